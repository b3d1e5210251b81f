// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use serial2::{self, SerialPort};
use std::io::{Read, Write};

use crate::error::TransportError;
use crate::types::QdlReadWrite;

type Result<T> = std::result::Result<T, TransportError>;

pub struct QdlSerialConfig {
    serport: SerialPort,
}

// TODO: timeouts?
impl Write for QdlSerialConfig {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.serport.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.serport.flush()
    }
}

impl Read for QdlSerialConfig {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.serport.read(buf)
    }
}

impl QdlReadWrite for QdlSerialConfig {}

pub fn setup_serial_device(dev_path: Option<String>) -> Result<QdlSerialConfig> {
    let Some(path) = dev_path else {
        return Err(TransportError::MissingDevicePath);
    };

    let serport = SerialPort::open(path, |mut settings: serial2::Settings| {
        settings.set_raw();
        settings.set_baud_rate(115200)?;
        Ok(settings)
    })?;

    Ok(QdlSerialConfig { serport })
}
