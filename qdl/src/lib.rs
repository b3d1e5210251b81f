// SPDX-License-Identifier: BSD-3-Clause

//! A Qualcomm Emergency Download (EDL) flashing engine: a Sahara loader
//! uploader, a Firehose XML command/response driver with GPT-aware
//! partition I/O, and the connection state machine that ties both
//! protocols into a single flashing session.
//!
//! The crate root re-exports the small set of operations most callers
//! need directly (`firehose_configure`, `firehose_read`, ...); the fuller
//! typed surface lives in [`types`], [`sahara`], [`gpt`], [`auth`] and
//! [`engine`].

pub mod auth;
pub mod engine;
pub mod error;
pub mod firehose;
pub mod gpt;
pub mod parsers;
pub mod sahara;
pub mod types;
#[cfg(feature = "vip")]
pub mod vip;

#[cfg(feature = "serial")]
mod serial;
#[cfg(feature = "usb")]
mod usb;

pub use error::{EngineError, ErrorKind, FirehoseError, NakOp, SaharaError, TransportError, VipError};
pub use firehose::{
    firehose_checksum_storage, firehose_configure, firehose_erase, firehose_get_default_sector_size,
    firehose_nop, firehose_patch, firehose_peek, firehose_program_storage, firehose_read,
    firehose_read_storage, firehose_reset, firehose_set_bootable, firehose_xml_setup,
};
pub use types::{
    ActiveSlot, ChipIdentity, FirehoseConfiguration, FirehoseResetMode, FirehoseStorageType, QdlBackend,
    QdlChan, QdlDevice, QdlReadWrite,
};

/// Opens whichever transport `backend` names. The single entry point every
/// binary in this workspace (`cli`, `qramdump`, `qviptblgen`) goes through
/// to get from a `--backend usb|serial` flag to a live channel.
pub fn setup_target_device(
    backend: QdlBackend,
    serial_no: Option<String>,
    dev_path: Option<String>,
) -> Result<Box<dyn QdlReadWrite>, TransportError> {
    match backend {
        #[cfg(feature = "usb")]
        QdlBackend::Usb => Ok(Box::new(usb::setup_usb_device(serial_no)?)),
        #[cfg(not(feature = "usb"))]
        QdlBackend::Usb => Err(TransportError::FeatureDisabled("usb")),

        #[cfg(feature = "serial")]
        QdlBackend::Serial => Ok(Box::new(serial::setup_serial_device(dev_path)?)),
        #[cfg(not(feature = "serial"))]
        QdlBackend::Serial => Err(TransportError::FeatureDisabled("serial")),
    }
}
