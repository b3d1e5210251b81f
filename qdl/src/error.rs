// SPDX-License-Identifier: BSD-3-Clause

//! Typed error taxonomy for the library boundary.
//!
//! The wire-level modules ([`crate::sahara`], [`crate::firehose`] and its
//! [`crate::parsers`]) raise their own narrow error types; [`EngineError`]
//! is the single type returned across the public API and the one the
//! [`crate::engine`] state machine matches on to decide whether a failure
//! tears down the connection or merely surfaces to the caller.

use std::io;

use indexmap::IndexMap;

/// Which Firehose command a NAK was raised against, for readable logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakOp {
    Configure,
    Read,
    Program,
    Patch,
    Erase,
    Power,
    Auth,
    Generic,
}

impl std::fmt::Display for NakOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NakOp::Configure => "configure",
            NakOp::Read => "read",
            NakOp::Program => "program",
            NakOp::Patch => "patch",
            NakOp::Erase => "erase",
            NakOp::Power => "power",
            NakOp::Auth => "authenticate",
            NakOp::Generic => "command",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FirehoseError {
    #[error("malformed response attributes: {0:?}")]
    MalformedData(IndexMap<String, String>),
    #[error("device requires Firehose protocol >= {device_min_version}, which this engine does not speak")]
    ProtocolVersionIncompatibility { device_min_version: u32 },
    #[error("device NAKed {op}: {log}")]
    Nak { op: NakOp, log: String },
    #[error("timed out waiting for a Firehose response")]
    Timeout,
    #[error("device response exceeded the negotiated XML buffer")]
    Overflow,
    #[error("malformed XML from device: {0}")]
    Xml(#[from] xmltree::ParseError),
    #[error("failed to serialize XML: {0}")]
    XmlWrite(#[from] xmltree::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors raised while opening the physical channel itself, before either
/// wire protocol has spoken a single byte.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("serial port path unspecified")]
    MissingDevicePath,
    #[error("found no device in EDL mode{}", .serial_no.as_deref().map(|s| format!(" with serial number {s}")).unwrap_or_default())]
    DeviceNotFound { serial_no: Option<String> },
    #[error("no usable bulk interface on the device")]
    NoUsableInterface,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("USB transport error: {0}")]
    Usb(String),
    #[error("this build was compiled without the {0} feature")]
    FeatureDisabled(&'static str),
}

/// Errors raised while building the VIP-mode digest tables (`qviptblgen`).
#[derive(Debug, thiserror::Error)]
pub enum VipError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("malformed program XML: {0}")]
    Xml(#[from] xmltree::ParseError),
    #[error("couldn't build a Firehose packet for a program XML entry: {0}")]
    Firehose(#[from] FirehoseError),
    #[error("couldn't serialize the MBN header: {0}")]
    Encoding(#[from] bincode::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SaharaError {
    #[error("timed out waiting for a Sahara frame")]
    Timeout,
    #[error("unexpected Sahara command 0x{0:02x}")]
    Protocol(u32),
    #[error("device reported a failed image transfer (status {0})")]
    BadImage(u32),
    #[error("device entered memory-debug dump mode unexpectedly")]
    UnsolicitedMemoryDebug,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("failed to encode/decode a Sahara frame: {0}")]
    Encoding(#[from] bincode::Error),
}

/// Flat error taxonomy independent of which layer (Sahara, Firehose,
/// filesystem...) actually produced the error.
/// Callers that only care about "was this a timeout" use [`EngineError::kind`]
/// rather than matching the full nested variant tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Timeout,
    Protocol,
    Nak,
    NotConnected,
    NotFound,
    BadImage,
    Cancelled,
    AuthFailed,
    Io,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Sahara(#[from] SaharaError),
    #[error(transparent)]
    Firehose(#[from] FirehoseError),
    #[error("no partition named {0:?}")]
    NotFound(String),
    #[error("not connected")]
    NotConnected,
    #[error("operation cancelled")]
    Cancelled,
    #[error("device authentication failed")]
    AuthFailed,
    #[error("filesystem error: {0}")]
    Io(#[from] io::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Sahara(SaharaError::Timeout) => ErrorKind::Timeout,
            EngineError::Sahara(SaharaError::Protocol(_)) => ErrorKind::Protocol,
            EngineError::Sahara(SaharaError::UnsolicitedMemoryDebug) => ErrorKind::Protocol,
            EngineError::Sahara(SaharaError::BadImage(_)) => ErrorKind::BadImage,
            EngineError::Sahara(SaharaError::Io(_)) => ErrorKind::Transport,
            EngineError::Sahara(SaharaError::Encoding(_)) => ErrorKind::Protocol,
            EngineError::Firehose(FirehoseError::Timeout) => ErrorKind::Timeout,
            EngineError::Firehose(FirehoseError::Nak { .. }) => ErrorKind::Nak,
            EngineError::Firehose(FirehoseError::Io(_)) => ErrorKind::Transport,
            EngineError::Firehose(FirehoseError::Xml(_))
            | EngineError::Firehose(FirehoseError::XmlWrite(_))
            | EngineError::Firehose(FirehoseError::MalformedData(_))
            | EngineError::Firehose(FirehoseError::Overflow)
            | EngineError::Firehose(FirehoseError::ProtocolVersionIncompatibility { .. }) => {
                ErrorKind::Protocol
            }
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::NotConnected => ErrorKind::NotConnected,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::AuthFailed => ErrorKind::AuthFailed,
            EngineError::Io(_) => ErrorKind::Io,
        }
    }

    pub fn is_transport(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }
}
