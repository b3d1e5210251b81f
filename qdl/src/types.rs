// SPDX-License-Identifier: BSD-3-Clause

//! Shared data model: the chip identity produced by Sahara, the storage
//! descriptor and per-channel configuration negotiated by Firehose, and the
//! `QdlChan` contract every wire-level function in this crate is generic
//! over.

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use anyhow::{bail, Result};

/// Marker trait for anything that can stand in for the physical transport
/// (serial port, USB bulk endpoint pair, or an in-memory test fixture).
pub trait QdlReadWrite: Read + Write {}

/// Everything a protocol-level function needs from the channel besides raw
/// bytes: the negotiated Firehose parameters, and the scratch buffer the
/// framer uses to hold bytes read past an XML document boundary (see
/// [`crate::firehose`]).
pub trait QdlChan: Read + Write {
    fn fh_config(&self) -> &FirehoseConfiguration;
    fn mut_fh_config(&mut self) -> &mut FirehoseConfiguration;
    fn recv_scratch(&mut self) -> &mut Vec<u8>;
}

/// Chip identity collected via Sahara's command-mode queries. Immutable
/// after the Sahara stage completes.
#[derive(Debug, Clone, Default)]
pub struct ChipIdentity {
    pub serial: u32,
    pub hw_id: u64,
    pub oem_id: u16,
    pub model_id: u16,
    pub pk_hash: Vec<u8>,
    pub sbl_version: u32,
    pub target_protocol_version: u32,
}

impl ChipIdentity {
    /// OEM id used to auto-detect the challenge-response authentication
    /// strategy.
    pub const OEM_ID_VENDOR_X: u16 = 0x0072;

    /// Public-key hash prefixes recognized as vendor X targets, for chips
    /// whose OEM id alone doesn't disambiguate them.
    const PK_HASH_PREFIXES: &'static [[u8; 2]] = &[[0x4a, 0x11], [0x9c, 0x02]];

    /// Assembles an identity from Sahara command-mode query results.
    /// `hw_id`'s top 16 bits carry the OEM id and the next 16 the model id.
    pub fn from_queries(serial: u32, hw_id: u64, pk_hash: Vec<u8>, sbl_version: u32, target_protocol_version: u32) -> Self {
        ChipIdentity {
            serial,
            hw_id,
            oem_id: (hw_id >> 48) as u16,
            model_id: (hw_id >> 32) as u16,
            pk_hash,
            sbl_version,
            target_protocol_version,
        }
    }

    /// Whether this chip matches the challenge-response auto-detection
    /// heuristic: OEM id `0x0072`, or a recognized public-key-hash prefix.
    pub fn wants_challenge_response(&self) -> bool {
        self.oem_id == Self::OEM_ID_VENDOR_X || Self::PK_HASH_PREFIXES.iter().any(|p| self.pk_hash.starts_with(p))
    }

    /// Builds identity from the raw little-endian byte strings Sahara's
    /// command-mode `ExecuteData` responses return, padding or truncating
    /// each to the field's natural width.
    pub fn from_raw_query_bytes(serial: &[u8], hw_id: &[u8], pk_hash: Vec<u8>, sbl_version: &[u8]) -> Self {
        fn le_padded<const N: usize>(bytes: &[u8]) -> [u8; N] {
            let mut out = [0u8; N];
            let n = bytes.len().min(N);
            out[..n].copy_from_slice(&bytes[..n]);
            out
        }
        Self::from_queries(
            u32::from_le_bytes(le_padded(serial)),
            u64::from_le_bytes(le_padded(hw_id)),
            pk_hash,
            u32::from_le_bytes(le_padded(sbl_version)),
            0,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FirehoseStorageType {
    #[default]
    Ufs,
    Emmc,
    Nand,
    Spinor,
}

impl FromStr for FirehoseStorageType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "ufs" => FirehoseStorageType::Ufs,
            "emmc" => FirehoseStorageType::Emmc,
            "nand" => FirehoseStorageType::Nand,
            "spinor" => FirehoseStorageType::Spinor,
            other => bail!("unknown storage type {other:?} (expected emmc/ufs/nand/spinor)"),
        })
    }
}

impl fmt::Display for FirehoseStorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FirehoseStorageType::Ufs => "UFS",
            FirehoseStorageType::Emmc => "eMMC",
            FirehoseStorageType::Nand => "NAND",
            FirehoseStorageType::Spinor => "spi-nor",
        };
        f.write_str(s)
    }
}

/// The A/B slot an engine instance is currently addressing, or the
/// indication that the device has no A/B split at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActiveSlot {
    A,
    B,
    #[default]
    Nonexistent,
}

impl FromStr for ActiveSlot {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "a" => ActiveSlot::A,
            "b" => ActiveSlot::B,
            other => bail!("unknown slot {other:?} (expected a/b)"),
        })
    }
}

impl fmt::Display for ActiveSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActiveSlot::A => "a",
            ActiveSlot::B => "b",
            ActiveSlot::Nonexistent => "none",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirehoseResetMode {
    /// Reboot back into the normal boot chain.
    Reset,
    /// Power the device off.
    Off,
    /// Reboot straight back into EDL/Sahara.
    ResetToEdl,
}

impl FromStr for FirehoseResetMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "system" | "reset" => FirehoseResetMode::Reset,
            "off" => FirehoseResetMode::Off,
            "edl" | "reset_to_edl" => FirehoseResetMode::ResetToEdl,
            other => bail!("unknown reset mode {other:?} (expected edl/off/system)"),
        })
    }
}

impl fmt::Display for FirehoseResetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FirehoseResetMode::Reset => "system",
            FirehoseResetMode::Off => "off",
            FirehoseResetMode::ResetToEdl => "edl",
        };
        f.write_str(s)
    }
}

impl FirehoseResetMode {
    /// The literal value of the Firehose `<power value=.../>` attribute.
    pub(crate) fn power_value(&self) -> &'static str {
        match self {
            FirehoseResetMode::Reset => "reset",
            FirehoseResetMode::Off => "off",
            FirehoseResetMode::ResetToEdl => "reset_to_edl",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QdlBackend {
    #[default]
    Usb,
    Serial,
}

impl FromStr for QdlBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "usb" => QdlBackend::Usb,
            "serial" => QdlBackend::Serial,
            other => bail!("unknown backend {other:?} (expected usb/serial)"),
        })
    }
}

/// Parameters negotiated (or about to be requested) over a Firehose session.
/// Lives for the whole session; `..Default::default()` is overwritten by the
/// `<configure>` round-trip and treated as read-only afterward.
#[derive(Debug, Clone)]
pub struct FirehoseConfiguration {
    pub storage_type: FirehoseStorageType,
    pub storage_sector_size: usize,
    pub storage_slot: u8,
    pub active_slot: ActiveSlot,
    pub backend: QdlBackend,
    pub bypass_storage: bool,
    pub hash_packets: bool,
    pub read_back_verify: bool,
    pub skip_firehose_log: bool,
    pub verbose_firehose: bool,
    /// Set once vendor-O signature auth succeeds. While true, reads are
    /// wrapped in the device's "disguise" envelope (`firehose_read_storage`
    /// adds an extra XML attribute) so the programmer accepts reads of
    /// regions it would otherwise protect.
    pub vip_mode: bool,
    /// `MaxPayloadSizeToTargetInBytes`: host -> device bulk sector payload size.
    pub send_buffer_size: usize,
    /// `MaxXMLSizeInBytes`: the largest single XML document the device will parse.
    pub xml_buf_size: usize,
    /// `MaxPayloadSizeFromTargetInBytes`: chunk size for host -> device XML commands.
    pub cmd_chunk_size: usize,
}

impl Default for FirehoseConfiguration {
    fn default() -> Self {
        FirehoseConfiguration {
            storage_type: FirehoseStorageType::default(),
            storage_sector_size: 512,
            storage_slot: 0,
            active_slot: ActiveSlot::default(),
            backend: QdlBackend::default(),
            bypass_storage: false,
            hash_packets: false,
            read_back_verify: false,
            skip_firehose_log: true,
            verbose_firehose: false,
            vip_mode: false,
            send_buffer_size: 1024 * 1024,
            xml_buf_size: 4096,
            cmd_chunk_size: 8 * 1024,
        }
    }
}

/// Owns the physical channel plus everything a Firehose session needs to
/// track between calls. The single owner of the transport: Sahara and
/// Firehose never hold it concurrently.
pub struct QdlDevice {
    pub rw: Box<dyn QdlReadWrite>,
    pub fh_cfg: FirehoseConfiguration,
    /// Set once Sahara has handed off to Firehose; if the device is dropped
    /// while this is still true, an emergency reset is attempted so a
    /// panic or early return never strands the device mid-flash.
    pub reset_on_drop: bool,
    scratch: Vec<u8>,
}

impl QdlDevice {
    pub fn new(rw: Box<dyn QdlReadWrite>, fh_cfg: FirehoseConfiguration) -> Self {
        QdlDevice {
            rw,
            fh_cfg,
            reset_on_drop: false,
            scratch: Vec::new(),
        }
    }
}

impl Read for QdlDevice {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.rw.read(buf)
    }
}

impl Write for QdlDevice {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.rw.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.rw.flush()
    }
}

impl QdlChan for QdlDevice {
    fn fh_config(&self) -> &FirehoseConfiguration {
        &self.fh_cfg
    }

    fn mut_fh_config(&mut self) -> &mut FirehoseConfiguration {
        &mut self.fh_cfg
    }

    fn recv_scratch(&mut self) -> &mut Vec<u8> {
        &mut self.scratch
    }
}

impl Drop for QdlDevice {
    fn drop(&mut self) {
        if self.reset_on_drop {
            log::warn!("QdlDevice dropped mid-session, attempting an emergency EDL reset");
            let _ = crate::firehose_reset(self, &FirehoseResetMode::ResetToEdl, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oem_id_splits_out_of_the_top_bits_of_hw_id() {
        let hw_id = (ChipIdentity::OEM_ID_VENDOR_X as u64) << 48 | (0x1234u64 << 32);
        let identity = ChipIdentity::from_queries(0xdead_beef, hw_id, vec![], 0, 0);
        assert_eq!(identity.oem_id, ChipIdentity::OEM_ID_VENDOR_X);
        assert_eq!(identity.model_id, 0x1234);
        assert!(identity.wants_challenge_response());
    }

    #[test]
    fn an_unrelated_oem_id_and_hash_does_not_trigger_challenge_response() {
        let identity = ChipIdentity::from_queries(1, 0, vec![0x00, 0x01], 0, 0);
        assert!(!identity.wants_challenge_response());
    }

    #[test]
    fn from_raw_query_bytes_pads_short_responses_instead_of_panicking() {
        let identity = ChipIdentity::from_raw_query_bytes(&[0x01, 0x00], &[], vec![0xaa], &[0x02]);
        assert_eq!(identity.serial, 1);
        assert_eq!(identity.hw_id, 0);
        assert_eq!(identity.sbl_version, 2);
    }

    #[test]
    fn a_recognized_pk_hash_prefix_triggers_challenge_response_even_with_a_foreign_oem_id() {
        let identity = ChipIdentity::from_queries(1, 0x1111_0000_0000_0000, vec![0x4a, 0x11, 0xff, 0xff], 0, 0);
        assert!(identity.wants_challenge_response());
    }
}
