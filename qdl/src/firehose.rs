// SPDX-License-Identifier: BSD-3-Clause

//! The Firehose protocol: XML command/response framing over the raw
//! transport, plus the bulk sector I/O it flow-controls.
//!
//! Builds on the terminal-response loop in `parsers.rs`
//! (`firehose_parser_ack_nak`/`firehose_parser_configure_response`) to drive
//! every configure/reset/program/read/patch/erase operation.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use xmltree::{Element, EmitterConfig, XMLNode};

use crate::error::{FirehoseError, NakOp};
use crate::parsers::{firehose_parser_ack_nak, firehose_parser_configure_response, FirehoseStatus};
use crate::types::{FirehoseResetMode, FirehoseStorageType, QdlChan};

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(20);
const RAWMODE_TIMEOUT: Duration = Duration::from_secs(20);
const CLOSING_TAG: &[u8] = b"</data>";

/// Serializes a single Firehose command element (e.g. `<configure .../>`)
/// to the bytes that go out over the wire. Public because `vip.rs` hashes
/// the exact bytes a programmer image's XML would have produced.
pub fn firehose_xml_setup(tag: &str, args: &[(&str, &str)]) -> Result<Vec<u8>, FirehoseError> {
    let mut data_elem = Element::new("data");
    let mut cmd_elem = Element::new(tag);
    for (k, v) in args {
        cmd_elem.attributes.insert(k.to_string(), v.to_string());
    }
    data_elem.children.push(XMLNode::Element(cmd_elem));

    let mut buf = Vec::new();
    let cfg = EmitterConfig::new().write_document_declaration(false);
    data_elem.write_with_config(&mut buf, cfg)?;
    Ok(buf)
}

fn send_xml<T: QdlChan>(channel: &mut T, tag: &str, args: &[(&str, &str)]) -> Result<(), FirehoseError> {
    let bytes = firehose_xml_setup(tag, args)?;
    channel.write_all(&bytes)?;
    Ok(())
}

/// Reads one `<data>...</data>` document off the wire, using and refilling
/// the per-channel scratch buffer so bytes read past the closing tag (the
/// start of a raw sector payload, for instance) survive into the next call.
fn recv_xml<T: QdlChan>(channel: &mut T, deadline: Instant) -> Result<Element, FirehoseError> {
    let max_len = channel.fh_config().xml_buf_size.max(CLOSING_TAG.len());

    loop {
        if let Some(pos) = find_subslice(channel.recv_scratch(), CLOSING_TAG) {
            let end = pos + CLOSING_TAG.len();
            let doc: Vec<u8> = channel.recv_scratch()[..end].to_vec();
            channel.recv_scratch().drain(..end);
            return Ok(Element::parse(&doc[..])?);
        }

        if channel.recv_scratch().len() >= max_len {
            return Err(FirehoseError::Overflow);
        }
        if Instant::now() > deadline {
            return Err(FirehoseError::Timeout);
        }

        let mut chunk = [0u8; 4096];
        let n = channel.read(&mut chunk)?;
        if n > 0 {
            channel.recv_scratch().extend_from_slice(&chunk[..n]);
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn response_attrs(elem: &Element) -> Option<&IndexMap<String, String>> {
    elem.children.iter().find_map(|n| match n {
        XMLNode::Element(e) if e.name == "response" => Some(&e.attributes),
        _ => None,
    })
}

fn log_lines(elem: &Element) -> impl Iterator<Item = &str> {
    elem.children.iter().filter_map(|n| match n {
        XMLNode::Element(e) if e.name == "log" => e.attributes.get("value").map(String::as_str),
        _ => None,
    })
}

/// Reads `<data>` documents until one carries a terminal `<response>` tag,
/// forwarding any `<log>` lines to the tracing output as it goes, and hands
/// that response's attributes to `parser`. This is the generic loop every
/// configure/reset/nop/program-completion call drives.
///
/// Returns the parser's result alongside the concatenation of every `<log
/// value=.../>` line seen since the call started, so a NAK raised from the
/// terminal response can report what the device said leading up to it.
pub fn firehose_read<T: QdlChan, R>(
    channel: &mut T,
    parser: impl Fn(&mut T, &IndexMap<String, String>) -> Result<R, FirehoseError>,
) -> Result<(R, String), FirehoseError> {
    let deadline = Instant::now() + RESPONSE_TIMEOUT;
    let mut log = String::new();
    loop {
        let doc = recv_xml(channel, deadline)?;
        for line in log_lines(&doc) {
            log::debug!("firehose: {line}");
            log.push_str(line);
        }
        if let Some(attrs) = response_attrs(&doc) {
            return Ok((parser(channel, attrs)?, log));
        }
    }
}

/// Blocks until the device signals `rawmode="true"` on a `<response>`,
/// meaning it is ready to stream (or send) raw sector bytes. `parsers.rs`'s
/// `FirehoseStatus` has no rawmode field since most commands never need one;
/// this is kept local to the raw-transfer operations that do.
fn await_rawmode<T: QdlChan>(channel: &mut T, op: NakOp) -> Result<(), FirehoseError> {
    let deadline = Instant::now() + RAWMODE_TIMEOUT;
    loop {
        let doc = recv_xml(channel, deadline)?;
        for line in log_lines(&doc) {
            log::debug!("firehose: {line}");
        }
        let Some(attrs) = response_attrs(&doc) else {
            continue;
        };
        let value = attrs.get("value").map(String::as_str);
        let rawmode = attrs.get("rawmode").map(String::as_str) == Some("true");
        match value {
            Some("ACK") if rawmode => return Ok(()),
            Some("ACK") => return Ok(()),
            Some("NAK") => {
                return Err(FirehoseError::Nak {
                    op,
                    log: attrs.get("value").cloned().unwrap_or_default(),
                })
            }
            _ => return Err(FirehoseError::MalformedData(attrs.clone())),
        }
    }
}

/// The default sector size Firehose assumes for a storage type when the
/// device's own `<configure>` response doesn't override it.
pub fn firehose_get_default_sector_size(storage_type: FirehoseStorageType) -> usize {
    match storage_type {
        FirehoseStorageType::Emmc => 512,
        FirehoseStorageType::Ufs => 4096,
        FirehoseStorageType::Nand => 2048,
        FirehoseStorageType::Spinor => 256,
    }
}

/// Negotiates the session: storage type, sector size, slot count, and the
/// payload sizes the device is willing to accept. `skip_storage_init` maps
/// to Firehose's `SkipStorageInit="1"`, used when re-configuring mid-session
/// (see `firehose_parser_configure_response`'s auto-reconfigure path).
pub fn firehose_configure<T: QdlChan>(channel: &mut T, skip_storage_init: bool) -> Result<(), FirehoseError> {
    let cfg = channel.fh_config().clone();
    let storage_type = match cfg.storage_type {
        FirehoseStorageType::Emmc => "eMMC",
        FirehoseStorageType::Ufs => "UFS",
        FirehoseStorageType::Nand => "NAND",
        FirehoseStorageType::Spinor => "spinor",
    };
    let send_buffer_size = cfg.send_buffer_size.to_string();
    send_xml(
        channel,
        "configure",
        &[
            ("MemoryName", storage_type),
            ("Verbose", if cfg.verbose_firehose { "1" } else { "0" }),
            ("AlwaysValidate", "0"),
            ("MaxDigestTableSizeInBytes", "2048"),
            ("MaxPayloadSizeToTargetInBytes", &send_buffer_size),
            ("ZlpAwareHost", "1"),
            ("SkipStorageInit", if skip_storage_init { "1" } else { "0" }),
            ("SkipWrite", "0"),
        ],
    )?;
    firehose_read(channel, firehose_parser_configure_response)?;
    Ok(())
}

pub fn firehose_nop<T: QdlChan>(channel: &mut T) -> Result<(), FirehoseError> {
    send_xml(channel, "nop", &[])?;
    let (status, log) = firehose_read(channel, firehose_parser_ack_nak)?;
    nak_to_err(status, NakOp::Generic, log)
}

pub fn firehose_reset<T: QdlChan>(
    channel: &mut T,
    mode: &FirehoseResetMode,
    extra_grace_ms: u64,
) -> Result<(), FirehoseError> {
    send_xml(channel, "power", &[("value", mode.power_value())])?;
    let status = firehose_read(channel, firehose_parser_ack_nak);
    if extra_grace_ms > 0 {
        std::thread::sleep(Duration::from_millis(extra_grace_ms));
    }
    match status {
        Ok((s, log)) => nak_to_err(s, NakOp::Power, log),
        Err(FirehoseError::Timeout) => Ok(()),
        Err(e) => Err(e),
    }
}

pub fn firehose_set_bootable<T: QdlChan>(channel: &mut T, phys_part_idx: u8) -> Result<(), FirehoseError> {
    send_xml(channel, "setbootablestoragedrive", &[("value", &phys_part_idx.to_string())])?;
    let (status, log) = firehose_read(channel, firehose_parser_ack_nak)?;
    nak_to_err(status, NakOp::Generic, log)
}

pub fn firehose_peek<T: QdlChan>(channel: &mut T, base: u64, len: u64) -> Result<Vec<u8>, FirehoseError> {
    send_xml(
        channel,
        "peek",
        &[("address64", &base.to_string()), ("SizeInBytes", &len.to_string())],
    )?;
    let (status, log) = firehose_read(channel, firehose_parser_ack_nak)?;
    nak_to_err(status, NakOp::Read, log)?;
    let mut buf = vec![0u8; len as usize];
    channel.read_exact(&mut buf)?;
    Ok(buf)
}

/// Streams `num_sectors` sectors starting at `start_sector` of
/// `phys_part_idx` on the given `slot` from `reader` into the device,
/// chunked to the negotiated send-buffer size.
pub fn firehose_program_storage<T: QdlChan, R: Read>(
    channel: &mut T,
    mut reader: R,
    label: &str,
    num_sectors: u64,
    slot: u8,
    phys_part_idx: u8,
    start_sector: &str,
) -> Result<(), FirehoseError> {
    let sector_size = channel.fh_config().storage_sector_size;
    send_xml(
        channel,
        "program",
        &[
            ("SECTOR_SIZE_IN_BYTES", &sector_size.to_string()),
            ("num_partition_sectors", &num_sectors.to_string()),
            ("physical_partition_number", &phys_part_idx.to_string()),
            ("slot", &slot.to_string()),
            ("start_sector", start_sector),
            ("filename", label),
        ],
    )?;
    await_rawmode(channel, NakOp::Program)?;

    let total_bytes = num_sectors * sector_size as u64;
    let mut sent = 0u64;
    let mut buf = vec![0u8; channel.fh_config().send_buffer_size];
    while sent < total_bytes {
        let want = buf.len().min((total_bytes - sent) as usize);
        reader.read_exact(&mut buf[..want])?;
        channel.write_all(&buf[..want])?;
        sent += want as u64;
    }
    // Pad the final sector if the caller's data wasn't sector-aligned.
    let remainder = sent % sector_size as u64;
    if remainder != 0 {
        let pad = vec![0u8; (sector_size as u64 - remainder) as usize];
        channel.write_all(&pad)?;
    }

    let (status, log) = firehose_read(channel, firehose_parser_ack_nak)?;
    nak_to_err(status, NakOp::Program, log)
}

/// Reads `num_sectors` sectors starting at `start_sector` of
/// `phys_part_idx` on `slot` into `writer`. When the channel's `vip_mode`
/// flag is set (vendor-O signature auth succeeded), the `<read>` command
/// carries the extra `Envelope="vip"` attribute the device requires to
/// accept reads of otherwise-protected regions.
pub fn firehose_read_storage<T: QdlChan, W: std::io::Write>(
    channel: &mut T,
    mut writer: W,
    num_sectors: u64,
    slot: u8,
    phys_part_idx: u8,
    start_sector: u32,
) -> Result<(), FirehoseError> {
    let sector_size = channel.fh_config().storage_sector_size;
    let vip_mode = channel.fh_config().vip_mode;
    let num_sectors_str = num_sectors.to_string();
    let phys_part_idx_str = phys_part_idx.to_string();
    let slot_str = slot.to_string();
    let start_sector_str = start_sector.to_string();
    let mut args = vec![
        ("SECTOR_SIZE_IN_BYTES", sector_size.to_string()),
        ("num_partition_sectors", num_sectors_str),
        ("physical_partition_number", phys_part_idx_str),
        ("slot", slot_str),
        ("start_sector", start_sector_str),
    ];
    if vip_mode {
        args.push(("Envelope", "vip".to_string()));
    }
    let args_ref: Vec<(&str, &str)> = args.iter().map(|(k, v)| (*k, v.as_str())).collect();
    send_xml(channel, "read", &args_ref)?;
    await_rawmode(channel, NakOp::Read)?;

    let total_bytes = num_sectors * sector_size as u64;
    let mut received = 0u64;
    let mut buf = vec![0u8; channel.fh_config().send_buffer_size];
    while received < total_bytes {
        let want = buf.len().min((total_bytes - received) as usize);
        channel.read_exact(&mut buf[..want])?;
        writer.write_all(&buf[..want])?;
        received += want as u64;
    }

    let (status, log) = firehose_read(channel, firehose_parser_ack_nak)?;
    nak_to_err(status, NakOp::Read, log)
}

pub fn firehose_checksum_storage<T: QdlChan>(
    channel: &mut T,
    num_sectors: u64,
    phys_part_idx: u8,
    start_sector: u32,
) -> Result<String, FirehoseError> {
    send_xml(
        channel,
        "getstorageinfo",
        &[
            ("num_partition_sectors", &num_sectors.to_string()),
            ("physical_partition_number", &phys_part_idx.to_string()),
            ("start_sector", &start_sector.to_string()),
        ],
    )?;
    firehose_read(channel, |_channel, attrs| {
        attrs
            .get("chksum")
            .cloned()
            .ok_or_else(|| FirehoseError::MalformedData(attrs.clone()))
    })
    .map(|(chksum, _log)| chksum)
}

pub fn firehose_patch<T: QdlChan>(
    channel: &mut T,
    byte_offset: u64,
    slot: u8,
    phys_part_idx: u8,
    size_in_bytes: u64,
    start_sector: &str,
    value: &str,
) -> Result<(), FirehoseError> {
    send_xml(
        channel,
        "patch",
        &[
            ("byte_offset", &byte_offset.to_string()),
            ("slot", &slot.to_string()),
            ("physical_partition_number", &phys_part_idx.to_string()),
            ("size_in_bytes", &size_in_bytes.to_string()),
            ("start_sector", start_sector),
            ("value", value),
        ],
    )?;
    let (status, log) = firehose_read(channel, firehose_parser_ack_nak)?;
    nak_to_err(status, NakOp::Patch, log)
}

pub fn firehose_erase<T: QdlChan>(
    channel: &mut T,
    num_sectors: u64,
    phys_part_idx: u8,
    start_sector: u32,
) -> Result<(), FirehoseError> {
    send_xml(
        channel,
        "erase",
        &[
            ("num_partition_sectors", &num_sectors.to_string()),
            ("physical_partition_number", &phys_part_idx.to_string()),
            ("start_sector", &start_sector.to_string()),
        ],
    )?;
    let (status, log) = firehose_read(channel, firehose_parser_ack_nak)?;
    nak_to_err(status, NakOp::Erase, log)
}

fn nak_to_err(status: FirehoseStatus, op: NakOp, log: String) -> Result<(), FirehoseError> {
    match status {
        FirehoseStatus::Ack => Ok(()),
        FirehoseStatus::Nak => Err(FirehoseError::Nak { op, log }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FirehoseConfiguration, QdlDevice, QdlReadWrite};
    use std::collections::VecDeque;

    /// A scripted inbound byte queue; writes are discarded since these tests
    /// only exercise the receive side of `firehose_read`/`nak_to_err`.
    struct ScriptedChannel {
        inbound: VecDeque<u8>,
    }

    impl ScriptedChannel {
        fn new(inbound: &[u8]) -> Self {
            ScriptedChannel { inbound: inbound.to_vec().into() }
        }
    }

    impl Read for ScriptedChannel {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = buf.len().min(self.inbound.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.inbound.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for ScriptedChannel {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl QdlReadWrite for ScriptedChannel {}

    /// A NAK preceded by `<log>` lines surfaces their concatenation in the
    /// error, matching what a diagnostic-minded caller needs to show the
    /// user instead of a bare "device NAKed".
    #[test]
    fn nak_error_carries_the_log_lines_seen_before_it() {
        let script = concat!(
            "<data><log value=\"erasing FFU header\"/></data>",
            "<data><log value=\"erase failed\"/><response value=\"NAK\"/></data>"
        );
        let fake = ScriptedChannel::new(script.as_bytes());
        let mut device = QdlDevice::new(Box::new(fake), FirehoseConfiguration::default());

        let err = firehose_nop(&mut device).unwrap_err();
        match err {
            FirehoseError::Nak { op, log } => {
                assert_eq!(op, NakOp::Generic);
                assert!(log.contains("erasing FFU header"), "log was {log:?}");
                assert!(log.contains("erase failed"), "log was {log:?}");
            }
            other => panic!("expected Nak, got {other:?}"),
        }
    }

    #[test]
    fn ack_with_no_preceding_log_lines_carries_no_log() {
        let script = "<data><response value=\"ACK\"/></data>";
        let fake = ScriptedChannel::new(script.as_bytes());
        let mut device = QdlDevice::new(Box::new(fake), FirehoseConfiguration::default());

        assert!(firehose_nop(&mut device).is_ok());
    }

    #[test]
    fn default_sector_sizes_match_storage_type() {
        assert_eq!(firehose_get_default_sector_size(FirehoseStorageType::Emmc), 512);
        assert_eq!(firehose_get_default_sector_size(FirehoseStorageType::Ufs), 4096);
        assert_eq!(firehose_get_default_sector_size(FirehoseStorageType::Nand), 2048);
        assert_eq!(firehose_get_default_sector_size(FirehoseStorageType::Spinor), 256);
    }

    #[test]
    fn xml_setup_wraps_command_in_data_element() {
        let bytes = firehose_xml_setup("nop", &[]).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("<data>"));
        assert!(text.contains("<nop"));
    }

    #[test]
    fn find_subslice_locates_closing_tag() {
        let haystack = b"<data><response value=\"ACK\"/></data>trailing";
        let pos = find_subslice(haystack, CLOSING_TAG).unwrap();
        assert_eq!(&haystack[pos..pos + CLOSING_TAG.len()], CLOSING_TAG);
    }
}
