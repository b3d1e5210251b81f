// SPDX-License-Identifier: BSD-3-Clause

//! The Sahara loader-boot protocol: a length-prefixed binary request/response
//! exchange used to get a signed programmer image into device SRAM before
//! Firehose ever speaks.
//!
//! Frames are encoded with `bincode` + `serde_repr` to match the fixed
//! little-endian layout the protocol uses on the wire.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::error::SaharaError;
use crate::types::QdlReadWrite;

#[cfg(not(test))]
const HELLO_WAIT: Duration = Duration::from_secs(3);
/// Shortened in test builds so the Hello-retry path (see
/// [`wait_for_hello_with_retry`]) doesn't spend real wall-clock time
/// waiting out a timeout that the fixtures trigger deliberately.
#[cfg(test)]
const HELLO_WAIT: Duration = Duration::from_millis(50);
const FRAME_WAIT: Duration = Duration::from_secs(5);
const STUCK_RECOVERY_FRAMES: u32 = 4;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
pub enum SaharaCommand {
    Hello = 0x01,
    HelloResp = 0x02,
    ReadData = 0x03,
    EndImageTransfer = 0x04,
    Done = 0x05,
    DoneResp = 0x06,
    Reset = 0x07,
    ResetResp = 0x08,
    MemoryDebug = 0x0B,
    MemoryRead = 0x0C,
    CmdReady = 0x10,
    SwitchMode = 0x11,
    ExecuteCmd = 0x12,
    ExecuteResp = 0x13,
    ExecuteData = 0x14,
    MemoryDebug64 = 0x15,
    ReadData64 = 0x16,
    ResetMachine = 0x17,
}

/// The device-reported "mode" field of the hello/hello-response exchange.
/// Which mode the host replies with decides what the device does next.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
pub enum SaharaMode {
    ImageTxPending = 0x00,
    MemoryDebug = 0x01,
    Command = 0x03,
}

/// Sub-commands of Sahara's command mode (`ExecuteCmd`). Numbered to match
/// the `EXEC_GET_*` constants of a sibling Qualcomm EDL tool in this same
/// pack, which drives the identical sub-protocol.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
pub enum SaharaCmdModeCmd {
    ReadSerialNum = 0x01,
    ReadMsmHwId = 0x02,
    ReadOemKeyHash = 0x03,
    ReadSblVersion = 0x07,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct FrameHeader {
    command: u32,
    length: u32,
}

// --- full frames, header included, used only on the send path --------------

#[derive(Debug, Clone, Copy, Serialize)]
struct HelloRespFrame {
    header: FrameHeader,
    version: u32,
    version_compatible: u32,
    status: u32,
    mode: u32,
}

#[derive(Debug, Clone, Copy, Serialize)]
struct DoneFrame {
    header: FrameHeader,
}

#[derive(Debug, Clone, Copy, Serialize)]
struct ResetFrame {
    header: FrameHeader,
}

#[derive(Debug, Clone, Copy, Serialize)]
struct ResetMachineFrame {
    header: FrameHeader,
}

#[derive(Debug, Clone, Copy, Serialize)]
struct SwitchModeFrame {
    header: FrameHeader,
    mode: u32,
}

#[derive(Debug, Clone, Copy, Serialize)]
struct ExecuteCmdFrame {
    header: FrameHeader,
    cmd: u32,
}

#[derive(Debug, Clone, Copy, Serialize)]
struct ExecuteDataFrame {
    header: FrameHeader,
    cmd: u32,
}

#[derive(Debug, Clone, Copy, Serialize)]
struct MemoryReadFrame {
    header: FrameHeader,
    memory_addr: u64,
    memory_length: u64,
}

// --- payload-only structs, used on the receive path (header already split off) ---

#[derive(Debug, Clone, Copy, Deserialize)]
struct HelloPayload {
    version: u32,
    _version_compatible: u32,
    _max_cmd_packet_length: u32,
    mode: u32,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct ReadDataPayload {
    image_id: u32,
    offset: u32,
    length: u32,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct ReadData64Payload {
    image_id: u64,
    offset: u64,
    length: u64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct EndImageTransferPayload {
    _image_id: u32,
    status: u32,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct DoneRespPayload {
    _image_tx_status: u32,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct ExecuteRespPayload {
    _cmd: u32,
    length: u32,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct MemoryDebugPayload {
    table_addr: u32,
    table_length: u32,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct MemoryDebug64Payload {
    table_addr: u64,
    table_length: u64,
}

fn send_frame<F: Serialize>(rw: &mut dyn QdlReadWrite, frame: &F) -> Result<(), SaharaError> {
    let bytes = bincode::serialize(frame)?;
    rw.write_all(&bytes)?;
    Ok(())
}

/// Reads exactly one frame header plus payload, applying `deadline`. Returns
/// the raw command code and payload bytes; callers decode the payload into
/// whichever struct the code implies.
fn recv_frame(rw: &mut dyn QdlReadWrite, deadline: Instant) -> Result<(u32, Vec<u8>), SaharaError> {
    let mut header_buf = [0u8; 8];
    read_exact_with_deadline(rw, &mut header_buf, deadline)?;
    let header: FrameHeader = bincode::deserialize(&header_buf)?;
    if header.length < 8 {
        return Err(SaharaError::Protocol(header.command));
    }
    let mut payload = vec![0u8; (header.length - 8) as usize];
    if !payload.is_empty() {
        read_exact_with_deadline(rw, &mut payload, deadline)?;
    }
    Ok((header.command, payload))
}

fn read_exact_with_deadline(rw: &mut dyn QdlReadWrite, buf: &mut [u8], deadline: Instant) -> Result<(), SaharaError> {
    let mut filled = 0;
    while filled < buf.len() {
        if Instant::now() > deadline {
            return Err(SaharaError::Timeout);
        }
        let n = rw.read(&mut buf[filled..])?;
        if n == 0 {
            continue;
        }
        filled += n;
    }
    Ok(())
}

fn decode<T: for<'de> Deserialize<'de>>(payload: &[u8], command: u32, expected_len: usize) -> Result<T, SaharaError> {
    if payload.len() != expected_len {
        return Err(SaharaError::Protocol(command));
    }
    bincode::deserialize(payload).map_err(SaharaError::from)
}

fn wait_for_hello(rw: &mut dyn QdlReadWrite, timeout: Duration) -> Result<HelloPayload, SaharaError> {
    let deadline = Instant::now() + timeout;
    let (command, payload) = recv_frame(rw, deadline)?;
    if command != SaharaCommand::Hello as u32 {
        return Err(SaharaError::Protocol(command));
    }
    decode(&payload, command, 16)
}

/// Waits for `Hello`; if none arrives within `timeout`, issues `ResetMachine`
/// and waits once more. A loader that missed the first handshake window
/// (USB enumeration delay, a stale buffer left by a previous tool) usually
/// reboots straight into a fresh one after a forceful reset.
fn wait_for_hello_with_retry(rw: &mut dyn QdlReadWrite, timeout: Duration) -> Result<HelloPayload, SaharaError> {
    match wait_for_hello(rw, timeout) {
        Err(SaharaError::Timeout) => {
            log::warn!("sahara: no hello within {timeout:?}, issuing ResetMachine and retrying once");
            send_frame(
                rw,
                &ResetMachineFrame {
                    header: FrameHeader {
                        command: SaharaCommand::ResetMachine as u32,
                        length: 8,
                    },
                },
            )?;
            wait_for_hello(rw, timeout)
        }
        other => other,
    }
}

fn send_hello_resp(rw: &mut dyn QdlReadWrite, device_version: u32, mode: SaharaMode) -> Result<(), SaharaError> {
    send_frame(
        rw,
        &HelloRespFrame {
            header: FrameHeader {
                command: SaharaCommand::HelloResp as u32,
                length: 0x18,
            },
            version: device_version,
            version_compatible: 1,
            status: 0,
            mode: mode as u32,
        },
    )
}

/// Sends a `HelloResp` without first waiting for the device's `Hello`, for
/// when some earlier process already consumed it off the wire.
pub fn sahara_send_hello_rsp(channel: &mut crate::types::QdlDevice, mode: SaharaMode) -> Result<(), SaharaError> {
    send_hello_resp(channel.rw.as_mut(), 2, mode)
}

/// Drives one full Sahara exchange. `mode` selects which sub-protocol to
/// run; `cmd` is only consulted in [`SaharaMode::Command`]; `images` backs
/// [`SaharaMode::ImageTxPending`] (only the first entry is ever served —
/// devices request a single programmer image by a fixed numeric id
/// regardless of what the host names it); `regions_to_dump` backs
/// [`SaharaMode::MemoryDebug`] and is a list of `addr:length` hex pairs.
///
/// Returns whatever bytes the mode naturally produces: the command-mode
/// query result, or an empty vector for the other two modes (their output is
/// the image transfer / dump files, not a return value).
pub fn sahara_run(
    channel: &mut crate::types::QdlDevice,
    mode: SaharaMode,
    cmd: Option<SaharaCmdModeCmd>,
    images: &mut [Vec<u8>],
    regions_to_dump: Vec<String>,
    verbose: bool,
) -> Result<Vec<u8>, SaharaError> {
    let rw = channel.rw.as_mut();
    let hello = wait_for_hello_with_retry(rw, HELLO_WAIT)?;
    if verbose {
        log::debug!("sahara: hello version={} mode_hint={}", hello.version, hello.mode);
    }
    send_hello_resp(rw, hello.version, mode)?;

    match mode {
        SaharaMode::ImageTxPending => run_image_transfer(rw, images, verbose),
        SaharaMode::Command => run_command_mode(rw, cmd),
        SaharaMode::MemoryDebug => run_memory_debug(rw, regions_to_dump, verbose),
    }
}

fn run_image_transfer(rw: &mut dyn QdlReadWrite, images: &mut [Vec<u8>], verbose: bool) -> Result<Vec<u8>, SaharaError> {
    let Some(image) = images.first() else {
        return Err(SaharaError::Protocol(SaharaCommand::ReadData as u32));
    };
    let file_size = image.len() as u64;

    loop {
        let (command, payload) = recv_frame(rw, Instant::now() + FRAME_WAIT)?;
        if command == SaharaCommand::ReadData as u32 {
            let req: ReadDataPayload = decode(&payload, command, 12)?;
            serve_chunk(rw, image, req.offset as u64, req.length as u64, file_size, verbose)?;
        } else if command == SaharaCommand::ReadData64 as u32 {
            let req: ReadData64Payload = decode(&payload, command, 24)?;
            serve_chunk(rw, image, req.offset, req.length, file_size, verbose)?;
        } else if command == SaharaCommand::EndImageTransfer as u32 {
            let end: EndImageTransferPayload = decode(&payload, command, 8)?;
            if end.status != 0 {
                return Err(SaharaError::BadImage(end.status));
            }
            break;
        } else if command == SaharaCommand::MemoryDebug as u32 || command == SaharaCommand::MemoryDebug64 as u32 {
            return Err(SaharaError::UnsolicitedMemoryDebug);
        } else {
            return Err(SaharaError::Protocol(command));
        }
    }

    send_frame(
        rw,
        &DoneFrame {
            header: FrameHeader {
                command: SaharaCommand::Done as u32,
                length: 8,
            },
        },
    )?;
    let (command, payload) = recv_frame(rw, Instant::now() + FRAME_WAIT)?;
    if command != SaharaCommand::DoneResp as u32 {
        return Err(SaharaError::Protocol(command));
    }
    let _done: DoneRespPayload = decode(&payload, command, 4)?;
    Ok(Vec::new())
}

fn serve_chunk(
    rw: &mut dyn QdlReadWrite,
    image: &[u8],
    offset: u64,
    length: u64,
    file_size: u64,
    verbose: bool,
) -> Result<(), SaharaError> {
    let start = offset as usize;
    let end = (offset + length) as usize;
    let chunk = image
        .get(start..end)
        .ok_or(SaharaError::Protocol(SaharaCommand::ReadData as u32))?;
    rw.write_all(chunk)?;
    if verbose && file_size > 0 {
        let pct = (offset as f64 / file_size as f64) * 100.0;
        log::debug!("sahara: sent {length} bytes at offset {offset} ({pct:.1}%)");
    }
    Ok(())
}

fn run_command_mode(rw: &mut dyn QdlReadWrite, cmd: Option<SaharaCmdModeCmd>) -> Result<Vec<u8>, SaharaError> {
    send_frame(
        rw,
        &SwitchModeFrame {
            header: FrameHeader {
                command: SaharaCommand::SwitchMode as u32,
                length: 12,
            },
            mode: SaharaMode::Command as u32,
        },
    )?;
    let (command, _) = recv_frame(rw, Instant::now() + FRAME_WAIT)?;
    if command != SaharaCommand::CmdReady as u32 {
        return Err(SaharaError::Protocol(command));
    }

    let Some(cmd) = cmd else {
        return Ok(Vec::new());
    };

    send_frame(
        rw,
        &ExecuteCmdFrame {
            header: FrameHeader {
                command: SaharaCommand::ExecuteCmd as u32,
                length: 12,
            },
            cmd: cmd as u32,
        },
    )?;
    let (command, payload) = recv_frame(rw, Instant::now() + FRAME_WAIT)?;
    if command != SaharaCommand::ExecuteResp as u32 {
        return Err(SaharaError::Protocol(command));
    }
    let resp: ExecuteRespPayload = decode(&payload, command, 8)?;

    send_frame(
        rw,
        &ExecuteDataFrame {
            header: FrameHeader {
                command: SaharaCommand::ExecuteData as u32,
                length: 12,
            },
            cmd: cmd as u32,
        },
    )?;
    let mut data = vec![0u8; resp.length as usize];
    let deadline = Instant::now() + FRAME_WAIT;
    read_exact_with_deadline(rw, &mut data, deadline)?;
    Ok(data)
}

fn run_memory_debug(rw: &mut dyn QdlReadWrite, regions_to_dump: Vec<String>, verbose: bool) -> Result<Vec<u8>, SaharaError> {
    let (command, payload) = recv_frame(rw, Instant::now() + FRAME_WAIT)?;
    let (table_addr, table_length) = if command == SaharaCommand::MemoryDebug as u32 {
        let d: MemoryDebugPayload = decode(&payload, command, 8)?;
        (d.table_addr as u64, d.table_length as u64)
    } else if command == SaharaCommand::MemoryDebug64 as u32 {
        let d: MemoryDebug64Payload = decode(&payload, command, 16)?;
        (d.table_addr, d.table_length)
    } else {
        return Err(SaharaError::Protocol(command));
    };

    if verbose {
        log::debug!("sahara: memory debug table at 0x{table_addr:x}, {table_length} bytes");
    }

    for region in regions_to_dump {
        let Some((addr_str, len_str)) = region.split_once(':') else {
            log::warn!("skipping malformed memory-dump region spec {region:?} (expected addr:length)");
            continue;
        };
        let addr = u64::from_str_radix(addr_str.trim_start_matches("0x"), 16).unwrap_or(0);
        let length = u64::from_str_radix(len_str.trim_start_matches("0x"), 16).unwrap_or(0);

        send_frame(
            rw,
            &MemoryReadFrame {
                header: FrameHeader {
                    command: SaharaCommand::MemoryRead as u32,
                    length: 24,
                },
                memory_addr: addr,
                memory_length: length,
            },
        )?;
        let mut buf = vec![0u8; length as usize];
        read_exact_with_deadline(rw, &mut buf, Instant::now() + FRAME_WAIT)?;
        let path = format!("0x{addr:x}-0x{length:x}.bin");
        if let Err(e) = std::fs::write(&path, &buf) {
            log::error!("failed to save memory dump {path}: {e}");
        }
    }

    Ok(Vec::new())
}

/// Recovery path for a loader that boot-looped or hung mid-Sahara:
/// ask it to `Reset`; if it goes quiet, fall back to the more forceful
/// `ResetMachine` and a discarded input buffer; succeed only once a fresh
/// `Hello` reappears.
pub fn sahara_reset(channel: &mut crate::types::QdlDevice) -> Result<(), SaharaError> {
    let rw = channel.rw.as_mut();
    send_frame(
        rw,
        &ResetFrame {
            header: FrameHeader {
                command: SaharaCommand::Reset as u32,
                length: 8,
            },
        },
    )?;

    let mut got_reset_resp = false;
    for _ in 0..STUCK_RECOVERY_FRAMES {
        match recv_frame(rw, Instant::now() + Duration::from_millis(500)) {
            Ok((command, _)) if command == SaharaCommand::ResetResp as u32 => {
                got_reset_resp = true;
                break;
            }
            Ok(_) => continue,
            Err(SaharaError::Timeout) => break,
            Err(e) => return Err(e),
        }
    }

    if !got_reset_resp {
        send_frame(
            rw,
            &ResetMachineFrame {
                header: FrameHeader {
                    command: SaharaCommand::ResetMachine as u32,
                    length: 8,
                },
            },
        )?;
    }

    wait_for_hello(rw, HELLO_WAIT).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FirehoseConfiguration, QdlDevice, QdlReadWrite};
    use std::collections::VecDeque;
    use std::io::{Read, Write};

    /// An in-memory duplex standing in for a real transport: a scripted
    /// inbound byte queue plus an outbound capture.
    struct FakeChannel {
        inbound: VecDeque<u8>,
        pub outbound: Vec<u8>,
    }

    impl FakeChannel {
        fn new(inbound: Vec<u8>) -> Self {
            FakeChannel {
                inbound: inbound.into(),
                outbound: Vec::new(),
            }
        }
    }

    impl Read for FakeChannel {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = buf.len().min(self.inbound.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.inbound.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for FakeChannel {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.outbound.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl QdlReadWrite for FakeChannel {}

    fn hello_frame(version: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(SaharaCommand::Hello as u32).to_le_bytes());
        buf.extend_from_slice(&24u32.to_le_bytes());
        buf.extend_from_slice(&version.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&(SaharaMode::ImageTxPending as u32).to_le_bytes());
        buf
    }

    fn read_data_frame(image_id: u32, offset: u32, length: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(SaharaCommand::ReadData as u32).to_le_bytes());
        buf.extend_from_slice(&20u32.to_le_bytes());
        buf.extend_from_slice(&image_id.to_le_bytes());
        buf.extend_from_slice(&offset.to_le_bytes());
        buf.extend_from_slice(&length.to_le_bytes());
        buf
    }

    fn end_image_transfer_frame(image_id: u32, status: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(SaharaCommand::EndImageTransfer as u32).to_le_bytes());
        buf.extend_from_slice(&16u32.to_le_bytes());
        buf.extend_from_slice(&image_id.to_le_bytes());
        buf.extend_from_slice(&status.to_le_bytes());
        buf
    }

    fn done_resp_frame(status: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(SaharaCommand::DoneResp as u32).to_le_bytes());
        buf.extend_from_slice(&12u32.to_le_bytes());
        buf.extend_from_slice(&status.to_le_bytes());
        buf
    }

    /// Hello, one ReadData covering the whole 16 KiB image,
    /// EndImageTransfer{status:0}, DoneResp — all in one shot, no device NAK
    /// anywhere.
    #[test]
    fn sahara_happy_path_uploads_whole_image() {
        let image = vec![0xABu8; 16384];
        let mut script = hello_frame(2);
        script.extend(read_data_frame(13, 0, 16384));
        script.extend(end_image_transfer_frame(13, 0));
        script.extend(done_resp_frame(0));

        let fake = FakeChannel::new(script);
        let mut device = QdlDevice::new(Box::new(fake), FirehoseConfiguration::default());

        let result = sahara_run(
            &mut device,
            SaharaMode::ImageTxPending,
            None,
            &mut [image.clone()],
            vec![],
            false,
        );

        assert!(result.is_ok());
    }

    #[test]
    fn sahara_reports_bad_image_on_nonzero_end_status() {
        let image = vec![0u8; 4096];
        let mut script = hello_frame(2);
        script.extend(read_data_frame(13, 0, 4096));
        script.extend(end_image_transfer_frame(13, 7));

        let fake = FakeChannel::new(script);
        let mut device = QdlDevice::new(Box::new(fake), FirehoseConfiguration::default());

        let result = sahara_run(&mut device, SaharaMode::ImageTxPending, None, &mut [image], vec![], false);

        assert!(matches!(result, Err(SaharaError::BadImage(7))));
    }

    /// A channel that stays silent until it has observed a full
    /// `ResetMachine` frame (8 bytes) written to it, then starts serving a
    /// scripted reply — stands in for a loader that missed the first hello
    /// window but comes back after a forceful reset.
    struct SilentUntilResetChannel {
        post_reset_script: VecDeque<u8>,
        outbound: Vec<u8>,
    }

    impl SilentUntilResetChannel {
        fn new(post_reset_script: Vec<u8>) -> Self {
            SilentUntilResetChannel {
                post_reset_script: post_reset_script.into(),
                outbound: Vec::new(),
            }
        }
    }

    impl Read for SilentUntilResetChannel {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.outbound.len() < 8 {
                return Ok(0);
            }
            let n = buf.len().min(self.post_reset_script.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.post_reset_script.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for SilentUntilResetChannel {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.outbound.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl QdlReadWrite for SilentUntilResetChannel {}

    /// Mirrors the "no Hello for the wait window, host issues ResetMachine,
    /// device sends a fresh Hello" recovery path.
    #[test]
    fn sahara_retries_the_hello_wait_after_a_reset_machine() {
        let image = vec![0x11u8; 2048];
        let mut script = hello_frame(2);
        script.extend(read_data_frame(13, 0, 2048));
        script.extend(end_image_transfer_frame(13, 0));
        script.extend(done_resp_frame(0));

        let fake = SilentUntilResetChannel::new(script);
        let mut device = QdlDevice::new(Box::new(fake), FirehoseConfiguration::default());

        let result = sahara_run(
            &mut device,
            SaharaMode::ImageTxPending,
            None,
            &mut [image.clone()],
            vec![],
            false,
        );

        assert!(result.is_ok());
    }

    /// If the device never sends a Hello even after the retry's
    /// ResetMachine, the caller sees a timeout rather than hanging forever.
    #[test]
    fn sahara_gives_up_after_a_single_retry() {
        struct NeverRespondsChannel;
        impl Read for NeverRespondsChannel {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Ok(0)
            }
        }
        impl Write for NeverRespondsChannel {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        impl QdlReadWrite for NeverRespondsChannel {}

        let mut device = QdlDevice::new(Box::new(NeverRespondsChannel), FirehoseConfiguration::default());
        let result = sahara_run(&mut device, SaharaMode::ImageTxPending, None, &mut [vec![0u8; 16]], vec![], false);
        assert!(matches!(result, Err(SaharaError::Timeout)));
    }

    /// A device that re-requests a chunk it already has (e.g. after a
    /// corrupted USB transfer) gets served again from the same offset
    /// rather than the transfer erroring out or skipping ahead.
    #[test]
    fn sahara_serves_a_repeated_read_data_request() {
        let image = vec![0x42u8; 8192];
        let mut script = hello_frame(2);
        script.extend(read_data_frame(13, 0, 4096));
        script.extend(read_data_frame(13, 0, 4096));
        script.extend(read_data_frame(13, 4096, 4096));
        script.extend(end_image_transfer_frame(13, 0));
        script.extend(done_resp_frame(0));

        let fake = FakeChannel::new(script);
        let mut device = QdlDevice::new(Box::new(fake), FirehoseConfiguration::default());

        let result = sahara_run(
            &mut device,
            SaharaMode::ImageTxPending,
            None,
            &mut [image.clone()],
            vec![],
            false,
        );

        assert!(result.is_ok());
    }
}
