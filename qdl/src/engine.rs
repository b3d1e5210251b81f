// SPDX-License-Identifier: BSD-3-Clause

//! The connection orchestrator: the single-threaded state machine that owns
//! the transport, drives it through Sahara then Firehose, and exposes the
//! full flashing API the CLI (and any other frontend) calls into.
//!
//! Wraps the same sequence a flashing session always needs — open transport,
//! Sahara hello, upload programmer, settle, reconfigure for Firehose,
//! `<configure>`, dispatch commands, reset on exit — as a reusable object
//! instead of something inlined in a binary's `main`.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gptman::GPTPartitionEntry;

use crate::auth::{authenticate, AuthMode};
use crate::error::EngineError;
use crate::gpt::{find_part, fix_gpt as fix_gpt_table, read_gpt_from_storage, set_active_slot};
use crate::parsers::firehose_parser_ack_nak;
use crate::sahara::{sahara_reset, sahara_run, SaharaCmdModeCmd, SaharaMode};
use crate::types::{ActiveSlot, ChipIdentity, FirehoseConfiguration, FirehoseResetMode, QdlBackend, QdlDevice};
use crate::{firehose_configure, firehose_erase, firehose_nop, firehose_read, firehose_reset, firehose_set_bootable};

/// Runs the four Sahara command-mode queries that make up a chip's identity,
/// in the same one-query-per-hello-cycle shape the CLI already used for the
/// serial-number/key-hash printout before this was centralized here.
fn query_chip_identity(device: &mut QdlDevice, verbose: bool) -> Result<ChipIdentity, EngineError> {
    let serial = sahara_run(device, SaharaMode::Command, Some(SaharaCmdModeCmd::ReadSerialNum), &mut [], vec![], verbose)?;
    let hw_id = sahara_run(device, SaharaMode::Command, Some(SaharaCmdModeCmd::ReadMsmHwId), &mut [], vec![], verbose)?;
    let pk_hash = sahara_run(device, SaharaMode::Command, Some(SaharaCmdModeCmd::ReadOemKeyHash), &mut [], vec![], verbose)?;
    let sbl_version = sahara_run(device, SaharaMode::Command, Some(SaharaCmdModeCmd::ReadSblVersion), &mut [], vec![], verbose)?;
    Ok(ChipIdentity::from_raw_query_bytes(&serial, &hw_id, pk_hash, &sbl_version))
}

/// A per-call cancellation flag: cheaply cloned, checked at every I/O
/// boundary. An in-flight sector write always finishes the current sector
/// before honoring it.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn check(&self) -> Result<(), EngineError> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    SaharaMode,
    FirehoseMode,
    Ready,
    Error,
}

/// The two events a consumer can observe without polling `state()`.
pub enum EngineEvent {
    StateChanged(ConnectionState),
    PortDisconnected,
}

/// The one entry (name, source file) of a [`Engine::flash_multiple`] batch.
pub struct FlashEntry {
    pub partition_name: String,
    pub file_path: String,
}

pub struct Engine {
    state: ConnectionState,
    device: Option<QdlDevice>,
    phys_part_idx: u8,
    storage_slot: u8,
    chip_identity: Option<ChipIdentity>,
    on_event: Option<Box<dyn FnMut(EngineEvent) + Send>>,
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Engine {
            state: ConnectionState::Disconnected,
            device: None,
            phys_part_idx: 0,
            storage_slot: 0,
            chip_identity: None,
            on_event: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The identity collected via Sahara command-mode queries during
    /// [`Engine::connect`]. `None` before a successful connect, or after one
    /// made through [`Engine::connect_firehose_direct`] (which skips Sahara
    /// entirely and has nothing to query).
    pub fn chip_identity(&self) -> Option<&ChipIdentity> {
        self.chip_identity.as_ref()
    }

    /// Exposes the underlying channel to callers (partition enumeration,
    /// direct storage I/O, patch application) that drive it through
    /// functions generic over [`crate::types::QdlChan`] rather than through
    /// one of this struct's own methods.
    pub fn device_mut(&mut self) -> Result<&mut QdlDevice, EngineError> {
        self.require_ready()
    }

    pub fn on_event(&mut self, callback: impl FnMut(EngineEvent) + Send + 'static) {
        self.on_event = Some(Box::new(callback));
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        if let Some(cb) = &mut self.on_event {
            cb(EngineEvent::StateChanged(state));
        }
    }

    fn require_ready(&mut self) -> Result<&mut QdlDevice, EngineError> {
        if self.state != ConnectionState::Ready {
            return Err(EngineError::NotConnected);
        }
        self.device.as_mut().ok_or(EngineError::NotConnected)
    }

    /// Full connect sequence: open the transport, run Sahara to push
    /// `programmer_image`, settle, then bring Firehose up to `Ready`.
    /// `skip_storage_init` is forwarded to `<configure>` as-is, for targets
    /// whose storage media hasn't been provisioned yet.
    pub fn connect(
        &mut self,
        backend: QdlBackend,
        dev_path: Option<String>,
        serial_no: Option<String>,
        programmer_image: Vec<u8>,
        fh_cfg: FirehoseConfiguration,
        auth_mode: &AuthMode,
        skip_storage_init: bool,
        cancel: &CancelToken,
    ) -> Result<bool, EngineError> {
        self.set_state(ConnectionState::Connecting);
        cancel.check().map_err(|e| {
            self.set_state(ConnectionState::Disconnected);
            e
        })?;

        let rw = crate::setup_target_device(backend, serial_no.clone(), dev_path.clone())
            .map_err(|_| EngineError::NotConnected)?;
        let mut device = QdlDevice::new(rw, fh_cfg.clone());

        self.set_state(ConnectionState::SaharaMode);
        let identity = match query_chip_identity(&mut device, false) {
            Ok(identity) => identity,
            Err(e) => {
                self.set_state(ConnectionState::Error);
                return Err(e);
            }
        };
        let effective_auth_mode = if identity.wants_challenge_response() {
            AuthMode::Challenge { chip_serial: identity.serial, hw_id: identity.hw_id }
        } else {
            auth_mode.clone()
        };
        self.chip_identity = Some(identity);

        let sahara_result = sahara_run(&mut device, SaharaMode::ImageTxPending, None, &mut [programmer_image], vec![], false);
        if let Err(e) = sahara_result {
            self.set_state(ConnectionState::Error);
            return Err(e.into());
        }

        // Sahara's handoff leaves the device rebooting into the Firehose
        // programmer: close the transport, honor a settle delay, then
        // reopen it fresh with the stale Sahara-side buffer discarded.
        drop(device);
        std::thread::sleep(Duration::from_millis(500));
        let rw = crate::setup_target_device(backend, serial_no, dev_path).map_err(|_| EngineError::NotConnected)?;
        let mut device = QdlDevice::new(rw, fh_cfg);

        self.set_state(ConnectionState::FirehoseMode);
        if let Err(e) = self.bring_up_firehose(&mut device, &effective_auth_mode, skip_storage_init) {
            self.set_state(ConnectionState::Error);
            return Err(e);
        }

        device.reset_on_drop = true;
        self.device = Some(device);
        self.set_state(ConnectionState::Ready);
        Ok(true)
    }

    /// Skips Sahara entirely — for devices already parked in Firehose mode
    /// (a loader previously uploaded by another tool, or a ramdump target).
    pub fn connect_firehose_direct(
        &mut self,
        backend: QdlBackend,
        dev_path: Option<String>,
        fh_cfg: FirehoseConfiguration,
        cancel: &CancelToken,
    ) -> Result<bool, EngineError> {
        self.set_state(ConnectionState::Connecting);
        cancel.check()?;

        let rw = crate::setup_target_device(backend, None, dev_path).map_err(|_| EngineError::NotConnected)?;
        let mut device = QdlDevice::new(rw, fh_cfg);

        self.set_state(ConnectionState::FirehoseMode);
        if let Err(e) = self.bring_up_firehose(&mut device, &AuthMode::None, false) {
            self.set_state(ConnectionState::Error);
            return Err(e);
        }

        device.reset_on_drop = true;
        self.device = Some(device);
        self.set_state(ConnectionState::Ready);
        Ok(true)
    }

    fn bring_up_firehose(&self, device: &mut QdlDevice, auth_mode: &AuthMode, skip_storage_init: bool) -> Result<(), EngineError> {
        let _ = firehose_read(device, firehose_parser_ack_nak);
        authenticate(device, auth_mode)?;
        firehose_configure(device, skip_storage_init)?;
        Ok(())
    }

    /// Recovery path for a loader stuck mid-Sahara handshake: issue
    /// `Reset`/`ResetMachine` and wait for a fresh `Hello`.
    pub fn reset_sahara(&mut self, backend: QdlBackend, dev_path: Option<String>, cancel: &CancelToken) -> Result<bool, EngineError> {
        cancel.check()?;
        let rw = crate::setup_target_device(backend, None, dev_path).map_err(|_| EngineError::NotConnected)?;
        let mut device = QdlDevice::new(rw, FirehoseConfiguration::default());
        sahara_reset(&mut device)?;
        Ok(true)
    }

    pub fn hard_reset(&mut self, backend: QdlBackend, dev_path: Option<String>, cancel: &CancelToken) -> Result<bool, EngineError> {
        cancel.check()?;
        let rw = crate::setup_target_device(backend, None, dev_path).map_err(|_| EngineError::NotConnected)?;
        let mut device = QdlDevice::new(rw, FirehoseConfiguration::default());
        firehose_reset(&mut device, &FirehoseResetMode::ResetToEdl, 0)?;
        Ok(true)
    }

    pub fn authenticate(&mut self, mode: &AuthMode, cancel: &CancelToken) -> Result<bool, EngineError> {
        cancel.check()?;
        let device = self.require_ready()?;
        authenticate(device, mode)?;
        Ok(true)
    }

    pub fn read_all_gpt(&mut self, max_luns: u8, cancel: &CancelToken) -> Result<Vec<(u8, GPTPartitionEntry)>, EngineError> {
        let slot = self.storage_slot;
        let device = self.require_ready()?;
        let mut out = Vec::new();
        for lun in 0..max_luns {
            cancel.check()?;
            if let Ok(gpt) = read_gpt_from_storage(device, slot, lun) {
                for (_, part) in gpt.iter() {
                    out.push((lun, part.clone()));
                }
            }
        }
        Ok(out)
    }

    pub fn find_partition(&mut self, name: &str) -> Result<GPTPartitionEntry, EngineError> {
        let (slot, phys_part_idx) = (self.storage_slot, self.phys_part_idx);
        let device = self.require_ready()?;
        find_part(device, name, slot, phys_part_idx)
    }

    pub fn read_partition(&mut self, name: &str, out_path: &Path, cancel: &CancelToken) -> Result<bool, EngineError> {
        cancel.check()?;
        let (slot, phys_part_idx) = (self.storage_slot, self.phys_part_idx);
        let device = self.require_ready()?;
        let mut file = std::fs::File::create(out_path)?;
        crate::gpt::read_logical_partition(device, &mut file, name, slot, phys_part_idx)?;
        Ok(true)
    }

    pub fn write_partition(&mut self, name: &str, in_path: &Path, cancel: &CancelToken) -> Result<bool, EngineError> {
        cancel.check()?;
        let (slot, phys_part_idx) = (self.storage_slot, self.phys_part_idx);
        let device = self.require_ready()?;
        let file = std::fs::File::open(in_path)?;
        crate::gpt::write_logical_partition(device, file, name, slot, phys_part_idx)?;
        Ok(true)
    }

    /// Writes `path` starting at an explicit `start_sector` on `lun` without
    /// consulting the GPT at all — `start_sector` is passed through
    /// verbatim so a caller can express `"NUM_DISK_SECTORS-k"` for a backup
    /// GPT write, matching Firehose's own literal-expression support.
    pub fn write_direct(
        &mut self,
        label: &str,
        path: &Path,
        lun: u8,
        start_sector: &str,
        cancel: &CancelToken,
    ) -> Result<bool, EngineError> {
        cancel.check()?;
        let slot = self.storage_slot;
        let device = self.require_ready()?;
        let mut file = std::fs::File::open(path)?;
        let sector_size = device.fh_cfg.storage_sector_size as u64;
        let num_sectors = file.metadata()?.len().div_ceil(sector_size);
        crate::firehose_program_storage(device, &mut file, label, num_sectors, slot, lun, start_sector)?;
        Ok(true)
    }

    /// Tries the device's native `<erase>` opcode first; not every Firehose
    /// programmer implements it, so a NAK falls back to a zero-fill write
    /// over the same sector range, matching the CLI's long-standing default.
    pub fn erase_partition(&mut self, name: &str, cancel: &CancelToken) -> Result<bool, EngineError> {
        cancel.check()?;
        let (slot, phys_part_idx) = (self.storage_slot, self.phys_part_idx);
        let device = self.require_ready()?;
        let part = find_part(device, name, slot, phys_part_idx)?;
        let num_sectors = part.ending_lba - part.starting_lba + 1;
        let start_sector = part.starting_lba as u32;

        if firehose_erase(device, num_sectors, phys_part_idx, start_sector).is_ok() {
            return Ok(true);
        }

        let sector_size = device.fh_cfg.storage_sector_size as u64;
        let zeroes = std::io::repeat(0).take(num_sectors * sector_size);
        crate::firehose_program_storage(device, zeroes, name, num_sectors, slot, phys_part_idx, &part.starting_lba.to_string())?;
        Ok(true)
    }

    pub fn read_partition_data(&mut self, name: &str, offset: u64, size: u64, cancel: &CancelToken) -> Result<Vec<u8>, EngineError> {
        cancel.check()?;
        let (slot, phys_part_idx) = (self.storage_slot, self.phys_part_idx);
        let device = self.require_ready()?;
        let part = find_part(device, name, slot, phys_part_idx)?;
        let sector_size = device.fh_cfg.storage_sector_size as u64;
        let num_sectors = size.div_ceil(sector_size);
        let start_sector = part.starting_lba + offset / sector_size;

        let mut buf = Vec::new();
        crate::firehose_read_storage(device, &mut buf, num_sectors, slot, phys_part_idx, start_sector as u32)?;
        let skip = (offset % sector_size) as usize;
        Ok(buf[skip..(skip + size as usize).min(buf.len())].to_vec())
    }

    pub fn reboot(&mut self, cancel: &CancelToken) -> Result<bool, EngineError> {
        self.power(FirehoseResetMode::Reset, cancel)
    }

    pub fn power_off(&mut self, cancel: &CancelToken) -> Result<bool, EngineError> {
        self.power(FirehoseResetMode::Off, cancel)
    }

    pub fn reboot_to_edl(&mut self, cancel: &CancelToken) -> Result<bool, EngineError> {
        self.power(FirehoseResetMode::ResetToEdl, cancel)
    }

    fn power(&mut self, mode: FirehoseResetMode, cancel: &CancelToken) -> Result<bool, EngineError> {
        cancel.check()?;
        let device = self.require_ready()?;
        device.reset_on_drop = false;
        firehose_reset(device, &mode, 0)?;
        self.set_state(ConnectionState::Disconnected);
        self.device = None;
        Ok(true)
    }

    pub fn set_active_slot(&mut self, slot: ActiveSlot, cancel: &CancelToken) -> Result<bool, EngineError> {
        cancel.check()?;
        let (storage_slot, phys_part_idx) = (self.storage_slot, self.phys_part_idx);
        let device = self.require_ready()?;
        set_active_slot(device, storage_slot, phys_part_idx, slot)?;
        Ok(true)
    }

    /// `lun == -1` repairs every LUN; otherwise only the specified one.
    pub fn fix_gpt(&mut self, lun: i16, cancel: &CancelToken) -> Result<bool, EngineError> {
        cancel.check()?;
        let storage_slot = self.storage_slot;
        let device = self.require_ready()?;
        let luns: Vec<u8> = if lun < 0 { (0..8).collect() } else { vec![lun as u8] };
        for target_lun in luns {
            cancel.check()?;
            if let Ok(mut gpt) = read_gpt_from_storage(device, storage_slot, target_lun) {
                fix_gpt_table(device, storage_slot, target_lun, &mut gpt)?;
            }
        }
        Ok(true)
    }

    pub fn set_boot_lun(&mut self, lun: u8, cancel: &CancelToken) -> Result<bool, EngineError> {
        cancel.check()?;
        let device = self.require_ready()?;
        firehose_set_bootable(device, lun)?;
        Ok(true)
    }

    pub fn ping(&mut self, cancel: &CancelToken) -> Result<bool, EngineError> {
        cancel.check()?;
        let device = self.require_ready()?;
        firehose_nop(device)?;
        Ok(true)
    }

    pub fn apply_patch_files(&mut self, paths: &[String], cancel: &CancelToken) -> Result<usize, EngineError> {
        let mut applied = 0;
        for path in paths {
            cancel.check()?;
            let bytes = std::fs::read(path)?;
            let xml = xmltree::Element::parse(&bytes[..]).map_err(crate::error::FirehoseError::from)?;
            let device = self.require_ready()?;
            for node in &xml.children {
                if let xmltree::XMLNode::Element(e) = node {
                    if e.name.to_lowercase() != "patch" {
                        continue;
                    }
                    let get = |k: &str| e.attributes.get(k).cloned().unwrap_or_default();
                    crate::firehose_patch(
                        device,
                        get("byte_offset").parse().unwrap_or(0),
                        get("slot").parse().unwrap_or(0),
                        get("physical_partition_number").parse().unwrap_or(0),
                        get("size_in_bytes").parse().unwrap_or(0),
                        &get("start_sector"),
                        &get("value"),
                    )?;
                    applied += 1;
                }
            }
        }
        Ok(applied)
    }

    pub fn flash_multiple(&mut self, entries: &[FlashEntry], cancel: &CancelToken) -> Result<bool, EngineError> {
        for entry in entries {
            cancel.check()?;
            self.write_partition(&entry.partition_name, Path::new(&entry.file_path), cancel)?;
        }
        Ok(true)
    }

    /// Splits a single oversized source file across several named
    /// partitions in order, each sized to the destination GPT entry — the
    /// counterpart of vendor tools that ship a `super.img` too large for
    /// any one logical partition and expect the flasher to split it.
    pub fn flash_super_split(&mut self, source: &Path, partition_names: &[String], cancel: &CancelToken) -> Result<bool, EngineError> {
        let mut reader = std::fs::File::open(source)?;
        for name in partition_names {
            cancel.check()?;
            let (slot, phys_part_idx) = (self.storage_slot, self.phys_part_idx);
            let device = self.require_ready()?;
            let part = find_part(device, name, slot, phys_part_idx)?;
            let chunk_sectors = part.ending_lba - part.starting_lba + 1;
            let sector_size = device.fh_cfg.storage_sector_size as u64;
            let mut chunk = vec![0u8; (chunk_sectors * sector_size) as usize];
            let n = std::io::Read::read(&mut reader, &mut chunk)?;
            if n == 0 {
                break;
            }
            crate::firehose_program_storage(
                device,
                &chunk[..n],
                name,
                n as u64 / sector_size,
                slot,
                phys_part_idx,
                &part.starting_lba.to_string(),
            )?;
        }
        Ok(true)
    }

    /// A liveness probe consulted on every externally visible `isConnected`
    /// query; a failed nop demotes state to `Disconnected` and fires the
    /// disconnect event exactly once.
    pub fn is_connected(&mut self) -> bool {
        if self.state != ConnectionState::Ready {
            return false;
        }
        let alive = matches!(self.device.as_mut().map(firehose_nop), Some(Ok(())));
        if !alive {
            self.device = None;
            self.set_state(ConnectionState::Disconnected);
            if let Some(cb) = &mut self.on_event {
                cb(EngineEvent::PortDisconnected);
            }
        }
        alive
    }

    pub fn disconnect(&mut self) {
        if let Some(mut device) = self.device.take() {
            let _ = firehose_reset(&mut device, &FirehoseResetMode::Reset, 0);
            device.reset_on_drop = false;
        }
        self.set_state(ConnectionState::Disconnected);
    }
}

impl Write for Engine {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.device
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "engine is not connected"))?
            .write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.device
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "engine is not connected"))?
            .flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_engine_is_disconnected_and_rejects_operations() {
        let mut engine = Engine::new();
        assert_eq!(engine.state(), ConnectionState::Disconnected);
        let cancel = CancelToken::new();
        let err = engine.ping(&cancel).unwrap_err();
        assert!(matches!(err, EngineError::NotConnected));
    }

    #[test]
    fn cancel_token_short_circuits_before_any_io() {
        let mut engine = Engine::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = engine.ping(&cancel).unwrap_err();
        // The cancellation check runs before the ready check, so a
        // cancelled token wins even on a disconnected engine.
        assert!(matches!(err, EngineError::Cancelled));
        assert!(cancel.is_cancelled());
    }

    /// Stands in for a USB cable yanked mid-session: every read/write after
    /// the port vanishes comes back as a broken-pipe I/O error instead of
    /// blocking or silently dropping bytes.
    struct YankedChannel;

    impl std::io::Read for YankedChannel {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "device disconnected"))
        }
    }

    impl Write for YankedChannel {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "device disconnected"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl crate::types::QdlReadWrite for YankedChannel {}

    #[test]
    fn a_disconnect_mid_session_surfaces_as_a_transport_error() {
        let mut engine = Engine::new();
        engine.device = Some(QdlDevice::new(Box::new(YankedChannel), FirehoseConfiguration::default()));
        engine.state = ConnectionState::Ready;

        let cancel = CancelToken::new();
        let err = engine.ping(&cancel).unwrap_err();
        assert!(err.is_transport());
    }

    /// A scripted Sahara channel serving one full command-mode cycle
    /// (`Hello` → `HelloResp` → `SwitchMode`/`CmdReady` → `ExecuteCmd`/`Resp`/`Data`)
    /// per query, for exercising [`query_chip_identity`] without a real device.
    struct ScriptedCommandModeChannel {
        inbound: std::collections::VecDeque<u8>,
    }

    impl ScriptedCommandModeChannel {
        fn new(responses: &[&[u8]]) -> Self {
            let mut script = Vec::new();
            for response in responses {
                script.extend(command_mode_hello_frame());
                script.extend(frame(0x10, 8, &[]));
                let mut exec_resp_payload = 0u32.to_le_bytes().to_vec();
                exec_resp_payload.extend_from_slice(&(response.len() as u32).to_le_bytes());
                script.extend(frame(0x13, 16, &exec_resp_payload));
                script.extend(response.iter().copied());
            }
            ScriptedCommandModeChannel { inbound: script.into() }
        }
    }

    fn frame(command: u32, length: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&command.to_le_bytes());
        buf.extend_from_slice(&length.to_le_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    /// A `Hello` advertising `SaharaMode::Command`, 24 bytes total
    /// (8-byte header + 4 `u32` payload fields).
    fn command_mode_hello_frame() -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&2u32.to_le_bytes()); // version
        payload.extend_from_slice(&1u32.to_le_bytes()); // version_compatible
        payload.extend_from_slice(&0u32.to_le_bytes()); // max_cmd_packet_length
        payload.extend_from_slice(&3u32.to_le_bytes()); // mode = Command
        frame(0x01, 24, &payload)
    }

    impl std::io::Read for ScriptedCommandModeChannel {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = buf.len().min(self.inbound.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.inbound.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for ScriptedCommandModeChannel {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl crate::types::QdlReadWrite for ScriptedCommandModeChannel {}

    /// A chip reporting vendor X's OEM id in the top 16 bits of its hardware
    /// id is recognized by [`ChipIdentity::wants_challenge_response`] once
    /// [`query_chip_identity`] has assembled it from the four query replies.
    #[test]
    fn query_chip_identity_assembles_an_identity_that_triggers_challenge_detection() {
        let hw_id: u64 = (ChipIdentity::OEM_ID_VENDOR_X as u64) << 48;
        let fake = ScriptedCommandModeChannel::new(&[
            &0x1234_5678u32.to_le_bytes(),
            &hw_id.to_le_bytes(),
            &[0xaa, 0xbb],
            &10u32.to_le_bytes(),
        ]);
        let mut device = QdlDevice::new(Box::new(fake), FirehoseConfiguration::default());

        let identity = query_chip_identity(&mut device, false).unwrap();

        assert_eq!(identity.serial, 0x1234_5678);
        assert!(identity.wants_challenge_response());
    }
}
