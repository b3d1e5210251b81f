// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use itertools::Itertools;
use owo_colors::OwoColorize;
use qdl::auth::AuthMode;
use qdl::engine::{CancelToken, Engine};
use qdl::firehose_reset;
use qdl::types::{FirehoseResetMode, FirehoseStorageType, QdlBackend};
use qdl::{firehose_get_default_sector_size, firehose_nop, firehose_peek, firehose_program_storage, firehose_set_bootable};
use util::{find_part, print_partition_table, read_gpt_from_storage, read_storage_logical_partition};

use std::fs::{self, File};
use std::{path::Path, str::FromStr};

mod flasher;
mod programfile;
mod util;

#[derive(Debug, Subcommand, PartialEq)]
enum Command {
    /// Dump the entire storage
    Dump {
        #[arg(short, default_value = "out/")]
        outdir: String,
    },

    /// Dump a single partition
    DumpPart {
        #[arg()]
        name: String,

        #[arg(short, default_value = "out/")]
        outdir: String,
    },

    /// Invoke the flasher
    Flasher {
        #[arg(short, long, num_args = 1..=128, value_name = "FILE")]
        program_file_paths: Vec<String>,

        #[arg(short = 'x', long, num_args = 0..=128, value_name = "FILE")]
        patch_file_paths: Vec<String>,

        #[arg(long, default_value = "false")]
        verbose_flasher: bool,
    },

    /// Erase a partition
    Erase {
        #[arg()]
        name: String,
    },

    /// Ask the device to do nothing, hopefully successfully
    Nop,

    /// Overwrite the storage physical partition contents with a raw image.
    /// Similar to Flasher, but this one only takes a partition dump as
    /// input and performs no real validation on the input data.
    OverwriteStorage {
        #[arg()]
        file_path: String,
    },

    /// Peek at memory
    Peek {
        #[arg(value_parser=maybe_hex::<u64>)]
        base: u64,

        #[arg(default_value = "1", value_parser=maybe_hex::<u64>)]
        len: u64,
    },

    /// Print the GPT table
    PrintGpt,

    /// Restart the device
    Reset {
        #[arg(default_value = "system", value_name = "edl/off/system")]
        reset_mode: String,
    },

    /// Mark physical storage partition as bootable
    SetBootablePart {
        #[arg()]
        idx: u8,
    },

    /// Write a partition
    Write {
        #[arg()]
        part_name: String,

        #[arg()]
        file_path: String,
    },
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(long, value_name = "usb/serial")]
    backend: Option<String>,

    /// Accept storage r/w operations, but make them never actually execute (useful for testing USB throughput)
    #[arg(long, default_value = "false")]
    bypass_storage: bool,

    #[arg(short, long, help = "E.g. COM4 on Windows")]
    dev_path: Option<String>,

    #[arg(short, long, value_name = "FILE")]
    loader_path: String,

    #[arg(long, default_value = "false", help = "Validate every packet. Slow.")]
    hash_packets: bool,

    #[arg(short = 'L', long, default_value = "0", help = "e.g. LUN index for UFS")]
    phys_part_idx: u8,

    #[arg(long, default_value = "false")]
    print_firehose_log: bool,

    #[arg(long, default_value = "false", help = "Every <program> operation is read back. VERY SLOW!")]
    read_back_verify: bool,

    /// WARNING: Will be deprecated in release v1.0.0
    #[arg(long, default_value = "edl", value_name = "edl/off/system")]
    reset_mode: String,

    // Only applies to the USB backend
    #[arg(long)]
    serial_no: Option<String>,

    #[arg(short, long, value_name = "emmc/ufs/nand/spinor")]
    storage_type: String,

    #[arg(short = 'S', long, default_value = "0", help = "Index of the physical device (e.g. 1 for secondary UFS)")]
    storage_slot: u8,

    #[arg(long)]
    sector_size: Option<usize>,

    #[arg(long, default_value = "false", help = "Required for unprovisioned storage media.")]
    skip_storage_init: bool,

    #[arg(long, default_value = "false")]
    verbose_firehose: bool,

    #[command(subcommand)]
    command: Command,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let backend = match args.backend {
        Some(b) => QdlBackend::from_str(&b)?,
        None => QdlBackend::default(),
    };
    let reset_mode = FirehoseResetMode::from_str(&args.reset_mode)?;
    let storage_type = FirehoseStorageType::from_str(&args.storage_type)?;

    let mbn_loader = match fs::read(args.loader_path) {
        Ok(m) => m,
        Err(e) => bail!("Couldn't open the programmer binary: {}", e.to_string()),
    };

    println!("{} {}", env!("CARGO_PKG_NAME").green(), env!("CARGO_PKG_VERSION").yellow());

    let storage_sector_size = match args.sector_size {
        Some(n) => n,
        None => {
            let n = firehose_get_default_sector_size(storage_type);
            println!("{} {}", "Using a default sector size of".bright_black(), n);
            n
        }
    };

    let fh_cfg = qdl::types::FirehoseConfiguration {
        hash_packets: args.hash_packets,
        read_back_verify: args.read_back_verify,
        storage_type,
        storage_sector_size,
        storage_slot: args.storage_slot,
        bypass_storage: args.bypass_storage,
        backend,
        skip_firehose_log: !args.print_firehose_log,
        verbose_firehose: args.verbose_firehose,
        ..Default::default()
    };

    let mut engine = Engine::new();
    let cancel = CancelToken::new();
    engine.connect(
        backend,
        args.dev_path,
        args.serial_no,
        mbn_loader,
        fh_cfg,
        &AuthMode::None,
        args.skip_storage_init,
        &cancel,
    )?;

    if let Some(identity) = engine.chip_identity() {
        println!("Chip serial number: 0x{:x}", identity.serial);
        println!("OEM Private Key hash: 0x{:02x}", identity.pk_hash.iter().format(""));
    }

    match args.command {
        Command::Dump { outdir } => {
            fs::create_dir_all(&outdir)?;
            let outpath = Path::new(&outdir);

            let gpt = read_gpt_from_storage(engine.device_mut()?, args.storage_slot, args.phys_part_idx)?;
            for (_, p) in gpt.iter() {
                if p.partition_name.as_str().is_empty() || p.size()? == 0 {
                    continue;
                }

                let mut out = File::create(outpath.join(p.partition_name.to_string()))?;
                read_storage_logical_partition(
                    engine.device_mut()?,
                    &mut out,
                    &p.partition_name.to_string(),
                    args.storage_slot,
                    args.phys_part_idx,
                )?
            }
        }
        Command::DumpPart { name, outdir } => {
            fs::create_dir_all(&outdir)?;
            let outpath = Path::new(&outdir);
            let mut out = File::create(outpath.join(&name))?;

            read_storage_logical_partition(engine.device_mut()?, &mut out, &name, args.storage_slot, args.phys_part_idx)?
        }
        Command::Erase { name } => {
            let part = find_part(engine.device_mut()?, &name, args.storage_slot, args.phys_part_idx)?;

            firehose_program_storage(
                engine.device_mut()?,
                &mut &[0u8][..],
                &name,
                (part.ending_lba - part.starting_lba + 1) as u64,
                args.storage_slot,
                args.phys_part_idx,
                &part.starting_lba.to_string(),
            )?;
        }
        Command::Flasher { program_file_paths, patch_file_paths, verbose_flasher } => {
            flasher::run_flash(engine.device_mut()?, program_file_paths, patch_file_paths, verbose_flasher)?;
        }
        Command::Nop => println!(
            "Your nop was {}",
            firehose_nop(engine.device_mut()?)
                .map(|_| "successful".bright_green())
                .map_err(|_| "unsuccessful".bright_red())
                .unwrap()
        ),
        Command::OverwriteStorage { file_path } => {
            let mut file = File::open(file_path)?;
            let device = engine.device_mut()?;
            let file_len_sectors = file.metadata()?.len().div_ceil(device.fh_cfg.storage_sector_size as u64);

            firehose_program_storage(device, &mut file, "", file_len_sectors, args.storage_slot, args.phys_part_idx, "0")?;
        }
        Command::Peek { base, len } => {
            let bytes = firehose_peek(engine.device_mut()?, base, len)?;
            println!("{}", bytes.iter().format_with(" ", |b, f| f(&format_args!("{b:02x}"))));
        }
        Command::PrintGpt => print_partition_table(engine.device_mut()?, args.storage_slot, args.phys_part_idx)?,
        Command::Reset { reset_mode } => firehose_reset(engine.device_mut()?, &FirehoseResetMode::from_str(&reset_mode)?, 0)?,
        Command::SetBootablePart { idx } => firehose_set_bootable(engine.device_mut()?, idx)?,
        Command::Write { part_name, file_path } => {
            let part: gptman::GPTPartitionEntry = find_part(engine.device_mut()?, &part_name, args.storage_slot, args.phys_part_idx)?;
            let mut file = File::open(file_path)?;
            let device = engine.device_mut()?;
            let file_len_sectors = file.metadata()?.len().div_ceil(device.fh_cfg.storage_sector_size as u64);
            let part_len_sectors = part.ending_lba - part.starting_lba + 1;

            if file_len_sectors > part_len_sectors {
                bail!(
                    "Partition {} is too small for the specified image ({} > {})",
                    part_name,
                    file_len_sectors,
                    part_len_sectors
                );
            }

            firehose_program_storage(
                device,
                &mut file,
                &part_name,
                file_len_sectors,
                args.storage_slot,
                args.phys_part_idx,
                &part.starting_lba.to_string(),
            )?;
        }
    };

    engine.device_mut()?.reset_on_drop = false;
    firehose_reset(engine.device_mut()?, &reset_mode, 0)?;

    println!("{} {}", "All went well! Resetting to".green(), reset_mode.to_string().bright_yellow());

    Ok(())
}
