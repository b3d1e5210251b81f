// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use anyhow::Result;
use gptman::{GPTPartitionEntry, GPT};
use owo_colors::OwoColorize;
use std::io::Write;

use qdl::gpt::{find_part as qdl_find_part, read_gpt_from_storage as qdl_read_gpt, read_logical_partition};
use qdl::types::QdlChan;

pub fn read_gpt_from_storage<T: QdlChan>(channel: &mut T, slot: u8, phys_part_idx: u8) -> Result<GPT> {
    Ok(qdl_read_gpt(channel, slot, phys_part_idx)?)
}

pub fn find_part<T: QdlChan>(channel: &mut T, name: &str, slot: u8, phys_part_idx: u8) -> Result<GPTPartitionEntry> {
    Ok(qdl_find_part(channel, name, slot, phys_part_idx)?)
}

pub fn print_partition_table<T: QdlChan>(channel: &mut T, slot: u8, phys_part_idx: u8) -> Result<()> {
    let gpt = qdl_read_gpt(channel, slot, phys_part_idx)?;

    println!(
        "GPT on physical partition {} of {}:",
        phys_part_idx.bright_yellow(),
        channel.fh_config().storage_type.to_string().bright_yellow()
    );
    for (idx, part) in gpt.iter() {
        println!(
            "{}] {}: start_sector = {}, {} bytes ({} kiB)",
            idx,
            part.partition_name.as_str(),
            part.starting_lba,
            part.size().unwrap() * gpt.sector_size,
            part.size().unwrap() * gpt.sector_size / 1024,
        );
    }

    Ok(())
}

pub fn read_storage_logical_partition<T: QdlChan>(
    channel: &mut T,
    out: &mut impl Write,
    name: &str,
    slot: u8,
    phys_part_idx: u8,
) -> Result<()> {
    Ok(read_logical_partition(channel, out, name, slot, phys_part_idx)?)
}
