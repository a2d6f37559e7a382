// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;
use std::io::{self, Error, ErrorKind};

use crate::consts::{FIRST_DIR_TRACK_DRWA, INVALID_LDAT, INVALID_LINK, WORDS_PER_SECTOR, WORDS_PER_TRACK};
use crate::device::{FileSystemDiskDevice, IoStatus};
use crate::freespace::PackFreeSpaceTable;
use crate::types::{LdatIndex, NodeId, PrepFactor, TrackCount};
use crate::word::Word36;

/// The VOL1 label in block 0 of a prepped pack. This is the only structure
/// with a fixed on-disk location; everything else is found from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackLabel {
    pub pack_name: String,
    pub first_directory_track_address: u64,
    pub words_per_block: PrepFactor,
    pub track_count: TrackCount,
}

impl PackLabel {
    pub fn new(pack_name: &str, prep_factor: PrepFactor, track_count: TrackCount) -> Self {
        PackLabel {
            pack_name: pack_name.to_string(),
            first_directory_track_address: FIRST_DIR_TRACK_DRWA,
            words_per_block: prep_factor,
            track_count,
        }
    }

    pub fn blocks_per_track(&self) -> u64 {
        WORDS_PER_TRACK as u64 / u64::from(self.words_per_block)
    }

    pub fn block_count(&self) -> u64 {
        self.track_count * self.blocks_per_track()
    }

    pub fn encode(&self, words: &mut [Word36]) {
        for word in words.iter_mut() {
            word.set_w(0);
        }

        let padded = format!("{:<6}", self.pack_name);
        words[0].from_str_ascii("VOL1");
        words[1].from_str_ascii(&padded[0..4]);
        words[2].from_str_ascii(&padded[4..6]);
        words[2].set_h2(0);
        words[3].set_w(self.first_directory_track_address);
        words[4].set_h1(self.blocks_per_track());
        words[4].set_h2(u64::from(self.words_per_block));
        words[0o14].set_s1(0o10); // recorded by a workstation utility
        words[0o14].set_s2(1); // VOL1 version
        words[0o14].set_h2(10); // heads per cylinder, nominal
        words[0o16].set_w(self.track_count);
        words[0o17].set_h1(u64::from(self.words_per_block));
        words[0o21].set_w(self.block_count());
    }

    /// Reads a label from the first 28 words of block 0.
    /// Returns None when the VOL1 marker is absent (an unprepped pack).
    pub fn decode(words: &[Word36]) -> Option<PackLabel> {
        if words[0].to_string_ascii() != "VOL1" {
            return None;
        }

        let mut pack_name = words[1].to_string_ascii();
        pack_name.push_str(&words[2].to_string_ascii()[0..2]);
        let pack_name = pack_name.trim_end().to_string();

        Some(PackLabel {
            pack_name,
            first_directory_track_address: words[3].w(),
            words_per_block: words[4].h2() as PrepFactor,
            track_count: words[0o16].w(),
        })
    }
}

/// Everything the directory layer tracks about one fixed pack.
pub struct PackDescriptor {
    pub node_id: NodeId,
    pub pack_name: String,
    pub prep_factor: PrepFactor,
    pub first_directory_track_address: u64,
    pub can_allocate: bool,
    /// sectors per block minus one; aligns sector addresses to blocks
    pub block_mask: u64,
    pub free_space: PackFreeSpaceTable,
    pub mfd_track_count: TrackCount,
    pub mfd_sectors_used: u64,
}

impl PackDescriptor {
    pub fn new(node_id: NodeId, label: &PackLabel) -> Self {
        PackDescriptor {
            node_id,
            pack_name: label.pack_name.clone(),
            prep_factor: label.words_per_block,
            first_directory_track_address: label.first_directory_track_address,
            can_allocate: true,
            block_mask: u64::from(label.words_per_block / WORDS_PER_SECTOR as u32) - 1,
            free_space: PackFreeSpaceTable::new(label.track_count),
            mfd_track_count: 0,
            mfd_sectors_used: 0,
        }
    }

    pub fn blocks_per_track(&self) -> u64 {
        WORDS_PER_TRACK as u64 / u64::from(self.prep_factor)
    }

    pub fn sectors_per_block(&self) -> u64 {
        u64::from(self.prep_factor / WORDS_PER_SECTOR as u32)
    }
}

/// Builds the image of a pack's initial directory track: a DAS in sector 0
/// with sectors 0 and 1 allocated, and the pack metadata in sector 1.
/// A fixed pack carries the not-yet-initialized LDAT marker until a boot
/// claims it; a removable pack carries LDAT 0.
pub fn initial_directory_track(label: &PackLabel, is_fixed: bool, track: &mut [Word36]) {
    for word in track.iter_mut() {
        word.set_w(0);
    }

    // sector 0: the first DAS on the pack
    let das = &mut track[0..WORDS_PER_SECTOR];
    das[1].set_w(0o600000_000000); // sectors 0 and 1 allocated
    for entry in 1..=8 {
        das[entry * 3].set_w(INVALID_LINK);
    }
    das[27].set_w(INVALID_LINK);

    // sector 1: pack metadata
    let sector1 = &mut track[WORDS_PER_SECTOR..2 * WORDS_PER_SECTOR];
    sector1[2].set_w(label.track_count);
    sector1[3].set_w(label.track_count);
    sector1[4].from_str_fieldata(&label.pack_name);
    sector1[5].set_h1(if is_fixed { u64::from(INVALID_LDAT) } else { 0 });
    sector1[0o10].set_t1(label.blocks_per_track());
    sector1[0o10].set_s3(1); // sector 1 version
    sector1[0o10].set_t3(u64::from(label.words_per_block));
}

/// Preps a pack image: label plus initial directory track.
pub fn prep_pack(
    device: &mut FileSystemDiskDevice,
    pack_name: &str,
    prep_factor: PrepFactor,
    track_count: TrackCount,
    removable: bool,
) -> io::Result<()> {
    let status = device.prep(pack_name, prep_factor, track_count);
    if status != IoStatus::Complete {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!("prep failed: {:?}", status),
        ));
    }

    let label = PackLabel::new(pack_name, prep_factor, track_count);
    let mut track = vec![Word36::default(); WORDS_PER_TRACK];
    initial_directory_track(&label, !removable, &mut track);

    let first_block = label.first_directory_track_address / u64::from(prep_factor);
    let words = prep_factor as usize;
    for bx in 0..label.blocks_per_track() {
        let start = bx as usize * words;
        let status = device.write_block(first_block + bx, &track[start..start + words]);
        if status != IoStatus::Complete {
            return Err(Error::new(
                ErrorKind::Other,
                format!("cannot write directory track: {:?}", status),
            ));
        }
    }
    Ok(())
}

/// Label and directory summary of a pack image, for display.
#[derive(Debug)]
pub struct PackInfo {
    pub pack_name: String,
    pub prep_factor: PrepFactor,
    pub track_count: TrackCount,
    pub block_count: u64,
    pub blocks_per_track: u64,
    pub first_directory_track_address: u64,
    pub ldat: LdatIndex,
    pub is_fixed: bool,
    pub is_initialized: bool,
}

impl fmt::Display for PackInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Pack               {}", self.pack_name)?;
        writeln!(f, "Prep Factor        {}", self.prep_factor)?;
        writeln!(f, "Track Count        {}", self.track_count)?;
        writeln!(f, "Block Count        {}", self.block_count)?;
        writeln!(f, "Blocks per Track   {}", self.blocks_per_track)?;
        writeln!(f, "First Dir Track    {:012o}", self.first_directory_track_address)?;
        let class = if self.is_fixed { "fixed" } else { "removable" };
        if self.is_initialized {
            writeln!(f, "Class              {} (LDAT {:04o})", class, self.ldat)
        } else {
            writeln!(f, "Class              {} (not initialized)", class)
        }
    }
}

/// Reads the label and directory sector 1 of an image and summarizes them.
pub fn pack_info(device: &mut FileSystemDiskDevice) -> io::Result<PackInfo> {
    let geometry = device
        .geometry()
        .ok_or_else(|| Error::new(ErrorKind::InvalidData, "pack is not prepped"))?;

    let mut block = vec![Word36::default(); geometry.words_per_block as usize];
    if device.read_block(0, &mut block) != IoStatus::Complete {
        return Err(Error::new(ErrorKind::Other, "cannot read label"));
    }
    let label = PackLabel::decode(&block)
        .ok_or_else(|| Error::new(ErrorKind::InvalidData, "no VOL1 label"))?;

    // sector 1 of the initial directory track holds the LDAT assignment
    let dir_block = label.first_directory_track_address / u64::from(geometry.words_per_block);
    let sector1_block = dir_block + u64::from(geometry.words_per_block == WORDS_PER_SECTOR as u32);
    if device.read_block(sector1_block, &mut block) != IoStatus::Complete {
        return Err(Error::new(ErrorKind::Other, "cannot read directory track"));
    }
    let sector1 = if geometry.words_per_block == WORDS_PER_SECTOR as u32 {
        &block[0..WORDS_PER_SECTOR]
    } else {
        &block[WORDS_PER_SECTOR..2 * WORDS_PER_SECTOR]
    };

    let ldat = sector1[5].h1() as LdatIndex;
    Ok(PackInfo {
        pack_name: label.pack_name.clone(),
        prep_factor: label.words_per_block,
        track_count: label.track_count,
        block_count: label.block_count(),
        blocks_per_track: label.blocks_per_track(),
        first_directory_track_address: label.first_directory_track_address,
        ldat: if ldat == INVALID_LDAT { 0 } else { ldat },
        is_fixed: ldat != 0,
        is_initialized: ldat != 0 && ldat != INVALID_LDAT,
    })
}
