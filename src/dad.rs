// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::consts::{DAD_FIRST_EXTENT_WORD, EXTENTS_PER_DAD, INVALID_LDAT, WORDS_PER_TRACK};
use crate::fas::{FileAllocation, FileAllocationSet};
use crate::types::LdatIndex;
use crate::word::Word36;

/// One on-disk extent descriptor: a run of device words, or a hole
/// (LDAT `0_400000`) covering file space which was never allocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DadExtent {
    pub device_word_address: u64,
    pub word_count: u64,
    pub ldat: LdatIndex,
}

impl DadExtent {
    pub fn is_hole(&self) -> bool {
        self.ldat == INVALID_LDAT
    }

    fn hole(word_count: u64) -> Self {
        DadExtent {
            device_word_address: 0,
            word_count,
            ldat: INVALID_LDAT,
        }
    }

    fn from_allocation(fa: &FileAllocation) -> Self {
        DadExtent {
            device_word_address: fa.device_track_id * WORDS_PER_TRACK as u64,
            word_count: fa.file_region.track_count * WORDS_PER_TRACK as u64,
            ldat: fa.ldat,
        }
    }
}

/// Flattens a FAS into the extent sequence its DAD chain must carry:
/// real extents in file order, with a hole extent wherever the file skips
/// tracks. The sequence covers [0, highest allocated word) contiguously.
pub fn build_extents(fas: &FileAllocationSet) -> Vec<DadExtent> {
    let mut extents = Vec::new();
    let mut cursor = 0u64;

    for fa in fas.allocations() {
        if fa.file_region.track_id > cursor {
            let gap = fa.file_region.track_id - cursor;
            extents.push(DadExtent::hole(gap * WORDS_PER_TRACK as u64));
        }
        extents.push(DadExtent::from_allocation(fa));
        cursor = fa.file_region.limit();
    }

    extents
}

pub fn sectors_required(extent_count: usize) -> usize {
    extent_count.div_ceil(EXTENTS_PER_DAD)
}

/// Fills the bounds and extent words of one DAD sector and returns the file
/// word address just past the last extent written. Link words 0 and 1 are the
/// caller's business.
pub fn encode_dad_sector(
    sector: &mut [Word36],
    extents: &[DadExtent],
    first_file_word: u64,
) -> u64 {
    debug_assert!(extents.len() <= EXTENTS_PER_DAD);

    let mut cursor = first_file_word;
    sector[2].set_w(first_file_word);
    for (ex, extent) in extents.iter().enumerate() {
        let wx = DAD_FIRST_EXTENT_WORD + ex * 3;
        sector[wx].set_w(extent.device_word_address);
        sector[wx + 1].set_w(extent.word_count);
        sector[wx + 2].set_w(0);
        sector[wx + 2].set_h2(u64::from(extent.ldat));
        cursor += extent.word_count;
    }
    sector[3].set_w(cursor);
    cursor
}

/// Reads the extents of one DAD sector, including holes.
/// Returns (file word address of the extent, extent) pairs.
pub fn decode_dad_sector(sector: &[Word36]) -> Vec<(u64, DadExtent)> {
    let mut result = Vec::new();
    let mut cursor = sector[2].w();
    let limit = sector[3].w();

    for ex in 0..EXTENTS_PER_DAD {
        if cursor >= limit {
            break;
        }
        let wx = DAD_FIRST_EXTENT_WORD + ex * 3;
        let extent = DadExtent {
            device_word_address: sector[wx].w(),
            word_count: sector[wx + 1].w(),
            ldat: sector[wx + 2].h2() as LdatIndex,
        };
        if extent.word_count == 0 {
            break;
        }
        result.push((cursor, extent));
        cursor += extent.word_count;
    }

    result
}
