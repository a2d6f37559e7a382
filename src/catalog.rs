// SPDX-License-Identifier: MIT OR Apache-2.0

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::consts::{
    CYCLE_LINK_TO_BE_CATALOGED, CYCLE_LINK_TO_BE_DROPPED, DEFAULT_MAX_CYCLE_RANGE, INVALID_LINK,
    LEAD0_LINK_BASE, LEAD_ITEM_MARKER, LINK_ADDRESS_MASK, MAIN1_PACK_ENTRY_COUNT,
    MAIN_ITEM_MARKER, MAX_ABSOLUTE_CYCLE, WORDS_PER_SECTOR,
};
use crate::fspec::{FileCycleSpecification, OPT_B, OPT_G, OPT_P, OPT_R, OPT_V, OPT_W};
use crate::types::{FileType, Granularity, LdatIndex, MfdAddress};
use crate::word::{fieldata_from_str, fieldata_to_string, Word36};

// Main item 0 word indices.
pub const MAIN0_DAD_LINK: usize = 0;
pub const MAIN0_LEAD_LINK: usize = 11;
pub const MAIN0_DESCRIPTOR: usize = 12;
pub const MAIN0_MAIN1_LINK: usize = 13;
pub const MAIN0_MNEMONIC: usize = 14;
pub const MAIN0_ASSIGN_COUNT: usize = 16;
pub const MAIN0_INHIBITS_CYCLE: usize = 17;
pub const MAIN0_TIME_LAST_REFERENCE: usize = 18;
pub const MAIN0_TIME_CATALOGED: usize = 19;
pub const MAIN0_INITIAL_GRANULES: usize = 20;
pub const MAIN0_MAX_GRANULES: usize = 21;
pub const MAIN0_HIGHEST_GRANULE: usize = 22;
pub const MAIN0_HIGHEST_TRACK_WRITTEN: usize = 23;
pub const MAIN0_READ_KEY_START: usize = 24;
pub const MAIN0_WRITE_KEY_START: usize = 26;
pub const MAIN0_INITIAL_LDAT: usize = 27;

// Main item 1 word indices.
pub const MAIN1_MAIN0_LINK: usize = 6;
pub const MAIN1_ENTRY_COUNT_WORD: usize = 17;
pub const MAIN1_ENTRY_BASE: usize = 18;
pub const MAIN_OVERFLOW_ENTRY_BASE: usize = 8;

// Lead item status bits (T1 of word 10).
pub const LEAD_STATUS_GUARDED: u64 = 0o1000;
pub const LEAD_STATUS_PLUS_ONE: u64 = 0o4000;

/// 12-bit descriptor field of main item 0 (T1 of word 12).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DescriptorFlags {
    pub unloaded: bool,
    pub backed_up: bool,
    pub save_on_checkpoint: bool,
    pub to_be_cataloged: bool,
    pub is_tape_file: bool,
    pub is_removable_file: bool,
    pub to_be_write_only: bool,
    pub to_be_read_only: bool,
    pub to_be_dropped: bool,
}

impl DescriptorFlags {
    pub fn compose(&self) -> u64 {
        let mut value = 0;
        if self.unloaded {
            value |= 0o4000;
        }
        if self.backed_up {
            value |= 0o2000;
        }
        if self.save_on_checkpoint {
            value |= 0o1000;
        }
        if self.to_be_cataloged {
            value |= 0o0100;
        }
        if self.is_tape_file {
            value |= 0o0040;
        }
        if self.is_removable_file {
            value |= 0o0010;
        }
        if self.to_be_write_only {
            value |= 0o0004;
        }
        if self.to_be_read_only {
            value |= 0o0002;
        }
        if self.to_be_dropped {
            value |= 0o0001;
        }
        value
    }

    pub fn extract(field: u64) -> Self {
        DescriptorFlags {
            unloaded: field & 0o4000 != 0,
            backed_up: field & 0o2000 != 0,
            save_on_checkpoint: field & 0o1000 != 0,
            to_be_cataloged: field & 0o0100 != 0,
            is_tape_file: field & 0o0040 != 0,
            is_removable_file: field & 0o0010 != 0,
            to_be_write_only: field & 0o0004 != 0,
            to_be_read_only: field & 0o0002 != 0,
            to_be_dropped: field & 0o0001 != 0,
        }
    }
}

/// 6-bit inhibit field of main item 0 (H1 of word 17).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InhibitFlags {
    pub is_guarded: bool,
    pub is_unload_inhibited: bool,
    pub is_private: bool,
    pub is_assigned_exclusive: bool,
    pub is_write_only: bool,
    pub is_read_only: bool,
}

impl InhibitFlags {
    pub fn compose(&self) -> u64 {
        let mut value = 0;
        if self.is_guarded {
            value |= 0o40;
        }
        if self.is_unload_inhibited {
            value |= 0o20;
        }
        if self.is_private {
            value |= 0o10;
        }
        if self.is_assigned_exclusive {
            value |= 0o04;
        }
        if self.is_write_only {
            value |= 0o02;
        }
        if self.is_read_only {
            value |= 0o01;
        }
        value
    }

    pub fn extract(field: u64) -> Self {
        InhibitFlags {
            is_guarded: field & 0o40 != 0,
            is_unload_inhibited: field & 0o20 != 0,
            is_private: field & 0o10 != 0,
            is_assigned_exclusive: field & 0o04 != 0,
            is_write_only: field & 0o02 != 0,
            is_read_only: field & 0o01 != 0,
        }
    }
}

/// 6-bit miscellaneous file flags (S3 of word 12).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileFlags {
    pub is_large_file: bool,
    pub assignment_acceleration: bool,
    pub is_written_to: bool,
    pub store_through: bool,
}

impl FileFlags {
    pub fn compose(&self) -> u64 {
        let mut value = 0;
        if self.is_large_file {
            value |= 0o40;
        }
        if self.assignment_acceleration {
            value |= 0o04;
        }
        if self.is_written_to {
            value |= 0o02;
        }
        if self.store_through {
            value |= 0o01;
        }
        value
    }

    pub fn extract(field: u64) -> Self {
        FileFlags {
            is_large_file: field & 0o40 != 0,
            assignment_acceleration: field & 0o04 != 0,
            is_written_to: field & 0o02 != 0,
            store_through: field & 0o01 != 0,
        }
    }
}

/// Physical characteristics (S1 of word 13).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PcharFlags {
    pub granularity: Granularity,
    pub is_word_addressable: bool,
}

impl PcharFlags {
    pub fn compose(&self) -> u64 {
        let mut value = 0;
        if self.granularity == Granularity::Position {
            value |= 0o40;
        }
        if self.is_word_addressable {
            value |= 0o10;
        }
        value
    }

    pub fn extract(field: u64) -> Self {
        PcharFlags {
            granularity: if field & 0o40 != 0 {
                Granularity::Position
            } else {
                Granularity::Track
            },
            is_word_addressable: field & 0o10 != 0,
        }
    }
}

/// Disable states (S1 of word 11); set by recovery when a cycle was caught
/// mid-mutation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DisableFlags {
    pub directory_error: bool,
    pub assigned_and_written_at_stop: bool,
    pub inaccessible_backup: bool,
    pub cache_drain_failure: bool,
}

impl DisableFlags {
    pub fn compose(&self) -> u64 {
        let mut value = 0;
        if self.directory_error {
            value |= 0o60;
        }
        if self.assigned_and_written_at_stop {
            value |= 0o50;
        }
        if self.inaccessible_backup {
            value |= 0o44;
        }
        if self.cache_drain_failure {
            value |= 0o42;
        }
        value
    }

    pub fn extract(field: u64) -> Self {
        DisableFlags {
            directory_error: field & 0o20 != 0,
            assigned_and_written_at_stop: field & 0o10 != 0,
            inaccessible_backup: field & 0o04 != 0,
            cache_drain_failure: field & 0o02 != 0,
        }
    }
}

/// Time-of-day word: S1 month, S2 day, S3 year since 1964, H2 seconds
/// since midnight.
pub fn sw_time_from(dt: DateTime<Utc>) -> u64 {
    let month = u64::from(dt.month());
    let day = u64::from(dt.day());
    let year = u64::from(dt.year().max(1964) as u32 - 1964) & 0o77;
    let seconds = u64::from(dt.num_seconds_from_midnight());
    (month << 30) | (day << 24) | (year << 18) | seconds
}

pub fn sw_time_now() -> u64 {
    sw_time_from(Utc::now())
}

/// One cycle slot of a file set, as read from the lead item link table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileSetCycleInfo {
    pub to_be_cataloged: bool,
    pub to_be_dropped: bool,
    pub absolute_cycle: u32,
    pub main_item0_address: MfdAddress,
}

/// Summary of a file set, assembled from its lead item(s).
#[derive(Clone, Debug)]
pub struct FileSetInfo {
    pub qualifier: String,
    pub filename: String,
    pub project_id: String,
    pub read_key: String,
    pub write_key: String,
    pub file_type: FileType,
    pub is_guarded: bool,
    pub plus_one_exists: bool,
    pub cycle_count: u32,
    pub max_cycle_range: u32,
    pub current_range: u32,
    pub highest_absolute: u32,
    /// index 0 is the highest-cycle position; holes are None
    pub cycle_info: Vec<Option<FileSetCycleInfo>>,
}

impl FileSetInfo {
    pub fn from_lead_items(lead0: &[Word36], lead1: Option<&[Word36]>) -> FileSetInfo {
        let current_range = lead0[9].s4() as u32;
        let highest_absolute = lead0[9].t3() as u32;
        let status = lead0[10].t1();

        let mut cycle_info = Vec::with_capacity(current_range as usize);
        for index in 0..current_range as usize {
            let word = lead_link_word(lead0, lead1, index);
            let link = MfdAddress::from_link(word);
            if word & LINK_ADDRESS_MASK != 0 && !link.is_invalid() {
                cycle_info.push(Some(FileSetCycleInfo {
                    to_be_cataloged: word & CYCLE_LINK_TO_BE_CATALOGED != 0,
                    to_be_dropped: word & CYCLE_LINK_TO_BE_DROPPED != 0,
                    absolute_cycle: cycle_below(highest_absolute, index as u32),
                    main_item0_address: link,
                }));
            } else {
                cycle_info.push(None);
            }
        }

        FileSetInfo {
            qualifier: fieldata_to_string(&lead0[1..3]),
            filename: fieldata_to_string(&lead0[3..5]),
            project_id: fieldata_to_string(&lead0[5..7]),
            read_key: fieldata_to_string(&lead0[7..8]),
            write_key: fieldata_to_string(&lead0[8..9]),
            file_type: FileType::from_field(lead0[9].s1()),
            is_guarded: status & LEAD_STATUS_GUARDED != 0,
            plus_one_exists: status & LEAD_STATUS_PLUS_ONE != 0,
            cycle_count: lead0[9].s2() as u32,
            max_cycle_range: lead0[9].s3() as u32,
            current_range,
            highest_absolute,
            cycle_info,
        }
    }

    /// Position of an absolute cycle in the link table, if it is in range.
    pub fn index_of(&self, absolute_cycle: u32) -> Option<usize> {
        (0..self.current_range)
            .find(|&ix| cycle_below(self.highest_absolute, ix) == absolute_cycle)
            .map(|ix| ix as usize)
    }

    /// Maps a relative cycle to an absolute one against the current state.
    /// `0` is the highest cycle; `-k` the k+1'th highest existing cycle.
    pub fn absolute_for_relative(&self, relative: i32) -> Option<u32> {
        if relative == 0 {
            return (self.current_range > 0).then_some(self.highest_absolute);
        }
        if relative == 1 {
            return Some(cycle_above(self.highest_absolute));
        }
        let wanted = (-relative) as usize;
        let mut seen = 0;
        for slot in self.cycle_info.iter() {
            if let Some(info) = slot {
                if seen == wanted {
                    return Some(info.absolute_cycle);
                }
                seen += 1;
            }
        }
        None
    }

    pub fn lowest_existing_absolute(&self) -> Option<u32> {
        self.cycle_info
            .iter()
            .rev()
            .flatten()
            .next()
            .map(|info| info.absolute_cycle)
    }
}

/// The cycle immediately above, wrapping 999 -> 1.
pub fn cycle_above(cycle: u32) -> u32 {
    if cycle >= MAX_ABSOLUTE_CYCLE {
        1
    } else {
        cycle + 1
    }
}

/// The cycle `offset` positions below `highest`, wrapping 1 -> 999.
pub fn cycle_below(highest: u32, offset: u32) -> u32 {
    if highest > offset {
        highest - offset
    } else {
        highest + MAX_ABSOLUTE_CYCLE - offset
    }
}

/// Link-table slot accessors. Slots live in lead item 0 from word 11
/// (after any security words) and continue in lead item 1 from word 1.
fn lead_slot_position(lead0: &[Word36], index: usize) -> (usize, usize) {
    let offset = LEAD0_LINK_BASE + lead0[10].s4() as usize + index;
    if offset < WORDS_PER_SECTOR {
        (0, offset)
    } else {
        (1, offset - WORDS_PER_SECTOR + 1)
    }
}

pub fn lead_link_word(lead0: &[Word36], lead1: Option<&[Word36]>, index: usize) -> u64 {
    match lead_slot_position(lead0, index) {
        (0, wx) => lead0[wx].w(),
        (_, wx) => lead1.map(|item| item[wx].w()).unwrap_or(0),
    }
}

pub fn set_lead_link_word(
    lead0: &mut [Word36],
    lead1: Option<&mut [Word36]>,
    index: usize,
    value: u64,
) {
    match lead_slot_position(lead0, index) {
        (0, wx) => lead0[wx].set_w(value),
        (_, wx) => {
            if let Some(item) = lead1 {
                item[wx].set_w(value);
            }
        }
    }
}

/// Number of link slots addressable with and without a lead item 1.
pub fn lead_capacity(has_lead1: bool) -> usize {
    let lead0_slots = WORDS_PER_SECTOR - LEAD0_LINK_BASE;
    if has_lead1 {
        lead0_slots + WORDS_PER_SECTOR - 1
    } else {
        lead0_slots
    }
}

/// Shifts the cycle links downward by `shift` slots to make room for a new
/// higher cycle, zeroes the vacated top slots, and bumps the current range.
/// The caller marks the lead item sectors dirty.
pub fn adjust_lead_links(lead0: &mut [Word36], mut lead1: Option<&mut [Word36]>, shift: u32) {
    if shift == 0 {
        return;
    }
    let current_range = lead0[9].s4() as usize;
    let new_range = current_range + shift as usize;

    for index in (0..current_range).rev() {
        let value = lead_link_word(lead0, lead1.as_deref(), index);
        set_lead_link_word(lead0, lead1.as_deref_mut(), index + shift as usize, value);
    }
    for index in 0..shift as usize {
        set_lead_link_word(lead0, lead1.as_deref_mut(), index, 0);
    }

    lead0[9].set_s4(new_range as u64);
}

/// Everything a caller supplies to catalog a file cycle.
#[derive(Clone, Debug)]
pub struct CatalogFileRequest {
    pub qualifier: String,
    pub filename: String,
    pub project_id: String,
    pub account_id: String,
    pub read_key: Option<String>,
    pub write_key: Option<String>,
    pub file_cycle: Option<FileCycleSpecification>,
    pub mnemonic: String,
    pub file_type: FileType,
    pub granularity: Granularity,
    pub is_word_addressable: bool,
    pub initial_granules: u64,
    pub max_granules: u64,
    pub pack_ids: Vec<String>,
    pub reel_numbers: Vec<String>,
    pub options: u32,
}

impl CatalogFileRequest {
    pub fn new(qualifier: &str, filename: &str) -> Self {
        CatalogFileRequest {
            qualifier: qualifier.to_string(),
            filename: filename.to_string(),
            project_id: String::new(),
            account_id: String::new(),
            read_key: None,
            write_key: None,
            file_cycle: None,
            mnemonic: "F".to_string(),
            file_type: FileType::Fixed,
            granularity: Granularity::Track,
            is_word_addressable: false,
            initial_granules: 0,
            max_granules: 0o777777,
            pack_ids: Vec::new(),
            reel_numbers: Vec::new(),
            options: 0,
        }
    }

    pub fn descriptor_flags(&self) -> DescriptorFlags {
        DescriptorFlags {
            save_on_checkpoint: self.options & OPT_B != 0,
            is_tape_file: self.file_type == FileType::Tape,
            is_removable_file: self.file_type == FileType::Removable,
            to_be_write_only: false,
            to_be_read_only: false,
            ..DescriptorFlags::default()
        }
    }

    pub fn inhibit_flags(&self) -> InhibitFlags {
        InhibitFlags {
            is_guarded: self.options & OPT_G != 0,
            is_unload_inhibited: self.options & OPT_V != 0,
            is_private: self.options & OPT_P == 0,
            is_assigned_exclusive: false,
            is_write_only: self.options & OPT_W != 0,
            is_read_only: self.options & OPT_R != 0,
        }
    }

    pub fn pchar_flags(&self) -> PcharFlags {
        PcharFlags {
            granularity: self.granularity,
            is_word_addressable: self.is_word_addressable,
        }
    }
}

/// Sets up a lead item sector 0 for a brand-new file set with one cycle.
pub fn populate_new_lead_item0(
    lead0: &mut [Word36],
    request: &CatalogFileRequest,
    absolute_cycle: u32,
    main_item0_address: MfdAddress,
) {
    for word in lead0.iter_mut() {
        word.set_w(0);
    }

    lead0[0].set_w(INVALID_LINK | LEAD_ITEM_MARKER);
    fieldata_from_str(&request.qualifier, &mut lead0[1..3]);
    fieldata_from_str(&request.filename, &mut lead0[3..5]);
    fieldata_from_str(&request.project_id, &mut lead0[5..7]);
    if let Some(key) = &request.read_key {
        lead0[7].from_str_fieldata(key);
    }
    if let Some(key) = &request.write_key {
        lead0[8].from_str_fieldata(key);
    }

    lead0[9].set_s1(request.file_type.to_field());
    lead0[9].set_s2(1); // cycles in existence
    lead0[9].set_s3(u64::from(DEFAULT_MAX_CYCLE_RANGE));
    lead0[9].set_s4(1); // current range
    lead0[9].set_t3(u64::from(absolute_cycle));

    let mut status = 0;
    if request.options & OPT_G != 0 {
        status |= LEAD_STATUS_GUARDED;
    }
    lead0[10].set_t1(status);
    lead0[LEAD0_LINK_BASE].set_w(main_item0_address.value());
}

/// Sets up a mass-storage main item 0.
pub fn populate_mass_storage_main_item0(
    main0: &mut [Word36],
    request: &CatalogFileRequest,
    lead_item0_address: MfdAddress,
    main_item1_address: MfdAddress,
    absolute_cycle: u32,
    initial_ldat: LdatIndex,
) {
    for word in main0.iter_mut() {
        word.set_w(0);
    }

    main0[MAIN0_DAD_LINK].set_w(INVALID_LINK | MAIN_ITEM_MARKER);
    fieldata_from_str(&request.qualifier, &mut main0[1..3]);
    fieldata_from_str(&request.filename, &mut main0[3..5]);
    fieldata_from_str(&request.project_id, &mut main0[5..7]);
    fieldata_from_str(&request.account_id, &mut main0[7..9]);

    main0[MAIN0_LEAD_LINK].set_w(lead_item0_address.value());
    main0[MAIN0_LEAD_LINK].set_s1(0); // disable flags

    main0[MAIN0_DESCRIPTOR].set_t1(request.descriptor_flags().compose());
    main0[MAIN0_DESCRIPTOR].set_s3(FileFlags::default().compose());

    main0[MAIN0_MAIN1_LINK].set_w(main_item1_address.value());
    main0[MAIN0_MAIN1_LINK].set_s1(request.pchar_flags().compose());

    main0[MAIN0_MNEMONIC].from_str_fieldata(&request.mnemonic);

    main0[MAIN0_INHIBITS_CYCLE].set_h1(request.inhibit_flags().compose());
    main0[MAIN0_INHIBITS_CYCLE].set_t3(u64::from(absolute_cycle));

    let now = sw_time_now();
    main0[MAIN0_TIME_LAST_REFERENCE].set_w(now);
    main0[MAIN0_TIME_CATALOGED].set_w(now);
    main0[MAIN0_INITIAL_GRANULES].set_h1(request.initial_granules);
    main0[MAIN0_MAX_GRANULES].set_h1(request.max_granules);

    if request.file_type == FileType::Removable {
        let mut rkey = Word36::default();
        if let Some(key) = &request.read_key {
            rkey.from_str_fieldata(key);
        }
        let mut wkey = Word36::default();
        if let Some(key) = &request.write_key {
            wkey.from_str_fieldata(key);
        }
        main0[MAIN0_READ_KEY_START].set_h1(rkey.h1());
        main0[MAIN0_READ_KEY_START + 1].set_h1(rkey.h2());
        main0[MAIN0_WRITE_KEY_START].set_h1(wkey.h1());
        main0[MAIN0_WRITE_KEY_START + 1].set_h1(wkey.h2());
    } else {
        main0[MAIN0_INITIAL_LDAT].set_h1(u64::from(initial_ldat));
    }
}

/// Sets up a tape main item 0. The reel table link is established by the
/// caller once the table sectors exist.
pub fn populate_tape_main_item0(
    main0: &mut [Word36],
    request: &CatalogFileRequest,
    lead_item0_address: MfdAddress,
    main_item1_address: MfdAddress,
    absolute_cycle: u32,
) {
    for word in main0.iter_mut() {
        word.set_w(0);
    }

    main0[MAIN0_DAD_LINK].set_w(INVALID_LINK | MAIN_ITEM_MARKER);
    fieldata_from_str(&request.qualifier, &mut main0[1..3]);
    fieldata_from_str(&request.filename, &mut main0[3..5]);
    fieldata_from_str(&request.project_id, &mut main0[5..7]);
    fieldata_from_str(&request.account_id, &mut main0[7..9]);

    main0[MAIN0_LEAD_LINK].set_w(lead_item0_address.value());
    main0[MAIN0_DESCRIPTOR].set_t1(request.descriptor_flags().compose());
    main0[MAIN0_MAIN1_LINK].set_w(main_item1_address.value());
    main0[MAIN0_MNEMONIC].from_str_fieldata(&request.mnemonic);
    main0[MAIN0_INHIBITS_CYCLE].set_h1(request.inhibit_flags().compose());
    main0[MAIN0_INHIBITS_CYCLE].set_t3(u64::from(absolute_cycle));

    let now = sw_time_now();
    main0[MAIN0_TIME_LAST_REFERENCE].set_w(now);
    main0[MAIN0_TIME_CATALOGED].set_w(now);
}

/// Sets up main item sector 1. Fixed files carry up to five pack entries;
/// removable files also record the per-pack main item links (established
/// later, when the packs are mounted); tape files carry reel names.
pub fn populate_main_item1(
    main1: &mut [Word36],
    request: &CatalogFileRequest,
    main_item0_address: MfdAddress,
    absolute_cycle: u32,
) {
    for word in main1.iter_mut() {
        word.set_w(0);
    }

    main1[0].set_w(INVALID_LINK); // no overflow sector yet
    fieldata_from_str(&request.qualifier, &mut main1[1..3]);
    fieldata_from_str(&request.filename, &mut main1[3..5]);
    main1[5].from_str_fieldata("*NO.1*");
    main1[MAIN1_MAIN0_LINK].set_w(main_item0_address.value());
    main1[7].set_t3(u64::from(absolute_cycle));

    match request.file_type {
        FileType::Tape => {
            main1[MAIN1_ENTRY_COUNT_WORD].set_t3(request.reel_numbers.len() as u64);
            for (rx, reel) in request
                .reel_numbers
                .iter()
                .take(MAIN1_PACK_ENTRY_COUNT * 2)
                .enumerate()
            {
                main1[MAIN1_ENTRY_BASE + rx].from_str_fieldata(reel);
            }
        }
        _ => {
            if request.file_type == FileType::Removable {
                main1[MAIN1_ENTRY_COUNT_WORD].set_t3(request.pack_ids.len() as u64);
            }
            let mut wx = MAIN1_ENTRY_BASE;
            for pack in request.pack_ids.iter().take(MAIN1_PACK_ENTRY_COUNT) {
                main1[wx].from_str_fieldata(pack);
                wx += 2;
            }
        }
    }
}

/// Fills one overflow sector with pack entries or reel names, starting at
/// `first`. Returns how many entries were consumed.
pub fn populate_main_overflow(
    sector: &mut [Word36],
    request: &CatalogFileRequest,
    main_item0_address: MfdAddress,
    first: usize,
) -> usize {
    for word in sector.iter_mut() {
        word.set_w(0);
    }
    sector[0].set_w(INVALID_LINK);
    sector[MAIN1_MAIN0_LINK].set_w(main_item0_address.value());

    match request.file_type {
        FileType::Tape => {
            let reels = &request.reel_numbers[first.min(request.reel_numbers.len())..];
            let taken = reels.len().min(2 * crate::consts::MAIN_OVERFLOW_PACK_ENTRY_COUNT);
            for (rx, reel) in reels.iter().take(taken).enumerate() {
                sector[MAIN_OVERFLOW_ENTRY_BASE + rx].from_str_fieldata(reel);
            }
            taken
        }
        _ => {
            let packs = &request.pack_ids[first.min(request.pack_ids.len())..];
            let taken = packs.len().min(crate::consts::MAIN_OVERFLOW_PACK_ENTRY_COUNT);
            let mut wx = MAIN_OVERFLOW_ENTRY_BASE;
            for pack in packs.iter().take(taken) {
                sector[wx].from_str_fieldata(pack);
                wx += 2;
            }
            taken
        }
    }
}

/// Fields common to every file cycle, from main item 0.
#[derive(Clone, Debug)]
pub struct FileCycleHeader {
    pub qualifier: String,
    pub filename: String,
    pub project_id: String,
    pub account_id: String,
    pub absolute_cycle: u32,
    pub assign_mnemonic: String,
    pub descriptor_flags: DescriptorFlags,
    pub file_flags: FileFlags,
    pub inhibit_flags: InhibitFlags,
    pub disable_flags: DisableFlags,
    pub current_assign_count: u32,
    pub time_cataloged: u64,
    pub time_last_reference: u64,
}

/// Per-cycle metadata, shaped by where the cycle lives. Common fields sit in
/// the embedded header; variant fields are matched, not dispatched.
#[derive(Clone, Debug)]
pub enum FileCycleInfo {
    Fixed {
        header: FileCycleHeader,
        pchar_flags: PcharFlags,
        initial_granules: u64,
        max_granules: u64,
        highest_granule_assigned: u64,
        highest_track_written: u64,
        initial_ldat: LdatIndex,
    },
    Removable {
        header: FileCycleHeader,
        pchar_flags: PcharFlags,
        initial_granules: u64,
        max_granules: u64,
        highest_granule_assigned: u64,
        highest_track_written: u64,
        pack_ids: Vec<String>,
    },
    Tape {
        header: FileCycleHeader,
        reel_numbers: Vec<String>,
    },
}

impl FileCycleInfo {
    pub fn header(&self) -> &FileCycleHeader {
        match self {
            FileCycleInfo::Fixed { header, .. }
            | FileCycleInfo::Removable { header, .. }
            | FileCycleInfo::Tape { header, .. } => header,
        }
    }

    /// Assembles cycle info from main item 0, main item 1, and any overflow
    /// sectors (in chain order).
    pub fn from_items(
        main0: &[Word36],
        main1: &[Word36],
        overflow: &[[Word36; WORDS_PER_SECTOR]],
    ) -> FileCycleInfo {
        let descriptor_flags = DescriptorFlags::extract(main0[MAIN0_DESCRIPTOR].t1());
        let header = FileCycleHeader {
            qualifier: fieldata_to_string(&main0[1..3]),
            filename: fieldata_to_string(&main0[3..5]),
            project_id: fieldata_to_string(&main0[5..7]),
            account_id: fieldata_to_string(&main0[7..9]),
            absolute_cycle: main0[MAIN0_INHIBITS_CYCLE].t3() as u32,
            assign_mnemonic: fieldata_to_string(&main0[MAIN0_MNEMONIC..MAIN0_MNEMONIC + 1]),
            descriptor_flags,
            file_flags: FileFlags::extract(main0[MAIN0_DESCRIPTOR].s3()),
            inhibit_flags: InhibitFlags::extract(main0[MAIN0_INHIBITS_CYCLE].h1()),
            disable_flags: DisableFlags::extract(main0[MAIN0_LEAD_LINK].s1()),
            current_assign_count: main0[MAIN0_ASSIGN_COUNT].h2() as u32,
            time_cataloged: main0[MAIN0_TIME_CATALOGED].w(),
            time_last_reference: main0[MAIN0_TIME_LAST_REFERENCE].w(),
        };

        if descriptor_flags.is_tape_file {
            let count = main1[MAIN1_ENTRY_COUNT_WORD].t3() as usize;
            let reel_numbers =
                collect_single_word_entries(main1, overflow, count);
            return FileCycleInfo::Tape {
                header,
                reel_numbers,
            };
        }

        let pchar_flags = PcharFlags::extract(main0[MAIN0_MAIN1_LINK].s1());
        let initial_granules = main0[MAIN0_INITIAL_GRANULES].h1();
        let max_granules = main0[MAIN0_MAX_GRANULES].h1();
        let highest_granule_assigned = main0[MAIN0_HIGHEST_GRANULE].h1();
        let highest_track_written = main0[MAIN0_HIGHEST_TRACK_WRITTEN].h1();

        if descriptor_flags.is_removable_file {
            let count = main1[MAIN1_ENTRY_COUNT_WORD].t3() as usize;
            let pack_ids = collect_pair_entries(main1, overflow, count);
            FileCycleInfo::Removable {
                header,
                pchar_flags,
                initial_granules,
                max_granules,
                highest_granule_assigned,
                highest_track_written,
                pack_ids,
            }
        } else {
            FileCycleInfo::Fixed {
                header,
                pchar_flags,
                initial_granules,
                max_granules,
                highest_granule_assigned,
                highest_track_written,
                initial_ldat: (main0[MAIN0_INITIAL_LDAT].h1()
                    & u64::from(crate::consts::MAX_LDAT)) as LdatIndex,
            }
        }
    }
}

fn collect_single_word_entries(
    main1: &[Word36],
    overflow: &[[Word36; WORDS_PER_SECTOR]],
    count: usize,
) -> Vec<String> {
    let mut names = Vec::with_capacity(count);
    for wx in MAIN1_ENTRY_BASE..WORDS_PER_SECTOR {
        if names.len() == count {
            return names;
        }
        names.push(main1[wx].to_string_fieldata().trim_end().to_string());
    }
    for sector in overflow {
        for wx in MAIN_OVERFLOW_ENTRY_BASE..WORDS_PER_SECTOR {
            if names.len() == count {
                return names;
            }
            names.push(sector[wx].to_string_fieldata().trim_end().to_string());
        }
    }
    names.truncate(count);
    names
}

fn collect_pair_entries(
    main1: &[Word36],
    overflow: &[[Word36; WORDS_PER_SECTOR]],
    count: usize,
) -> Vec<String> {
    let mut names = Vec::with_capacity(count);
    let mut wx = MAIN1_ENTRY_BASE;
    while wx + 1 < WORDS_PER_SECTOR && names.len() < count {
        names.push(main1[wx].to_string_fieldata().trim_end().to_string());
        wx += 2;
    }
    for sector in overflow {
        let mut wx = MAIN_OVERFLOW_ENTRY_BASE;
        while wx + 1 < WORDS_PER_SECTOR && names.len() < count {
            names.push(sector[wx].to_string_fieldata().trim_end().to_string());
            wx += 2;
        }
    }
    names
}

/// Outcome of a successful cycle check: where the new cycle lands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CycleCheck {
    pub absolute_cycle: u32,
    /// slot in the link table after any shift; 0 is the highest position
    pub cycle_index: usize,
    /// how far the existing links must shift downward
    pub shift_amount: u32,
    pub new_cycle_range: u32,
    pub plus_one: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleCheckError {
    AlreadyExists,
    InvalidRelativeCycle,
    PlusOneCycleExists,
    OutOfRange,
    /// legal only after the oldest existing cycle is dropped
    DropOldestRequired,
}

/// Validates a requested file cycle against a file set, per the rule
/// `(x - w) < z <= (x - y + w + 1)` with the 999 wrap, where x is the
/// highest absolute cycle, w the max range, and y the current range.
pub fn check_cycle(
    specification: Option<FileCycleSpecification>,
    fs_info: &FileSetInfo,
) -> Result<CycleCheck, CycleCheckError> {
    let mut result = CycleCheck {
        absolute_cycle: 1,
        cycle_index: 0,
        shift_amount: 0,
        new_cycle_range: fs_info.current_range,
        plus_one: false,
    };

    let specification = match specification {
        None => {
            // No cycle given: only valid while the set is empty.
            if fs_info.current_range != 0 {
                return Err(CycleCheckError::AlreadyExists);
            }
            result.new_cycle_range = 1;
            return Ok(result);
        }
        Some(spec) => spec,
    };

    if let FileCycleSpecification::Relative(relative) = specification {
        // Catalog can never target an existing cycle, so negative relatives
        // are meaningless here; zero behaves like "no cycle".
        if relative < 0 {
            return Err(CycleCheckError::InvalidRelativeCycle);
        }
        if relative == 0 {
            if fs_info.current_range != 0 {
                return Err(CycleCheckError::AlreadyExists);
            }
            result.new_cycle_range = 1;
            return Ok(result);
        }

        if fs_info.plus_one_exists {
            return Err(CycleCheckError::PlusOneCycleExists);
        }

        result.plus_one = true;
        if fs_info.current_range == 0 {
            result.new_cycle_range = 1;
            return Ok(result);
        }

        if fs_info.cycle_info[0].is_none() {
            // The highest position is a hole; the plus-one takes its place.
            result.absolute_cycle = fs_info.highest_absolute;
        } else if fs_info.current_range == fs_info.max_cycle_range {
            return Err(CycleCheckError::DropOldestRequired);
        } else {
            result.absolute_cycle = cycle_above(fs_info.highest_absolute);
            result.shift_amount = 1;
            result.new_cycle_range += 1;
        }
        return Ok(result);
    }

    let absolute = match specification {
        FileCycleSpecification::Absolute(value) => value,
        FileCycleSpecification::Relative(_) => unreachable!(),
    };
    result.absolute_cycle = absolute;

    if fs_info.current_range == 0 {
        result.new_cycle_range = 1;
        return Ok(result);
    }

    // Inside the current range: either an occupied slot (conflict) or a hole.
    if let Some(index) = fs_info.index_of(absolute) {
        if fs_info.cycle_info[index].is_some() {
            return Err(CycleCheckError::AlreadyExists);
        }
        result.cycle_index = index;
        return Ok(result);
    }

    let lowest = fs_info
        .lowest_existing_absolute()
        .unwrap_or(fs_info.highest_absolute);

    // Distance from the highest cycle upward to the request, honoring the
    // 999 -> 1 wrap; None when the request is not above the highest.
    let above = distance_above(fs_info.highest_absolute, absolute);
    if let Some(climb) = above {
        let span = distance_above(lowest, absolute)
            .map(|d| d + 1)
            .unwrap_or(1);
        if span == fs_info.max_cycle_range + 1 {
            return Err(CycleCheckError::DropOldestRequired);
        }
        if span > fs_info.max_cycle_range {
            return Err(CycleCheckError::OutOfRange);
        }
        result.shift_amount = climb;
        result.new_cycle_range += climb;
        if result.new_cycle_range > fs_info.max_cycle_range {
            return Err(CycleCheckError::OutOfRange);
        }
        return Ok(result);
    }

    // Below the lowest existing cycle: index from the highest position.
    if let Some(depth) = distance_above(absolute, fs_info.highest_absolute) {
        if depth >= fs_info.max_cycle_range {
            return Err(CycleCheckError::OutOfRange);
        }
        result.cycle_index = depth as usize;
        result.new_cycle_range = depth + 1;
        return Ok(result);
    }

    Err(CycleCheckError::OutOfRange)
}

/// How many steps it takes to climb from `from` up to `to`, if `to` is
/// above `from` within a half-range window (the wrap makes the cycle space
/// circular, so "above" only makes sense within the window).
fn distance_above(from: u32, to: u32) -> Option<u32> {
    if to > from && to - from < 500 {
        Some(to - from)
    } else if to < from && to + MAX_ABSOLUTE_CYCLE - from < 500 {
        Some(to + MAX_ABSOLUTE_CYCLE - from)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs_info_with(highest: u32, cycles: &[u32], max_range: u32) -> FileSetInfo {
        let lowest = *cycles.iter().min().unwrap();
        let current_range = highest - lowest + 1;
        let cycle_info = (0..current_range)
            .map(|ix| {
                let abs = cycle_below(highest, ix);
                cycles.contains(&abs).then_some(FileSetCycleInfo {
                    to_be_cataloged: false,
                    to_be_dropped: false,
                    absolute_cycle: abs,
                    main_item0_address: MfdAddress::compose(1, 0, 3),
                })
            })
            .collect();
        FileSetInfo {
            qualifier: "TEST".into(),
            filename: "FILE".into(),
            project_id: String::new(),
            read_key: String::new(),
            write_key: String::new(),
            file_type: FileType::Fixed,
            is_guarded: false,
            plus_one_exists: false,
            cycle_count: cycles.len() as u32,
            max_cycle_range: max_range,
            current_range,
            highest_absolute: highest,
            cycle_info,
        }
    }

    #[test]
    fn flag_fields_round_trip() {
        let df = DescriptorFlags {
            save_on_checkpoint: true,
            is_tape_file: true,
            to_be_dropped: true,
            ..DescriptorFlags::default()
        };
        assert_eq!(DescriptorFlags::extract(df.compose()), df);

        let inf = InhibitFlags {
            is_guarded: true,
            is_private: true,
            is_read_only: true,
            ..InhibitFlags::default()
        };
        assert_eq!(InhibitFlags::extract(inf.compose()), inf);

        let pf = PcharFlags {
            granularity: Granularity::Position,
            is_word_addressable: true,
        };
        assert_eq!(PcharFlags::extract(pf.compose()), pf);

        let ff = FileFlags {
            is_written_to: true,
            ..FileFlags::default()
        };
        assert_eq!(FileFlags::extract(ff.compose()), ff);
    }

    #[test]
    fn sw_time_packs_the_date_fields() {
        let dt = DateTime::parse_from_rfc3339("2024-03-15T12:30:45Z")
            .unwrap()
            .with_timezone(&Utc);
        let word = sw_time_from(dt);
        assert_eq!(word >> 30, 3);
        assert_eq!((word >> 24) & 0o77, 15);
        assert_eq!((word >> 18) & 0o77, 60);
        assert_eq!(word & 0o777777, 12 * 3600 + 30 * 60 + 45);
    }

    #[test]
    fn new_lead_item_describes_one_cycle() {
        let mut lead0 = [Word36::default(); WORDS_PER_SECTOR];
        let request = CatalogFileRequest::new("TEST", "FILE");
        let main0 = MfdAddress::compose(1, 0, 4);
        populate_new_lead_item0(&mut lead0, &request, 5, main0);

        let info = FileSetInfo::from_lead_items(&lead0, None);
        assert_eq!(info.qualifier, "TEST");
        assert_eq!(info.filename, "FILE");
        assert_eq!(info.cycle_count, 1);
        assert_eq!(info.current_range, 1);
        assert_eq!(info.highest_absolute, 5);
        assert_eq!(info.max_cycle_range, DEFAULT_MAX_CYCLE_RANGE);
        assert_eq!(info.cycle_info[0].unwrap().absolute_cycle, 5);
        assert_eq!(info.cycle_info[0].unwrap().main_item0_address, main0);
    }

    #[test]
    fn lead_links_overflow_into_item1() {
        let mut lead0 = [Word36::default(); WORDS_PER_SECTOR];
        let mut lead1 = [Word36::default(); WORDS_PER_SECTOR];
        lead1[0].set_w(INVALID_LINK);

        set_lead_link_word(&mut lead0, Some(&mut lead1), 16, 0o42);
        set_lead_link_word(&mut lead0, Some(&mut lead1), 17, 0o43);
        assert_eq!(lead0[WORDS_PER_SECTOR - 1].w(), 0o42);
        assert_eq!(lead1[1].w(), 0o43);
        assert_eq!(lead_link_word(&lead0, Some(&lead1), 17), 0o43);
        assert_eq!(lead_capacity(false), 17);
        assert_eq!(lead_capacity(true), 44);
    }

    #[test]
    fn link_shift_moves_cycles_downward() {
        let mut lead0 = [Word36::default(); WORDS_PER_SECTOR];
        let request = CatalogFileRequest::new("TEST", "FILE");
        populate_new_lead_item0(&mut lead0, &request, 10, MfdAddress::compose(1, 0, 4));

        adjust_lead_links(&mut lead0, None, 2);
        assert_eq!(lead0[9].s4(), 3);
        assert_eq!(lead_link_word(&lead0, None, 0), 0);
        assert_eq!(lead_link_word(&lead0, None, 1), 0);
        assert_eq!(
            MfdAddress::from_link(lead_link_word(&lead0, None, 2)),
            MfdAddress::compose(1, 0, 4)
        );
    }

    #[test]
    fn empty_set_accepts_defaults_and_absolutes() {
        let mut info = fs_info_with(1, &[1], 31);
        info.current_range = 0;
        info.cycle_info.clear();

        let check = check_cycle(None, &info).unwrap();
        assert_eq!(check.absolute_cycle, 1);
        assert_eq!(check.new_cycle_range, 1);

        let check =
            check_cycle(Some(FileCycleSpecification::Absolute(500)), &info).unwrap();
        assert_eq!(check.absolute_cycle, 500);
    }

    #[test]
    fn occupied_set_rejects_missing_cycle() {
        let info = fs_info_with(5, &[5], 31);
        assert_eq!(check_cycle(None, &info), Err(CycleCheckError::AlreadyExists));
        assert_eq!(
            check_cycle(Some(FileCycleSpecification::Relative(-1)), &info),
            Err(CycleCheckError::InvalidRelativeCycle)
        );
    }

    #[test]
    fn plus_one_climbs_above_the_highest() {
        let info = fs_info_with(10, &[9, 10], 31);
        let check = check_cycle(Some(FileCycleSpecification::Relative(1)), &info).unwrap();
        assert!(check.plus_one);
        assert_eq!(check.absolute_cycle, 11);
        assert_eq!(check.shift_amount, 1);
        assert_eq!(check.new_cycle_range, 3);

        let mut blocked = fs_info_with(10, &[9, 10], 31);
        blocked.plus_one_exists = true;
        assert_eq!(
            check_cycle(Some(FileCycleSpecification::Relative(1)), &blocked),
            Err(CycleCheckError::PlusOneCycleExists)
        );
    }

    #[test]
    fn rollover_requires_dropping_the_oldest() {
        // cycles {10, 11, 30, 31}, max range 25: legal window is (6, 35]
        let info = fs_info_with(31, &[10, 11, 30, 31], 25);

        assert_eq!(
            check_cycle(Some(FileCycleSpecification::Absolute(35)), &info),
            Err(CycleCheckError::DropOldestRequired)
        );
        assert_eq!(
            check_cycle(Some(FileCycleSpecification::Absolute(5)), &info),
            Err(CycleCheckError::OutOfRange)
        );
        assert_eq!(
            check_cycle(Some(FileCycleSpecification::Absolute(36)), &info),
            Err(CycleCheckError::OutOfRange)
        );

        // after cycle 10 goes away the same request becomes a plain shift
        let dropped = fs_info_with(31, &[11, 30, 31], 25);
        let check =
            check_cycle(Some(FileCycleSpecification::Absolute(35)), &dropped).unwrap();
        assert_eq!(check.shift_amount, 4);
        assert_eq!(check.new_cycle_range, 25);
    }

    #[test]
    fn holes_in_the_range_are_fillable() {
        let info = fs_info_with(10, &[8, 10], 31);
        let check = check_cycle(Some(FileCycleSpecification::Absolute(9)), &info).unwrap();
        assert_eq!(check.cycle_index, 1);
        assert_eq!(check.shift_amount, 0);

        assert_eq!(
            check_cycle(Some(FileCycleSpecification::Absolute(10)), &info),
            Err(CycleCheckError::AlreadyExists)
        );
    }

    #[test]
    fn cycle_numbers_wrap_at_999() {
        assert_eq!(cycle_above(999), 1);
        assert_eq!(cycle_below(2, 3), 998);

        // highest 998, cataloging 3 wraps the range
        let info = fs_info_with(998, &[996, 998], 31);
        let check = check_cycle(Some(FileCycleSpecification::Absolute(3)), &info).unwrap();
        assert_eq!(check.shift_amount, 4);
        assert_eq!(check.new_cycle_range, 7);

        // below the lowest, on the far side of the wrap
        let low = fs_info_with(3, &[1, 3], 31);
        let check = check_cycle(Some(FileCycleSpecification::Absolute(998)), &low).unwrap();
        assert_eq!(check.cycle_index, 4);
        assert_eq!(check.new_cycle_range, 5);
    }

    #[test]
    fn relative_cycle_mapping() {
        let info = fs_info_with(10, &[8, 10], 31);
        assert_eq!(info.absolute_for_relative(0), Some(10));
        assert_eq!(info.absolute_for_relative(1), Some(11));
        assert_eq!(info.absolute_for_relative(-1), Some(8));
        assert_eq!(info.absolute_for_relative(-2), None);
        assert_eq!(info.lowest_existing_absolute(), Some(8));
    }
}
