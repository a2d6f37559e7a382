// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, error, info, warn};

use crate::cache::DirectorySectorCache;
use crate::catalog::{
    self, adjust_lead_links, check_cycle, lead_capacity, lead_link_word, populate_main_item1,
    populate_main_overflow, populate_mass_storage_main_item0, populate_new_lead_item0,
    populate_tape_main_item0, set_lead_link_word, sw_time_now, CatalogFileRequest,
    CycleCheckError, DescriptorFlags, FileCycleInfo, FileSetInfo, LEAD_STATUS_PLUS_ONE,
    MAIN0_ASSIGN_COUNT, MAIN0_DAD_LINK, MAIN0_DESCRIPTOR, MAIN0_HIGHEST_GRANULE,
    MAIN0_HIGHEST_TRACK_WRITTEN, MAIN0_INHIBITS_CYCLE, MAIN0_MAIN1_LINK,
    MAIN0_TIME_LAST_REFERENCE,
};
use crate::config::ExecConfig;
use crate::consts::{
    CYCLE_LINK_TO_BE_DROPPED, DAS_LINK_WORD, DAS_TRACK_INTERVAL, EXTENTS_PER_DAD, INVALID_LINK,
    LEAD0_LINK_CAPACITY, LEAD_ITEM_MARKER, MAIN1_PACK_ENTRY_COUNT, MAIN_ITEM_MARKER,
    MAX_CYCLE_RANGE, MAX_LDAT, SECTORS_PER_TRACK, WORDS_PER_SECTOR, WORDS_PER_TRACK,
};
use crate::dad;
use crate::device::{DiskChannel, IoPacket, IoStatus};
use crate::exec::{ExecLink, StopCode};
use crate::facstatus::{FacResult, FacStatusCode};
use crate::fas::{FileAllocation, FileAllocationSet};
use crate::fspec::{self, FileCycleSpecification, OPT_Z};
use crate::pack::{PackDescriptor, PackLabel};
use crate::types::{FileType, LdatIndex, MfdAddress, NodeId, TrackCount, TrackId, TrackRegion};
use crate::word::{fieldata_to_string, Word36};

/// Errors out of the directory services. Everything except `Stopped` is a
/// caller error which leaves the directory unchanged; `Stopped` means the
/// exec has already been halted with the given code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MfdError {
    SyntaxError,
    NotFound,
    AlreadyExists,
    CycleConflict,
    CycleOutOfRange,
    PlusOneCycleExists,
    KeyMismatch,
    IllegalOption,
    MnemonicNotConfigured,
    OutOfSpace,
    HoldRejected,
    PackNotMounted,
    Stopped(StopCode),
}

impl MfdError {
    /// Result word as presented to callers: the fatal bit for exec stops,
    /// the caller-error pattern for everything else.
    pub fn status_word(self) -> u64 {
        match self {
            MfdError::Stopped(_) => crate::facstatus::STATUS_FATAL,
            _ => crate::facstatus::STATUS_CALLER_ERROR,
        }
    }
}

impl fmt::Display for MfdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MfdError::SyntaxError => write!(f, "syntax error"),
            MfdError::NotFound => write!(f, "file is not cataloged"),
            MfdError::AlreadyExists => write!(f, "file is already cataloged"),
            MfdError::CycleConflict => write!(f, "file cycle conflict"),
            MfdError::CycleOutOfRange => write!(f, "file cycle out of range"),
            MfdError::PlusOneCycleExists => write!(f, "plus-one cycle already exists"),
            MfdError::KeyMismatch => write!(f, "incorrect read or write key"),
            MfdError::IllegalOption => write!(f, "illegal option"),
            MfdError::MnemonicNotConfigured => write!(f, "assign mnemonic is not configured"),
            MfdError::OutOfSpace => write!(f, "mass storage space exhausted"),
            MfdError::HoldRejected => write!(f, "hold rejected by Z option"),
            MfdError::PackNotMounted => write!(f, "disk pack is not mounted"),
            MfdError::Stopped(code) => write!(f, "exec stopped ({:?})", code),
        }
    }
}

impl std::error::Error for MfdError {}

pub type MfdResult<T> = Result<T, MfdError>;

struct MfdState {
    mfd_main_item0_address: MfdAddress,
    cache: DirectorySectorCache,
    free_sectors: BTreeSet<u64>,
    packs: BTreeMap<LdatIndex, PackDescriptor>,
    lookup: BTreeMap<String, BTreeMap<String, MfdAddress>>,
    fas_cache: BTreeMap<u64, FileAllocationSet>,
}

impl MfdState {
    fn new() -> Self {
        MfdState {
            mfd_main_item0_address: MfdAddress::INVALID,
            cache: DirectorySectorCache::new(),
            free_sectors: BTreeSet::new(),
            packs: BTreeMap::new(),
            lookup: BTreeMap::new(),
            fas_cache: BTreeMap::new(),
        }
    }
}

/// The master file directory manager: the one authority over catalog
/// structures and track allocation on fixed mass storage.
///
/// All services serialize on one internal lock; nothing is queued, and every
/// call either completes, fails with a caller error, or stops the exec.
pub struct MfdManager {
    config: ExecConfig,
    exec: Arc<dyn ExecLink>,
    channel: Arc<DiskChannel>,
    state: Mutex<MfdState>,
}

impl MfdManager {
    pub fn new(config: ExecConfig, exec: Arc<dyn ExecLink>, channel: Arc<DiskChannel>) -> Self {
        MfdManager {
            config,
            exec,
            channel,
            state: Mutex::new(MfdState::new()),
        }
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, MfdState> {
        self.state.lock().unwrap()
    }

    fn stop_with(&self, code: StopCode) -> MfdError {
        self.exec.stop(code);
        MfdError::Stopped(code)
    }

    // ----- sector and block primitives -----

    fn sector_checked(
        &self,
        state: &MfdState,
        addr: MfdAddress,
    ) -> MfdResult<[Word36; WORDS_PER_SECTOR]> {
        match state.cache.sector(addr) {
            Some(sector) => Ok(sector),
            None => {
                error!("directory sector {} is not resident", addr);
                Err(self.stop_with(StopCode::DirectoryErrors))
            }
        }
    }

    fn write_sector(
        &self,
        state: &mut MfdState,
        addr: MfdAddress,
        sector: &[Word36; WORDS_PER_SECTOR],
    ) -> MfdResult<()> {
        if !state.cache.put_sector(addr, sector) {
            error!("directory sector {} is not resident", addr);
            return Err(self.stop_with(StopCode::DirectoryErrors));
        }
        self.mark_sector_dirty(state, addr)
    }

    fn block_mask_of(&self, state: &MfdState, ldat: LdatIndex) -> MfdResult<u64> {
        match state.packs.get(&ldat) {
            Some(desc) => Ok(desc.block_mask),
            None => {
                error!("no pack descriptor for LDAT {:04o}", ldat);
                Err(self.stop_with(StopCode::DirectoryErrors))
            }
        }
    }

    fn mark_sector_dirty(&self, state: &mut MfdState, addr: MfdAddress) -> MfdResult<()> {
        let mask = self.block_mask_of(state, addr.ldat())?;
        state.cache.mark_dirty(addr.block_aligned(mask));
        Ok(())
    }

    // ----- DAS management -----
    //
    // Sector 0 of every ninth directory track is a DAS. Entry e of the DAS
    // on track 9k covers directory track 9k+e; its first word carries the
    // device-relative word address of the covered track (which is what makes
    // a recovery boot able to find every directory track), and the next two
    // words are the 64-bit sector allocation bitmap. Word 27 chains to the
    // next DAS track by device address.

    fn das_location(track: TrackId) -> (TrackId, usize) {
        let das_track = track - track % DAS_TRACK_INTERVAL;
        (das_track, (track % DAS_TRACK_INTERVAL) as usize)
    }

    /// The DAS address and entry index covering `sector_addr`, verified
    /// against the DAS itself.
    fn find_das_entry(
        &self,
        state: &MfdState,
        sector_addr: MfdAddress,
    ) -> MfdResult<(MfdAddress, usize)> {
        let (das_track, entry_index) = Self::das_location(sector_addr.track());
        let das_addr = MfdAddress::compose(sector_addr.ldat(), das_track, 0);
        let das = self.sector_checked(state, das_addr)?;
        if das[entry_index * 3].w() & INVALID_LINK != 0 {
            error!("no DAS entry for sector {}", sector_addr);
            return Err(self.stop_with(StopCode::DirectoryErrors));
        }
        Ok((das_addr, entry_index))
    }

    fn set_das_bit(
        &self,
        state: &mut MfdState,
        sector_addr: MfdAddress,
        allocate: bool,
    ) -> MfdResult<()> {
        let (das_addr, entry_index) = self.find_das_entry(state, sector_addr)?;
        let mut das = self.sector_checked(state, das_addr)?;

        let sector_id = sector_addr.sector();
        let wx = entry_index * 3 + 1 + (sector_id >= 32) as usize;
        let mask = 0o400000_000000u64 >> (sector_id % 32);
        if allocate {
            das[wx].or(mask);
        } else {
            das[wx].and(!mask);
        }
        self.write_sector(state, das_addr, &das)
    }

    fn das_bit_is_set(&self, state: &MfdState, sector_addr: MfdAddress) -> MfdResult<bool> {
        let (das_addr, entry_index) = self.find_das_entry(state, sector_addr)?;
        let das = self.sector_checked(state, das_addr)?;
        let sector_id = sector_addr.sector();
        let wx = entry_index * 3 + 1 + (sector_id >= 32) as usize;
        let mask = 0o400000_000000u64 >> (sector_id % 32);
        Ok(das[wx].w() & mask != 0)
    }

    // ----- device I/O -----

    fn read_device_track(
        &self,
        desc: &PackDescriptor,
        device_track: TrackId,
    ) -> MfdResult<Vec<Word36>> {
        let mut data = vec![Word36::default(); WORDS_PER_TRACK];
        let words = desc.prep_factor as usize;
        let first_block = device_track * desc.blocks_per_track();
        for bx in 0..desc.blocks_per_track() {
            let start = bx as usize * words;
            let mut packet = IoPacket::read(first_block + bx, &mut data[start..start + words]);
            self.channel.route_io(desc.node_id, &mut packet);
            if packet.status != IoStatus::Complete {
                error!(
                    "cannot read directory track, node {} block {}: {:?}",
                    desc.node_id,
                    first_block + bx,
                    packet.status
                );
                return Err(self.stop_with(StopCode::InternalExecIOFailed));
            }
        }
        Ok(data)
    }

    // ----- directory sector allocation -----

    /// Hands out a zero-filled directory sector, preferring the given pack,
    /// then the pack with the fewest sectors in use. Allocates a fresh
    /// directory track when the free list runs dry.
    fn allocate_directory_sector(
        &self,
        state: &mut MfdState,
        preferred: Option<LdatIndex>,
    ) -> MfdResult<MfdAddress> {
        if state.free_sectors.is_empty() {
            self.allocate_directory_track(state, preferred)?;
        }

        let mut chosen: Option<(u64, MfdAddress)> = None;
        for &value in state.free_sectors.iter() {
            let addr = MfdAddress::from_link(value);
            let used = match state.packs.get(&addr.ldat()) {
                Some(desc) => desc.mfd_sectors_used,
                None => continue,
            };
            if preferred == Some(addr.ldat()) {
                chosen = Some((used, addr));
                break;
            }
            if chosen.map(|(best, _)| used < best).unwrap_or(true) {
                chosen = Some((used, addr));
            }
        }

        let (_, addr) = match chosen {
            Some(c) => c,
            None => {
                error!("free sector list exhausted after track allocation");
                return Err(self.stop_with(StopCode::DirectoryErrors));
            }
        };

        state.free_sectors.remove(&addr.value());
        self.set_das_bit(state, addr, true)?;
        if let Some(desc) = state.packs.get_mut(&addr.ldat()) {
            desc.mfd_sectors_used += 1;
        }

        let zeroed = [Word36::default(); WORDS_PER_SECTOR];
        self.write_sector(state, addr, &zeroed)?;
        Ok(addr)
    }

    /// Returns a directory sector to the free list. The containing track is
    /// never released, even when it becomes empty.
    fn release_directory_sector(&self, state: &mut MfdState, addr: MfdAddress) -> MfdResult<()> {
        self.set_das_bit(state, addr, false)?;
        if let Some(desc) = state.packs.get_mut(&addr.ldat()) {
            desc.mfd_sectors_used = desc.mfd_sectors_used.saturating_sub(1);
        }
        let zeroed = [Word36::default(); WORDS_PER_SECTOR];
        self.write_sector(state, addr, &zeroed)?;
        state.free_sectors.insert(addr.value());
        Ok(())
    }

    /// Claims a device track for directory use, wires it into the DAS
    /// structure, seeds the free sector list, and extends the MFD file's own
    /// allocation so the new track can be written back and recovered.
    fn allocate_directory_track(
        &self,
        state: &mut MfdState,
        preferred: Option<LdatIndex>,
    ) -> MfdResult<(LdatIndex, TrackId)> {
        let candidate = |desc: &PackDescriptor| -> Option<TrackCount> {
            let has_mfd_room = desc.mfd_track_count < u64::from(MAX_LDAT);
            let free = desc.free_space.free_track_count();
            (desc.can_allocate && has_mfd_room && free > 0).then_some(free)
        };

        let mut chosen: Option<(LdatIndex, TrackCount)> = None;
        if let Some(ldat) = preferred {
            if let Some(free) = state.packs.get(&ldat).and_then(candidate) {
                chosen = Some((ldat, free));
            }
        }
        if chosen.is_none() {
            for (&ldat, desc) in state.packs.iter() {
                if let Some(free) = candidate(desc) {
                    if chosen.map(|(_, best)| free > best).unwrap_or(true) {
                        chosen = Some((ldat, free));
                    }
                }
            }
        }

        let (ldat, _) = match chosen {
            Some(c) => c,
            None => {
                error!("no space available for directory track allocation");
                return Err(self.stop_with(StopCode::ExecRequestForMassStorageFailed));
            }
        };

        // first unused MFD track id on the pack
        let existing = state.cache.tracks_for_ldat(ldat);
        let mut track_id: TrackId = 0;
        for t in existing {
            if t == track_id {
                track_id += 1;
            } else {
                break;
            }
        }

        let device_track = {
            let desc = state.packs.get_mut(&ldat).unwrap();
            let device_track = match desc.free_space.allocate_track() {
                Some(t) => t,
                None => {
                    error!("free space table empty for LDAT {:04o}", ldat);
                    return Err(self.stop_with(StopCode::ExecRequestForMassStorageFailed));
                }
            };
            desc.mfd_track_count += 1;
            device_track
        };
        let drwa = device_track * WORDS_PER_TRACK as u64;

        let track_addr = MfdAddress::compose(ldat, track_id, 0);
        state
            .cache
            .insert_track(track_addr, vec![Word36::default(); WORDS_PER_TRACK]);

        let free_first_sector;
        if track_id % DAS_TRACK_INTERVAL == 0 {
            // the new track carries its own DAS
            let mut das = [Word36::default(); WORDS_PER_SECTOR];
            das[0].set_w(drwa);
            das[1].set_w(0o400000_000000); // sector 0 holds the DAS itself
            for entry in 1..=8 {
                das[entry * 3].set_w(INVALID_LINK);
            }
            das[DAS_LINK_WORD].set_w(INVALID_LINK);
            self.write_sector(state, track_addr, &das)?;

            if track_id >= DAS_TRACK_INTERVAL {
                let prev_addr =
                    MfdAddress::compose(ldat, track_id - DAS_TRACK_INTERVAL, 0);
                let mut prev = self.sector_checked(state, prev_addr)?;
                prev[DAS_LINK_WORD].set_w(drwa);
                self.write_sector(state, prev_addr, &prev)?;
            }
            free_first_sector = 1;
        } else {
            let (das_track, entry_index) = Self::das_location(track_id);
            let das_addr = MfdAddress::compose(ldat, das_track, 0);
            let mut das = self.sector_checked(state, das_addr)?;
            das[entry_index * 3].set_w(drwa);
            das[entry_index * 3 + 1].set_w(0);
            das[entry_index * 3 + 2].set_w(0);
            self.write_sector(state, das_addr, &das)?;
            free_first_sector = 0;
        }

        for sector in free_first_sector..SECTORS_PER_TRACK as u64 {
            state
                .free_sectors
                .insert(MfdAddress::compose(ldat, track_id, sector).value());
        }

        self.extend_mfd_file(state, ldat, track_id, device_track)?;

        debug!(
            "allocated directory track ldat {:04o} track {} at device track {}",
            ldat, track_id, device_track
        );
        Ok((ldat, track_id))
    }

    /// Records a new directory track as an extent of the MFD's own file.
    /// During bootstrap the file does not exist yet; its initial extents are
    /// created explicitly there.
    fn extend_mfd_file(
        &self,
        state: &mut MfdState,
        ldat: LdatIndex,
        track_id: TrackId,
        device_track: TrackId,
    ) -> MfdResult<()> {
        let main0_addr = state.mfd_main_item0_address;
        if main0_addr.is_invalid() {
            return Ok(());
        }

        let file_track = mfd_file_track(ldat, track_id);
        let fas = match state.fas_cache.get_mut(&main0_addr.value()) {
            Some(fas) => fas,
            None => {
                error!("MFD file allocation set is not resident");
                return Err(self.stop_with(StopCode::DirectoryErrors));
            }
        };
        fas.merge(FileAllocation::new(file_track, 1, ldat, device_track));
        let highest = fas.highest_track_allocated();

        let mut main0 = self.sector_checked(state, main0_addr)?;
        main0[MAIN0_HIGHEST_GRANULE].set_h1(highest);
        main0[MAIN0_HIGHEST_TRACK_WRITTEN].set_h1(highest);
        self.write_sector(state, main0_addr, &main0)
    }
}

/// The MFD file's file-relative track id for a directory track: the LDAT and
/// track fields of its address, run together. This is what lets a dirty
/// block's location fall out of an ordinary allocation lookup.
fn mfd_file_track(ldat: LdatIndex, track_id: TrackId) -> TrackId {
    (u64::from(ldat) << 12) | track_id
}

impl MfdManager {
    // ----- file allocation sets and DAD chains -----

    /// Builds the in-memory allocation set of a file cycle from its DAD
    /// chain. Loading a set that is already resident is a directory error.
    fn load_file_allocations(&self, state: &mut MfdState, main0_addr: MfdAddress) -> MfdResult<()> {
        if state.fas_cache.contains_key(&main0_addr.value()) {
            error!("allocation set already loaded for {}", main0_addr);
            return Err(self.stop_with(StopCode::DirectoryErrors));
        }

        let main0 = self.sector_checked(state, main0_addr)?;
        let first_dad = MfdAddress::from_link(main0[MAIN0_DAD_LINK].w());
        let mut fas = FileAllocationSet::new(main0_addr, first_dad);

        let mut dad_addr = first_dad;
        while !dad_addr.is_invalid() {
            let sector = self.sector_checked(state, dad_addr)?;
            for (file_word, extent) in dad::decode_dad_sector(&sector) {
                if extent.is_hole() {
                    continue;
                }
                fas.merge(FileAllocation::new(
                    file_word / WORDS_PER_TRACK as u64,
                    extent.word_count / WORDS_PER_TRACK as u64,
                    extent.ldat,
                    extent.device_word_address / WORDS_PER_TRACK as u64,
                ));
            }
            dad_addr = MfdAddress::from_link(sector[0].w());
        }

        fas.is_updated = false;
        state.fas_cache.insert(main0_addr.value(), fas);
        Ok(())
    }

    /// Rewrites the DAD chain of a file cycle from its in-memory allocation
    /// set, growing or shrinking the chain as needed.
    ///
    /// Growing the chain can expand the directory, which extends the MFD
    /// file's own allocation set; when that set is the one being persisted,
    /// the write is repeated until it is self-consistent.
    fn persist_file_allocations(
        &self,
        state: &mut MfdState,
        main0_addr: MfdAddress,
    ) -> MfdResult<()> {
        loop {
            let extents = match state.fas_cache.get_mut(&main0_addr.value()) {
                Some(fas) if fas.is_updated => {
                    fas.is_updated = false;
                    dad::build_extents(fas)
                }
                Some(_) => return Ok(()),
                None => {
                    error!("no allocation set to persist for {}", main0_addr);
                    return Err(self.stop_with(StopCode::DirectoryErrors));
                }
            };

            // existing chain, in order
            let main0 = self.sector_checked(state, main0_addr)?;
            let mut existing = Vec::new();
            let mut dad_addr = MfdAddress::from_link(main0[MAIN0_DAD_LINK].w());
            while !dad_addr.is_invalid() {
                existing.push(dad_addr);
                let sector = self.sector_checked(state, dad_addr)?;
                dad_addr = MfdAddress::from_link(sector[0].w());
            }

            let needed = dad::sectors_required(extents.len());
            let mut chain = Vec::with_capacity(needed);
            for dx in 0..needed {
                match existing.get(dx) {
                    Some(&addr) => chain.push(addr),
                    None => chain.push(
                        self.allocate_directory_sector(state, Some(main0_addr.ldat()))?,
                    ),
                }
            }
            for &addr in existing.iter().skip(needed) {
                self.release_directory_sector(state, addr)?;
            }

            let mut cursor = 0u64;
            for (dx, group) in extents.chunks(EXTENTS_PER_DAD).enumerate() {
                let mut sector = [Word36::default(); WORDS_PER_SECTOR];
                match chain.get(dx + 1) {
                    Some(next) => sector[0].set_w(next.value()),
                    None => sector[0].set_w(INVALID_LINK),
                }
                let back = if dx == 0 { main0_addr } else { chain[dx - 1] };
                sector[1].set_w(back.value());
                cursor = dad::encode_dad_sector(&mut sector, group, cursor);
                self.write_sector(state, chain[dx], &sector)?;
            }

            let mut main0 = self.sector_checked(state, main0_addr)?;
            match chain.first() {
                Some(first) => main0[MAIN0_DAD_LINK].set_w(MAIN_ITEM_MARKER | first.value()),
                None => main0[MAIN0_DAD_LINK].set_w(MAIN_ITEM_MARKER | INVALID_LINK),
            }
            self.write_sector(state, main0_addr, &main0)?;

            let fas = state.fas_cache.get_mut(&main0_addr.value()).unwrap();
            fas.dad_item0_address = chain.first().copied().unwrap_or(MfdAddress::INVALID);
            if !fas.is_updated {
                return Ok(());
            }
        }
    }

    /// Physically releases everything a file cycle owns: its device tracks
    /// back to pack free space, and its DAD/main item sectors back to the
    /// directory. The cycle must not be assigned; lead item maintenance is
    /// the caller's business.
    fn drop_file_cycle_sectors(
        &self,
        state: &mut MfdState,
        main0_addr: MfdAddress,
    ) -> MfdResult<()> {
        if state.fas_cache.contains_key(&main0_addr.value()) {
            error!("attempt to drop assigned file cycle {}", main0_addr);
            return Err(self.stop_with(StopCode::DirectoryErrors));
        }

        let main0 = self.sector_checked(state, main0_addr)?;
        let descriptor = DescriptorFlags::extract(main0[MAIN0_DESCRIPTOR].t1());

        if !descriptor.is_tape_file {
            let mut dad_addr = MfdAddress::from_link(main0[MAIN0_DAD_LINK].w());
            while !dad_addr.is_invalid() {
                let sector = self.sector_checked(state, dad_addr)?;
                for (_, extent) in dad::decode_dad_sector(&sector) {
                    if extent.is_hole() {
                        continue;
                    }
                    let device_track = extent.device_word_address / WORDS_PER_TRACK as u64;
                    let track_count = extent.word_count / WORDS_PER_TRACK as u64;
                    let released = state
                        .packs
                        .get_mut(&extent.ldat)
                        .map(|desc| desc.free_space.release_region(device_track, track_count))
                        .unwrap_or(false);
                    if !released {
                        error!(
                            "cannot release device tracks {}+{} on LDAT {:04o}",
                            device_track, track_count, extent.ldat
                        );
                        return Err(self.stop_with(StopCode::DirectoryErrors));
                    }
                }
                self.release_directory_sector(state, dad_addr)?;
                dad_addr = MfdAddress::from_link(sector[0].w());
            }
        }

        // main item chain: sector 0, then sector 1 and its overflows
        let mut item_addr = MfdAddress::from_link(main0[MAIN0_MAIN1_LINK].w());
        self.release_directory_sector(state, main0_addr)?;
        while !item_addr.is_invalid() {
            let sector = self.sector_checked(state, item_addr)?;
            self.release_directory_sector(state, item_addr)?;
            item_addr = MfdAddress::from_link(sector[0].w());
        }
        Ok(())
    }
}

impl MfdManager {
    // ----- lead item maintenance -----

    fn read_lead_items(
        &self,
        state: &MfdState,
        lead0_addr: MfdAddress,
    ) -> MfdResult<(
        [Word36; WORDS_PER_SECTOR],
        Option<(MfdAddress, [Word36; WORDS_PER_SECTOR])>,
    )> {
        let lead0 = self.sector_checked(state, lead0_addr)?;
        let lead1_addr = MfdAddress::from_link(lead0[0].w());
        let lead1 = if lead1_addr.is_invalid() {
            None
        } else {
            Some((lead1_addr, self.sector_checked(state, lead1_addr)?))
        };
        Ok((lead0, lead1))
    }

    fn fileset_info_at(&self, state: &MfdState, lead0_addr: MfdAddress) -> MfdResult<FileSetInfo> {
        let (lead0, lead1) = self.read_lead_items(state, lead0_addr)?;
        Ok(FileSetInfo::from_lead_items(
            &lead0,
            lead1.as_ref().map(|(_, s)| &s[..]),
        ))
    }

    /// Makes sure the lead item can hold `slots` cycle links, allocating a
    /// lead item sector 1 when sector 0's seventeen run out.
    fn ensure_lead_capacity(
        &self,
        state: &mut MfdState,
        lead0_addr: MfdAddress,
        slots: usize,
    ) -> MfdResult<()> {
        let (mut lead0, lead1) = self.read_lead_items(state, lead0_addr)?;
        if slots <= LEAD0_LINK_CAPACITY || lead1.is_some() {
            if slots > lead_capacity(lead1.is_some()) {
                error!("cycle range {} exceeds lead item capacity", slots);
                return Err(self.stop_with(StopCode::DirectoryErrors));
            }
            return Ok(());
        }

        let lead1_addr = self.allocate_directory_sector(state, Some(lead0_addr.ldat()))?;
        let mut lead1 = [Word36::default(); WORDS_PER_SECTOR];
        lead1[0].set_w(INVALID_LINK);
        self.write_sector(state, lead1_addr, &lead1)?;

        lead0[0].set_w(LEAD_ITEM_MARKER | lead1_addr.value());
        self.write_sector(state, lead0_addr, &lead0)
    }

    /// Removes one cycle link from a lead item, renormalizes the range
    /// fields, and tears down the whole file set when the last cycle is
    /// gone. Returns true when the file set itself was removed.
    fn remove_cycle_slot(
        &self,
        state: &mut MfdState,
        lead0_addr: MfdAddress,
        absolute_cycle: u32,
    ) -> MfdResult<bool> {
        let (mut lead0, lead1_pair) = self.read_lead_items(state, lead0_addr)?;
        let mut lead1 = lead1_pair.map(|(addr, sector)| (addr, sector));
        let info = FileSetInfo::from_lead_items(
            &lead0,
            lead1.as_ref().map(|(_, s)| &s[..]),
        );

        let index = match info.index_of(absolute_cycle) {
            Some(ix) if info.cycle_info[ix].is_some() => ix,
            _ => {
                error!(
                    "cycle {} is not present in lead item {}",
                    absolute_cycle, lead0_addr
                );
                return Err(self.stop_with(StopCode::DirectoryErrors));
            }
        };

        set_lead_link_word(
            &mut lead0,
            lead1.as_mut().map(|(_, s)| &mut s[..]),
            index,
            0,
        );
        let remaining = info.cycle_count - 1;

        if remaining == 0 {
            let qualifier = info.qualifier.clone();
            let filename = info.filename.clone();
            if let Some((lead1_addr, _)) = lead1 {
                self.release_directory_sector(state, lead1_addr)?;
            }
            self.release_directory_sector(state, lead0_addr)?;
            if let Some(files) = state.lookup.get_mut(&qualifier) {
                files.remove(&filename);
                if files.is_empty() {
                    state.lookup.remove(&qualifier);
                }
            }
            info!("file set {}*{} removed", qualifier, filename);
            return Ok(true);
        }

        // renormalize: the link table must start at the highest existing
        // cycle and end at the lowest
        let survivors: Vec<usize> = (0..info.current_range as usize)
            .filter(|&ix| {
                ix != index && info.cycle_info.get(ix).map(|s| s.is_some()).unwrap_or(false)
            })
            .collect();
        let first = *survivors.first().unwrap();
        let last = *survivors.last().unwrap();

        if first > 0 {
            for (new_ix, old_ix) in (first..=last).enumerate() {
                let value = lead_link_word(
                    &lead0,
                    lead1.as_ref().map(|(_, s)| &s[..]),
                    old_ix,
                );
                set_lead_link_word(
                    &mut lead0,
                    lead1.as_mut().map(|(_, s)| &mut s[..]),
                    new_ix,
                    value,
                );
            }
            for old_ix in (last - first + 1)..=last {
                set_lead_link_word(
                    &mut lead0,
                    lead1.as_mut().map(|(_, s)| &mut s[..]),
                    old_ix,
                    0,
                );
            }
        }

        let new_highest = catalog::cycle_below(info.highest_absolute, first as u32);
        lead0[9].set_s2(u64::from(remaining));
        lead0[9].set_s4((last - first + 1) as u64);
        lead0[9].set_t3(u64::from(new_highest));
        if index == 0 {
            // dropping the top cycle retires any plus-one marker with it
            let status = lead0[10].t1() & !LEAD_STATUS_PLUS_ONE;
            lead0[10].set_t1(status);
        }

        self.write_sector(state, lead0_addr, &lead0)?;
        if let Some((lead1_addr, lead1_sector)) = lead1 {
            self.write_sector(state, lead1_addr, &lead1_sector)?;
        }
        Ok(false)
    }

    // ----- write-back -----

    /// Writes every dirty block through the channel, locating each one by
    /// resolving the MFD file's own allocation. Clears the dirty set only
    /// when every write succeeded.
    fn flush_inner(&self, state: &mut MfdState) -> MfdResult<()> {
        // DAD persistence is deferred until a free or a flush; settle every
        // updated allocation set before draining blocks. Persisting one set
        // can expand the directory and dirty the MFD file's set, so drain
        // until quiet.
        let mfd_main = state.mfd_main_item0_address;
        loop {
            let updated: Vec<u64> = state
                .fas_cache
                .iter()
                .filter(|(_, fas)| fas.is_updated)
                .map(|(&addr, _)| addr)
                .collect();
            if updated.is_empty() {
                break;
            }
            for addr in updated {
                self.persist_file_allocations(state, MfdAddress::from_link(addr))?;
            }
        }

        for block_addr in state.cache.dirty_blocks() {
            let ldat = block_addr.ldat();
            let file_track = mfd_file_track(ldat, block_addr.track());
            let device_track = state
                .fas_cache
                .get(&mfd_main.value())
                .and_then(|fas| fas.resolve(file_track));
            let (extent_ldat, device_track) = match device_track {
                Some(pair) => pair,
                None => {
                    error!(
                        "dirty block {} is not covered by the MFD file allocation",
                        block_addr
                    );
                    return Err(self.stop_with(StopCode::DirectoryErrors));
                }
            };
            if extent_ldat != ldat {
                error!("MFD extent for block {} is on the wrong pack", block_addr);
                return Err(self.stop_with(StopCode::DirectoryErrors));
            }

            let desc = match state.packs.get(&ldat) {
                Some(d) => d,
                None => {
                    error!("no pack descriptor for LDAT {:04o}", ldat);
                    return Err(self.stop_with(StopCode::DirectoryErrors));
                }
            };
            let block_id = device_track * desc.blocks_per_track()
                + block_addr.sector() / desc.sectors_per_block();

            let mut buffer = match state.cache.block(block_addr, desc.block_mask) {
                Some(slice) => slice.to_vec(),
                None => {
                    error!("dirty block {} is not resident", block_addr);
                    return Err(self.stop_with(StopCode::DirectoryErrors));
                }
            };
            let node_id = desc.node_id;
            let mut packet = IoPacket::write(block_id, &mut buffer);
            self.channel.route_io(node_id, &mut packet);
            if packet.status != IoStatus::Complete {
                error!(
                    "error writing MFD block {} (device block {}): {:?}",
                    block_addr, block_id, packet.status
                );
                return Err(self.stop_with(StopCode::InternalExecIOFailed));
            }
        }

        state.cache.clear_dirty();
        Ok(())
    }
}

impl MfdManager {
    // ----- boot support -----

    fn read_pack_label(&self, node_id: NodeId) -> Option<PackLabel> {
        let geometry = self.channel.geometry(node_id)?;
        let mut block = vec![Word36::default(); geometry.words_per_block as usize];
        let mut packet = IoPacket::read(0, &mut block);
        self.channel.route_io(node_id, &mut packet);
        if packet.status != IoStatus::Complete {
            warn!("cannot read label on node {}: {:?}", node_id, packet.status);
            return None;
        }
        PackLabel::decode(&block)
    }

    /// Sector 1 of the initial directory track, which records the pack's
    /// LDAT assignment (0 for a removable pack).
    fn read_directory_sector1(
        &self,
        node_id: NodeId,
        label: &PackLabel,
    ) -> Option<[Word36; WORDS_PER_SECTOR]> {
        let words_per_block = u64::from(label.words_per_block);
        let mut block_id = label.first_directory_track_address / words_per_block;
        if words_per_block == WORDS_PER_SECTOR as u64 {
            block_id += 1;
        }

        let mut block = vec![Word36::default(); label.words_per_block as usize];
        let mut packet = IoPacket::read(block_id, &mut block);
        self.channel.route_io(node_id, &mut packet);
        if packet.status != IoStatus::Complete {
            warn!(
                "cannot read directory track on node {}: {:?}",
                node_id, packet.status
            );
            return None;
        }

        let mut sector1 = [Word36::default(); WORDS_PER_SECTOR];
        if words_per_block == WORDS_PER_SECTOR as u64 {
            sector1.copy_from_slice(&block);
        } else {
            sector1.copy_from_slice(&block[WORDS_PER_SECTOR..2 * WORDS_PER_SECTOR]);
        }
        Some(sector1)
    }

    /// Initial boot of the fixed pool: claims every labeled fixed pack,
    /// assigns LDAT indices, rewrites the directory control sectors, and
    /// self-catalogs the MFD file. Everything on the packs is forfeit.
    pub fn initialize_mass_storage(&self) -> MfdResult<()> {
        info!("initializing mass storage");
        let mut state = self.lock();
        *state = MfdState::new();

        let mut fixed: Vec<(NodeId, PackLabel)> = Vec::new();
        for node_id in self.channel.node_ids() {
            let label = match self.read_pack_label(node_id) {
                Some(label) => label,
                None => {
                    self.exec.send_read_only_message(&format!(
                        "No valid label exists for pack on device {}",
                        node_id
                    ));
                    continue;
                }
            };
            let sector1 = match self.read_directory_sector1(node_id, &label) {
                Some(sector1) => sector1,
                None => {
                    self.exec.send_read_only_message(&format!(
                        "IO error reading directory track on device {}",
                        node_id
                    ));
                    continue;
                }
            };
            // LDAT 0 in sector 1 marks a removable pack; those are mounted
            // on request, not claimed into the fixed pool.
            if sector1[5].h1() == 0 {
                debug!("pack {} is removable", label.pack_name);
                continue;
            }
            fixed.push((node_id, label));
        }

        self.exec
            .send_read_only_message(&format!("Fixed Disk Pool = {} Devices", fixed.len()));
        if fixed.is_empty() {
            self.exec
                .send_read_only_message("No Fixed Disks - Cannot Continue Initialization");
            return Err(self.stop_with(StopCode::InitializationSystemConfigurationError));
        }

        let mut names = BTreeSet::new();
        for (_, label) in &fixed {
            if !names.insert(label.pack_name.clone()) {
                self.exec.send_read_only_message(&format!(
                    "Fixed pack name conflict - {}",
                    label.pack_name
                ));
                self.exec
                    .send_read_only_message("Resolve pack name conflicts and reboot");
                return Err(self.stop_with(StopCode::DirectoryErrors));
            }
        }

        let reply = self
            .exec
            .send_read_reply_message(
                "Mass Storage will be Initialized - Do You Want To Continue? Y/N",
                &["Y", "N"],
            )
            .unwrap_or_else(|_| "N".to_string());
        if reply != "Y" {
            return Err(self.stop_with(StopCode::ConsoleResponseRequiresReboot));
        }

        let mut total_tracks: TrackCount = 0;
        for (ix, (node_id, label)) in fixed.iter().enumerate() {
            let ldat = (ix + 1) as LdatIndex;
            let mut desc = PackDescriptor::new(*node_id, label);
            let dir_track = label.first_directory_track_address / WORDS_PER_TRACK as u64;
            if !desc
                .free_space
                .allocate_specific_region(0, dir_track + 1)
            {
                error!("cannot reserve label region on pack {}", label.pack_name);
                return Err(self.stop_with(StopCode::DirectoryErrors));
            }
            desc.mfd_track_count = 1;
            desc.mfd_sectors_used = 2;

            let data = self.read_device_track(&desc, dir_track)?;
            state.packs.insert(ldat, desc);
            let track_addr = MfdAddress::compose(ldat, 0, 0);
            state.cache.insert_track(track_addr, data);

            // sector 0: the pack's first DAS, covering the initial track
            let mut das = self.sector_checked(&state, track_addr)?;
            das[0].set_w(label.first_directory_track_address);
            das[1].set_w(0o600000_000000); // sectors 0 and 1 allocated
            das[2].set_w(0);
            for entry in 1..=8 {
                das[entry * 3].set_w(INVALID_LINK);
                das[entry * 3 + 1].set_w(0);
                das[entry * 3 + 2].set_w(0);
            }
            das[DAS_LINK_WORD].set_w(INVALID_LINK);
            self.write_sector(&mut state, track_addr, &das)?;

            // sector 1: pack metadata, now carrying its LDAT assignment
            let sector1_addr = MfdAddress::compose(ldat, 0, 1);
            let mut sector1 = self.sector_checked(&state, sector1_addr)?;
            sector1[2].set_w(label.track_count);
            sector1[3].set_w(label.track_count);
            sector1[4].from_str_fieldata(&label.pack_name);
            sector1[5].set_h1(u64::from(ldat));
            sector1[0o10].set_t1(label.blocks_per_track());
            sector1[0o10].set_s3(1);
            sector1[0o10].set_t3(u64::from(label.words_per_block));
            self.write_sector(&mut state, sector1_addr, &sector1)?;

            for sector in 2..SECTORS_PER_TRACK as u64 {
                state
                    .free_sectors
                    .insert(MfdAddress::compose(ldat, 0, sector).value());
            }
            total_tracks += label.track_count;
        }

        self.bootstrap_mfd(&mut state)?;
        self.exec
            .send_read_only_message(&format!("MS Initialized - {} Tracks Available", total_tracks));
        Ok(())
    }

    /// Catalogs the MFD's own file, whose extents are exactly the directory
    /// tracks. Until this exists, nothing can be flushed.
    fn bootstrap_mfd(&self, state: &mut MfdState) -> MfdResult<()> {
        let lowest = match state.packs.keys().next() {
            Some(&ldat) => ldat,
            None => return Err(self.stop_with(StopCode::InitializationSystemConfigurationError)),
        };

        let mut request =
            CatalogFileRequest::new(&self.config.system_qualifier, "MFD$$");
        request.project_id = self.config.system_project_id.clone();
        request.account_id = self.config.master_account_id.clone();
        request.mnemonic = self.config.mass_storage_default_mnemonic.clone();
        request.options = fspec::OPT_G | fspec::OPT_V;
        request.initial_granules = state.packs.len() as u64;

        let lead0_addr = self.allocate_directory_sector(state, Some(lowest))?;
        let main0_addr = self.allocate_directory_sector(state, Some(lowest))?;
        let main1_addr = self.allocate_directory_sector(state, Some(lowest))?;
        state.mfd_main_item0_address = main0_addr;

        let mut lead0 = [Word36::default(); WORDS_PER_SECTOR];
        populate_new_lead_item0(&mut lead0, &request, 1, main0_addr);
        self.write_sector(state, lead0_addr, &lead0)?;

        let mut main0 = [Word36::default(); WORDS_PER_SECTOR];
        populate_mass_storage_main_item0(&mut main0, &request, lead0_addr, main1_addr, 1, lowest);
        self.write_sector(state, main0_addr, &main0)?;

        let mut main1 = [Word36::default(); WORDS_PER_SECTOR];
        populate_main_item1(&mut main1, &request, main0_addr, 1);
        self.write_sector(state, main1_addr, &main1)?;

        let mut fas = FileAllocationSet::new(main0_addr, MfdAddress::INVALID);
        let initial_tracks: Vec<(LdatIndex, TrackId)> = state
            .packs
            .iter()
            .map(|(&ldat, desc)| {
                (
                    ldat,
                    desc.first_directory_track_address / WORDS_PER_TRACK as u64,
                )
            })
            .collect();
        let mut highest: TrackId = 0;
        for (ldat, device_track) in initial_tracks {
            let file_track = mfd_file_track(ldat, 0);
            fas.merge(FileAllocation::new(file_track, 1, ldat, device_track));
            highest = highest.max(file_track);
        }
        state.fas_cache.insert(main0_addr.value(), fas);

        let mut main0 = self.sector_checked(state, main0_addr)?;
        main0[MAIN0_HIGHEST_GRANULE].set_h1(highest);
        main0[MAIN0_HIGHEST_TRACK_WRITTEN].set_h1(highest);
        self.write_sector(state, main0_addr, &main0)?;

        self.persist_file_allocations(state, main0_addr)?;
        state
            .lookup
            .entry(self.config.system_qualifier.clone())
            .or_default()
            .insert("MFD$$".to_string(), lead0_addr);

        self.flush_inner(state)?;
        info!("MFD bootstrap complete");
        Ok(())
    }

    /// Recovery boot: rebuilds every in-memory structure from the packs
    /// without reformatting anything. Any inconsistency stops the exec.
    pub fn recover_mass_storage(&self) -> MfdResult<()> {
        info!("recovering mass storage");
        let mut state = self.lock();
        *state = MfdState::new();

        for node_id in self.channel.node_ids() {
            let label = match self.read_pack_label(node_id) {
                Some(label) => label,
                None => {
                    self.exec.send_read_only_message(&format!(
                        "No valid label exists for pack on device {}",
                        node_id
                    ));
                    continue;
                }
            };
            let sector1 = match self.read_directory_sector1(node_id, &label) {
                Some(sector1) => sector1,
                None => continue,
            };
            let ldat_field = sector1[5].h1();
            if ldat_field == 0 {
                continue; // removable
            }
            if ldat_field == u64::from(crate::consts::INVALID_LDAT) {
                self.exec.send_read_only_message(&format!(
                    "Pack {} has never joined the fixed pool",
                    label.pack_name
                ));
                continue;
            }
            let ldat = ldat_field as LdatIndex;
            if ldat > MAX_LDAT || state.packs.contains_key(&ldat) {
                error!("conflicting LDAT {:04o} on pack {}", ldat, label.pack_name);
                return Err(self.stop_with(StopCode::DirectoryErrors));
            }
            state.packs.insert(ldat, PackDescriptor::new(node_id, &label));
        }

        if state.packs.is_empty() {
            self.exec
                .send_read_only_message("No Fixed Disks - Cannot Continue Recovery");
            return Err(self.stop_with(StopCode::InitializationSystemConfigurationError));
        }

        // Walk every pack's DAS chain, pulling each directory track into the
        // cache and rebuilding sector accounting as we go.
        let ldats: Vec<LdatIndex> = state.packs.keys().copied().collect();
        for ldat in ldats {
            let (first_drwa, label_tracks) = {
                let desc = state.packs.get(&ldat).unwrap();
                (
                    desc.first_directory_track_address,
                    desc.first_directory_track_address / WORDS_PER_TRACK as u64,
                )
            };
            if label_tracks > 0 {
                let desc = state.packs.get_mut(&ldat).unwrap();
                if !desc.free_space.allocate_specific_region(0, label_tracks) {
                    error!("cannot reserve label region on LDAT {:04o}", ldat);
                    return Err(self.stop_with(StopCode::DirectoryErrors));
                }
            }

            let mut das_drwa = first_drwa;
            let mut das_track_id: TrackId = 0;
            loop {
                self.recover_directory_track(&mut state, ldat, das_track_id, das_drwa)?;
                let das_addr = MfdAddress::compose(ldat, das_track_id, 0);
                let das = self.sector_checked(&state, das_addr)?;
                if das[0].w() != das_drwa {
                    error!("DAS at {} does not describe itself", das_addr);
                    return Err(self.stop_with(StopCode::DirectoryErrors));
                }

                for entry in 1..=8u64 {
                    let word = das[(entry * 3) as usize].w();
                    if word & INVALID_LINK != 0 {
                        continue;
                    }
                    self.recover_directory_track(
                        &mut state,
                        ldat,
                        das_track_id + entry,
                        word,
                    )?;
                }

                for entry in 0..=8u64 {
                    let track_id = das_track_id + entry;
                    let track_addr = MfdAddress::compose(ldat, track_id, 0);
                    if !state.cache.contains_track(track_addr) {
                        continue;
                    }
                    for sector in 0..SECTORS_PER_TRACK as u64 {
                        let wx = (entry * 3) as usize + 1 + (sector >= 32) as usize;
                        let bit = das[wx].w() & (0o400000_000000 >> (sector % 32));
                        let addr = MfdAddress::compose(ldat, track_id, sector);
                        if bit != 0 {
                            state.packs.get_mut(&ldat).unwrap().mfd_sectors_used += 1;
                        } else {
                            state.free_sectors.insert(addr.value());
                        }
                    }
                }

                let link = das[DAS_LINK_WORD].w();
                if link & INVALID_LINK != 0 {
                    break;
                }
                das_drwa = link;
                das_track_id += DAS_TRACK_INTERVAL;
            }
        }

        // Rebuild the file set lookup from lead items. Lead item 0 sectors
        // are the only ones whose first word carries the lead marker alone.
        let ldats: Vec<LdatIndex> = state.packs.keys().copied().collect();
        for ldat in ldats {
            for track_id in state.cache.tracks_for_ldat(ldat) {
                for sector in 0..SECTORS_PER_TRACK as u64 {
                    if sector == 0 && track_id % DAS_TRACK_INTERVAL == 0 {
                        continue;
                    }
                    if sector == 1 && track_id == 0 {
                        continue;
                    }
                    let addr = MfdAddress::compose(ldat, track_id, sector);
                    if state.free_sectors.contains(&addr.value()) {
                        continue;
                    }
                    let item = match state.cache.sector(addr) {
                        Some(item) => item,
                        None => continue,
                    };
                    let word0 = item[0].w();
                    if word0 & LEAD_ITEM_MARKER == 0 || word0 & MAIN_ITEM_MARKER != 0 {
                        continue;
                    }
                    let qualifier = fieldata_to_string(&item[1..3]);
                    let filename = fieldata_to_string(&item[3..5]);
                    let previous = state
                        .lookup
                        .entry(qualifier.clone())
                        .or_default()
                        .insert(filename.clone(), addr);
                    if previous.is_some() {
                        error!("duplicate lead item for {}*{}", qualifier, filename);
                        return Err(self.stop_with(StopCode::DirectoryErrors));
                    }
                }
            }
        }

        // The exec's own file is permanently assigned; bring its allocation
        // set in now and make sure it covers every directory track.
        let mfd_lead = state
            .lookup
            .get(&self.config.system_qualifier)
            .and_then(|files| files.get("MFD$$"))
            .copied();
        let mfd_lead = match mfd_lead {
            Some(addr) => addr,
            None => {
                error!("MFD file is not cataloged on the recovered packs");
                return Err(self.stop_with(StopCode::DirectoryErrors));
            }
        };
        let (lead0, lead1) = self.read_lead_items(&state, mfd_lead)?;
        let main0_addr = MfdAddress::from_link(lead_link_word(
            &lead0,
            lead1.as_ref().map(|(_, s)| &s[..]),
            0,
        ));
        if main0_addr.is_invalid() {
            error!("MFD lead item carries no file cycle");
            return Err(self.stop_with(StopCode::DirectoryErrors));
        }
        state.mfd_main_item0_address = main0_addr;
        self.load_file_allocations(&mut state, main0_addr)?;

        let ldats: Vec<LdatIndex> = state.packs.keys().copied().collect();
        for ldat in ldats {
            for track_id in state.cache.tracks_for_ldat(ldat) {
                let covered = state
                    .fas_cache
                    .get(&main0_addr.value())
                    .and_then(|fas| fas.resolve(mfd_file_track(ldat, track_id)))
                    .is_some();
                if !covered {
                    error!(
                        "directory track {:04o}:{} is outside the MFD file allocation",
                        ldat, track_id
                    );
                    return Err(self.stop_with(StopCode::DirectoryErrors));
                }
            }
        }

        // Carve every cataloged cycle's extents out of pack free space.
        // The MFD file itself is skipped; its extents are the directory
        // tracks which were claimed during the DAS walk.
        let filesets: Vec<(String, String, MfdAddress)> = state
            .lookup
            .iter()
            .flat_map(|(qualifier, files)| {
                files
                    .iter()
                    .map(|(filename, &addr)| (qualifier.clone(), filename.clone(), addr))
            })
            .collect();
        for (qualifier, filename, lead_addr) in filesets {
            if qualifier == self.config.system_qualifier && filename == "MFD$$" {
                continue;
            }
            let info = self.fileset_info_at(&state, lead_addr)?;
            for cycle in info.cycle_info.iter().flatten() {
                let main0 = self.sector_checked(&state, cycle.main_item0_address)?;
                if DescriptorFlags::extract(main0[MAIN0_DESCRIPTOR].t1()).is_tape_file {
                    continue;
                }
                let mut dad_addr = MfdAddress::from_link(main0[MAIN0_DAD_LINK].w());
                while !dad_addr.is_invalid() {
                    let sector = self.sector_checked(&state, dad_addr)?;
                    for (_, extent) in dad::decode_dad_sector(&sector) {
                        if extent.is_hole() {
                            continue;
                        }
                        let device_track = extent.device_word_address / WORDS_PER_TRACK as u64;
                        let track_count = extent.word_count / WORDS_PER_TRACK as u64;
                        let claimed = state
                            .packs
                            .get_mut(&extent.ldat)
                            .map(|desc| {
                                desc.free_space
                                    .allocate_specific_region(device_track, track_count)
                            })
                            .unwrap_or(false);
                        if !claimed {
                            error!(
                                "extent {}+{} of {}*{} overlaps another allocation",
                                device_track, track_count, qualifier, filename
                            );
                            return Err(self.stop_with(StopCode::DirectoryErrors));
                        }
                    }
                    dad_addr = MfdAddress::from_link(sector[0].w());
                }
            }
        }

        let total_free: TrackCount = state
            .packs
            .values()
            .map(|desc| desc.free_space.free_track_count())
            .sum();
        self.exec.send_read_only_message(&format!(
            "MS Recovered - {} Packs, {} Tracks Available",
            state.packs.len(),
            total_free
        ));
        Ok(())
    }

    /// Claims one directory track from pack free space, reads it, and
    /// installs it in the cache.
    fn recover_directory_track(
        &self,
        state: &mut MfdState,
        ldat: LdatIndex,
        track_id: TrackId,
        drwa: u64,
    ) -> MfdResult<()> {
        let device_track = drwa / WORDS_PER_TRACK as u64;
        {
            let desc = state.packs.get_mut(&ldat).unwrap();
            if !desc.free_space.allocate_specific_region(device_track, 1) {
                error!(
                    "directory track {:04o}:{} at device track {} is doubly allocated",
                    ldat, track_id, device_track
                );
                return Err(self.stop_with(StopCode::DirectoryErrors));
            }
            desc.mfd_track_count += 1;
        }
        let data = {
            let desc = state.packs.get(&ldat).unwrap();
            self.read_device_track(desc, device_track)?
        };
        state
            .cache
            .insert_track(MfdAddress::compose(ldat, track_id, 0), data);
        Ok(())
    }
}

impl MfdManager {
    // ----- directory services -----

    /// Catalogs a file cycle. Caller errors leave the directory untouched
    /// and post their reason to `fr`; on success all dirty state is flushed
    /// before returning the new main item 0 address.
    pub fn catalog_file(
        &self,
        request: &CatalogFileRequest,
        fr: &mut FacResult,
    ) -> MfdResult<MfdAddress> {
        let mut state = self.lock();

        if !fspec::is_valid_qualifier(&request.qualifier)
            || !fspec::is_valid_filename(&request.filename)
        {
            fr.post(FacStatusCode::SyntaxErrorInImage, &[]);
            return Err(MfdError::SyntaxError);
        }
        for key in [&request.read_key, &request.write_key].into_iter().flatten() {
            if !fspec::is_valid_key(key) {
                fr.post(FacStatusCode::SyntaxErrorInImage, &[]);
                return Err(MfdError::SyntaxError);
            }
        }
        for pack in &request.pack_ids {
            if !fspec::is_valid_pack_name(pack) {
                fr.post(FacStatusCode::SyntaxErrorInImage, &[]);
                return Err(MfdError::SyntaxError);
            }
        }

        if !self.config.is_mnemonic_configured(&request.mnemonic) {
            fr.post(FacStatusCode::MnemonicIsNotConfigured, &[&request.mnemonic]);
            return Err(MfdError::MnemonicNotConfigured);
        }
        let allowed = self.config.allowed_options(&request.mnemonic).unwrap_or(0);
        if let Some(letter) = fspec::first_illegal_option(request.options, allowed) {
            fr.post(FacStatusCode::IllegalOption, &[&letter.to_string()]);
            return Err(MfdError::IllegalOption);
        }

        // A removable cycle needs its packs; a pack we do not know is not
        // mounted, and holding for the mount is the caller's business.
        if request.file_type == FileType::Removable {
            let known = |name: &String| {
                state
                    .packs
                    .values()
                    .any(|desc| desc.pack_name == *name && desc.can_allocate)
            };
            if !request.pack_ids.iter().all(known) {
                if request.options & OPT_Z != 0 {
                    fr.post(FacStatusCode::HoldForPackRejected, &[]);
                    return Err(MfdError::HoldRejected);
                }
                fr.post(FacStatusCode::RunHeldForDiskPackMount, &["EXEC", "0"]);
                return Err(MfdError::PackNotMounted);
            }
        }

        let existing = state
            .lookup
            .get(&request.qualifier)
            .and_then(|files| files.get(&request.filename))
            .copied();

        let main0_addr = match existing {
            None => self.catalog_into_new_fileset(&mut state, request, fr)?,
            Some(lead0_addr) => {
                self.catalog_into_existing_fileset(&mut state, lead0_addr, request, fr)?
            }
        };

        self.flush_inner(&mut state)?;
        fr.post(FacStatusCode::Complete, &["CAT"]);
        Ok(main0_addr)
    }

    fn catalog_into_new_fileset(
        &self,
        state: &mut MfdState,
        request: &CatalogFileRequest,
        fr: &mut FacResult,
    ) -> MfdResult<MfdAddress> {
        let absolute_cycle = match request.file_cycle {
            None => 1,
            Some(FileCycleSpecification::Relative(0)) => 1,
            Some(FileCycleSpecification::Relative(1)) => 1,
            Some(FileCycleSpecification::Absolute(cycle)) => cycle,
            Some(FileCycleSpecification::Relative(_)) => {
                fr.post(FacStatusCode::FileCycleOutOfRange, &[]);
                return Err(MfdError::CycleOutOfRange);
            }
        };
        let plus_one = matches!(
            request.file_cycle,
            Some(FileCycleSpecification::Relative(1))
        );

        let lead0_addr = self.allocate_directory_sector(state, None)?;
        let main0_addr =
            self.create_main_items(state, request, lead0_addr, absolute_cycle)?;

        let mut lead0 = [Word36::default(); WORDS_PER_SECTOR];
        populate_new_lead_item0(&mut lead0, request, absolute_cycle, main0_addr);
        if plus_one {
            lead0[10].set_t1(lead0[10].t1() | LEAD_STATUS_PLUS_ONE);
        }
        self.write_sector(state, lead0_addr, &lead0)?;

        state
            .lookup
            .entry(request.qualifier.clone())
            .or_default()
            .insert(request.filename.clone(), lead0_addr);
        debug!(
            "cataloged {}*{}({}) at {}",
            request.qualifier, request.filename, absolute_cycle, main0_addr
        );
        Ok(main0_addr)
    }

    fn catalog_into_existing_fileset(
        &self,
        state: &mut MfdState,
        lead0_addr: MfdAddress,
        request: &CatalogFileRequest,
        fr: &mut FacResult,
    ) -> MfdResult<MfdAddress> {
        let mut info = self.fileset_info_at(state, lead0_addr)?;

        if info.file_type != request.file_type {
            fr.post(FacStatusCode::FileCycleConflict, &[]);
            return Err(MfdError::CycleConflict);
        }

        if !info.write_key.is_empty() {
            match &request.write_key {
                None => {
                    fr.post(FacStatusCode::ReadWriteKeysNeeded, &[]);
                    return Err(MfdError::KeyMismatch);
                }
                Some(key) if *key != info.write_key => {
                    fr.post(FacStatusCode::IncorrectWriteKey, &[]);
                    return Err(MfdError::KeyMismatch);
                }
                _ => {}
            }
        }
        if !info.read_key.is_empty() {
            if let Some(key) = &request.read_key {
                if *key != info.read_key {
                    fr.post(FacStatusCode::IncorrectReadKey, &[]);
                    return Err(MfdError::KeyMismatch);
                }
            }
        }

        let mut attempts = 0;
        let check = loop {
            match check_cycle(request.file_cycle, &info) {
                Ok(check) => break check,
                Err(CycleCheckError::DropOldestRequired) => {
                    attempts += 1;
                    if attempts > MAX_CYCLE_RANGE {
                        error!("cycle rollover does not converge for {}", lead0_addr);
                        return Err(self.stop_with(StopCode::DirectoryErrors));
                    }
                    if self.drop_oldest_for_rollover(state, lead0_addr, &info, fr)? {
                        // the set vanished with its last cycle
                        return self.catalog_into_new_fileset(state, request, fr);
                    }
                    info = self.fileset_info_at(state, lead0_addr)?;
                }
                Err(CycleCheckError::AlreadyExists) => {
                    fr.post(FacStatusCode::FileIsAlreadyCataloged, &[]);
                    return Err(MfdError::AlreadyExists);
                }
                Err(CycleCheckError::InvalidRelativeCycle) => {
                    fr.post(FacStatusCode::FileCycleOutOfRange, &[]);
                    return Err(MfdError::CycleOutOfRange);
                }
                Err(CycleCheckError::PlusOneCycleExists) => {
                    fr.post(FacStatusCode::PlusOneCycleExists, &[]);
                    return Err(MfdError::PlusOneCycleExists);
                }
                Err(CycleCheckError::OutOfRange) => {
                    fr.post(FacStatusCode::FileCycleOutOfRange, &[]);
                    return Err(MfdError::CycleOutOfRange);
                }
            }
        };

        self.ensure_lead_capacity(state, lead0_addr, check.new_cycle_range as usize)?;
        let main0_addr =
            self.create_main_items(state, request, lead0_addr, check.absolute_cycle)?;

        let (mut lead0, lead1_pair) = self.read_lead_items(state, lead0_addr)?;
        let mut lead1 = lead1_pair;
        adjust_lead_links(
            &mut lead0,
            lead1.as_mut().map(|(_, s)| &mut s[..]),
            check.shift_amount,
        );
        let slot = if check.shift_amount > 0 {
            0
        } else {
            check.cycle_index
        };
        set_lead_link_word(
            &mut lead0,
            lead1.as_mut().map(|(_, s)| &mut s[..]),
            slot,
            main0_addr.value(),
        );

        lead0[9].set_s2(lead0[9].s2() + 1);
        lead0[9].set_s4(u64::from(check.new_cycle_range));
        if check.shift_amount > 0 {
            lead0[9].set_t3(u64::from(check.absolute_cycle));
        }
        if check.plus_one {
            lead0[10].set_t1(lead0[10].t1() | LEAD_STATUS_PLUS_ONE);
        }

        self.write_sector(state, lead0_addr, &lead0)?;
        if let Some((lead1_addr, lead1_sector)) = lead1 {
            self.write_sector(state, lead1_addr, &lead1_sector)?;
        }
        debug!(
            "cataloged {}*{}({}) at {}",
            request.qualifier, request.filename, check.absolute_cycle, main0_addr
        );
        Ok(main0_addr)
    }

    /// Allocates and populates main item 0, main item 1, and any overflow
    /// sectors for long pack or reel lists. Returns the main item 0 address.
    fn create_main_items(
        &self,
        state: &mut MfdState,
        request: &CatalogFileRequest,
        lead0_addr: MfdAddress,
        absolute_cycle: u32,
    ) -> MfdResult<MfdAddress> {
        let preferred = Some(lead0_addr.ldat());
        let main0_addr = self.allocate_directory_sector(state, preferred)?;
        let main1_addr = self.allocate_directory_sector(state, preferred)?;

        let mut main0 = [Word36::default(); WORDS_PER_SECTOR];
        match request.file_type {
            FileType::Tape => populate_tape_main_item0(
                &mut main0,
                request,
                lead0_addr,
                main1_addr,
                absolute_cycle,
            ),
            _ => populate_mass_storage_main_item0(
                &mut main0,
                request,
                lead0_addr,
                main1_addr,
                absolute_cycle,
                lead0_addr.ldat(),
            ),
        }
        self.write_sector(state, main0_addr, &main0)?;

        let mut previous_addr = main1_addr;
        let mut previous = [Word36::default(); WORDS_PER_SECTOR];
        populate_main_item1(&mut previous, request, main0_addr, absolute_cycle);

        let total = match request.file_type {
            FileType::Tape => request.reel_numbers.len(),
            _ => request.pack_ids.len(),
        };
        let mut consumed = total.min(match request.file_type {
            FileType::Tape => MAIN1_PACK_ENTRY_COUNT * 2,
            _ => MAIN1_PACK_ENTRY_COUNT,
        });
        while consumed < total {
            let overflow_addr = self.allocate_directory_sector(state, preferred)?;
            let mut overflow = [Word36::default(); WORDS_PER_SECTOR];
            let taken = populate_main_overflow(&mut overflow, request, main0_addr, consumed);
            if taken == 0 {
                break;
            }
            consumed += taken;
            previous[0].set_w(overflow_addr.value());
            self.write_sector(state, previous_addr, &previous)?;
            previous_addr = overflow_addr;
            previous = overflow;
        }
        self.write_sector(state, previous_addr, &previous)?;
        Ok(main0_addr)
    }

    /// Drops the lowest existing cycle so a rollover catalog can proceed.
    /// Returns true when the file set disappeared with it.
    fn drop_oldest_for_rollover(
        &self,
        state: &mut MfdState,
        lead0_addr: MfdAddress,
        info: &FileSetInfo,
        fr: &mut FacResult,
    ) -> MfdResult<bool> {
        let oldest = match info.cycle_info.iter().rev().flatten().next() {
            Some(cycle) => *cycle,
            None => {
                error!("rollover drop with no existing cycles at {}", lead0_addr);
                return Err(self.stop_with(StopCode::DirectoryErrors));
            }
        };

        let main0 = self.sector_checked(state, oldest.main_item0_address)?;
        let assigned = main0[MAIN0_ASSIGN_COUNT].h2() > 0
            || state
                .fas_cache
                .contains_key(&oldest.main_item0_address.value());
        if assigned || oldest.to_be_cataloged {
            fr.post(FacStatusCode::FileCycleConflict, &[]);
            return Err(MfdError::CycleConflict);
        }

        debug!(
            "rollover drops cycle {} of {}*{}",
            oldest.absolute_cycle, info.qualifier, info.filename
        );
        self.drop_file_cycle_sectors(state, oldest.main_item0_address)?;
        self.remove_cycle_slot(state, lead0_addr, oldest.absolute_cycle)
    }

    /// Drops a file cycle. An assigned cycle is only marked to-be-dropped;
    /// the physical release happens on its final free.
    pub fn drop_file_cycle(
        &self,
        qualifier: &str,
        filename: &str,
        absolute_cycle: u32,
        fr: &mut FacResult,
    ) -> MfdResult<()> {
        let mut state = self.lock();

        let lead0_addr = match state
            .lookup
            .get(qualifier)
            .and_then(|files| files.get(filename))
            .copied()
        {
            Some(addr) => addr,
            None => {
                fr.post(FacStatusCode::FileIsNotCataloged, &[]);
                return Err(MfdError::NotFound);
            }
        };

        let info = self.fileset_info_at(&state, lead0_addr)?;
        let cycle = match info
            .cycle_info
            .iter()
            .flatten()
            .find(|cycle| cycle.absolute_cycle == absolute_cycle)
        {
            Some(cycle) => *cycle,
            None => {
                fr.post(FacStatusCode::FileIsNotCataloged, &[]);
                return Err(MfdError::NotFound);
            }
        };

        let main0_addr = cycle.main_item0_address;
        let mut main0 = self.sector_checked(&state, main0_addr)?;
        let assigned = main0[MAIN0_ASSIGN_COUNT].h2() > 0
            || state.fas_cache.contains_key(&main0_addr.value());

        if assigned {
            let mut descriptor = DescriptorFlags::extract(main0[MAIN0_DESCRIPTOR].t1());
            descriptor.to_be_dropped = true;
            main0[MAIN0_DESCRIPTOR].set_t1(descriptor.compose());
            self.write_sector(&mut state, main0_addr, &main0)?;

            let index = match info.index_of(absolute_cycle) {
                Some(index) => index,
                None => return Err(self.stop_with(StopCode::DirectoryErrors)),
            };
            let (mut lead0, lead1_pair) = self.read_lead_items(&state, lead0_addr)?;
            let mut lead1 = lead1_pair;
            let value = lead_link_word(&lead0, lead1.as_ref().map(|(_, s)| &s[..]), index);
            set_lead_link_word(
                &mut lead0,
                lead1.as_mut().map(|(_, s)| &mut s[..]),
                index,
                value | CYCLE_LINK_TO_BE_DROPPED,
            );
            self.write_sector(&mut state, lead0_addr, &lead0)?;
            if let Some((lead1_addr, lead1_sector)) = lead1 {
                self.write_sector(&mut state, lead1_addr, &lead1_sector)?;
            }
            self.flush_inner(&mut state)?;
            info!(
                "cycle {} of {}*{} marked to be dropped",
                absolute_cycle, qualifier, filename
            );
            return Ok(());
        }

        self.drop_file_cycle_sectors(&mut state, main0_addr)?;
        self.remove_cycle_slot(&mut state, lead0_addr, absolute_cycle)?;
        self.flush_inner(&mut state)?;
        fr.post(FacStatusCode::Complete, &["DROP"]);
        Ok(())
    }

    /// First assign of a cycle loads its allocation set; later assigns just
    /// bump the count.
    pub fn assign_file_cycle(&self, main0_addr: MfdAddress) -> MfdResult<()> {
        let mut state = self.lock();

        let mut main0 = self.sector_checked(&state, main0_addr)?;
        let count = main0[MAIN0_ASSIGN_COUNT].h2();
        if count == 0 {
            if state.mfd_main_item0_address != main0_addr {
                self.load_file_allocations(&mut state, main0_addr)?;
            }
        } else if !state.fas_cache.contains_key(&main0_addr.value()) {
            error!("assigned cycle {} has no resident allocation set", main0_addr);
            return Err(self.stop_with(StopCode::DirectoryErrors));
        }

        main0[MAIN0_ASSIGN_COUNT].set_h2(count + 1);
        main0[MAIN0_TIME_LAST_REFERENCE].set_w(sw_time_now());
        self.write_sector(&mut state, main0_addr, &main0)
    }

    /// Final free of a cycle persists its DAD chain, retires the allocation
    /// set, and completes any deferred drop. All dirty state is drained.
    pub fn release_file_cycle(&self, main0_addr: MfdAddress) -> MfdResult<()> {
        let mut state = self.lock();

        let mut main0 = self.sector_checked(&state, main0_addr)?;
        let count = main0[MAIN0_ASSIGN_COUNT].h2();
        if count == 0 {
            error!("release of unassigned cycle {}", main0_addr);
            return Err(self.stop_with(StopCode::DirectoryErrors));
        }
        main0[MAIN0_ASSIGN_COUNT].set_h2(count - 1);
        self.write_sector(&mut state, main0_addr, &main0)?;

        if count == 1 && state.mfd_main_item0_address != main0_addr {
            self.persist_file_allocations(&mut state, main0_addr)?;
            state.fas_cache.remove(&main0_addr.value());

            let descriptor = DescriptorFlags::extract(main0[MAIN0_DESCRIPTOR].t1());
            let lead0_addr = MfdAddress::from_link(main0[crate::catalog::MAIN0_LEAD_LINK].w());
            let absolute_cycle = main0[MAIN0_INHIBITS_CYCLE].t3() as u32;

            if descriptor.to_be_dropped {
                self.drop_file_cycle_sectors(&mut state, main0_addr)?;
                self.remove_cycle_slot(&mut state, lead0_addr, absolute_cycle)?;
            } else {
                // a released +1 becomes an ordinary cycle
                let (mut lead0, _) = self.read_lead_items(&state, lead0_addr)?;
                let status = lead0[10].t1();
                if status & LEAD_STATUS_PLUS_ONE != 0
                    && lead0[9].t3() as u32 == absolute_cycle
                {
                    lead0[10].set_t1(status & !LEAD_STATUS_PLUS_ONE);
                    self.write_sector(&mut state, lead0_addr, &lead0)?;
                }
            }
        }

        self.flush_inner(&mut state)
    }

    /// Gives a file cycle one more track at the given file-relative
    /// position. Pack choice: the preferred pack, then the pack holding the
    /// nearest neighboring extent, then the pack with the most free tracks.
    pub fn allocate_track_to_file(
        &self,
        main0_addr: MfdAddress,
        preferred: Option<LdatIndex>,
        file_track: TrackId,
    ) -> MfdResult<()> {
        let mut state = self.lock();

        if !state.fas_cache.contains_key(&main0_addr.value()) {
            self.load_file_allocations(&mut state, main0_addr)?;
        }

        let (covered, neighbor) = {
            let fas = state.fas_cache.get(&main0_addr.value()).unwrap();
            (
                fas.resolve(file_track).is_some(),
                fas.find_preceding(file_track).map(|fa| fa.ldat),
            )
        };
        if covered {
            return Ok(());
        }

        let mut candidates: Vec<LdatIndex> = Vec::new();
        if let Some(ldat) = preferred {
            candidates.push(ldat);
        }
        if let Some(ldat) = neighbor {
            candidates.push(ldat);
        }
        let mut by_free: Vec<(TrackCount, LdatIndex)> = state
            .packs
            .iter()
            .map(|(&ldat, desc)| (desc.free_space.free_track_count(), ldat))
            .collect();
        by_free.sort_by(|a, b| b.cmp(a));
        candidates.extend(by_free.into_iter().map(|(_, ldat)| ldat));

        let mut allocated = None;
        let mut seen = BTreeSet::new();
        for ldat in candidates {
            if !seen.insert(ldat) {
                continue;
            }
            if let Some(desc) = state.packs.get_mut(&ldat) {
                if !desc.can_allocate {
                    continue;
                }
                if let Some(device_track) = desc.free_space.allocate_track() {
                    allocated = Some((ldat, device_track));
                    break;
                }
            }
        }
        let (ldat, device_track) = match allocated {
            Some(pair) => pair,
            None => {
                warn!("no fixed pack can satisfy a track allocation");
                return Err(MfdError::OutOfSpace);
            }
        };

        let highest = {
            let fas = state.fas_cache.get_mut(&main0_addr.value()).unwrap();
            fas.merge(FileAllocation::new(file_track, 1, ldat, device_track));
            fas.highest_track_allocated()
        };

        let mut main0 = self.sector_checked(&state, main0_addr)?;
        main0[MAIN0_HIGHEST_GRANULE].set_h1(highest.max(main0[MAIN0_HIGHEST_GRANULE].h1()));
        self.write_sector(&mut state, main0_addr, &main0)
    }

    /// Returns a file-relative region's tracks to their pack.
    pub fn release_file_track_region(
        &self,
        main0_addr: MfdAddress,
        region: TrackRegion,
    ) -> MfdResult<()> {
        let mut state = self.lock();

        let extracted = match state.fas_cache.get_mut(&main0_addr.value()) {
            Some(fas) => fas.extract(region),
            None => {
                error!("no resident allocation set for {}", main0_addr);
                return Err(self.stop_with(StopCode::DirectoryErrors));
            }
        };
        let (ldat, device_track) = match extracted {
            Some(pair) => pair,
            None => {
                error!(
                    "region {}+{} is not allocated to {}",
                    region.track_id, region.track_count, main0_addr
                );
                return Err(self.stop_with(StopCode::DirectoryErrors));
            }
        };

        let released = state
            .packs
            .get_mut(&ldat)
            .map(|desc| desc.free_space.release_region(device_track, region.track_count))
            .unwrap_or(false);
        if !released {
            error!(
                "cannot return device tracks {}+{} to LDAT {:04o}",
                device_track, region.track_count, ldat
            );
            return Err(self.stop_with(StopCode::DirectoryErrors));
        }
        Ok(())
    }

    /// Maps a file-relative track to its pack and device track. The
    /// allocation set is brought in on demand.
    pub fn resolve_file_relative(
        &self,
        main0_addr: MfdAddress,
        file_track: TrackId,
    ) -> MfdResult<Option<(LdatIndex, TrackId)>> {
        let mut state = self.lock();
        let transient = !state.fas_cache.contains_key(&main0_addr.value());
        if transient {
            self.load_file_allocations(&mut state, main0_addr)?;
        }
        let resolved = state
            .fas_cache
            .get(&main0_addr.value())
            .and_then(|fas| fas.resolve(file_track));
        if transient {
            // only assigned files keep their allocation sets resident
            state.fas_cache.remove(&main0_addr.value());
        }
        Ok(resolved)
    }

    /// Drains all dirty directory blocks to their packs.
    pub fn flush(&self) -> MfdResult<()> {
        let mut state = self.lock();
        self.flush_inner(&mut state)
    }

    // ----- lookup services -----

    pub fn get_fileset_info(
        &self,
        qualifier: &str,
        filename: &str,
    ) -> MfdResult<Option<(MfdAddress, FileSetInfo)>> {
        let state = self.lock();
        let lead0_addr = match state
            .lookup
            .get(qualifier)
            .and_then(|files| files.get(filename))
        {
            Some(&addr) => addr,
            None => return Ok(None),
        };
        let info = self.fileset_info_at(&state, lead0_addr)?;
        Ok(Some((lead0_addr, info)))
    }

    /// Cycle metadata for one absolute cycle of a file set.
    pub fn get_file_cycle_info(
        &self,
        qualifier: &str,
        filename: &str,
        absolute_cycle: u32,
    ) -> MfdResult<(MfdAddress, FileCycleInfo)> {
        let state = self.lock();
        let lead0_addr = state
            .lookup
            .get(qualifier)
            .and_then(|files| files.get(filename))
            .copied()
            .ok_or(MfdError::NotFound)?;

        let info = self.fileset_info_at(&state, lead0_addr)?;
        let cycle = info
            .cycle_info
            .iter()
            .flatten()
            .find(|cycle| cycle.absolute_cycle == absolute_cycle)
            .copied()
            .ok_or(MfdError::NotFound)?;

        let main0_addr = cycle.main_item0_address;
        let main0 = self.sector_checked(&state, main0_addr)?;
        let main1_addr = MfdAddress::from_link(main0[MAIN0_MAIN1_LINK].w());
        let main1 = self.sector_checked(&state, main1_addr)?;

        let mut overflow = Vec::new();
        let mut next = MfdAddress::from_link(main1[0].w());
        while !next.is_invalid() {
            let sector = self.sector_checked(&state, next)?;
            next = MfdAddress::from_link(sector[0].w());
            overflow.push(sector);
        }

        Ok((
            main0_addr,
            FileCycleInfo::from_items(&main0, &main1, &overflow),
        ))
    }

    /// Every file set in the directory, in name order.
    pub fn list_filesets(&self) -> MfdResult<Vec<FileSetInfo>> {
        let state = self.lock();
        let mut result = Vec::new();
        for files in state.lookup.values() {
            for &lead0_addr in files.values() {
                result.push(self.fileset_info_at(&state, lead0_addr)?);
            }
        }
        Ok(result)
    }

    /// Renames a file set, rewriting the name fields of every item sector.
    pub fn change_fileset_name(
        &self,
        qualifier: &str,
        filename: &str,
        new_qualifier: &str,
        new_filename: &str,
        fr: &mut FacResult,
    ) -> MfdResult<()> {
        let mut state = self.lock();

        if !fspec::is_valid_qualifier(new_qualifier) || !fspec::is_valid_filename(new_filename) {
            fr.post(FacStatusCode::SyntaxErrorInImage, &[]);
            return Err(MfdError::SyntaxError);
        }
        let lead0_addr = match state
            .lookup
            .get(qualifier)
            .and_then(|files| files.get(filename))
            .copied()
        {
            Some(addr) => addr,
            None => {
                fr.post(FacStatusCode::FileIsNotCataloged, &[]);
                return Err(MfdError::NotFound);
            }
        };
        let taken = state
            .lookup
            .get(new_qualifier)
            .map(|files| files.contains_key(new_filename))
            .unwrap_or(false);
        if taken {
            fr.post(FacStatusCode::FileIsAlreadyCataloged, &[]);
            return Err(MfdError::AlreadyExists);
        }

        let rewrite_names = |sector: &mut [Word36; WORDS_PER_SECTOR]| {
            crate::word::fieldata_from_str(new_qualifier, &mut sector[1..3]);
            crate::word::fieldata_from_str(new_filename, &mut sector[3..5]);
        };

        let mut lead0 = self.sector_checked(&state, lead0_addr)?;
        rewrite_names(&mut lead0);
        self.write_sector(&mut state, lead0_addr, &lead0)?;

        let info = self.fileset_info_at(&state, lead0_addr)?;
        for cycle in info.cycle_info.iter().flatten() {
            let mut main0 = self.sector_checked(&state, cycle.main_item0_address)?;
            rewrite_names(&mut main0);
            let main1_addr = MfdAddress::from_link(main0[MAIN0_MAIN1_LINK].w());
            self.write_sector(&mut state, cycle.main_item0_address, &main0)?;
            let mut main1 = self.sector_checked(&state, main1_addr)?;
            rewrite_names(&mut main1);
            self.write_sector(&mut state, main1_addr, &main1)?;
        }

        if let Some(files) = state.lookup.get_mut(qualifier) {
            files.remove(filename);
            if files.is_empty() {
                state.lookup.remove(qualifier);
            }
        }
        state
            .lookup
            .entry(new_qualifier.to_string())
            .or_default()
            .insert(new_filename.to_string(), lead0_addr);

        self.flush_inner(&mut state)?;
        fr.post(FacStatusCode::Complete, &["CHG"]);
        Ok(())
    }

    /// Widens (never narrows) the maximum cycle range of a file set.
    pub fn set_file_cycle_range(
        &self,
        qualifier: &str,
        filename: &str,
        cycle_range: u32,
        fr: &mut FacResult,
    ) -> MfdResult<()> {
        let mut state = self.lock();

        let lead0_addr = match state
            .lookup
            .get(qualifier)
            .and_then(|files| files.get(filename))
            .copied()
        {
            Some(addr) => addr,
            None => {
                fr.post(FacStatusCode::FileIsNotCataloged, &[]);
                return Err(MfdError::NotFound);
            }
        };
        let info = self.fileset_info_at(&state, lead0_addr)?;
        if cycle_range == 0 || cycle_range > MAX_CYCLE_RANGE || cycle_range < info.max_cycle_range
        {
            fr.post(FacStatusCode::FileCycleOutOfRange, &[]);
            return Err(MfdError::CycleOutOfRange);
        }

        self.ensure_lead_capacity(&mut state, lead0_addr, cycle_range as usize)?;
        let mut lead0 = self.sector_checked(&state, lead0_addr)?;
        lead0[9].set_s3(u64::from(cycle_range));
        self.write_sector(&mut state, lead0_addr, &lead0)?;
        self.flush_inner(&mut state)
    }

    // ----- inspection -----

    pub fn pack_ldats(&self) -> Vec<LdatIndex> {
        self.lock().packs.keys().copied().collect()
    }

    pub fn pack_name_of(&self, ldat: LdatIndex) -> Option<String> {
        self.lock().packs.get(&ldat).map(|desc| desc.pack_name.clone())
    }

    pub fn pack_free_track_count(&self, ldat: LdatIndex) -> Option<TrackCount> {
        self.lock()
            .packs
            .get(&ldat)
            .map(|desc| desc.free_space.free_track_count())
    }

    pub fn pack_capacity(&self, ldat: LdatIndex) -> Option<TrackCount> {
        self.lock()
            .packs
            .get(&ldat)
            .map(|desc| desc.free_space.capacity())
    }

    pub fn directory_track_count(&self, ldat: LdatIndex) -> Option<TrackCount> {
        self.lock().packs.get(&ldat).map(|desc| desc.mfd_track_count)
    }

    pub fn free_sector_count(&self) -> usize {
        self.lock().free_sectors.len()
    }

    /// Checks that every sector of every directory track is either marked
    /// allocated in its DAS or present in the free list, never both.
    pub fn verify_directory_structure(&self) -> MfdResult<()> {
        let state = self.lock();
        for &ldat in state.packs.keys() {
            for track_id in state.cache.tracks_for_ldat(ldat) {
                for sector in 0..SECTORS_PER_TRACK as u64 {
                    let addr = MfdAddress::compose(ldat, track_id, sector);
                    let allocated = self.das_bit_is_set(&state, addr)?;
                    let free = state.free_sectors.contains(&addr.value());
                    if allocated == free {
                        error!(
                            "sector {} allocation bit disagrees with the free list",
                            addr
                        );
                        return Err(self.stop_with(StopCode::DirectoryErrors));
                    }
                }
            }
        }
        Ok(())
    }

    /// Debug listing of the manager state.
    pub fn dump(&self, dest: &mut dyn Write) -> std::io::Result<()> {
        let state = self.lock();

        writeln!(dest, "MFDManager ----------------------------------------")?;
        writeln!(dest, "  Fixed Packs:")?;
        for (ldat, desc) in state.packs.iter() {
            writeln!(
                dest,
                "    ldat={:04o} pack={} node={} prep={} alloc={} mfdTrks={} mfdSecUsed={}",
                ldat,
                desc.pack_name,
                desc.node_id,
                desc.prep_factor,
                desc.can_allocate,
                desc.mfd_track_count,
                desc.mfd_sectors_used
            )?;
            writeln!(dest, "      FreeSpace TrackId  TrackCount")?;
            for region in desc.free_space.regions() {
                writeln!(
                    dest,
                    "              {:7}  {:10}",
                    region.track_id, region.track_count
                )?;
            }
        }

        writeln!(dest, "  Dirty cache blocks:")?;
        for addr in state.cache.dirty_blocks() {
            writeln!(dest, "    {}", addr)?;
        }

        writeln!(
            dest,
            "  Free MFD sectors ({} entries)",
            state.free_sectors.len()
        )?;

        writeln!(dest, "  Lookup Table:")?;
        for (qualifier, files) in state.lookup.iter() {
            for (filename, addr) in files.iter() {
                writeln!(dest, "    {:<25} {}", format!("{}*{}", qualifier, filename), addr)?;
            }
        }

        writeln!(dest, "  Accelerated file allocations:")?;
        for fas in state.fas_cache.values() {
            writeln!(
                dest,
                "    mainItem:{} 1stDAD:{} upd:{} highest:{:06o}",
                fas.main_item0_address,
                fas.dad_item0_address,
                fas.is_updated,
                fas.highest_track_allocated()
            )?;
            for fa in fas.allocations() {
                writeln!(
                    dest,
                    "      fileTrk:{:06o} count:{:06o} ldat:{:04o} devTrk:{:06o}",
                    fa.file_region.track_id, fa.file_region.track_count, fa.ldat, fa.device_track_id
                )?;
            }
        }
        Ok(())
    }
}
