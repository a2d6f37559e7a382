// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{BTreeSet, HashMap};

use crate::consts::{WORDS_PER_SECTOR, WORDS_PER_TRACK};
use crate::types::{LdatIndex, MfdAddress, TrackId};
use crate::word::Word36;

/// Write-back cache of directory tracks, keyed by track-aligned MFD address,
/// plus the set of dirty block-aligned addresses.
///
/// The cache never evicts: the MFD universe is bounded by the 12-bit LDAT
/// and track spaces, and in practice by pack capacity, so tracks stay
/// resident for the life of the session. A dirty block is retired only by a
/// successful write.
#[derive(Default)]
pub struct DirectorySectorCache {
    tracks: HashMap<u64, Vec<Word36>>,
    dirty_blocks: BTreeSet<u64>,
}

impl DirectorySectorCache {
    pub fn new() -> Self {
        DirectorySectorCache::default()
    }

    pub fn contains_track(&self, addr: MfdAddress) -> bool {
        self.tracks.contains_key(&addr.track_aligned().value())
    }

    /// Installs a track buffer. The address is normalized to its track.
    pub fn insert_track(&mut self, addr: MfdAddress, data: Vec<Word36>) {
        debug_assert_eq!(data.len(), WORDS_PER_TRACK);
        self.tracks.insert(addr.track_aligned().value(), data);
    }

    /// Copies one 28-word sector out of the cache.
    pub fn sector(&self, addr: MfdAddress) -> Option<[Word36; WORDS_PER_SECTOR]> {
        let track = self.tracks.get(&addr.track_aligned().value())?;
        let start = addr.sector() as usize * WORDS_PER_SECTOR;
        let mut sector = [Word36::default(); WORDS_PER_SECTOR];
        sector.copy_from_slice(&track[start..start + WORDS_PER_SECTOR]);
        Some(sector)
    }

    /// Replaces one sector. The caller is responsible for marking the
    /// containing block dirty.
    pub fn put_sector(&mut self, addr: MfdAddress, sector: &[Word36; WORDS_PER_SECTOR]) -> bool {
        match self.tracks.get_mut(&addr.track_aligned().value()) {
            Some(track) => {
                let start = addr.sector() as usize * WORDS_PER_SECTOR;
                track[start..start + WORDS_PER_SECTOR].copy_from_slice(sector);
                true
            }
            None => false,
        }
    }

    /// The block-sized slice containing `addr`, for write-back.
    pub fn block(&self, addr: MfdAddress, block_mask: u64) -> Option<&[Word36]> {
        let track = self.tracks.get(&addr.track_aligned().value())?;
        let base_sector = (addr.sector() & !block_mask) as usize;
        let start = base_sector * WORDS_PER_SECTOR;
        let len = (block_mask as usize + 1) * WORDS_PER_SECTOR;
        Some(&track[start..start + len])
    }

    pub fn mark_dirty(&mut self, block_addr: MfdAddress) {
        self.dirty_blocks.insert(block_addr.value());
    }

    pub fn dirty_blocks(&self) -> Vec<MfdAddress> {
        self.dirty_blocks
            .iter()
            .map(|&v| MfdAddress::from_link(v))
            .collect()
    }

    pub fn clear_dirty(&mut self) {
        self.dirty_blocks.clear();
    }

    pub fn has_dirty_blocks(&self) -> bool {
        !self.dirty_blocks.is_empty()
    }

    /// Track ids currently cached for one pack, ascending.
    pub fn tracks_for_ldat(&self, ldat: LdatIndex) -> Vec<TrackId> {
        let mut ids: Vec<TrackId> = self
            .tracks
            .keys()
            .map(|&v| MfdAddress::from_link(v))
            .filter(|a| a.ldat() == ldat)
            .map(|a| a.track())
            .collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track_of(value: u64) -> Vec<Word36> {
        vec![Word36::new(value); WORDS_PER_TRACK]
    }

    #[test]
    fn sectors_are_28_word_views_of_their_track() {
        let mut cache = DirectorySectorCache::new();
        let base = MfdAddress::compose(1, 5, 0);
        cache.insert_track(base, track_of(0o42));

        let addr = MfdAddress::compose(1, 5, 0o17);
        let sector = cache.sector(addr).unwrap();
        assert!(sector.iter().all(|w| w.w() == 0o42));

        let mut replacement = sector;
        replacement[0].set_w(0o777);
        assert!(cache.put_sector(addr, &replacement));
        assert_eq!(cache.sector(addr).unwrap()[0].w(), 0o777);
        // neighboring sector untouched
        assert_eq!(
            cache.sector(MfdAddress::compose(1, 5, 0o16)).unwrap()[0].w(),
            0o42
        );
    }

    #[test]
    fn blocks_group_sectors_by_mask() {
        let mut cache = DirectorySectorCache::new();
        let base = MfdAddress::compose(2, 0, 0);
        cache.insert_track(base, track_of(0));

        // prep factor 112: 4 sectors per block
        let block = cache.block(MfdAddress::compose(2, 0, 6), 0o3).unwrap();
        assert_eq!(block.len(), 4 * WORDS_PER_SECTOR);
    }

    #[test]
    fn dirty_set_tracks_blocks_not_sectors() {
        let mut cache = DirectorySectorCache::new();
        let block = MfdAddress::compose(1, 0, 0o20);
        cache.mark_dirty(block);
        cache.mark_dirty(block);
        assert_eq!(cache.dirty_blocks().len(), 1);
        cache.clear_dirty();
        assert!(!cache.has_dirty_blocks());
    }

    #[test]
    fn missing_track_yields_none() {
        let cache = DirectorySectorCache::new();
        assert!(cache.sector(MfdAddress::compose(1, 0, 0)).is_none());
        assert!(!cache.contains_track(MfdAddress::compose(1, 0, 0)));
    }

    #[test]
    fn ldat_track_listing_is_sorted() {
        let mut cache = DirectorySectorCache::new();
        cache.insert_track(MfdAddress::compose(1, 9, 0), track_of(0));
        cache.insert_track(MfdAddress::compose(1, 0, 0), track_of(0));
        cache.insert_track(MfdAddress::compose(2, 4, 0), track_of(0));
        assert_eq!(cache.tracks_for_ldat(1), vec![0, 9]);
        assert_eq!(cache.tracks_for_ldat(2), vec![4]);
    }
}
