// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::types::{LdatIndex, MfdAddress, TrackCount, TrackId, TrackRegion};

/// One run of file-relative tracks mapped onto contiguous device tracks
/// of a single pack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileAllocation {
    pub file_region: TrackRegion,
    pub ldat: LdatIndex,
    pub device_track_id: TrackId,
}

impl FileAllocation {
    pub fn new(
        file_track_id: TrackId,
        track_count: TrackCount,
        ldat: LdatIndex,
        device_track_id: TrackId,
    ) -> Self {
        FileAllocation {
            file_region: TrackRegion::new(file_track_id, track_count),
            ldat,
            device_track_id,
        }
    }

    fn device_limit(&self) -> TrackId {
        self.device_track_id + self.file_region.track_count
    }
}

/// The in-memory allocation map of one file cycle, held while the cycle is
/// assigned. The persisted form is the DAD chain hanging off main item 0.
#[derive(Clone, Debug)]
pub struct FileAllocationSet {
    pub main_item0_address: MfdAddress,
    pub dad_item0_address: MfdAddress,
    pub is_updated: bool,
    allocations: Vec<FileAllocation>,
}

impl FileAllocationSet {
    pub fn new(main_item0_address: MfdAddress, dad_item0_address: MfdAddress) -> Self {
        FileAllocationSet {
            main_item0_address,
            dad_item0_address,
            is_updated: false,
            allocations: Vec::new(),
        }
    }

    pub fn allocations(&self) -> &[FileAllocation] {
        &self.allocations
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    pub fn highest_track_allocated(&self) -> TrackId {
        self.allocations
            .last()
            .map(|fa| fa.file_region.limit() - 1)
            .unwrap_or(0)
    }

    /// Inserts a new allocation at its position in file-track order,
    /// coalescing with a neighbor when both the file regions and the device
    /// tracks are contiguous on the same pack. The caller must ensure the new
    /// entry overlaps nothing.
    pub fn merge(&mut self, new_entry: FileAllocation) {
        self.is_updated = true;

        let pos = self
            .allocations
            .iter()
            .position(|fa| fa.file_region.track_id > new_entry.file_region.track_id)
            .unwrap_or(self.allocations.len());

        let joins_previous = pos > 0 && {
            let prev = &self.allocations[pos - 1];
            prev.ldat == new_entry.ldat
                && prev.file_region.limit() == new_entry.file_region.track_id
                && prev.device_limit() == new_entry.device_track_id
        };
        let joins_next = pos < self.allocations.len() && {
            let next = &self.allocations[pos];
            next.ldat == new_entry.ldat
                && new_entry.file_region.limit() == next.file_region.track_id
                && new_entry.device_limit() == next.device_track_id
        };

        match (joins_previous, joins_next) {
            (true, true) => {
                let next_count = self.allocations[pos].file_region.track_count;
                self.allocations[pos - 1].file_region.track_count +=
                    new_entry.file_region.track_count + next_count;
                self.allocations.remove(pos);
            }
            (true, false) => {
                self.allocations[pos - 1].file_region.track_count +=
                    new_entry.file_region.track_count;
            }
            (false, true) => {
                let next = &mut self.allocations[pos];
                next.file_region.track_id = new_entry.file_region.track_id;
                next.file_region.track_count += new_entry.file_region.track_count;
                next.device_track_id = new_entry.device_track_id;
            }
            (false, false) => {
                self.allocations.insert(pos, new_entry);
            }
        }
    }

    /// Removes a file-relative region and reports where it lived.
    /// The region must be a subset of exactly one entry; four shapes are
    /// supported: exact match, front-aligned, back-aligned, and interior
    /// (which splits the entry).
    pub fn extract(&mut self, region: TrackRegion) -> Option<(LdatIndex, TrackId)> {
        let rx = self.allocations.iter().position(|fa| {
            region.track_id >= fa.file_region.track_id && region.limit() <= fa.file_region.limit()
        })?;

        let entry = self.allocations[rx];
        let ldat = entry.ldat;
        let device_track_id =
            entry.device_track_id + (region.track_id - entry.file_region.track_id);

        if entry.file_region == region {
            self.allocations.remove(rx);
        } else if entry.file_region.track_id == region.track_id {
            let fa = &mut self.allocations[rx];
            fa.file_region.track_id += region.track_count;
            fa.file_region.track_count -= region.track_count;
            fa.device_track_id += region.track_count;
        } else if entry.file_region.limit() == region.limit() {
            self.allocations[rx].file_region.track_count -= region.track_count;
        } else {
            let tail_track_id = region.limit();
            let tail = FileAllocation::new(
                tail_track_id,
                entry.file_region.limit() - tail_track_id,
                entry.ldat,
                entry.device_track_id + (tail_track_id - entry.file_region.track_id),
            );
            self.allocations[rx].file_region.track_count =
                region.track_id - entry.file_region.track_id;
            self.allocations.insert(rx + 1, tail);
        }

        self.is_updated = true;
        Some((ldat, device_track_id))
    }

    /// The entry containing `file_track`, or the nearest entry before it.
    pub fn find_preceding(&self, file_track: TrackId) -> Option<&FileAllocation> {
        self.allocations
            .iter()
            .take_while(|fa| fa.file_region.track_id <= file_track)
            .last()
    }

    /// Maps a file-relative track onto its pack and device track,
    /// if it is allocated.
    pub fn resolve(&self, file_track: TrackId) -> Option<(LdatIndex, TrackId)> {
        for fa in &self.allocations {
            if file_track < fa.file_region.track_id {
                break;
            }
            if file_track < fa.file_region.limit() {
                let device_track = fa.device_track_id + (file_track - fa.file_region.track_id);
                return Some((fa.ldat, device_track));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set() -> FileAllocationSet {
        FileAllocationSet::new(MfdAddress::compose(1, 0, 3), MfdAddress::INVALID)
    }

    #[test]
    fn merge_coalesces_contiguous_device_tracks() {
        let mut fas = set();
        fas.merge(FileAllocation::new(0, 1, 1, 100));
        fas.merge(FileAllocation::new(1, 1, 1, 101));
        fas.merge(FileAllocation::new(2, 1, 1, 102));
        assert_eq!(fas.allocations().len(), 1);
        assert_eq!(fas.allocations()[0].file_region, TrackRegion::new(0, 3));
        assert_eq!(fas.highest_track_allocated(), 2);
    }

    #[test]
    fn merge_keeps_discontiguous_device_tracks_apart() {
        let mut fas = set();
        fas.merge(FileAllocation::new(0, 1, 1, 100));
        fas.merge(FileAllocation::new(1, 1, 1, 500));
        fas.merge(FileAllocation::new(2, 1, 2, 501));
        assert_eq!(fas.allocations().len(), 3);
    }

    #[test]
    fn merge_fills_gap_and_joins_both_sides() {
        let mut fas = set();
        fas.merge(FileAllocation::new(0, 2, 1, 100));
        fas.merge(FileAllocation::new(3, 2, 1, 103));
        fas.merge(FileAllocation::new(2, 1, 1, 102));
        assert_eq!(fas.allocations().len(), 1);
        assert_eq!(fas.allocations()[0].file_region, TrackRegion::new(0, 5));
        assert_eq!(fas.allocations()[0].device_track_id, 100);
    }

    #[test]
    fn merge_then_extract_is_identity() {
        let mut fas = set();
        fas.merge(FileAllocation::new(10, 4, 2, 300));
        let before = fas.allocations().to_vec();

        fas.merge(FileAllocation::new(14, 2, 2, 304));
        let (ldat, dev) = fas.extract(TrackRegion::new(14, 2)).unwrap();
        assert_eq!((ldat, dev), (2, 304));
        assert_eq!(fas.allocations(), &before[..]);
    }

    #[test]
    fn extract_interior_splits_entry() {
        let mut fas = set();
        fas.merge(FileAllocation::new(0, 10, 1, 100));
        let (ldat, dev) = fas.extract(TrackRegion::new(4, 2)).unwrap();
        assert_eq!((ldat, dev), (1, 104));
        assert_eq!(fas.allocations(), &[
            FileAllocation::new(0, 4, 1, 100),
            FileAllocation::new(6, 4, 1, 106),
        ]);
    }

    #[test]
    fn extract_of_unallocated_region_fails() {
        let mut fas = set();
        fas.merge(FileAllocation::new(5, 2, 1, 100));
        assert!(fas.extract(TrackRegion::new(0, 1)).is_none());
        assert!(fas.extract(TrackRegion::new(6, 2)).is_none());
    }

    #[test]
    fn resolve_walks_regions_in_order() {
        let mut fas = set();
        fas.merge(FileAllocation::new(0, 2, 1, 100));
        fas.merge(FileAllocation::new(5, 3, 2, 700));
        assert_eq!(fas.resolve(1), Some((1, 101)));
        assert_eq!(fas.resolve(2), None);
        assert_eq!(fas.resolve(7), Some((2, 702)));
        assert_eq!(fas.resolve(8), None);
        assert_eq!(fas.find_preceding(4).unwrap().file_region.track_id, 0);
    }
}
