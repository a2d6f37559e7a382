// SPDX-License-Identifier: MIT OR Apache-2.0

use log::warn;

use crate::types::{TrackCount, TrackId, TrackRegion};

/// Free-track accounting for one pack. The table is the only record of
/// unallocated space; there is no on-disk bit table.
///
/// Invariants: regions are strictly ascending by track id, never overlap,
/// and abutting regions are always merged.
#[derive(Clone, Debug)]
pub struct PackFreeSpaceTable {
    capacity: TrackCount,
    content: Vec<TrackRegion>,
}

impl PackFreeSpaceTable {
    pub fn new(capacity: TrackCount) -> Self {
        PackFreeSpaceTable {
            capacity,
            content: vec![TrackRegion::new(0, capacity)],
        }
    }

    pub fn capacity(&self) -> TrackCount {
        self.capacity
    }

    pub fn regions(&self) -> &[TrackRegion] {
        &self.content
    }

    pub fn free_track_count(&self) -> TrackCount {
        self.content.iter().map(|r| r.track_count).sum()
    }

    /// Allocates a single track, preferring an exact one-track region so that
    /// larger runs stay intact for file extents.
    pub fn allocate_track(&mut self) -> Option<TrackId> {
        if let Some(rx) = self.content.iter().position(|r| r.track_count == 1) {
            let track_id = self.content[rx].track_id;
            self.content.remove(rx);
            return Some(track_id);
        }

        let region = self.content.first_mut()?;
        let track_id = region.track_id;
        region.track_id += 1;
        region.track_count -= 1;
        if region.track_count == 0 {
            self.content.remove(0);
        }
        Some(track_id)
    }

    /// Removes a specific region from the table. The region must be wholly
    /// contained in a single free entry; anything else is a double allocation
    /// and is refused.
    pub fn allocate_specific_region(&mut self, track_id: TrackId, track_count: TrackCount) -> bool {
        if track_count == 0 {
            warn!(
                "free space: zero-length allocation requested at track {}",
                track_id
            );
            return false;
        }

        let requested_limit = track_id + track_count;
        for rx in 0..self.content.len() {
            let region = self.content[rx];
            if track_id < region.track_id {
                break;
            }
            if track_id >= region.limit() {
                continue;
            }
            if requested_limit > region.limit() {
                warn!(
                    "free space: region {}+{} exceeds free entry {}+{}",
                    track_id, track_count, region.track_id, region.track_count
                );
                return false;
            }

            if region.track_id == track_id && region.track_count == track_count {
                self.content.remove(rx);
            } else if region.track_id == track_id {
                let entry = &mut self.content[rx];
                entry.track_id += track_count;
                entry.track_count -= track_count;
            } else if region.limit() == requested_limit {
                self.content[rx].track_count -= track_count;
            } else {
                let tail = TrackRegion::new(requested_limit, region.limit() - requested_limit);
                self.content[rx].track_count = track_id - region.track_id;
                self.content.insert(rx + 1, tail);
            }
            return true;
        }

        warn!(
            "free space: region {}+{} is not free",
            track_id, track_count
        );
        false
    }

    /// Returns a region to the table, merging with abutting neighbors.
    /// Overlap with existing free space is a double free and is refused.
    pub fn release_region(&mut self, track_id: TrackId, track_count: TrackCount) -> bool {
        if track_count == 0 {
            return true;
        }

        let released_limit = track_id + track_count;
        let pos = self
            .content
            .iter()
            .position(|r| r.track_id > track_id)
            .unwrap_or(self.content.len());

        if pos > 0 && self.content[pos - 1].limit() > track_id {
            warn!(
                "free space: release of {}+{} overlaps free entry",
                track_id, track_count
            );
            return false;
        }
        if pos < self.content.len() && released_limit > self.content[pos].track_id {
            warn!(
                "free space: release of {}+{} overlaps free entry",
                track_id, track_count
            );
            return false;
        }

        let merges_back = pos > 0 && self.content[pos - 1].limit() == track_id;
        let merges_forward =
            pos < self.content.len() && released_limit == self.content[pos].track_id;

        match (merges_back, merges_forward) {
            (true, true) => {
                let next_count = self.content[pos].track_count;
                self.content[pos - 1].track_count += track_count + next_count;
                self.content.remove(pos);
            }
            (true, false) => {
                self.content[pos - 1].track_count += track_count;
            }
            (false, true) => {
                let entry = &mut self.content[pos];
                entry.track_id = track_id;
                entry.track_count += track_count;
            }
            (false, false) => {
                self.content
                    .insert(pos, TrackRegion::new(track_id, track_count));
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_table_is_one_region() {
        let table = PackFreeSpaceTable::new(10000);
        assert_eq!(table.free_track_count(), 10000);
        assert_eq!(table.regions().len(), 1);
    }

    #[test]
    fn single_track_regions_are_preferred() {
        let mut table = PackFreeSpaceTable::new(100);
        assert!(table.allocate_specific_region(1, 99));
        assert!(table.release_region(50, 1));
        // region layout is now {0,1} {50,1}
        assert_eq!(table.allocate_track(), Some(0));
        assert_eq!(table.allocate_track(), Some(50));
        assert_eq!(table.allocate_track(), None);
    }

    #[test]
    fn specific_allocation_splits_interior_region() {
        let mut table = PackFreeSpaceTable::new(100);
        assert!(table.allocate_specific_region(40, 20));
        assert_eq!(table.regions(), &[
            TrackRegion::new(0, 40),
            TrackRegion::new(60, 40),
        ]);
        assert_eq!(table.free_track_count(), 80);
    }

    #[test]
    fn specific_allocation_refuses_spanning_request() {
        let mut table = PackFreeSpaceTable::new(100);
        assert!(table.allocate_specific_region(40, 20));
        assert!(!table.allocate_specific_region(30, 20));
        assert!(!table.allocate_specific_region(45, 5));
        assert_eq!(table.free_track_count(), 80);
    }

    #[test]
    fn release_merges_abutting_neighbors() {
        let mut table = PackFreeSpaceTable::new(100);
        assert!(table.allocate_specific_region(40, 20));
        assert!(table.release_region(40, 20));
        assert_eq!(table.regions(), &[TrackRegion::new(0, 100)]);
    }

    #[test]
    fn release_rejects_double_free() {
        let mut table = PackFreeSpaceTable::new(100);
        assert!(!table.release_region(10, 5));
        assert!(table.allocate_specific_region(10, 5));
        assert!(table.release_region(10, 5));
        assert!(!table.release_region(10, 5));
    }

    #[test]
    fn allocate_on_empty_table_returns_none() {
        let mut table = PackFreeSpaceTable::new(2);
        assert!(table.allocate_specific_region(0, 2));
        assert_eq!(table.allocate_track(), None);
        assert!(!table.allocate_specific_region(0, 1));
    }
}
