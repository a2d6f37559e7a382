// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end scenarios over file-backed pack images: boot, catalog,
//! allocation, persistence across a recovery boot, and cycle management.

use std::sync::Arc;

use crate::catalog::{CatalogFileRequest, FileCycleInfo};
use crate::config::ExecConfig;
use crate::device::{DiskChannel, FileSystemDiskDevice};
use crate::exec::AutoConsole;
use crate::facstatus::{FacResult, FacStatusCode};
use crate::fspec::{self, FileCycleSpecification};
use crate::mfd::{MfdError, MfdManager};
use crate::pack;
use crate::testutil::scratch_path;
use crate::types::{FileType, LdatIndex, TrackRegion};

const POOL: &[(&str, u32, u64)] = &[
    ("FIX000", 1792, 10000),
    ("FIX001", 896, 12000),
    ("FIX002", 448, 15000),
];

fn build_pool(packs: &[(&str, u32, u64)]) -> Arc<DiskChannel> {
    let channel = Arc::new(DiskChannel::new());
    for (name, prep_factor, track_count) in packs {
        let path = scratch_path(name);
        let mut device = FileSystemDiskDevice::open(&path).unwrap();
        pack::prep_pack(&mut device, name, *prep_factor, *track_count, false).unwrap();
        channel.attach(device);
    }
    channel
}

fn manager_over(channel: &Arc<DiskChannel>) -> MfdManager {
    MfdManager::new(
        ExecConfig::default(),
        Arc::new(AutoConsole::quiet("Y")),
        channel.clone(),
    )
}

fn booted_pool() -> (Arc<DiskChannel>, MfdManager) {
    let channel = build_pool(POOL);
    let manager = manager_over(&channel);
    manager.initialize_mass_storage().unwrap();
    (channel, manager)
}

fn used_tracks(manager: &MfdManager, ldat: LdatIndex) -> u64 {
    manager.pack_capacity(ldat).unwrap() - manager.pack_free_track_count(ldat).unwrap()
}

#[test]
fn bootstrap_claims_packs_and_catalogs_the_mfd() {
    let (_channel, manager) = booted_pool();

    assert_eq!(manager.pack_ldats(), vec![1, 2, 3]);
    assert_eq!(manager.pack_name_of(1).as_deref(), Some("FIX000"));
    assert_eq!(manager.pack_name_of(3).as_deref(), Some("FIX002"));

    let (_, info) = manager
        .get_fileset_info("SYS$", "MFD$$")
        .unwrap()
        .expect("the MFD file must be self-cataloged");
    assert_eq!(info.cycle_count, 1);
    assert!(info.is_guarded);

    // one single-track extent per pack, at the composed file-relative track
    let main0 = info.cycle_info[0].unwrap().main_item0_address;
    for ldat in [1u32, 2, 3] {
        let resolved = manager
            .resolve_file_relative(main0, u64::from(ldat) << 12)
            .unwrap();
        assert_eq!(resolved, Some((ldat, 1)));
    }

    // label track plus initial directory track are the only tracks in use
    for ldat in [1u32, 2, 3] {
        assert_eq!(used_tracks(&manager, ldat), 2);
        assert_eq!(manager.directory_track_count(ldat), Some(1));
    }

    manager.verify_directory_structure().unwrap();
}

#[test]
fn boot_declined_by_operator_stops_the_exec() {
    let channel = build_pool(&[("FIX000", 448, 10000)]);
    let console = Arc::new(AutoConsole::quiet("N"));
    let manager = MfdManager::new(ExecConfig::default(), console, channel);
    let result = manager.initialize_mass_storage();
    assert!(matches!(result, Err(MfdError::Stopped(_))));
}

#[test]
fn duplicate_pack_names_cancel_the_boot() {
    let channel = build_pool(&[("FIX000", 448, 10000), ("FIX000", 448, 10000)]);
    let manager = manager_over(&channel);
    assert!(matches!(
        manager.initialize_mass_storage(),
        Err(MfdError::Stopped(_))
    ));
}

#[test]
fn catalog_establishes_main_item_fields() {
    let (_channel, manager) = booted_pool();

    let mut request = CatalogFileRequest::new("TEST", "FILE");
    request.initial_granules = 1;
    request.max_granules = 10;
    let mut fr = FacResult::new();
    let main0 = manager.catalog_file(&request, &mut fr).unwrap();
    assert!(!fr.has_error());
    assert!(fr.has_code(FacStatusCode::Complete));

    let (addr, cycle) = manager.get_file_cycle_info("TEST", "FILE", 1).unwrap();
    assert_eq!(addr, main0);
    match cycle {
        FileCycleInfo::Fixed {
            header,
            initial_granules,
            max_granules,
            ..
        } => {
            assert_eq!(header.absolute_cycle, 1);
            assert_eq!(header.qualifier, "TEST");
            assert_eq!(header.assign_mnemonic, "F");
            assert_eq!(initial_granules, 1);
            assert_eq!(max_granules, 10);
        }
        other => panic!("expected a fixed cycle, got {:?}", other),
    }

    // a fresh cycle owns no tracks
    assert_eq!(manager.resolve_file_relative(main0, 0).unwrap(), None);
    for ldat in [1u32, 2, 3] {
        assert_eq!(used_tracks(&manager, ldat), 2);
    }
    manager.verify_directory_structure().unwrap();
}

#[test]
fn cataloging_the_same_cycle_twice_fails() {
    let (_channel, manager) = booted_pool();

    let request = CatalogFileRequest::new("TEST", "DOUBLE");
    let mut fr = FacResult::new();
    manager.catalog_file(&request, &mut fr).unwrap();

    let mut fr = FacResult::new();
    let result = manager.catalog_file(&request, &mut fr);
    assert_eq!(result, Err(MfdError::AlreadyExists));
    assert!(fr.has_code(FacStatusCode::FileIsAlreadyCataloged));
    assert!(fr.has_error());
    assert_ne!(fr.status_word(), 0);
}

#[test]
fn catalog_validates_names_mnemonics_and_options() {
    let (_channel, manager) = booted_pool();

    let mut fr = FacResult::new();
    let request = CatalogFileRequest::new("bad name", "FILE");
    assert_eq!(
        manager.catalog_file(&request, &mut fr),
        Err(MfdError::SyntaxError)
    );

    let mut request = CatalogFileRequest::new("TEST", "FILE");
    request.mnemonic = "NOPE".to_string();
    let mut fr = FacResult::new();
    assert_eq!(
        manager.catalog_file(&request, &mut fr),
        Err(MfdError::MnemonicNotConfigured)
    );
    assert!(fr.has_code(FacStatusCode::MnemonicIsNotConfigured));

    // B is not legal on the tape mnemonic
    let mut request = CatalogFileRequest::new("TEST", "FILE");
    request.mnemonic = "T".to_string();
    request.file_type = FileType::Tape;
    request.options = fspec::OPT_B;
    let mut fr = FacResult::new();
    assert_eq!(
        manager.catalog_file(&request, &mut fr),
        Err(MfdError::IllegalOption)
    );
    assert!(fr.has_code(FacStatusCode::IllegalOption));
}

#[test]
fn allocation_survives_a_recovery_boot() {
    let (channel, manager) = booted_pool();

    let mut request = CatalogFileRequest::new("TEST", "FILE");
    request.initial_granules = 1;
    request.max_granules = 100;
    let mut fr = FacResult::new();
    let main0 = manager.catalog_file(&request, &mut fr).unwrap();

    manager.assign_file_cycle(main0).unwrap();
    for track in 0..5 {
        manager.allocate_track_to_file(main0, None, track).unwrap();
    }
    let before = manager.resolve_file_relative(main0, 3).unwrap().unwrap();
    manager.release_file_cycle(main0).unwrap();
    let live_usage: Vec<u64> = [1u32, 2, 3]
        .iter()
        .map(|&ldat| used_tracks(&manager, ldat))
        .collect();
    drop(manager);

    // a second exec over the same packs rebuilds everything from disk
    let recovered = manager_over(&channel);
    recovered.recover_mass_storage().unwrap();
    recovered.verify_directory_structure().unwrap();

    let (_, info) = recovered
        .get_fileset_info("TEST", "FILE")
        .unwrap()
        .expect("catalog must survive recovery");
    let main0_again = info.cycle_info[0].unwrap().main_item0_address;
    let after = recovered
        .resolve_file_relative(main0_again, 3)
        .unwrap()
        .unwrap();
    assert_eq!(after, before);

    // free space accounting matches the live session exactly
    let rebuilt_usage: Vec<u64> = [1u32, 2, 3]
        .iter()
        .map(|&ldat| used_tracks(&recovered, ldat))
        .collect();
    assert_eq!(rebuilt_usage, live_usage);
}

#[test]
fn rollover_drops_the_oldest_cycle() {
    let (_channel, manager) = booted_pool();

    for cycle in [10u32, 11, 30, 31] {
        let mut request = CatalogFileRequest::new("TEST", "CYCLES");
        request.file_cycle = Some(FileCycleSpecification::Absolute(cycle));
        let mut fr = FacResult::new();
        manager.catalog_file(&request, &mut fr).unwrap();
    }

    let (_, info) = manager.get_fileset_info("TEST", "CYCLES").unwrap().unwrap();
    assert_eq!(info.cycle_count, 4);
    assert_eq!(info.highest_absolute, 31);
    assert_eq!(info.current_range, 22);

    // 41 pushes the range one past the maximum: the oldest cycle gives way
    let mut request = CatalogFileRequest::new("TEST", "CYCLES");
    request.file_cycle = Some(FileCycleSpecification::Absolute(41));
    let mut fr = FacResult::new();
    manager.catalog_file(&request, &mut fr).unwrap();

    let (_, info) = manager.get_fileset_info("TEST", "CYCLES").unwrap().unwrap();
    assert_eq!(info.cycle_count, 4);
    assert_eq!(info.highest_absolute, 41);
    assert_eq!(info.current_range, 31);
    assert_eq!(info.lowest_existing_absolute(), Some(11));
    let cycles: Vec<u32> = info
        .cycle_info
        .iter()
        .flatten()
        .map(|c| c.absolute_cycle)
        .collect();
    assert_eq!(cycles, vec![41, 31, 30, 11]);
    manager.verify_directory_structure().unwrap();
}

#[test]
fn out_of_range_cycle_leaves_the_set_untouched() {
    let (_channel, manager) = booted_pool();

    for cycle in [10u32, 11, 30, 31] {
        let mut request = CatalogFileRequest::new("TEST", "CYCLES");
        request.file_cycle = Some(FileCycleSpecification::Absolute(cycle));
        let mut fr = FacResult::new();
        manager.catalog_file(&request, &mut fr).unwrap();
    }

    // 41 would be the drop-oldest boundary; 42 is flatly out of range,
    // and so is anything more than a full range below the highest cycle
    for cycle in [42u32, 990] {
        let mut request = CatalogFileRequest::new("TEST", "CYCLES");
        request.file_cycle = Some(FileCycleSpecification::Absolute(cycle));
        let mut fr = FacResult::new();
        assert_eq!(
            manager.catalog_file(&request, &mut fr),
            Err(MfdError::CycleOutOfRange)
        );
        assert!(fr.has_code(FacStatusCode::FileCycleOutOfRange));
    }

    let (_, info) = manager.get_fileset_info("TEST", "CYCLES").unwrap().unwrap();
    assert_eq!(info.cycle_count, 4);
    assert_eq!(info.highest_absolute, 31);
    assert_eq!(info.current_range, 22);
}

#[test]
fn drop_returns_space_and_sectors() {
    let (_channel, manager) = booted_pool();

    let mut request = CatalogFileRequest::new("TEST", "FILE");
    request.max_granules = 100;
    let mut fr = FacResult::new();
    let main0 = manager.catalog_file(&request, &mut fr).unwrap();

    manager.assign_file_cycle(main0).unwrap();
    for track in 0..5 {
        manager.allocate_track_to_file(main0, None, track).unwrap();
    }
    let (home_ldat, _) = manager.resolve_file_relative(main0, 0).unwrap().unwrap();
    assert_eq!(used_tracks(&manager, home_ldat), 2 + 5);
    manager.release_file_cycle(main0).unwrap();

    let free_sectors_before_drop = manager.free_sector_count();
    let mut fr = FacResult::new();
    manager.drop_file_cycle("TEST", "FILE", 1, &mut fr).unwrap();

    assert!(manager.get_fileset_info("TEST", "FILE").unwrap().is_none());
    assert_eq!(used_tracks(&manager, home_ldat), 2);
    // lead 0, main 0, main 1, and one DAD sector came back
    assert_eq!(manager.free_sector_count(), free_sectors_before_drop + 4);
    manager.verify_directory_structure().unwrap();
}

#[test]
fn dropping_an_assigned_cycle_is_deferred() {
    let (_channel, manager) = booted_pool();

    let request = CatalogFileRequest::new("TEST", "BUSY");
    let mut fr = FacResult::new();
    let main0 = manager.catalog_file(&request, &mut fr).unwrap();
    manager.assign_file_cycle(main0).unwrap();

    let mut fr = FacResult::new();
    manager.drop_file_cycle("TEST", "BUSY", 1, &mut fr).unwrap();
    // still cataloged while assigned
    assert!(manager.get_fileset_info("TEST", "BUSY").unwrap().is_some());

    manager.release_file_cycle(main0).unwrap();
    assert!(manager.get_fileset_info("TEST", "BUSY").unwrap().is_none());
    manager.verify_directory_structure().unwrap();
}

#[test]
fn plus_one_cycles_are_exclusive_until_released() {
    let (_channel, manager) = booted_pool();

    let mut request = CatalogFileRequest::new("TEST", "PLUS");
    request.file_cycle = Some(FileCycleSpecification::Relative(1));
    let mut fr = FacResult::new();
    let main0 = manager.catalog_file(&request, &mut fr).unwrap();

    let mut fr = FacResult::new();
    assert_eq!(
        manager.catalog_file(&request, &mut fr),
        Err(MfdError::PlusOneCycleExists)
    );
    assert!(fr.has_code(FacStatusCode::PlusOneCycleExists));

    // once the +1 is released it becomes an ordinary cycle
    manager.assign_file_cycle(main0).unwrap();
    manager.release_file_cycle(main0).unwrap();
    let mut fr = FacResult::new();
    manager.catalog_file(&request, &mut fr).unwrap();

    let (_, info) = manager.get_fileset_info("TEST", "PLUS").unwrap().unwrap();
    assert_eq!(info.cycle_count, 2);
    assert_eq!(info.highest_absolute, 2);
}

#[test]
fn write_keys_guard_new_cycles() {
    let (_channel, manager) = booted_pool();

    let mut request = CatalogFileRequest::new("TEST", "LOCKED");
    request.write_key = Some("SECRET".to_string());
    request.file_cycle = Some(FileCycleSpecification::Absolute(1));
    let mut fr = FacResult::new();
    manager.catalog_file(&request, &mut fr).unwrap();

    let mut next = CatalogFileRequest::new("TEST", "LOCKED");
    next.file_cycle = Some(FileCycleSpecification::Absolute(2));
    let mut fr = FacResult::new();
    assert_eq!(
        manager.catalog_file(&next, &mut fr),
        Err(MfdError::KeyMismatch)
    );
    assert!(fr.has_code(FacStatusCode::ReadWriteKeysNeeded));

    next.write_key = Some("WRONG".to_string());
    let mut fr = FacResult::new();
    assert_eq!(
        manager.catalog_file(&next, &mut fr),
        Err(MfdError::KeyMismatch)
    );
    assert!(fr.has_code(FacStatusCode::IncorrectWriteKey));

    next.write_key = Some("SECRET".to_string());
    let mut fr = FacResult::new();
    manager.catalog_file(&next, &mut fr).unwrap();
}

#[test]
fn removable_catalog_requires_mounted_packs() {
    let (_channel, manager) = booted_pool();

    let mut request = CatalogFileRequest::new("TEST", "REMOV");
    request.file_type = FileType::Removable;
    request.pack_ids = vec!["NOPACK".to_string()];
    let mut fr = FacResult::new();
    assert_eq!(
        manager.catalog_file(&request, &mut fr),
        Err(MfdError::PackNotMounted)
    );
    assert!(fr.has_code(FacStatusCode::RunHeldForDiskPackMount));

    request.options = fspec::OPT_Z;
    let mut fr = FacResult::new();
    assert_eq!(
        manager.catalog_file(&request, &mut fr),
        Err(MfdError::HoldRejected)
    );
    assert!(fr.has_code(FacStatusCode::HoldForPackRejected));
}

#[test]
fn tape_catalog_spills_reels_into_overflow_sectors() {
    let (_channel, manager) = booted_pool();

    let mut request = CatalogFileRequest::new("TEST", "TAPE");
    request.file_type = FileType::Tape;
    request.mnemonic = "T".to_string();
    request.reel_numbers = (0..25).map(|rx| format!("R{:05}", rx)).collect();
    let mut fr = FacResult::new();
    manager.catalog_file(&request, &mut fr).unwrap();

    let (_, cycle) = manager.get_file_cycle_info("TEST", "TAPE", 1).unwrap();
    match cycle {
        FileCycleInfo::Tape {
            header,
            reel_numbers,
        } => {
            assert_eq!(header.filename, "TAPE");
            assert!(header.descriptor_flags.is_tape_file);
            assert_eq!(reel_numbers.len(), 25);
            assert_eq!(reel_numbers[0], "R00000");
            assert_eq!(reel_numbers[24], "R00024");
        }
        other => panic!("expected a tape cycle, got {:?}", other),
    }
    manager.verify_directory_structure().unwrap();
}

#[test]
fn released_track_regions_return_to_their_pack() {
    let (_channel, manager) = booted_pool();

    let mut request = CatalogFileRequest::new("TEST", "SHRINK");
    request.max_granules = 100;
    let mut fr = FacResult::new();
    let main0 = manager.catalog_file(&request, &mut fr).unwrap();

    manager.assign_file_cycle(main0).unwrap();
    for track in 0..4 {
        manager.allocate_track_to_file(main0, None, track).unwrap();
    }
    let (ldat, _) = manager.resolve_file_relative(main0, 1).unwrap().unwrap();
    assert_eq!(used_tracks(&manager, ldat), 2 + 4);

    manager
        .release_file_track_region(main0, TrackRegion::new(1, 2))
        .unwrap();
    assert_eq!(used_tracks(&manager, ldat), 2 + 2);
    assert_eq!(manager.resolve_file_relative(main0, 1).unwrap(), None);
    assert!(manager.resolve_file_relative(main0, 0).unwrap().is_some());
    assert!(manager.resolve_file_relative(main0, 3).unwrap().is_some());

    manager.release_file_cycle(main0).unwrap();
}

#[test]
fn fileset_rename_updates_every_item() {
    let (_channel, manager) = booted_pool();

    let request = CatalogFileRequest::new("TEST", "OLD");
    let mut fr = FacResult::new();
    manager.catalog_file(&request, &mut fr).unwrap();

    let mut fr = FacResult::new();
    manager
        .change_fileset_name("TEST", "OLD", "TEST", "NEW", &mut fr)
        .unwrap();

    assert!(manager.get_fileset_info("TEST", "OLD").unwrap().is_none());
    let (_, cycle) = manager.get_file_cycle_info("TEST", "NEW", 1).unwrap();
    assert_eq!(cycle.header().filename, "NEW");
}

#[test]
fn cycle_range_can_widen_but_not_narrow() {
    let (_channel, manager) = booted_pool();

    let request = CatalogFileRequest::new("TEST", "RANGE");
    let mut fr = FacResult::new();
    manager.catalog_file(&request, &mut fr).unwrap();

    let mut fr = FacResult::new();
    manager
        .set_file_cycle_range("TEST", "RANGE", 32, &mut fr)
        .unwrap();
    let (_, info) = manager.get_fileset_info("TEST", "RANGE").unwrap().unwrap();
    assert_eq!(info.max_cycle_range, 32);

    let mut fr = FacResult::new();
    assert_eq!(
        manager.set_file_cycle_range("TEST", "RANGE", 16, &mut fr),
        Err(MfdError::CycleOutOfRange)
    );
}

#[test]
fn directory_growth_allocates_new_tracks() {
    let (_channel, manager) = booted_pool();

    // three packs seed 3 * 62 free sectors; each catalog takes at least
    // three, so a few hundred filesets force several new directory tracks
    for fx in 0..80 {
        let request = CatalogFileRequest::new("GROW", &format!("F{:04}", fx));
        let mut fr = FacResult::new();
        manager.catalog_file(&request, &mut fr).unwrap();
    }

    let total_dir_tracks: u64 = [1u32, 2, 3]
        .iter()
        .map(|&ldat| manager.directory_track_count(ldat).unwrap())
        .sum();
    assert!(total_dir_tracks > 3, "directory should have grown");
    manager.verify_directory_structure().unwrap();

    // every fileset remains reachable
    for fx in 0..80 {
        let name = format!("F{:04}", fx);
        assert!(manager.get_fileset_info("GROW", &name).unwrap().is_some());
    }
}

#[test]
fn grown_directory_survives_recovery() {
    let (channel, manager) = booted_pool();

    for fx in 0..80 {
        let request = CatalogFileRequest::new("GROW", &format!("F{:04}", fx));
        let mut fr = FacResult::new();
        manager.catalog_file(&request, &mut fr).unwrap();
    }
    manager.flush().unwrap();
    drop(manager);

    let recovered = manager_over(&channel);
    recovered.recover_mass_storage().unwrap();
    recovered.verify_directory_structure().unwrap();
    for fx in 0..80 {
        let name = format!("F{:04}", fx);
        assert!(recovered.get_fileset_info("GROW", &name).unwrap().is_some());
    }
}

#[test]
fn dump_lists_the_pool() {
    let (_channel, manager) = booted_pool();
    let mut out = Vec::new();
    manager.dump(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("Fixed Packs"));
    assert!(text.contains("FIX000"));
    assert!(text.contains("SYS$*MFD$$"));
}
