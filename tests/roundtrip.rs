//! End-to-end lifecycle tests: create, save, reopen, mutate.

use compound_core::{
    CollectSink, CompoundFile, FileDevice, MemDevice, Pool, Version,
};
use std::io::{Read, Seek, SeekFrom, Write};

/// Save a memory-backed container and reopen it from its bytes.
fn save_and_reopen(cfb: CompoundFile<MemDevice>) -> CompoundFile<MemDevice> {
    cfb.save().unwrap();
    let bytes = cfb.into_device().unwrap().into_inner();
    CompoundFile::open_editor(MemDevice::from_vec(bytes)).unwrap()
}

#[test]
fn create_and_read_back_via_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("small.cfb");

    {
        let cfb = CompoundFile::create(FileDevice::create(&path).unwrap()).unwrap();
        let root = cfb.root().unwrap();
        let storage = cfb.create_storage(&root, "S").unwrap();
        let a = cfb.create_stream(&storage, "a", b"hello").unwrap();
        assert_eq!(cfb.stream_pool(&a).unwrap(), Pool::Mini);
        cfb.close().unwrap();
    }

    let cfb = CompoundFile::open_reader(FileDevice::open_read_only(&path).unwrap()).unwrap();
    let entry = cfb.entry("/S/a").unwrap();
    assert!(entry.is_stream());
    assert_eq!(entry.size(), 5);
    assert_eq!(cfb.stream_pool(&entry).unwrap(), Pool::Mini);
    assert_eq!(cfb.read_path("/S/a").unwrap(), b"hello");
}

#[test]
fn reader_mode_rejects_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ro.cfb");
    {
        let cfb = CompoundFile::create(FileDevice::create(&path).unwrap()).unwrap();
        cfb.close().unwrap();
    }

    let cfb = CompoundFile::open_reader(FileDevice::open_read_only(&path).unwrap()).unwrap();
    let root = cfb.root().unwrap();
    assert!(cfb.create_storage(&root, "X").is_err());
    assert!(cfb.save().is_err());
}

#[test]
fn cross_cutoff_stream_uses_normal_pool() {
    // 4096-byte sectors: 5000 bytes is exactly two sectors.
    let cfb =
        CompoundFile::create_with_version(MemDevice::new(), Version::V4).unwrap();
    let root = cfb.root().unwrap();
    let big = cfb.create_stream(&root, "big", &vec![0_u8; 5000]).unwrap();

    assert_eq!(cfb.stream_pool(&big).unwrap(), Pool::Normal);
    let size = cfb.entry("/big").unwrap().size();
    assert!((4096..8192).contains(&size));
    assert_eq!(cfb.stream_sectors(&big).unwrap(), 2);

    let cfb = save_and_reopen(cfb);
    assert_eq!(cfb.read_path("/big").unwrap(), vec![0_u8; 5000]);
}

#[test]
fn deleted_slot_is_reused_by_next_insert() {
    let cfb = CompoundFile::create(MemDevice::new()).unwrap();
    let root = cfb.root().unwrap();
    let storage = cfb.create_storage(&root, "S").unwrap();
    let a = cfb.create_stream(&storage, "a", b"hello").unwrap();
    let a_id = a.dir_id();

    cfb.delete(&a).unwrap();
    assert!(cfb.children(&storage).unwrap().is_empty());

    let b = cfb.create_stream(&storage, "b", b"xyz").unwrap();
    assert_eq!(b.dir_id(), a_id, "freed directory slot is reused");
    assert_eq!(cfb.read_path("/S/b").unwrap(), b"xyz");
}

#[test]
fn rename_across_order() {
    let cfb = CompoundFile::create(MemDevice::new()).unwrap();
    let root = cfb.root().unwrap();
    let storage = cfb.create_storage(&root, "S").unwrap();
    let aa = cfb.create_stream(&storage, "aa", b"1").unwrap();
    cfb.create_stream(&storage, "bb", b"2").unwrap();

    cfb.rename(&aa, "zz").unwrap();
    let names: Vec<String> = cfb
        .children(&storage)
        .unwrap()
        .iter()
        .map(|e| e.name().to_owned())
        .collect();
    assert_eq!(names, vec!["bb", "zz"]);

    // Contents follow the entry through the rename and a round-trip.
    let cfb = save_and_reopen(cfb);
    assert_eq!(cfb.read_path("/S/zz").unwrap(), b"1");
    assert_eq!(cfb.read_path("/S/bb").unwrap(), b"2");
}

#[test]
fn rename_collision_fails_without_mutating() {
    let cfb = CompoundFile::create(MemDevice::new()).unwrap();
    let root = cfb.root().unwrap();
    let aa = cfb.create_stream(&root, "aa", b"1").unwrap();
    cfb.create_stream(&root, "bb", b"2").unwrap();

    assert!(cfb.rename(&aa, "bb").is_err());
    let names: Vec<String> = cfb
        .children(&root)
        .unwrap()
        .iter()
        .map(|e| e.name().to_owned())
        .collect();
    assert_eq!(names, vec!["aa", "bb"]);
}

#[test]
fn migration_up_happens_once_per_crossing_write() {
    let cfb = CompoundFile::create(MemDevice::new()).unwrap();
    let root = cfb.root().unwrap();
    let entry = cfb.create_stream(&root, "s", &vec![7_u8; 1000]).unwrap();
    assert_eq!(cfb.stream_pool(&entry).unwrap(), Pool::Mini);

    // One write that pushes the size across 4096.
    let mut stream = cfb.open_stream(&entry).unwrap();
    stream.seek(SeekFrom::End(0)).unwrap();
    stream.write_all(&vec![9_u8; 4000]).unwrap();
    drop(stream);

    assert_eq!(cfb.stream_pool(&entry).unwrap(), Pool::Normal);
    let data = cfb.read_path("/s").unwrap();
    assert_eq!(data.len(), 5000);
    assert!(data[..1000].iter().all(|b| *b == 7));
    assert!(data[1000..].iter().all(|b| *b == 9));
}

#[test]
fn truncation_below_cutoff_migrates_down() {
    let cfb = CompoundFile::create(MemDevice::new()).unwrap();
    let root = cfb.root().unwrap();
    let entry = cfb.create_stream(&root, "s", &vec![5_u8; 6000]).unwrap();
    assert_eq!(cfb.stream_pool(&entry).unwrap(), Pool::Normal);

    let mut stream = cfb.open_stream(&entry).unwrap();
    stream.set_len(100).unwrap();
    drop(stream);

    assert_eq!(cfb.stream_pool(&entry).unwrap(), Pool::Mini);
    assert_eq!(cfb.read_path("/s").unwrap(), vec![5_u8; 100]);

    let cfb = save_and_reopen(cfb);
    assert_eq!(cfb.read_path("/s").unwrap(), vec![5_u8; 100]);
}

#[test]
fn set_len_zero_and_regrow_reads_zeros() {
    let cfb = CompoundFile::create(MemDevice::new()).unwrap();
    let root = cfb.root().unwrap();
    let entry = cfb.create_stream(&root, "s", b"abcdef").unwrap();

    let mut stream = cfb.open_stream(&entry).unwrap();
    stream.set_len(0).unwrap();
    assert_eq!(stream.len().unwrap(), 0);
    stream.set_len(10).unwrap();

    let mut contents = Vec::new();
    stream.seek(SeekFrom::Start(0)).unwrap();
    stream.read_to_end(&mut contents).unwrap();
    assert_eq!(contents, vec![0_u8; 10]);
}

#[test]
fn unsaved_changes_are_discarded_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("discard.cfb");
    {
        let cfb = CompoundFile::create(FileDevice::create(&path).unwrap()).unwrap();
        let root = cfb.root().unwrap();
        cfb.create_stream(&root, "keep", b"saved").unwrap();
        cfb.close().unwrap();
    }
    {
        // Mutate, then drop without saving.
        let cfb = CompoundFile::open_editor(FileDevice::open(&path).unwrap()).unwrap();
        let root = cfb.root().unwrap();
        cfb.create_stream(&root, "lost", b"never flushed").unwrap();
        let keep = cfb.entry("/keep").unwrap();
        let mut stream = cfb.open_stream(&keep).unwrap();
        stream.write_all(b"WRECK").unwrap();
        drop(stream);
    }

    let cfb = CompoundFile::open_reader(FileDevice::open_read_only(&path).unwrap()).unwrap();
    assert_eq!(cfb.read_path("/keep").unwrap(), b"saved");
    assert!(!cfb.exists("/lost").unwrap());
}

#[test]
fn recursive_delete_frees_slots_and_chains() {
    let cfb = CompoundFile::create(MemDevice::new()).unwrap();
    let root = cfb.root().unwrap();
    let outer = cfb.create_storage(&root, "outer").unwrap();
    let inner = cfb.create_storage(&outer, "inner").unwrap();
    cfb.create_stream(&inner, "mini", b"little").unwrap();
    cfb.create_stream(&inner, "big", &vec![1_u8; 5000]).unwrap();

    cfb.delete(&outer).unwrap();
    assert!(cfb.children(&root).unwrap().is_empty());
    assert!(!cfb.exists("/outer").unwrap());

    let cfb = save_and_reopen(cfb);
    assert!(cfb.children(&cfb.root().unwrap()).unwrap().is_empty());
}

#[test]
fn deep_nesting_round_trip() {
    let cfb = CompoundFile::create(MemDevice::new()).unwrap();
    let mut cur = cfb.root().unwrap();
    for level in 0..10 {
        cur = cfb.create_storage(&cur, &format!("level_{level}")).unwrap();
    }
    cfb.create_stream(&cur, "deep_stream", b"Deeply nested data")
        .unwrap();

    let cfb = save_and_reopen(cfb);
    let path = (0..10).map(|l| format!("level_{l}")).collect::<Vec<_>>().join("/");
    assert_eq!(
        cfb.read_path(&format!("/{path}/deep_stream")).unwrap(),
        b"Deeply nested data"
    );
}

#[test]
fn reopen_preserves_tree_and_contents_without_diagnostics() {
    let cfb = CompoundFile::create(MemDevice::new()).unwrap();
    let root = cfb.root().unwrap();
    let docs = cfb.create_storage(&root, "Docs").unwrap();
    for i in 0..20 {
        cfb.create_stream(&docs, &format!("note{i:02}"), format!("note {i}").as_bytes())
            .unwrap();
    }
    cfb.create_stream(&root, "blob", &vec![0x5A_u8; 10_000]).unwrap();
    cfb.save().unwrap();
    let bytes = cfb.into_device().unwrap().into_inner();

    let sink = CollectSink::new();
    let cfb = CompoundFile::open_with_sink(
        MemDevice::from_vec(bytes),
        Box::new(sink.clone()),
        true,
    )
    .unwrap();
    assert!(sink.is_empty(), "clean file reopens clean: {:?}", sink.diagnostics());

    let docs = cfb.entry("/Docs").unwrap();
    let names: Vec<String> = cfb
        .children(&docs)
        .unwrap()
        .iter()
        .map(|e| e.name().to_owned())
        .collect();
    let expected: Vec<String> = (0..20).map(|i| format!("note{i:02}")).collect();
    assert_eq!(names, expected);
    for i in 0..20 {
        assert_eq!(
            cfb.read_path(&format!("/Docs/note{i:02}")).unwrap(),
            format!("note {i}").as_bytes()
        );
    }
    assert_eq!(cfb.read_path("/blob").unwrap(), vec![0x5A_u8; 10_000]);
}

#[test]
fn many_mini_streams_share_the_mini_stream() {
    let cfb = CompoundFile::create(MemDevice::new()).unwrap();
    let root = cfb.root().unwrap();
    for i in 0..50 {
        let body = format!("mini contents number {i}");
        cfb.create_stream(&root, &format!("m{i:02}"), body.as_bytes())
            .unwrap();
    }
    let cfb = save_and_reopen(cfb);
    for i in 0..50 {
        assert_eq!(
            cfb.read_path(&format!("/m{i:02}")).unwrap(),
            format!("mini contents number {i}").as_bytes()
        );
    }
}

#[test]
fn large_stream_spills_the_difat() {
    // Enough sectors that the FAT needs more than the 109 inline DIFAT
    // slots: 110 FAT sectors cover 110 * 128 * 512 bytes.
    let cfb = CompoundFile::create(MemDevice::new()).unwrap();
    let root = cfb.root().unwrap();
    let len = 110 * 128 * 512;
    cfb.create_stream(&root, "huge", &vec![0xAB_u8; len]).unwrap();
    cfb.save().unwrap();
    let bytes = cfb.into_device().unwrap().into_inner();

    let sink = CollectSink::new();
    let cfb =
        CompoundFile::open_with_sink(MemDevice::from_vec(bytes), Box::new(sink.clone()), true)
            .unwrap();
    assert!(sink.is_empty(), "{:?}", sink.diagnostics());
    let data = cfb.read_path("/huge").unwrap();
    assert_eq!(data.len(), len);
    assert!(data.iter().all(|b| *b == 0xAB));
}

#[test]
fn sparse_write_after_seek_reads_zero_gap() {
    let cfb = CompoundFile::create(MemDevice::new()).unwrap();
    let root = cfb.root().unwrap();
    let entry = cfb.create_stream(&root, "sparse", b"head").unwrap();

    let mut stream = cfb.open_stream(&entry).unwrap();
    stream.seek(SeekFrom::Start(300)).unwrap();
    stream.write_all(b"tail").unwrap();
    drop(stream);

    let data = cfb.read_path("/sparse").unwrap();
    assert_eq!(data.len(), 304);
    assert_eq!(&data[..4], b"head");
    assert!(data[4..300].iter().all(|b| *b == 0));
    assert_eq!(&data[300..], b"tail");
}

#[test]
fn storage_timestamps_are_set_and_persisted() {
    let cfb = CompoundFile::create(MemDevice::new()).unwrap();
    let root = cfb.root().unwrap();
    let storage = cfb.create_storage(&root, "stamped").unwrap();
    assert!(!storage.created().is_unset());
    assert!(!storage.modified().is_unset());

    let cfb = save_and_reopen(cfb);
    let reloaded = cfb.entry("/stamped").unwrap();
    assert_eq!(reloaded.created(), storage.created());
    assert_eq!(reloaded.modified(), storage.modified());
}

#[test]
fn v4_round_trip() {
    let cfb = CompoundFile::create_with_version(MemDevice::new(), Version::V4).unwrap();
    assert_eq!(cfb.sector_size(), 4096);
    let root = cfb.root().unwrap();
    let storage = cfb.create_storage(&root, "S").unwrap();
    cfb.create_stream(&storage, "tiny", b"mini pool").unwrap();
    cfb.create_stream(&storage, "large", &vec![3_u8; 9000]).unwrap();

    let cfb = save_and_reopen(cfb);
    assert_eq!(cfb.version(), Version::V4);
    assert_eq!(cfb.read_path("/S/tiny").unwrap(), b"mini pool");
    assert_eq!(cfb.read_path("/S/large").unwrap(), vec![3_u8; 9000]);
}

#[test]
fn lookup_is_case_insensitive() {
    let cfb = CompoundFile::create(MemDevice::new()).unwrap();
    let root = cfb.root().unwrap();
    cfb.create_stream(&root, "Summary", b"x").unwrap();
    assert_eq!(cfb.read_path("/SUMMARY").unwrap(), b"x");
    assert_eq!(cfb.read_path("/summary").unwrap(), b"x");
    assert!(cfb
        .create_stream(&root, "SUMMARY", b"y")
        .is_err(), "names collide case-insensitively");
}

#[test]
fn create_storage_path_creates_missing_levels() {
    let cfb = CompoundFile::create(MemDevice::new()).unwrap();
    let deep = cfb.create_storage_path("/a/b/c").unwrap();
    assert!(deep.is_storage());
    cfb.create_stream(&deep, "leaf", b"v").unwrap();
    // Existing levels are reused, not duplicated.
    cfb.create_storage_path("/a/b").unwrap();
    assert_eq!(cfb.children(&cfb.entry("/a").unwrap()).unwrap().len(), 1);
    assert_eq!(cfb.read_path("/a/b/c/leaf").unwrap(), b"v");
}

#[test]
fn closed_container_invalidates_stream_handles() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("closed.cfb");
    let cfb = CompoundFile::create(FileDevice::create(&path).unwrap()).unwrap();
    let root = cfb.root().unwrap();
    let entry = cfb.create_stream(&root, "s", b"abc").unwrap();
    let mut stream = cfb.open_stream(&entry).unwrap();
    cfb.close().unwrap();

    let mut buf = [0_u8; 3];
    assert!(stream.read(&mut buf).is_err());
    assert!(stream.set_len(0).is_err());
}
