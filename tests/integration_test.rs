use mwm::codec::CodecId;
use mwm::container::{ContainerReader, BLOBS_TAG, HEADER_TAG};
use mwm::header::{DataHeader, Rect};
use mwm::map_value::{pack_file, FileLoader, LoaderOptions, MapValue, PackOptions};
use mwm::registry::{PendingFileOp, Registry, SlotStatus, UpdateOutcome};
use mwm::version::{ContainerVersion, Format, LEGACY_TIMESTAMP};
use mwm::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use tempfile::{tempdir, NamedTempFile};

fn header(max_scale: u8) -> DataHeader {
    DataHeader { bounds: Rect::new(-10.0, 40.0, 5.0, 52.0), min_scale: 1, max_scale }
}

fn write_map(dir: &Path, name: &str, max_scale: u8, blobs: &[&[u8]], codec: CodecId) {
    let opts = PackOptions { codec, bits_in_chunk_size: 6, ..PackOptions::default() };
    pack_file(&dir.join(name), &header(max_scale), blobs, &opts).unwrap();
}

fn registry(dir: &Path, codec: CodecId) -> Registry<MapValue> {
    Registry::new(FileLoader::new(LoaderOptions { data_dir: dir.to_path_buf(), codec }))
}

#[test]
fn test_pack_and_read_file() {
    let temp_file = NamedTempFile::new().unwrap();
    let path = temp_file.path();
    let blobs: Vec<Vec<u8>> = (0..40u8).map(|i| vec![i; usize::from(i) * 3]).collect();

    let opts = PackOptions { codec: CodecId::Zstd, bits_in_chunk_size: 7, ..PackOptions::default() };
    pack_file(path, &header(12), &blobs, &opts).unwrap();

    let container = ContainerReader::open_path(path).unwrap();
    assert_eq!(container.version().format, Format::LATEST);
    assert!(container.has_section(HEADER_TAG));
    assert!(container.has_section(BLOBS_TAG));

    let map = MapValue::open(container, CodecId::Zstd).unwrap();
    assert_eq!(map.header(), &header(12));
    assert_eq!(map.blob_count(), 40);
    let store = map.blobs().unwrap();
    assert!(store.chunk_count() > 1);
    for (i, want) in blobs.iter().enumerate() {
        assert_eq!(&store.get_blob(i as u32).unwrap(), want);
    }
    assert_eq!(store.get_blobs(5..25).unwrap(), blobs[5..25].to_vec());
}

#[test]
fn test_legacy_file_reads_with_fallback_version() {
    let temp_file = NamedTempFile::new().unwrap();
    let opts = PackOptions { version: Some(ContainerVersion::LEGACY), ..PackOptions::default() };
    pack_file(temp_file.path(), &header(9), [b"old"], &opts).unwrap();

    let map = MapValue::open(ContainerReader::open_path(temp_file.path()).unwrap(), CodecId::Deflate).unwrap();
    assert_eq!(map.version().format, Format::Legacy);
    assert_eq!(map.version().timestamp, LEGACY_TIMESTAMP);
    assert_eq!(map.blob(0).unwrap().unwrap(), b"old");
}

#[test]
fn test_registry_over_files() {
    let dir = tempdir().unwrap();
    write_map(dir.path(), "a.mwm", 10, &[b"a0", b"a1"], CodecId::Deflate);
    write_map(dir.path(), "b.mwm", 14, &[b"b0"], CodecId::Deflate);
    std::fs::write(dir.path().join("junk.mwm"), b"not a container").unwrap();

    let r = registry(dir.path(), CodecId::Deflate);
    let a = r.add("a.mwm").unwrap();
    let b = r.add("b.mwm").unwrap();
    assert_eq!(r.add("junk.mwm").unwrap_err().kind(), ErrorKind::Open);
    assert_eq!(r.add("missing.mwm").unwrap_err().kind(), ErrorKind::Read);
    assert_eq!(r.len(), 2);

    let info = r.info(b).unwrap();
    assert_eq!(info.max_scale, 14);
    assert_eq!(info.min_scale, 1);
    assert_eq!(info.bounds, header(14).bounds);

    let lock = r.acquire(a);
    let map = lock.value().unwrap();
    assert_eq!(map.blob(1).unwrap().unwrap(), b"a1");
    assert_eq!(r.info(a).unwrap().lock_count, 1);
}

#[test]
fn test_replace_while_reading() {
    let dir = tempdir().unwrap();
    write_map(dir.path(), "r.mwm", 10, &[b"old data"], CodecId::Lz4);
    let r = registry(dir.path(), CodecId::Lz4);

    let old_id = r.add("r.mwm").unwrap();
    let reader = r.acquire(old_id);
    let old_value = reader.value_arc().unwrap();

    // The file is replaced on disk and the container re-registered.
    write_map(dir.path(), "r.mwm.part", 11, &[b"new data", b"more"], CodecId::Lz4);
    std::fs::rename(dir.path().join("r.mwm.part"), dir.path().join("r.mwm")).unwrap();
    assert!(r.remove("r.mwm"));
    let new_id = r.add("r.mwm").unwrap();
    assert_ne!(new_id.index(), old_id.index());

    // The old reader still sees the old contents.
    assert!(Arc::ptr_eq(&old_value, &reader.value_arc().unwrap()));
    assert_eq!(reader.value().unwrap().blob(0).unwrap().unwrap(), b"old data");
    assert_eq!(r.info(old_id).unwrap().status, SlotStatus::Stale);

    {
        let fresh = r.acquire_by_name("r.mwm").unwrap();
        let map = fresh.value().unwrap();
        assert_eq!(map.blob_count(), 2);
        assert_eq!(map.header().max_scale, 11);
    }

    drop(old_value);
    drop(reader);
    assert_eq!(r.info(old_id).unwrap().lock_count, 0);

    // The freed slot is reused by the next registration.
    write_map(dir.path(), "s.mwm", 12, &[b"s"], CodecId::Lz4);
    let s = r.add("s.mwm").unwrap();
    assert_eq!(s.index(), old_id.index());
    assert!(r.info(old_id).is_none());
    assert_eq!(r.active_count(), 2);
}

#[test]
fn test_wrong_codec_and_vanished_file() {
    let dir = tempdir().unwrap();
    write_map(dir.path(), "z.mwm", 10, &[b"zzzz"], CodecId::Zstd);
    // Loader configured for a different codec: headers load, blob reads fail.
    let r = registry(dir.path(), CodecId::None);
    let id = r.add("z.mwm").unwrap();
    let lock = r.acquire(id);
    let map = lock.value().unwrap();
    assert_eq!(map.blob(0).unwrap().unwrap_err().kind(), ErrorKind::Decode);

    // A container removed from disk after registration yields no value.
    write_map(dir.path(), "gone.mwm", 10, &[b"x"], CodecId::Zstd);
    let gone = r.add("gone.mwm").unwrap();
    std::fs::remove_file(dir.path().join("gone.mwm")).unwrap();
    assert!(r.acquire(gone).value().is_none());
}

#[test]
fn test_delete_keeps_file_until_last_lock() {
    let dir = tempdir().unwrap();
    write_map(dir.path(), "d.mwm", 10, &[b"kept while read"], CodecId::Deflate);
    std::fs::write(dir.path().join("d.mwm.resume"), b"partial").unwrap();
    let r = registry(dir.path(), CodecId::Deflate);

    let id = r.add("d.mwm").unwrap();
    let lock = r.acquire(id);
    assert!(r.delete("d.mwm").unwrap());
    assert_eq!(r.info(id).unwrap().pending, Some(PendingFileOp::Delete));

    assert!(dir.path().join("d.mwm").exists());
    assert_eq!(lock.value().unwrap().blob(0).unwrap().unwrap(), b"kept while read");

    drop(lock);
    assert!(!dir.path().join("d.mwm").exists());
    assert!(!dir.path().join("d.mwm.resume").exists());
    assert!(r.find("d.mwm").is_none());
}

#[test]
fn test_update_swaps_ready_file_after_last_lock() {
    let dir = tempdir().unwrap();
    write_map(dir.path(), "u.mwm", 10, &[b"v1"], CodecId::Zstd);
    let r = registry(dir.path(), CodecId::Zstd);
    let old = r.add("u.mwm").unwrap();
    let reader = r.acquire(old);

    write_map(dir.path(), "u.mwm.ready", 13, &[b"v2", b"extra"], CodecId::Zstd);
    assert_eq!(r.update("u.mwm").unwrap(), UpdateOutcome::Deferred(old));
    assert!(dir.path().join("u.mwm.ready").exists());
    assert_eq!(reader.value().unwrap().blob(0).unwrap().unwrap(), b"v1");

    drop(reader);
    assert!(!dir.path().join("u.mwm.ready").exists());
    let new = r.find("u.mwm").unwrap();
    assert_ne!(new, old);
    assert_eq!(r.info(new).unwrap().max_scale, 13);
    let lock = r.acquire(new);
    let map = lock.value().unwrap();
    assert_eq!(map.blob_count(), 2);
    assert_eq!(map.blob(0).unwrap().unwrap(), b"v2");
}

#[test]
fn test_update_of_unregistered_map_installs_ready_file() {
    let dir = tempdir().unwrap();
    write_map(dir.path(), "n.mwm.ready", 9, &[b"fresh"], CodecId::Lz4);
    let r = registry(dir.path(), CodecId::Lz4);

    let UpdateOutcome::Installed(id) = r.update("n.mwm").unwrap() else {
        panic!("nothing held the map");
    };
    assert!(dir.path().join("n.mwm").exists());
    assert_eq!(r.info(id).unwrap().max_scale, 9);

    // No staged file: the registration stays as it is.
    assert_eq!(r.update("n.mwm").unwrap_err().kind(), ErrorKind::Read);
    assert!(r.is_current(id));
}
