//! Archive round trips over a real store file.

use std::path::Path;

use tinymush::archive::{self, ArchiveJob, RestoreOptions};
use tinymush::prelude::*;
use tinymush_redb::MushStore;

fn job_for(dir: &Path) -> ArchiveJob {
    ArchiveJob {
        archive_dir: dir.to_path_buf(),
        server: "tinymush test".into(),
        mud_name: "ArchiveMUSH".into(),
        objects: 1,
        store_name: "game.redb".into(),
        sql_path: None,
        dict_dir: None,
        text_dir: None,
        conf_files: Vec::new(),
        retain: 0,
    }
}

fn store_snapshot(store: &MushStore) -> impl Fn(&Path) -> Result<(), ArchiveError> + '_ {
    move |staged: &Path| {
        store
            .backup(staged)
            .map_err(|e| ArchiveError::Io(std::io::Error::other(e.to_string())))
    }
}

#[test]
fn archive_round_trip_restores_channels() {
    let work = tempfile::tempdir().unwrap();

    let store = MushStore::open(work.path().join("game.redb"), None).unwrap();
    store
        .put_channel(&Channel {
            name: "Public".into(),
            owner: 1,
            ..Default::default()
        })
        .unwrap();

    let archive_dir = work.path().join("archives");
    let snapshot = store_snapshot(&store);
    let archive = archive::create(&job_for(&archive_dir), &snapshot, None).unwrap();

    // restore into a completely empty data directory
    let fresh = tempfile::tempdir().unwrap();
    let opts = RestoreOptions {
        data_dir: fresh.path().join("data"),
        conf_dir: fresh.path().join("conf"),
        dict_dir: None,
        text_dir: None,
    };
    archive::restore(&archive, &opts, std::io::empty(), std::io::sink()).unwrap();

    let restored = MushStore::open(fresh.path().join("data/game.redb"), None).unwrap();
    let channels = restored.load_channels().unwrap();

    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].name, "Public");
}

#[test]
fn archive_digests_verify() {
    let work = tempfile::tempdir().unwrap();

    let store = MushStore::open(work.path().join("game.redb"), None).unwrap();
    let mut db = Database::new();
    db.put(Object::new(0, ObjectType::Room, "Limbo"));
    store.import_from_database(&db).unwrap();

    let archive_dir = work.path().join("archives");
    let snapshot = store_snapshot(&store);
    let archive = archive::create(&job_for(&archive_dir), &snapshot, None).unwrap();

    // a clean restore implies every manifest digest matched
    let fresh = tempfile::tempdir().unwrap();
    let opts = RestoreOptions {
        data_dir: fresh.path().join("data"),
        conf_dir: fresh.path().join("conf"),
        dict_dir: None,
        text_dir: None,
    };
    let summary = archive::restore(&archive, &opts, std::io::empty(), std::io::sink()).unwrap();
    assert_eq!(summary.restored.len(), 1);
}

#[test]
fn concurrent_archives_are_both_valid() {
    let work = tempfile::tempdir().unwrap();

    let store = MushStore::open(work.path().join("game.redb"), None).unwrap();
    let mut db = Database::new();
    db.put(Object::new(0, ObjectType::Room, "Limbo"));
    store.import_from_database(&db).unwrap();

    let archive_dir = work.path().join("archives");

    let paths: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let store = store.clone();
                let archive_dir = archive_dir.clone();
                scope.spawn(move || {
                    let snapshot = store_snapshot(&store);
                    archive::create(&job_for(&archive_dir), &snapshot, None).unwrap()
                })
            })
            .collect();

        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(paths.len(), 2);
    assert_ne!(paths[0], paths[1]);

    // both restore cleanly
    for archive in &paths {
        let fresh = tempfile::tempdir().unwrap();
        let opts = RestoreOptions {
            data_dir: fresh.path().join("data"),
            conf_dir: fresh.path().join("conf"),
            dict_dir: None,
            text_dir: None,
        };
        archive::restore(archive, &opts, std::io::empty(), std::io::sink()).unwrap();

        let restored = MushStore::open(fresh.path().join("data/game.redb"), None).unwrap();
        assert_eq!(restored.load_all().unwrap().object_count(), 1);
    }
}

#[test]
fn listing_reports_manifest_fields() {
    let work = tempfile::tempdir().unwrap();

    let store = MushStore::open(work.path().join("game.redb"), None).unwrap();
    let archive_dir = work.path().join("archives");
    let snapshot = store_snapshot(&store);
    archive::create(&job_for(&archive_dir), &snapshot, None).unwrap();

    let archives = archive::list(&archive_dir).unwrap();
    assert_eq!(archives.len(), 1);
    assert_eq!(archives[0].mud_name, "ArchiveMUSH");
    assert_eq!(archives[0].objects, 1);
    assert!(archives[0].size > 0);
}
