//! End-to-end import: legacy flatfile -> database -> durable store.

use std::collections::HashSet;

use tinymush::flatfile::{self, WriteOptions};
use tinymush::prelude::*;
use tinymush_redb::MushStore;

fn three_object_flatfile() -> String {
    let mut db = Database::new();

    let mut room = Object::new(0, ObjectType::Room, "Limbo");
    room.contents = 1;
    room.owner = 1;

    let mut wizard = Object::new(1, ObjectType::Player, "Wizard");
    wizard.location = 0;
    wizard.next = 2;
    wizard.owner = 1;
    wizard.flags[0] |= FLAG_WIZARD;
    wizard.set_attr(Attr::new(A_PASS, auth::crypt("testpass", "XX")));

    let mut thing = Object::new(2, ObjectType::Thing, "ball");
    thing.location = 0;
    thing.owner = 1;

    db.put(room);
    db.put(wizard);
    db.put(thing);
    db.record_players = 1;

    let mut buf = Vec::new();
    flatfile::write(
        &db,
        &mut buf,
        &WriteOptions {
            stamp_missing_timestamps: false,
        },
    )
    .unwrap();

    String::from_utf8(buf).unwrap()
}

#[test]
fn import_then_query() {
    let text = three_object_flatfile();
    let db = flatfile::read(text.as_bytes()).unwrap();

    assert_eq!(db.object_count(), 3);
    assert_eq!(db.get(1).unwrap().location, 0);

    let head = db.get(0).unwrap().contents;
    assert!(head == 1 || head == 2);

    let contents: HashSet<Dbref> = db.chain_iter(head).collect();
    assert_eq!(contents, HashSet::from([1, 2]));
}

#[test]
fn export_import_export_is_byte_stable() {
    let first = three_object_flatfile();

    let db = flatfile::read(first.as_bytes()).unwrap();

    let mut second = Vec::new();
    flatfile::write(
        &db,
        &mut second,
        &WriteOptions {
            stamp_missing_timestamps: false,
        },
    )
    .unwrap();

    assert_eq!(first.as_bytes(), second.as_slice());
}

#[test]
fn store_round_trip_preserves_objects() {
    let text = three_object_flatfile();
    let db = flatfile::read(text.as_bytes()).unwrap();

    let store = MushStore::memory().unwrap();
    store.import_from_database(&db).unwrap();

    let loaded = store.load_all().unwrap();
    assert_eq!(loaded.object_count(), 3);

    for dbref in [0, 1, 2] {
        assert_eq!(loaded.get(dbref).unwrap(), db.get(dbref).unwrap());
    }

    // the player-name index came back too
    assert_eq!(loaded.resolve_name("Wizard"), 1);
    assert_eq!(store.lookup_player("wizard").unwrap(), Some(1));
}

#[test]
fn imported_password_verifies() {
    let text = three_object_flatfile();
    let db = flatfile::read(text.as_bytes()).unwrap();

    let hash = db.get(1).unwrap().attr(A_PASS).unwrap().text().to_owned();
    assert_eq!(hash.len(), 13);
    assert!(hash.starts_with("XX"));
    assert!(auth::check_password("testpass", &hash));
    assert!(!auth::check_password("wrong", &hash));
}

#[test]
fn every_reference_resolves_after_import() {
    let text = three_object_flatfile();
    let db = flatfile::read(text.as_bytes()).unwrap();

    for obj in db.objects.values() {
        if obj.is_going() {
            continue;
        }
        for reference in obj.references() {
            assert!(
                db.get(reference).is_some(),
                "#{} holds a dangling reference to #{}",
                obj.dbref,
                reference
            );
        }
    }
}

#[test]
fn location_agrees_with_contents_chains() {
    let text = three_object_flatfile();
    let db = flatfile::read(text.as_bytes()).unwrap();

    for room in db.objects.values() {
        for member in db.chain_iter(room.contents) {
            assert_eq!(db.get(member).unwrap().location, room.dbref);
        }
    }
}
