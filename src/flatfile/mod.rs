//! Codec for the legacy flatfile dump format. Imports, manual dumps and
//! the reference test suites all go through here.
//!
//! A dump is line-oriented: a `+T` header whose low bits carry a
//! feature-flag set, `+S`/`+N` size and next-attribute counters, `+A`
//! attribute definitions, a `-R` record-player count, then object
//! records framed by `!<dbref>` and a lone `<`, closed by the
//! `***END OF DUMP***` sentinel.

mod quote;
mod reader;
mod writer;

pub mod comsys;

pub use quote::{quote, unquote};
pub use reader::read;
pub use writer::{write, write_to_path, WriteOptions};

pub const END_OF_DUMP: &str = "***END OF DUMP***";

// Feature-flag bits carried in the low word of the +T header.
pub const V_MASK: u32 = 0x0000_00ff;
pub const V_ZONE: u32 = 0x0000_0100;
pub const V_LINK: u32 = 0x0000_0200;
pub const V_ATRNAME: u32 = 0x0000_0800;
pub const V_ATRKEY: u32 = 0x0000_1000;
pub const V_PARENT: u32 = 0x0000_2000;
pub const V_XFLAGS: u32 = 0x0001_0000;
pub const V_POWERS: u32 = 0x0002_0000;
pub const V_3FLAGS: u32 = 0x0004_0000;
pub const V_QUOTED: u32 = 0x0008_0000;
pub const V_TIMESTAMPS: u32 = 0x0020_0000;

/// The bit set the writer always emits.
pub const OUTPUT_VERSION: u32 = 1
    | V_ZONE
    | V_LINK
    | V_ATRNAME
    | V_ATRKEY
    | V_PARENT
    | V_XFLAGS
    | V_POWERS
    | V_3FLAGS
    | V_QUOTED
    | V_TIMESTAMPS;

#[cfg(test)]
mod tests {
    use crate::prelude::*;

    use super::*;

    fn sample_db() -> Database {
        let mut db = Database::new();

        let mut room = Object::new(0, ObjectType::Room, "Limbo");
        room.contents = 1;
        room.owner = 1;

        let mut wizard = Object::new(1, ObjectType::Player, "Wizard");
        wizard.location = 0;
        wizard.next = 2;
        wizard.owner = 1;
        wizard.pennies = 100;
        wizard.flags[0] |= FLAG_WIZARD;
        wizard.set_attr(Attr::new(A_PASS, "XXtzvN7JMYeIc"));
        wizard.set_attr(Attr::new(A_DESC, "an imposing figure"));
        wizard.lock = Some(BoolExp::Const(1));

        let mut thing = Object::new(2, ObjectType::Thing, "ball");
        thing.location = 0;
        thing.owner = 1;
        thing.link = HOME;

        db.put(room);
        db.put(wizard);
        db.put(thing);
        db.record_players = 1;

        let num = db.define_attr("VRML_URL", 0);
        db.get_mut(2)
            .unwrap()
            .set_attr(Attr::new(num, "http://example.com/ball.wrl"));

        db
    }

    #[test]
    fn write_then_read_round_trips() {
        let db = sample_db();

        let mut buf = Vec::new();
        write(&db, &mut buf, &WriteOptions::default()).unwrap();

        let loaded = read(buf.as_slice()).unwrap();

        assert_eq!(loaded.object_count(), 3);
        assert_eq!(loaded.record_players, 1);
        assert_eq!(loaded.size, 3);

        for dbref in [0, 1, 2] {
            let a = db.get(dbref).unwrap();
            let b = loaded.get(dbref).unwrap();
            assert_eq!(a.name, b.name);
            assert_eq!(a.location, b.location);
            assert_eq!(a.contents, b.contents);
            assert_eq!(a.next, b.next);
            assert_eq!(a.link, b.link);
            assert_eq!(a.flags, b.flags);
            assert_eq!(a.powers, b.powers);
            assert_eq!(a.pennies, b.pennies);
            assert_eq!(a.attrs, b.attrs);
            assert_eq!(a.lock, b.lock);
        }

        // sentinels are preserved, never collapsed
        assert_eq!(loaded.get(2).unwrap().link, HOME);
        // user attr definitions survive
        assert_eq!(loaded.attr_num("vrml_url"), db.attr_num("vrml_url"));
    }

    #[test]
    fn second_write_is_stable() {
        let db = sample_db();
        let opts = WriteOptions {
            stamp_missing_timestamps: false,
        };

        let mut first = Vec::new();
        write(&db, &mut first, &opts).unwrap();

        let loaded = read(first.as_slice()).unwrap();

        let mut second = Vec::new();
        write(&loaded, &mut second, &opts).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn timestamps_are_stamped_by_default() {
        let db = sample_db();

        let mut buf = Vec::new();
        write(&db, &mut buf, &WriteOptions::default()).unwrap();

        let loaded = read(buf.as_slice()).unwrap();
        assert!(loaded.get(1).unwrap().last_access > 0);
    }

    #[test]
    fn missing_terminator_is_distinguishable() {
        let db = sample_db();

        let mut buf = Vec::new();
        write(&db, &mut buf, &WriteOptions::default()).unwrap();

        // chop off the sentinel line
        let text = String::from_utf8(buf).unwrap();
        let truncated = text.rsplit_once(END_OF_DUMP).unwrap().0;

        match read(truncated.as_bytes()) {
            Err(FlatfileError::MissingTerminator) => {}
            other => panic!("expected MissingTerminator, got {other:?}"),
        }
    }

    #[test]
    fn malformed_line_reports_position() {
        let input = "+T1\n+S3\nbogus\n";
        match read(input.as_bytes()) {
            Err(FlatfileError::Malformed { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn unknown_attr_numbers_load_anyway() {
        let input = format!(
            concat!(
                "+T{version}\n",
                "+S1\n",
                "+N256\n",
                "-R0\n",
                "!0\n",
                "\"Limbo\"\n",
                "-1\n-1\n-1\n-1\n-1\n-1\n-1\n-1\n",
                "0\n0\n0\n0\n0\n0\n0\n0\n",
                ">999\n",
                "\"mystery value\"\n",
                "<\n",
                "***END OF DUMP***\n",
            ),
            version = OUTPUT_VERSION,
        );

        let db = read(input.as_bytes()).unwrap();
        let obj = db.get(0).unwrap();
        assert_eq!(obj.attr(999).unwrap().value, "mystery value");
    }

    #[test]
    fn write_to_path_stages_through_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("game.flat");

        write_to_path(&sample_db(), &path, &WriteOptions::default()).unwrap();

        assert!(path.exists());
        assert!(!dir.path().join("game.flat.tmp").exists());

        let loaded = read(std::io::BufReader::new(
            std::fs::File::open(&path).unwrap(),
        ))
        .unwrap();
        assert_eq!(loaded.object_count(), 3);
    }
}
