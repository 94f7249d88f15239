use itertools::Itertools as _;
use std::io::Write;
use std::path::Path;

use crate::prelude::*;

use super::quote::quote;
use super::{END_OF_DUMP, OUTPUT_VERSION};

#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Substitute the current wall clock for zero object timestamps.
    /// Lossy, so dumps meant for byte comparison turn it off.
    pub stamp_missing_timestamps: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            stamp_missing_timestamps: true,
        }
    }
}

/// Emits a flatfile dump of `db`. Objects and attributes are written in
/// ascending numeric order so repeated dumps of the same database are
/// byte-identical.
pub fn write(db: &Database, mut w: impl Write, opts: &WriteOptions) -> Result<(), FlatfileError> {
    let now = chrono::Utc::now().timestamp();

    writeln!(w, "+T{OUTPUT_VERSION}")?;
    writeln!(w, "+S{}", db.size)?;
    writeln!(w, "+N{}", db.next_attr)?;

    for def in db
        .attr_names
        .values()
        .filter(|d| d.num >= A_USER_START)
        .sorted_by_key(|d| d.num)
    {
        writeln!(w, "+A{}", def.num)?;
        writeln!(w, "{}", quote(&format!("{}:{}", def.flags, def.name)))?;
    }

    writeln!(w, "-R{}", db.record_players)?;

    for dbref in db.objects.keys().copied().sorted() {
        let obj = match db.get(dbref) {
            Some(o) => o,
            None => continue,
        };
        write_object(&mut w, obj, opts, now)?;
    }

    writeln!(w, "{END_OF_DUMP}")?;
    w.flush()?;

    Ok(())
}

fn write_object(
    w: &mut impl Write,
    obj: &Object,
    opts: &WriteOptions,
    now: i64,
) -> Result<(), FlatfileError> {
    writeln!(w, "!{}", obj.dbref)?;
    writeln!(w, "{}", quote(&obj.name))?;
    writeln!(w, "{}", obj.location)?;
    writeln!(w, "{}", obj.zone)?;
    writeln!(w, "{}", obj.contents)?;
    writeln!(w, "{}", obj.exits)?;
    writeln!(w, "{}", obj.link)?;
    writeln!(w, "{}", obj.next)?;
    writeln!(w, "{}", obj.owner)?;
    writeln!(w, "{}", obj.parent)?;
    writeln!(w, "{}", obj.pennies)?;
    writeln!(w, "{}", obj.flags[0])?;
    writeln!(w, "{}", obj.flags[1])?;
    writeln!(w, "{}", obj.flags[2])?;
    writeln!(w, "{}", obj.powers[0])?;
    writeln!(w, "{}", obj.powers[1])?;

    let stamp = |value: i64| {
        if value == 0 && opts.stamp_missing_timestamps {
            now
        } else {
            value
        }
    };
    writeln!(w, "{}", stamp(obj.last_access))?;
    writeln!(w, "{}", stamp(obj.last_mod))?;

    // the lock is materialised back into attribute 42 at its numeric
    // position among the rest
    let lock_text = obj.lock.as_ref().map(|l| l.to_string());

    let mut attrs: Vec<(AttrNum, &str)> = obj
        .attrs
        .iter()
        .map(|a| (a.num, a.value.as_str()))
        .collect();
    if let Some(text) = lock_text.as_deref() {
        attrs.push((A_LOCK, text));
    }
    attrs.sort_by_key(|(num, _)| *num);

    for (num, value) in attrs {
        writeln!(w, ">{num}")?;
        writeln!(w, "{}", quote(value))?;
    }

    writeln!(w, "<")?;
    Ok(())
}

/// Writes the dump to `<path>.tmp` and renames it into place on
/// success; a failed write leaves no temp file behind.
pub fn write_to_path(db: &Database, path: &Path, opts: &WriteOptions) -> Result<(), FlatfileError> {
    let tmp = path.with_extension(match path.extension() {
        Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
        None => "tmp".to_owned(),
    });

    let result: Result<(), FlatfileError> = (|| {
        let file = std::fs::File::create(&tmp)?;
        let mut writer = std::io::BufWriter::new(file);
        write(db, &mut writer, opts)?;
        writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            std::fs::rename(&tmp, path)?;
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e)
        }
    }
}
