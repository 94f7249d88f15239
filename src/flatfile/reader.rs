use std::io::BufRead;

use crate::prelude::*;

use super::quote::unquote;
use super::{
    END_OF_DUMP, V_3FLAGS, V_LINK, V_PARENT, V_POWERS, V_QUOTED, V_TIMESTAMPS, V_XFLAGS, V_ZONE,
};

/// Parses a flatfile dump into a fresh database. Any malformed line
/// fails the whole parse; unknown attribute numbers load anyway and
/// stay addressable by number.
pub fn read(r: impl BufRead) -> Result<Database, FlatfileError> {
    let mut lines = Lines::new(r);
    let mut db = Database::new();

    let mut version = 1u32;
    let mut header_size: Dbref = 0;
    let mut terminated = false;

    while let Some(line) = lines.next()? {
        if let Some(rest) = line.strip_prefix("+T") {
            version = lines.parse(rest)?;
            db.version = version;
        } else if let Some(rest) = line.strip_prefix("+S") {
            header_size = lines.parse(rest)?;
        } else if let Some(rest) = line.strip_prefix("+N") {
            let next_attr: AttrNum = lines.parse(rest)?;
            if next_attr > db.next_attr {
                db.next_attr = next_attr;
            }
        } else if let Some(rest) = line.strip_prefix("+A") {
            let num: AttrNum = lines.parse(rest)?;
            read_attr_def(&mut lines, &mut db, version, num)?;
        } else if let Some(rest) = line.strip_prefix("-R") {
            db.record_players = lines.parse(rest)?;
        } else if let Some(rest) = line.strip_prefix('!') {
            let dbref: Dbref = lines.parse(rest)?;
            let obj = read_object(&mut lines, version, dbref)?;
            db.put(obj);
        } else if line == END_OF_DUMP {
            terminated = true;
            break;
        } else {
            return Err(lines.malformed("unrecognized directive"));
        }
    }

    if !terminated {
        return Err(FlatfileError::MissingTerminator);
    }

    if header_size > db.size {
        db.size = header_size;
    }

    Ok(db)
}

fn read_attr_def(
    lines: &mut Lines<impl BufRead>,
    db: &mut Database,
    version: u32,
    num: AttrNum,
) -> Result<(), FlatfileError> {
    let payload = lines.string(version)?;

    let (flags, name) = payload
        .split_once(':')
        .ok_or_else(|| lines.malformed("attr definition missing ':'"))?;

    let flags: u32 = flags
        .parse()
        .map_err(|_| lines.malformed("bad attr flags"))?;

    db.register_attr(AttrDef {
        num,
        name: name.to_owned(),
        flags,
    });

    Ok(())
}

fn read_object(
    lines: &mut Lines<impl BufRead>,
    version: u32,
    dbref: Dbref,
) -> Result<Object, FlatfileError> {
    let mut obj = Object::new(dbref, ObjectType::Thing, lines.string(version)?);

    obj.location = lines.int()?;
    if version & V_ZONE != 0 {
        obj.zone = lines.int()?;
    }
    obj.contents = lines.int()?;
    obj.exits = lines.int()?;
    if version & V_LINK != 0 {
        obj.link = lines.int()?;
    }
    obj.next = lines.int()?;
    obj.owner = lines.int()?;
    if version & V_PARENT != 0 {
        obj.parent = lines.int()?;
    }
    obj.pennies = lines.int()?;

    obj.flags[0] = lines.word()?;
    if version & V_XFLAGS != 0 {
        obj.flags[1] = lines.word()?;
    }
    if version & V_3FLAGS != 0 {
        obj.flags[2] = lines.word()?;
    }
    if version & V_POWERS != 0 {
        obj.powers[0] = lines.word()?;
        obj.powers[1] = lines.word()?;
    }
    if version & V_TIMESTAMPS != 0 {
        obj.last_access = lines.int()?;
        obj.last_mod = lines.int()?;
    }

    loop {
        let line = lines.expect()?;

        if line == "<" {
            return Ok(obj);
        }

        let Some(rest) = line.strip_prefix('>') else {
            return Err(lines.malformed("expected attribute or record terminator"));
        };

        let num: AttrNum = lines.parse(rest)?;
        let value = lines.string(version)?;

        // the lock lives as a parsed tree, not as attribute text
        if num == A_LOCK {
            let lock = BoolExp::parse(&value)
                .map_err(|e| lines.malformed(format!("bad lock: {e}")))?;
            obj.lock = Some(lock);
        } else {
            obj.set_attr(Attr::new(num, value));
        }
    }
}

struct Lines<R> {
    inner: R,
    line: usize,
}

impl<R: BufRead> Lines<R> {
    fn new(inner: R) -> Self {
        Self { inner, line: 0 }
    }

    fn next(&mut self) -> Result<Option<String>, FlatfileError> {
        let mut buf = String::new();
        let n = self.inner.read_line(&mut buf)?;
        if n == 0 {
            return Ok(None);
        }

        self.line += 1;
        while buf.ends_with('\n') || buf.ends_with('\r') {
            buf.pop();
        }

        Ok(Some(buf))
    }

    /// Next line, treating EOF as a truncated dump.
    fn expect(&mut self) -> Result<String, FlatfileError> {
        self.next()?.ok_or(FlatfileError::MissingTerminator)
    }

    fn parse<T: std::str::FromStr>(&self, text: &str) -> Result<T, FlatfileError> {
        text.trim()
            .parse()
            .map_err(|_| self.malformed(format!("bad number {text:?}")))
    }

    fn int(&mut self) -> Result<i64, FlatfileError> {
        let line = self.expect()?;
        self.parse(&line)
    }

    /// Flag and power words are stored as unsigned decimals.
    fn word(&mut self) -> Result<u32, FlatfileError> {
        let line = self.expect()?;
        let wide: i64 = self.parse(&line)?;
        Ok(wide as u32)
    }

    fn string(&mut self, version: u32) -> Result<String, FlatfileError> {
        let line = self.expect()?;

        if version & V_QUOTED == 0 {
            return Ok(line);
        }

        unquote(&line).ok_or_else(|| self.malformed("bad quoted string"))
    }

    fn malformed(&self, reason: impl std::fmt::Display) -> FlatfileError {
        FlatfileError::malformed(self.line, reason)
    }
}
