//! Codec for the comsys sidecar file: channel records followed by
//! per-player alias records, each section introduced by a `+V` version
//! header and the whole file closed by its own end-of-dump sentinel
//! (spelled with spaces, unlike the main flatfile).

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::Path;

use crate::prelude::*;

use super::quote::{quote, unquote};

pub const COMSYS_END_OF_DUMP: &str = "*** END OF DUMP ***";

pub const CHANNEL_VERSION: u32 = 4;
pub const ALIAS_VERSION: u32 = 1;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ComsysData {
    pub channels: Vec<Channel>,
    pub aliases: Vec<ChanAlias>,
}

impl ComsysData {
    /// Folds the parsed records into the database's sidecar maps.
    pub fn apply(self, db: &mut Database) {
        for channel in self.channels {
            db.channels.insert(channel.name.to_lowercase(), channel);
        }
        for alias in self.aliases {
            db.chan_aliases
                .insert(composite_key(alias.player, &alias.alias), alias);
        }
    }
}

/// Parses a comsys dump.
pub fn read(r: impl BufRead) -> Result<ComsysData, FlatfileError> {
    let mut lines = Lines::new(r);
    let mut data = ComsysData::default();

    let header = lines.expect()?;
    if !header.starts_with("+V") {
        return Err(lines.malformed("expected +V header"));
    }

    // channel section, until the alias header or the sentinel
    let alias_section = loop {
        let line = lines.expect()?;

        if line.starts_with("+V") {
            break true;
        }
        if line == COMSYS_END_OF_DUMP {
            break false;
        }

        let name = lines.unquote(&line)?;
        data.channels.push(read_channel(&mut lines, name)?);
    };

    if alias_section {
        loop {
            let line = lines.expect()?;
            if line == COMSYS_END_OF_DUMP {
                break;
            }

            let player: Dbref = lines.parse(&line)?;
            data.aliases.push(read_alias(&mut lines, player)?);
        }
    }

    Ok(data)
}

fn read_channel(lines: &mut Lines<impl BufRead>, name: String) -> Result<Channel, FlatfileError> {
    let owner = lines.int()?;
    let flags = lines.int()? as u32;
    let charge = lines.int()?;
    let charge_collected = lines.int()?;
    let num_sent = lines.int()?;
    let description = lines.quoted()?;
    let header = unescape_header(&lines.quoted()?);

    let join_lock = lines.lock_body()?;
    let transmit_lock = lines.lock_body()?;
    let receive_lock = lines.lock_body()?;

    lines.terminator()?;

    Ok(Channel {
        name,
        owner,
        flags,
        charge,
        charge_collected,
        num_sent,
        description,
        header,
        join_lock,
        transmit_lock,
        receive_lock,
    })
}

fn read_alias(lines: &mut Lines<impl BufRead>, player: Dbref) -> Result<ChanAlias, FlatfileError> {
    let channel = lines.quoted()?;
    let alias = lines.quoted()?;
    let title = lines.quoted()?;
    let listening = lines.int()? != 0;

    lines.terminator()?;

    Ok(ChanAlias {
        player,
        channel,
        alias,
        title,
        listening,
    })
}

/// Emits a comsys dump. Channels sort by name, aliases by player then
/// alias, so repeated dumps are stable.
pub fn write(data: &ComsysData, mut w: impl Write) -> Result<(), FlatfileError> {
    writeln!(w, "+V{CHANNEL_VERSION}")?;

    let mut channels: Vec<&Channel> = data.channels.iter().collect();
    channels.sort_by(|a, b| a.name.cmp(&b.name));

    for c in channels {
        writeln!(w, "{}", quote(&c.name))?;
        writeln!(w, "{}", c.owner)?;
        writeln!(w, "{}", c.flags)?;
        writeln!(w, "{}", c.charge)?;
        writeln!(w, "{}", c.charge_collected)?;
        writeln!(w, "{}", c.num_sent)?;
        writeln!(w, "{}", quote(&c.description))?;
        // the ESC -> `\e` substitution happens outside the quoting
        // layer so the file carries a single backslash
        writeln!(w, "{}", escape_header(&quote(&c.header)))?;
        for lock in [&c.join_lock, &c.transmit_lock, &c.receive_lock] {
            if !lock.is_empty() {
                writeln!(w, "{lock}")?;
            }
            writeln!(w, "-")?;
        }
        writeln!(w, "<")?;
    }

    writeln!(w, "+V{ALIAS_VERSION}")?;

    let mut aliases: Vec<&ChanAlias> = data.aliases.iter().collect();
    aliases.sort_by(|a, b| (a.player, &a.alias).cmp(&(b.player, &b.alias)));

    for a in aliases {
        writeln!(w, "{}", a.player)?;
        writeln!(w, "{}", quote(&a.channel))?;
        writeln!(w, "{}", quote(&a.alias))?;
        writeln!(w, "{}", quote(&a.title))?;
        writeln!(w, "{}", i32::from(a.listening))?;
        writeln!(w, "<")?;
    }

    writeln!(w, "{COMSYS_END_OF_DUMP}")?;
    w.flush()?;

    Ok(())
}

/// Writes through a `.tmp` stage like the main flatfile writer.
pub fn write_to_path(data: &ComsysData, path: &Path) -> Result<(), FlatfileError> {
    let tmp = path.with_extension("tmp");

    let result: Result<(), FlatfileError> = (|| {
        let file = std::fs::File::create(&tmp)?;
        let mut writer = std::io::BufWriter::new(file);
        write(data, &mut writer)?;
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

/// Channel headers store ANSI colour; on disk the ESC byte appears as
/// the two characters `\e`.
fn unescape_header(text: &str) -> String {
    text.replace("\\e", "\x1b")
}

fn escape_header(text: &str) -> String {
    text.replace('\x1b', "\\e")
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

    fn quoted(&mut self) -> Result<String, FlatfileError> {
        let line = self.expect()?;
        self.unquote(&line)
    }

    fn unquote(&self, line: &str) -> Result<String, FlatfileError> {
        unquote(line).ok_or_else(|| self.malformed("bad quoted string"))
    }

    /// A lock body: zero or more raw lines terminated by a lone `-`.
    fn lock_body(&mut self) -> Result<String, FlatfileError> {
        let mut body = String::new();
        loop {
            let line = self.expect()?;
            if line == "-" {
                return Ok(body);
            }
            if !body.is_empty() {
                body.push('\n');
            }
            body.push_str(&line);
        }
    }

    fn terminator(&mut self) -> Result<(), FlatfileError> {
        let line = self.expect()?;
        if line == "<" {
            Ok(())
        } else {
            Err(self.malformed("expected record terminator"))
        }
    }

    fn malformed(&self, reason: impl std::fmt::Display) -> FlatfileError {
        FlatfileError::malformed(self.line, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ComsysData {
        ComsysData {
            channels: vec![Channel {
                name: "Public".into(),
                owner: 1,
                flags: 0,
                charge: 0,
                charge_collected: 0,
                num_sent: 42,
                description: "general chatter".into(),
                header: "\x1b[36m[Public]\x1b[0m".into(),
                join_lock: String::new(),
                transmit_lock: "#1".into(),
                receive_lock: String::new(),
            }],
            aliases: vec![ChanAlias {
                player: 3,
                channel: "Public".into(),
                alias: "pub".into(),
                title: "the regular".into(),
                listening: true,
            }],
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let data = sample();

        let mut buf = Vec::new();
        write(&data, &mut buf).unwrap();

        let loaded = read(buf.as_slice()).unwrap();
        assert_eq!(loaded, data);
    }

    #[test]
    fn header_esc_conversion() {
        let text = concat!(
            "+V4\n",
            "\"Public\"\n",
            "1\n0\n0\n0\n0\n",
            "\"general chatter\"\n",
            "\"\\e[36m[Public]\\e[0m\"\n",
            "-\n-\n-\n",
            "<\n",
            "+V1\n",
            "3\n",
            "\"Public\"\n",
            "\"pub\"\n",
            "\"\"\n",
            "1\n",
            "<\n",
            "*** END OF DUMP ***\n",
        );

        let data = read(text.as_bytes()).unwrap();
        assert_eq!(data.channels.len(), 1);
        assert_eq!(data.aliases.len(), 1);

        let channel = &data.channels[0];
        assert_eq!(channel.name, "Public");
        assert_eq!(channel.owner, 1);
        assert!(channel.header.starts_with('\x1b'));

        let alias = &data.aliases[0];
        assert_eq!(alias.player, 3);
        assert_eq!(alias.alias, "pub");
        assert!(alias.listening);
    }

    #[test]
    fn channels_without_aliases_parse() {
        let text = concat!(
            "+V4\n",
            "\"Softcode\"\n",
            "1\n0\n0\n0\n0\n",
            "\"\"\n",
            "\"\"\n",
            "-\n-\n-\n",
            "<\n",
            "*** END OF DUMP ***\n",
        );

        let data = read(text.as_bytes()).unwrap();
        assert_eq!(data.channels.len(), 1);
        assert!(data.aliases.is_empty());
    }

    #[test]
    fn truncated_file_fails() {
        let text = "+V4\n\"Public\"\n1\n0\n";
        assert!(matches!(
            read(text.as_bytes()),
            Err(FlatfileError::MissingTerminator)
        ));
    }

    #[test]
    fn apply_keys_by_lowercased_name() {
        let mut db = Database::new();
        sample().apply(&mut db);

        assert!(db.channels.contains_key("public"));
        assert!(db.chan_aliases.contains_key("3:pub"));
    }
}
