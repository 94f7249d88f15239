//! String quoting for flatfile records. Strings are wrapped in double
//! quotes; inside, `\"`, `\\`, `\n`, `\r` and `\t` are recognised and
//! every other byte is literal, ESC included (ANSI colour survives).

/// Wraps `text` in quotes, escaping as needed.
pub fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

/// Strips the surrounding quotes and resolves escapes. Returns `None`
/// when the input is not a complete quoted string.
pub fn unquote(text: &str) -> Option<String> {
    let inner = text.strip_prefix('"')?;

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                // closing quote must end the input
                return chars.next().is_none().then_some(out);
            }
            '\\' => match chars.next() {
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some('"') => out.push('"'),
                Some('\\') => out.push('\\'),
                // unrecognised escapes keep their backslash verbatim
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => return None,
            },
            other => out.push(other),
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        for s in [
            "",
            "plain",
            "with \"quotes\"",
            "back\\slash",
            "line\nbreak\ttab",
            "ansi \x1b[1mbold\x1b[0m",
        ] {
            assert_eq!(unquote(&quote(s)).as_deref(), Some(s));
        }
    }

    #[test]
    fn rejects_incomplete() {
        assert_eq!(unquote("\"open"), None);
        assert_eq!(unquote("bare"), None);
        assert_eq!(unquote("\"trail\" x"), None);
        assert_eq!(unquote("\"bad\\"), None);
    }

    #[test]
    fn esc_bytes_pass_through() {
        let s = "\x1b[36mheader\x1b[0m";
        let quoted = quote(s);
        assert!(quoted.contains('\x1b'));
        assert_eq!(unquote(&quoted).unwrap(), s);
    }
}
