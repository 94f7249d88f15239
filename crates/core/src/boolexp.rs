//! Lock expressions: the boolean predicate trees that gate actions
//! against objects. The textual form is the legacy TinyMUSH syntax and
//! round-trips through [`BoolExp::parse`] and [`Display`].

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use thiserror::Error;

use crate::{Database, Dbref, NOTHING};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockParseError {
    #[error("unexpected end of lock expression")]
    UnexpectedEnd,

    #[error("unexpected character {0:?} at offset {1}")]
    UnexpectedChar(char, usize),

    #[error("bad dbref in lock expression")]
    BadRef,
}

/// A parsed lock. Leaf nodes reference other objects by dbref or match
/// attribute values; inner nodes combine them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BoolExp {
    /// `#n` — satisfied by the object itself or anything it carries.
    Const(Dbref),
    /// `=#n` — satisfied only by the object itself.
    Is(Dbref),
    /// `+#n` — satisfied by carrying the object.
    Carry(Dbref),
    /// `$#n` — satisfied when the owner matches.
    Owner(Dbref),
    /// `@#n` — defer to the named object's own lock.
    Indirect(Dbref),
    /// `name:pattern` — wildcard match against an attribute value.
    Attr(String, String),
    /// `name/pattern` — match against the evaluated attribute.
    Eval(String, String),
    Not(Box<BoolExp>),
    And(Box<BoolExp>, Box<BoolExp>),
    Or(Box<BoolExp>, Box<BoolExp>),
}

impl BoolExp {
    pub fn parse(input: &str) -> Result<Self, LockParseError> {
        let mut p = Parser {
            chars: input.char_indices().peekable(),
            input,
        };
        let exp = p.parse_or()?;
        p.skip_ws();
        match p.chars.peek() {
            None => Ok(exp),
            Some(&(at, c)) => Err(LockParseError::UnexpectedChar(c, at)),
        }
    }

    /// True when `player` satisfies the lock. Indirect locks recurse
    /// through the referenced object with a depth guard.
    pub fn eval(&self, db: &Database, player: Dbref) -> bool {
        self.eval_depth(db, player, 0)
    }

    fn eval_depth(&self, db: &Database, player: Dbref, depth: usize) -> bool {
        // indirect chains can be cyclic in a hostile database
        if depth > 32 {
            return false;
        }

        match self {
            BoolExp::Const(target) => player == *target || db.carries(player, *target),
            BoolExp::Is(target) => player == *target,
            BoolExp::Carry(target) => db.carries(player, *target),
            BoolExp::Owner(target) => {
                let owner = db.get(*target).map(|o| o.owner).unwrap_or(NOTHING);
                db.get(player).map(|o| o.owner) == Some(owner) && owner != NOTHING
            }
            BoolExp::Indirect(target) => db
                .get(*target)
                .and_then(|o| o.lock.as_ref())
                .map(|lock| lock.eval_depth(db, player, depth + 1))
                .unwrap_or(true),
            BoolExp::Attr(name, pattern) => db
                .get(player)
                .and_then(|o| db.attr_text_by_name(o, name))
                .map(|text| wild_match(pattern, &text))
                .unwrap_or(false),
            // evaluation belongs to the soft-code layer; unevaluated
            // attribute text is matched as-is
            BoolExp::Eval(name, pattern) => db
                .get(player)
                .and_then(|o| db.attr_text_by_name(o, name))
                .map(|text| wild_match(pattern, &text))
                .unwrap_or(false),
            BoolExp::Not(inner) => !inner.eval_depth(db, player, depth),
            BoolExp::And(a, b) => {
                a.eval_depth(db, player, depth) && b.eval_depth(db, player, depth)
            }
            BoolExp::Or(a, b) => a.eval_depth(db, player, depth) || b.eval_depth(db, player, depth),
        }
    }
}

impl Display for BoolExp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BoolExp::Const(r) => write!(f, "#{r}"),
            BoolExp::Is(r) => write!(f, "=#{r}"),
            BoolExp::Carry(r) => write!(f, "+#{r}"),
            BoolExp::Owner(r) => write!(f, "$#{r}"),
            BoolExp::Indirect(r) => write!(f, "@#{r}"),
            BoolExp::Attr(name, pattern) => write!(f, "{name}:{pattern}"),
            BoolExp::Eval(name, pattern) => write!(f, "{name}/{pattern}"),
            BoolExp::Not(inner) => match inner.as_ref() {
                BoolExp::And(..) | BoolExp::Or(..) => write!(f, "!({inner})"),
                _ => write!(f, "!{inner}"),
            },
            BoolExp::And(a, b) => {
                write_operand(f, a, true)?;
                write!(f, "&")?;
                write_operand(f, b, true)
            }
            BoolExp::Or(a, b) => {
                write_operand(f, a, false)?;
                write!(f, "|")?;
                write_operand(f, b, false)
            }
        }
    }
}

fn write_operand(
    f: &mut std::fmt::Formatter<'_>,
    exp: &BoolExp,
    in_and: bool,
) -> std::fmt::Result {
    // `|` binds looser than `&`, so an or-node inside an and-node needs
    // parens to survive a round trip
    let needs_parens = in_and && matches!(exp, BoolExp::Or(..));
    if needs_parens {
        write!(f, "({exp})")
    } else {
        write!(f, "{exp}")
    }
}

/// Case-insensitive wildcard match supporting `*` and `?`.
fn wild_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[char], t: &[char]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some('*'), _) => inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..])),
            (Some('?'), Some(_)) => inner(&p[1..], &t[1..]),
            (Some(pc), Some(tc)) => {
                pc.eq_ignore_ascii_case(tc) && inner(&p[1..], &t[1..])
            }
            _ => false,
        }
    }

    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    inner(&p, &t)
}

struct Parser<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    input: &'a str,
}

impl Parser<'_> {
    fn skip_ws(&mut self) {
        while matches!(self.chars.peek(), Some(&(_, c)) if c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn parse_or(&mut self) -> Result<BoolExp, LockParseError> {
        let mut left = self.parse_and()?;
        loop {
            self.skip_ws();
            if matches!(self.chars.peek(), Some(&(_, '|'))) {
                self.chars.next();
                let right = self.parse_and()?;
                left = BoolExp::Or(Box::new(left), Box::new(right));
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_and(&mut self) -> Result<BoolExp, LockParseError> {
        let mut left = self.parse_not()?;
        loop {
            self.skip_ws();
            if matches!(self.chars.peek(), Some(&(_, '&'))) {
                self.chars.next();
                let right = self.parse_not()?;
                left = BoolExp::And(Box::new(left), Box::new(right));
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_not(&mut self) -> Result<BoolExp, LockParseError> {
        self.skip_ws();
        if matches!(self.chars.peek(), Some(&(_, '!'))) {
            self.chars.next();
            let inner = self.parse_not()?;
            return Ok(BoolExp::Not(Box::new(inner)));
        }
        self.parse_prim()
    }

    fn parse_prim(&mut self) -> Result<BoolExp, LockParseError> {
        self.skip_ws();
        let &(at, c) = self.chars.peek().ok_or(LockParseError::UnexpectedEnd)?;

        match c {
            '(' => {
                self.chars.next();
                let inner = self.parse_or()?;
                self.skip_ws();
                match self.chars.next() {
                    Some((_, ')')) => Ok(inner),
                    Some((at, c)) => Err(LockParseError::UnexpectedChar(c, at)),
                    None => Err(LockParseError::UnexpectedEnd),
                }
            }
            '@' => {
                self.chars.next();
                Ok(BoolExp::Indirect(self.parse_ref()?))
            }
            '+' => {
                self.chars.next();
                Ok(BoolExp::Carry(self.parse_ref()?))
            }
            '=' => {
                self.chars.next();
                Ok(BoolExp::Is(self.parse_ref()?))
            }
            '$' => {
                self.chars.next();
                Ok(BoolExp::Owner(self.parse_ref()?))
            }
            '#' => Ok(BoolExp::Const(self.parse_ref()?)),
            c if is_word_char(c) => self.parse_attr(),
            other => Err(LockParseError::UnexpectedChar(other, at)),
        }
    }

    fn parse_ref(&mut self) -> Result<Dbref, LockParseError> {
        self.skip_ws();
        match self.chars.next() {
            Some((_, '#')) => {}
            Some((at, c)) => return Err(LockParseError::UnexpectedChar(c, at)),
            None => return Err(LockParseError::UnexpectedEnd),
        }

        let mut digits = String::new();
        if matches!(self.chars.peek(), Some(&(_, '-'))) {
            digits.push('-');
            self.chars.next();
        }
        while matches!(self.chars.peek(), Some(&(_, c)) if c.is_ascii_digit()) {
            digits.push(self.chars.next().map(|(_, c)| c).unwrap_or_default());
        }

        digits.parse().map_err(|_| LockParseError::BadRef)
    }

    fn parse_attr(&mut self) -> Result<BoolExp, LockParseError> {
        let start = match self.chars.peek() {
            Some(&(at, _)) => at,
            None => return Err(LockParseError::UnexpectedEnd),
        };

        let mut sep = None;
        let mut sep_at = start;
        while let Some(&(at, c)) = self.chars.peek() {
            if c == ':' || c == '/' {
                sep = Some(c);
                sep_at = at;
                self.chars.next();
                break;
            }
            if !is_word_char(c) {
                break;
            }
            self.chars.next();
        }

        let sep = match sep {
            Some(s) => s,
            None => {
                return Err(LockParseError::UnexpectedChar(
                    self.input[start..].chars().next().unwrap_or(' '),
                    start,
                ))
            }
        };

        let name = self.input[start..sep_at].to_owned();

        // pattern runs until an operator or close paren at this level
        let pat_start = sep_at + sep.len_utf8();
        let mut pat_end = self.input.len();
        while let Some(&(at, c)) = self.chars.peek() {
            if c == '&' || c == '|' || c == ')' {
                pat_end = at;
                break;
            }
            self.chars.next();
        }

        let pattern = self.input[pat_start..pat_end].trim().to_owned();

        match sep {
            ':' => Ok(BoolExp::Attr(name, pattern)),
            _ => Ok(BoolExp::Eval(name, pattern)),
        }
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}
