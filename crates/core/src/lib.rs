//! Traits and machinery that are common to all tinymush crates.
//!
//! Glossary:
//!  - `dbref`: integer identity of a world object. Negative values are
//!    sentinels, everything else indexes into the database.
//!  - `chain`: a singly-linked list of objects threaded through their
//!    `next` field from a parent's `contents` or `exits` head.
//!  - `sidecar`: entities (channels, mail, structs) stored in parallel
//!    tables keyed by composite strings rather than dbrefs.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use thiserror::Error;

pub mod auth;
pub mod boolexp;
pub mod config;
pub mod db;

pub use boolexp::BoolExp;
pub use config::{Config, LoggingConfig};
pub use db::Database;

/// Integer object identifier. Real objects are `>= 0`.
pub type Dbref = i64;

pub const NOTHING: Dbref = -1;
pub const AMBIGUOUS: Dbref = -2;
pub const HOME: Dbref = -3;

/// Attribute number. Numbers below 256 carry built-in semantics.
pub type AttrNum = i32;

/// First user-defined attribute number.
pub const A_USER_START: AttrNum = 256;

pub const A_OSUCC: AttrNum = 1;
pub const A_OFAIL: AttrNum = 2;
pub const A_FAIL: AttrNum = 3;
pub const A_SUCC: AttrNum = 4;
pub const A_PASS: AttrNum = 5;
pub const A_DESC: AttrNum = 6;
pub const A_STARTUP: AttrNum = 19;
pub const A_LAST: AttrNum = 30;
pub const A_LOCK: AttrNum = 42;
pub const A_SEMAPHORE: AttrNum = 47;

/// Maximum number of nodes visited when walking a contents or exit
/// chain before the walk is declared broken.
pub const CHAIN_LIMIT: usize = 50_000;

// Type bits live in the low octal digit of flags[0].
pub const TYPE_MASK: u32 = 0x7;

pub const TYPE_ROOM: u32 = 0x0;
pub const TYPE_THING: u32 = 0x1;
pub const TYPE_EXIT: u32 = 0x2;
pub const TYPE_PLAYER: u32 = 0x3;
pub const TYPE_ZONE: u32 = 0x4;
pub const TYPE_GARBAGE: u32 = 0x5;

// Word 0 flags, TinyMUSH 3.0 bit assignments.
pub const FLAG_SEETHRU: u32 = 0x0000_0008;
pub const FLAG_WIZARD: u32 = 0x0000_0010;
pub const FLAG_LINK_OK: u32 = 0x0000_0020;
pub const FLAG_DARK: u32 = 0x0000_0040;
pub const FLAG_JUMP_OK: u32 = 0x0000_0080;
pub const FLAG_STICKY: u32 = 0x0000_0100;
pub const FLAG_DESTROY_OK: u32 = 0x0000_0200;
pub const FLAG_HAVEN: u32 = 0x0000_0400;
pub const FLAG_QUIET: u32 = 0x0000_0800;
pub const FLAG_HALT: u32 = 0x0000_1000;
pub const FLAG_TRACE: u32 = 0x0000_2000;
pub const FLAG_GOING: u32 = 0x0000_4000;
pub const FLAG_MONITOR: u32 = 0x0000_8000;
pub const FLAG_MYOPIC: u32 = 0x0001_0000;
pub const FLAG_PUPPET: u32 = 0x0002_0000;
pub const FLAG_CHOWN_OK: u32 = 0x0004_0000;
pub const FLAG_ENTER_OK: u32 = 0x0008_0000;
pub const FLAG_VISUAL: u32 = 0x0010_0000;
pub const FLAG_IMMORTAL: u32 = 0x0020_0000;
pub const FLAG_HAS_STARTUP: u32 = 0x0040_0000;
pub const FLAG_OPAQUE: u32 = 0x0080_0000;
pub const FLAG_VERBOSE: u32 = 0x0100_0000;
pub const FLAG_INHERIT: u32 = 0x0200_0000;
pub const FLAG_NOSPOOF: u32 = 0x0400_0000;
pub const FLAG_ROBOT: u32 = 0x0800_0000;
pub const FLAG_SAFE: u32 = 0x1000_0000;
pub const FLAG_ROYALTY: u32 = 0x2000_0000;
pub const FLAG_HEARTHRU: u32 = 0x4000_0000;
pub const FLAG_TERSE: u32 = 0x8000_0000;

// Word 1 flags (the subset the kernel consults).
pub const FLAG2_KEY: u32 = 0x0000_0001;
pub const FLAG2_ABODE: u32 = 0x0000_0002;
pub const FLAG2_FLOATING: u32 = 0x0000_0004;
pub const FLAG2_UNFINDABLE: u32 = 0x0000_0008;
pub const FLAG2_PARENT_OK: u32 = 0x0000_0010;
pub const FLAG2_LIGHT: u32 = 0x0000_0020;
pub const FLAG2_HAS_LISTEN: u32 = 0x0000_0040;
pub const FLAG2_HAS_FWDLIST: u32 = 0x0000_0080;
pub const FLAG2_SLAVE: u32 = 0x0000_8000;

/// The six object types of the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    Room,
    Thing,
    Exit,
    Player,
    Zone,
    Garbage,
}

impl ObjectType {
    pub fn from_flagword(word: u32) -> Self {
        match word & TYPE_MASK {
            TYPE_ROOM => ObjectType::Room,
            TYPE_THING => ObjectType::Thing,
            TYPE_EXIT => ObjectType::Exit,
            TYPE_PLAYER => ObjectType::Player,
            TYPE_ZONE => ObjectType::Zone,
            _ => ObjectType::Garbage,
        }
    }

    pub fn to_bits(self) -> u32 {
        match self {
            ObjectType::Room => TYPE_ROOM,
            ObjectType::Thing => TYPE_THING,
            ObjectType::Exit => TYPE_EXIT,
            ObjectType::Player => TYPE_PLAYER,
            ObjectType::Zone => TYPE_ZONE,
            ObjectType::Garbage => TYPE_GARBAGE,
        }
    }
}

impl Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ObjectType::Room => "room",
            ObjectType::Thing => "thing",
            ObjectType::Exit => "exit",
            ObjectType::Player => "player",
            ObjectType::Zone => "zone",
            ObjectType::Garbage => "garbage",
        };
        write!(f, "{name}")
    }
}

/// A single attribute value on an object. The text begins with the
/// internal `\x01owner:flags:` prefix when the attribute carries an
/// owner or per-attribute flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attr {
    pub num: AttrNum,
    pub value: String,
}

impl Attr {
    pub fn new(num: AttrNum, value: impl Into<String>) -> Self {
        Self {
            num,
            value: value.into(),
        }
    }

    /// Builds the stored representation for `text` owned by `owner` with
    /// per-attribute `flags`. A zero owner/flags pair stores bare text.
    pub fn encode(num: AttrNum, owner: Dbref, flags: u32, text: &str) -> Self {
        let value = if owner == NOTHING && flags == 0 {
            text.to_owned()
        } else {
            format!("\x01{owner}:{flags}:{text}")
        };
        Self { num, value }
    }

    /// Splits the stored value into `(owner, flags, text)`. Values
    /// without the internal prefix report `NOTHING` and zero flags.
    pub fn split(&self) -> (Dbref, u32, &str) {
        let Some(rest) = self.value.strip_prefix('\x01') else {
            return (NOTHING, 0, &self.value);
        };

        let mut parts = rest.splitn(3, ':');
        let owner = parts.next().and_then(|x| x.parse().ok());
        let flags = parts.next().and_then(|x| x.parse().ok());

        match (owner, flags, parts.next()) {
            (Some(owner), Some(flags), Some(text)) => (owner, flags, text),
            // malformed prefix: treat the whole value as text
            _ => (NOTHING, 0, &self.value),
        }
    }

    pub fn text(&self) -> &str {
        self.split().2
    }
}

/// Definition of an attribute: its number, name and flags. Definitions
/// are append-only within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrDef {
    pub num: AttrNum,
    pub name: String,
    pub flags: u32,
}

/// The unit of world state. All references to other objects are dbrefs,
/// never in-memory pointers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub dbref: Dbref,
    pub name: String,

    pub location: Dbref,
    pub contents: Dbref,
    pub exits: Dbref,
    pub next: Dbref,
    pub link: Dbref,

    pub owner: Dbref,
    pub parent: Dbref,
    pub zone: Dbref,

    pub pennies: i64,
    pub flags: [u32; 3],
    pub powers: [u32; 2],

    pub last_access: i64,
    pub last_mod: i64,

    pub lock: Option<BoolExp>,
    pub attrs: Vec<Attr>,
}

impl Object {
    pub fn new(dbref: Dbref, typ: ObjectType, name: impl Into<String>) -> Self {
        Self {
            dbref,
            name: name.into(),
            location: NOTHING,
            contents: NOTHING,
            exits: NOTHING,
            next: NOTHING,
            link: NOTHING,
            owner: NOTHING,
            parent: NOTHING,
            zone: NOTHING,
            pennies: 0,
            flags: [typ.to_bits(), 0, 0],
            powers: [0, 0],
            last_access: 0,
            last_mod: 0,
            lock: None,
            attrs: Vec::new(),
        }
    }

    pub fn typ(&self) -> ObjectType {
        ObjectType::from_flagword(self.flags[0])
    }

    pub fn is_player(&self) -> bool {
        self.typ() == ObjectType::Player
    }

    pub fn is_going(&self) -> bool {
        self.flags[0] & FLAG_GOING != 0
    }

    pub fn has_flag(&self, word: usize, bit: u32) -> bool {
        self.flags[word] & bit != 0
    }

    pub fn set_flag(&mut self, word: usize, bit: u32, on: bool) {
        if on {
            self.flags[word] |= bit;
        } else {
            self.flags[word] &= !bit;
        }
    }

    /// Looks up an attribute by number.
    pub fn attr(&self, num: AttrNum) -> Option<&Attr> {
        self.attrs.iter().find(|a| a.num == num)
    }

    /// Sets or replaces an attribute, keeping numbers unique within the
    /// list. An empty value removes the attribute.
    pub fn set_attr(&mut self, attr: Attr) {
        if attr.value.is_empty() {
            self.attrs.retain(|a| a.num != attr.num);
            return;
        }

        match self.attrs.iter_mut().find(|a| a.num == attr.num) {
            Some(slot) => *slot = attr,
            None => self.attrs.push(attr),
        }
    }

    pub fn remove_attr(&mut self, num: AttrNum) {
        self.attrs.retain(|a| a.num != num);
    }

    /// All non-sentinel references held by this object, for invariant
    /// checks (I1).
    pub fn references(&self) -> impl Iterator<Item = Dbref> + '_ {
        [
            self.location,
            self.contents,
            self.exits,
            self.next,
            self.link,
            self.owner,
            self.parent,
            self.zone,
        ]
        .into_iter()
        .filter(|r| *r >= 0)
    }
}

/// A chat channel, keyed in the store by its lower-cased name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    pub owner: Dbref,
    pub flags: u32,
    pub charge: i64,
    pub charge_collected: i64,
    pub num_sent: i64,
    pub description: String,
    pub header: String,
    pub join_lock: String,
    pub transmit_lock: String,
    pub receive_lock: String,
}

/// A player's alias onto a channel, keyed by `player:alias`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChanAlias {
    pub player: Dbref,
    pub channel: String,
    pub alias: String,
    pub title: String,
    pub listening: bool,
}

/// A user-defined record schema, keyed by `player:name`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StructDef {
    pub player: Dbref,
    pub name: String,
    pub components: Vec<String>,
    pub types: Vec<String>,
    pub defaults: Vec<String>,
    pub delimiter: String,
}

/// An instance of a struct schema, keyed by `player:name`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StructInstance {
    pub player: Dbref,
    pub name: String,
    pub def_name: String,
    pub values: Vec<String>,
}

/// One message in a player's mail folder, keyed by `recipient:id`.
/// Message ids are per-recipient.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MailMessage {
    pub recipient: Dbref,
    pub id: i64,
    pub sender: Dbref,
    pub subject: String,
    pub body: String,
    pub sent_at: i64,
    pub flags: u32,
}

/// Composite key for per-player sidecar tables. The name portion is
/// lower-cased so lookups are case-insensitive.
pub fn composite_key(player: Dbref, name: &str) -> String {
    format!("{player}:{}", name.to_lowercase())
}

pub fn mail_key(recipient: Dbref, id: i64) -> String {
    format!("{recipient}:{id}")
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("corrupt store record: {0}")]
    Corrupt(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("object #{0} not found")]
    NotFound(Dbref),
}

impl StoreError {
    pub fn io<T>(value: T) -> Self
    where
        T: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        StoreError::Io(value.into())
    }
}

#[derive(Debug, Error)]
pub enum FlatfileError {
    #[error("malformed flatfile at line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("flatfile ended before the end-of-dump sentinel")]
    MissingTerminator,

    #[error("unsupported flatfile version {0}")]
    UnsupportedVersion(u32),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlatfileError {
    pub fn malformed(line: usize, reason: impl Display) -> Self {
        FlatfileError::Malformed {
            line,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive entry {0} failed checksum validation")]
    Corrupt(String),

    #[error("archive entry {0} escapes the extraction root")]
    Path(String),

    #[error("archive has no manifest")]
    MissingManifest,

    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("function invocation limit exceeded")]
    QuotaExceeded,

    #[error("output limit exceeded")]
    OutputExceeded,

    #[error("permission denied")]
    PermissionDenied,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transient i/o: {0}")]
    Transient(String),

    #[error("command error: {0}")]
    Command(String),
}

impl QueueError {
    /// The dbref-prefixed soft error surfaced to players.
    pub fn user_visible(&self) -> String {
        match self {
            QueueError::QuotaExceeded | QueueError::OutputExceeded => {
                "#-1 LIMIT EXCEEDED".to_owned()
            }
            QueueError::PermissionDenied => "#-1 PERMISSION DENIED".to_owned(),
            QueueError::NotFound(_) => "#-1 NOT FOUND".to_owned(),
            QueueError::Transient(_) => "#-1 INTERNAL ERROR".to_owned(),
            QueueError::Command(reason) => format!("#-1 {reason}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to bind listener")]
    BindError(std::io::Error),

    #[error("failed to shutdown")]
    ShutdownError(std::io::Error),

    #[error("tls configuration error: {0}")]
    TlsConfig(String),

    #[error(transparent)]
    Internal(#[from] Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("flatfile error: {0}")]
    Flatfile(#[from] FlatfileError),

    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("inconsistent state: {0}")]
    InconsistentState(String),
}

#[trait_variant::make(Send)]
pub trait CancelToken: Send + Sync + 'static + Clone {
    async fn cancelled(&self);
}

/// A long-running service driver. Drivers receive a cloneable handle to
/// the running game and a cancellation token; they exit cleanly when the
/// token fires.
#[trait_variant::make(Send)]
pub trait Driver<H: Clone + Send + Sync + 'static, C: CancelToken>: Send + Sync + 'static {
    type Config: Clone;

    async fn run(config: Self::Config, handle: H, cancel: C) -> Result<(), ServeError>;
}

/// Aggregate state reported by the admin panel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatus {
    pub mud_name: String,
    pub uptime_secs: u64,
    pub object_count: usize,
    pub connected_players: usize,
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhoEntry {
    pub player: Dbref,
    pub name: String,
    pub addr: String,
    pub conn_secs: u64,
    pub idle_secs: u64,
    pub transport: String,
}

/// The seam between the admin panel and the running server. Read-only
/// calls answer from snapshots; everything else is marshalled onto the
/// command queue by the implementation.
pub trait ServerController: Send + Sync + 'static {
    fn status(&self) -> ServerStatus;
    fn who(&self) -> Vec<WhoEntry>;
    fn broadcast(&self, text: &str);
    fn enqueue(&self, executor: Dbref, command: &str);
    fn trigger_archive(&self);
    fn shutdown(&self, grace_secs: u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_bits_round_trip() {
        for typ in [
            ObjectType::Room,
            ObjectType::Thing,
            ObjectType::Exit,
            ObjectType::Player,
            ObjectType::Zone,
            ObjectType::Garbage,
        ] {
            assert_eq!(ObjectType::from_flagword(typ.to_bits()), typ);
        }

        // type bits survive alongside flag bits
        let word = TYPE_PLAYER | FLAG_WIZARD | FLAG_DARK;
        assert_eq!(ObjectType::from_flagword(word), ObjectType::Player);
    }

    #[test]
    fn attr_prefix_round_trip() {
        let attr = Attr::encode(A_DESC, 1, 0x10, "a dusty room");
        assert_eq!(attr.split(), (1, 0x10, "a dusty room"));

        let bare = Attr::new(A_DESC, "plain text");
        assert_eq!(bare.split(), (NOTHING, 0, "plain text"));
    }

    #[test]
    fn attr_set_keeps_numbers_unique() {
        let mut obj = Object::new(2, ObjectType::Thing, "widget");
        obj.set_attr(Attr::new(A_DESC, "first"));
        obj.set_attr(Attr::new(A_DESC, "second"));

        assert_eq!(obj.attrs.len(), 1);
        assert_eq!(obj.attr(A_DESC).unwrap().value, "second");

        obj.set_attr(Attr::new(A_DESC, ""));
        assert!(obj.attr(A_DESC).is_none());
    }

    #[test]
    fn quota_errors_surface_as_soft_codes() {
        assert_eq!(QueueError::QuotaExceeded.user_visible(), "#-1 LIMIT EXCEEDED");
        assert_eq!(
            QueueError::PermissionDenied.user_visible(),
            "#-1 PERMISSION DENIED"
        );
        assert_eq!(
            QueueError::NotFound("ball".into()).user_visible(),
            "#-1 NOT FOUND"
        );
    }
}
