//! The in-memory object database: an arena keyed by dbref. Objects
//! reference each other only by dbref, so cycle-prone structures
//! (contents chains, parent chains) are always walked with a visited-set
//! guard.

use std::collections::{HashMap, HashSet};
use tracing::warn;

use crate::{
    Attr, AttrDef, AttrNum, Channel, ChanAlias, Dbref, MailMessage, Object, ObjectType, StructDef,
    StructInstance, A_DESC, A_FAIL, A_LAST, A_LOCK, A_OFAIL, A_OSUCC, A_PASS, A_SEMAPHORE,
    A_STARTUP, A_SUCC, A_USER_START, CHAIN_LIMIT, NOTHING,
};

/// Top-level container for world state. The database exclusively owns
/// every object; mutation happens only from the command-queue runner.
#[derive(Debug, Clone)]
pub struct Database {
    pub objects: HashMap<Dbref, Object>,

    pub attr_names: HashMap<AttrNum, AttrDef>,
    pub attr_by_name: HashMap<String, AttrNum>,

    pub version: u32,
    pub format: u32,
    pub flags: u32,
    /// High-water dbref + 1.
    pub size: Dbref,
    /// Next user-defined attribute number to allocate.
    pub next_attr: AttrNum,
    pub record_players: i64,

    /// Lower-cased player name -> dbref.
    pub players: HashMap<String, Dbref>,

    pub channels: HashMap<String, Channel>,
    pub chan_aliases: HashMap<String, ChanAlias>,
    pub struct_defs: HashMap<String, StructDef>,
    pub struct_insts: HashMap<String, StructInstance>,
    pub mail: HashMap<String, MailMessage>,
}

const STANDARD_ATTRS: &[(AttrNum, &str)] = &[
    (A_OSUCC, "OSUCC"),
    (A_OFAIL, "OFAIL"),
    (A_FAIL, "FAIL"),
    (A_SUCC, "SUCC"),
    (A_PASS, "PASS"),
    (A_DESC, "DESC"),
    (A_STARTUP, "STARTUP"),
    (A_LAST, "LAST"),
    (A_LOCK, "LOCK"),
    (A_SEMAPHORE, "SEMAPHORE"),
];

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl Database {
    pub fn new() -> Self {
        let mut db = Self {
            objects: HashMap::new(),
            attr_names: HashMap::new(),
            attr_by_name: HashMap::new(),
            version: 1,
            format: 1,
            flags: 0,
            size: 0,
            next_attr: A_USER_START,
            record_players: 0,
            players: HashMap::new(),
            channels: HashMap::new(),
            chan_aliases: HashMap::new(),
            struct_defs: HashMap::new(),
            struct_insts: HashMap::new(),
            mail: HashMap::new(),
        };

        for &(num, name) in STANDARD_ATTRS {
            db.register_attr(AttrDef {
                num,
                name: name.to_owned(),
                flags: 0,
            });
        }

        db
    }

    pub fn get(&self, dbref: Dbref) -> Option<&Object> {
        self.objects.get(&dbref)
    }

    pub fn get_mut(&mut self, dbref: Dbref) -> Option<&mut Object> {
        self.objects.get_mut(&dbref)
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Inserts or replaces an object, keeping the player-name and size
    /// bookkeeping current.
    pub fn put(&mut self, obj: Object) {
        if obj.dbref >= self.size {
            self.size = obj.dbref + 1;
        }

        if let Some(old) = self.objects.get(&obj.dbref) {
            if old.is_player() && !old.is_going() {
                self.players.remove(&old.name.to_lowercase());
            }
        }

        if obj.is_player() && !obj.is_going() {
            self.players.insert(obj.name.to_lowercase(), obj.dbref);
        }

        self.objects.insert(obj.dbref, obj);
    }

    /// Allocates a fresh object at the high-water mark.
    pub fn new_object(&mut self, typ: ObjectType, name: impl Into<String>) -> Dbref {
        let dbref = self.size;
        self.put(Object::new(dbref, typ, name));
        dbref
    }

    /// Registers an attribute definition in both indexes. Definitions
    /// are append-only within a run.
    pub fn register_attr(&mut self, def: AttrDef) {
        self.attr_by_name.insert(def.name.to_lowercase(), def.num);
        if def.num >= self.next_attr {
            self.next_attr = def.num + 1;
        }
        self.attr_names.insert(def.num, def);
    }

    /// Allocates a new user-defined attribute number for `name`.
    pub fn define_attr(&mut self, name: &str, flags: u32) -> AttrNum {
        if let Some(&num) = self.attr_by_name.get(&name.to_lowercase()) {
            return num;
        }

        let num = self.next_attr;
        self.register_attr(AttrDef {
            num,
            name: name.to_owned(),
            flags,
        });
        num
    }

    pub fn attr_num(&self, name: &str) -> Option<AttrNum> {
        self.attr_by_name.get(&name.to_lowercase()).copied()
    }

    /// Attribute text on `obj` looked up by name, prefix stripped.
    pub fn attr_text_by_name(&self, obj: &Object, name: &str) -> Option<String> {
        let num = self.attr_num(name)?;
        obj.attr(num).map(|a| a.text().to_owned())
    }

    /// Case-insensitive player lookup; also accepts `#dbref` literals.
    pub fn resolve_name(&self, name: &str) -> Dbref {
        if let Some(num) = name.strip_prefix('#') {
            return num.parse().unwrap_or(NOTHING);
        }

        self.players
            .get(&name.to_lowercase())
            .copied()
            .unwrap_or(NOTHING)
    }

    /// True when `holder`'s contents chain includes `target`.
    pub fn carries(&self, holder: Dbref, target: Dbref) -> bool {
        let head = match self.get(holder) {
            Some(o) => o.contents,
            None => return false,
        };
        self.chain_iter(head).any(|r| r == target)
    }

    /// Walks a `next`-threaded chain from `head`, guarding against
    /// cycles and runaway lengths.
    pub fn chain_iter(&self, head: Dbref) -> ChainIter<'_> {
        ChainIter {
            db: self,
            cursor: head,
            seen: HashSet::new(),
        }
    }

    /// Boot-time repair: truncate every contents and exit chain at the
    /// last valid node when it reaches a missing object, cycles, or
    /// exceeds the length cap. Returns the number of repairs applied.
    pub fn check_contents(&mut self) -> usize {
        let mut repairs = 0;
        let parents: Vec<Dbref> = self.objects.keys().copied().collect();

        for parent in parents {
            repairs += self.repair_chain(parent, ChainKind::Contents);
            repairs += self.repair_chain(parent, ChainKind::Exits);
        }

        repairs
    }

    fn repair_chain(&mut self, parent: Dbref, kind: ChainKind) -> usize {
        let head = match self.get(parent) {
            Some(o) => kind.head(o),
            None => return 0,
        };

        if head == NOTHING {
            return 0;
        }

        let mut seen = HashSet::new();
        let mut prev = NOTHING;
        let mut cursor = head;

        while cursor != NOTHING {
            let broken = !self.objects.contains_key(&cursor)
                || !seen.insert(cursor)
                || seen.len() > CHAIN_LIMIT;

            if broken {
                warn!(
                    parent,
                    node = cursor,
                    chain = kind.name(),
                    "truncating broken chain"
                );

                if prev == NOTHING {
                    if let Some(o) = self.get_mut(parent) {
                        kind.set_head(o, NOTHING);
                    }
                } else if let Some(o) = self.get_mut(prev) {
                    o.next = NOTHING;
                }

                return 1;
            }

            prev = cursor;
            cursor = self.get(cursor).map(|o| o.next).unwrap_or(NOTHING);
        }

        0
    }

    /// Splices `obj` onto the head of `dest`'s contents chain and
    /// updates its location, detaching it from its old container first.
    pub fn move_to(&mut self, obj: Dbref, dest: Dbref) {
        self.detach(obj);

        let old_head = match self.get(dest) {
            Some(o) => o.contents,
            None => return,
        };

        if let Some(o) = self.get_mut(obj) {
            o.next = old_head;
            o.location = dest;
        }
        if let Some(d) = self.get_mut(dest) {
            d.contents = obj;
        }
    }

    /// Removes `obj` from its container's contents chain.
    fn detach(&mut self, obj: Dbref) {
        let loc = match self.get(obj) {
            Some(o) => o.location,
            None => return,
        };

        if loc == NOTHING {
            return;
        }

        let head = match self.get(loc) {
            Some(o) => o.contents,
            None => return,
        };

        if head == obj {
            let next = self.get(obj).map(|o| o.next).unwrap_or(NOTHING);
            if let Some(l) = self.get_mut(loc) {
                l.contents = next;
            }
        } else {
            let prev = self.chain_iter(head).find(|&r| {
                self.get(r).map(|o| o.next) == Some(obj)
            });
            if let Some(prev) = prev {
                let next = self.get(obj).map(|o| o.next).unwrap_or(NOTHING);
                if let Some(p) = self.get_mut(prev) {
                    p.next = next;
                }
            }
        }

        if let Some(o) = self.get_mut(obj) {
            o.next = NOTHING;
            o.location = NOTHING;
        }
    }

    /// Sets an attribute on an object, registering the owner prefix.
    pub fn set_attr(&mut self, obj: Dbref, num: AttrNum, owner: Dbref, flags: u32, text: &str) {
        if let Some(o) = self.get_mut(obj) {
            o.set_attr(Attr::encode(num, owner, flags, text));
        }
    }
}

enum ChainKind {
    Contents,
    Exits,
}

impl ChainKind {
    fn head(&self, obj: &Object) -> Dbref {
        match self {
            ChainKind::Contents => obj.contents,
            ChainKind::Exits => obj.exits,
        }
    }

    fn set_head(&self, obj: &mut Object, value: Dbref) {
        match self {
            ChainKind::Contents => obj.contents = value,
            ChainKind::Exits => obj.exits = value,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ChainKind::Contents => "contents",
            ChainKind::Exits => "exits",
        }
    }
}

/// Iterator over a `next`-threaded chain. Stops at `NOTHING`, on a
/// missing object, on the first revisit, or at the length cap.
pub struct ChainIter<'a> {
    db: &'a Database,
    cursor: Dbref,
    seen: HashSet<Dbref>,
}

impl Iterator for ChainIter<'_> {
    type Item = Dbref;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == NOTHING || self.seen.len() >= CHAIN_LIMIT {
            return None;
        }

        if !self.seen.insert(self.cursor) {
            return None;
        }

        let current = self.cursor;
        self.cursor = self
            .db
            .get(current)
            .map(|o| o.next)
            .unwrap_or(NOTHING);

        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_object_world() -> Database {
        let mut db = Database::new();

        let mut room = Object::new(0, ObjectType::Room, "Limbo");
        let mut wizard = Object::new(1, ObjectType::Player, "Wizard");
        let mut thing = Object::new(2, ObjectType::Thing, "ball");

        wizard.location = 0;
        wizard.next = 2;
        thing.location = 0;
        room.contents = 1;
        wizard.owner = 1;
        thing.owner = 1;

        db.put(room);
        db.put(wizard);
        db.put(thing);
        db
    }

    #[test]
    fn chain_walk_visits_contents() {
        let db = three_object_world();
        let head = db.get(0).unwrap().contents;
        let refs: Vec<Dbref> = db.chain_iter(head).collect();
        assert_eq!(refs, vec![1, 2]);
    }

    #[test]
    fn chain_walk_stops_on_cycle() {
        let mut db = three_object_world();
        // point the tail back at the head
        db.get_mut(2).unwrap().next = 1;

        let refs: Vec<Dbref> = db.chain_iter(1).collect();
        assert_eq!(refs, vec![1, 2]);
    }

    #[test]
    fn repair_truncates_cycle() {
        let mut db = three_object_world();
        db.get_mut(2).unwrap().next = 1;

        let repairs = db.check_contents();
        assert_eq!(repairs, 1);
        assert_eq!(db.get(2).unwrap().next, NOTHING);

        // a second pass finds nothing left to fix
        assert_eq!(db.check_contents(), 0);
    }

    #[test]
    fn repair_truncates_missing_node() {
        let mut db = three_object_world();
        db.get_mut(2).unwrap().next = 99;

        assert_eq!(db.check_contents(), 1);
        assert_eq!(db.get(2).unwrap().next, NOTHING);
    }

    #[test]
    fn repair_resets_bad_head() {
        let mut db = three_object_world();
        db.get_mut(0).unwrap().contents = 77;

        assert_eq!(db.check_contents(), 1);
        assert_eq!(db.get(0).unwrap().contents, NOTHING);
    }

    #[test]
    fn player_index_follows_renames() {
        let mut db = three_object_world();
        assert_eq!(db.resolve_name("wizard"), 1);
        assert_eq!(db.resolve_name("WIZARD"), 1);

        let mut wizard = db.get(1).unwrap().clone();
        wizard.name = "Merlin".into();
        db.put(wizard);

        assert_eq!(db.resolve_name("wizard"), NOTHING);
        assert_eq!(db.resolve_name("merlin"), 1);
        assert_eq!(db.resolve_name("#1"), 1);
    }

    #[test]
    fn move_to_splices_chains() {
        let mut db = three_object_world();
        let hall = db.new_object(ObjectType::Room, "Hall");

        db.move_to(2, hall);

        assert_eq!(db.get(2).unwrap().location, hall);
        let hall_contents: Vec<Dbref> = db.chain_iter(db.get(hall).unwrap().contents).collect();
        assert_eq!(hall_contents, vec![2]);

        let limbo_contents: Vec<Dbref> = db.chain_iter(db.get(0).unwrap().contents).collect();
        assert_eq!(limbo_contents, vec![1]);
    }

    #[test]
    fn define_attr_allocates_above_user_start() {
        let mut db = Database::new();
        let num = db.define_attr("VRML_URL", 0);
        assert!(num >= A_USER_START);
        assert_eq!(db.attr_num("vrml_url"), Some(num));
        // repeated definition returns the existing number
        assert_eq!(db.define_attr("VRML_URL", 0), num);
    }
}
