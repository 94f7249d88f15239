//! The [`MushStore`]: write-through persistence for the in-memory
//! database. Every exported operation is one atomic transaction of the
//! underlying redb file.

use itertools::Itertools as _;
use redb::{ReadTransaction, WriteTransaction};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use tinymush_core::{
    composite_key, mail_key, AttrDef, ChanAlias, Channel, Database, Dbref, MailMessage, Object,
    StructDef, StructInstance,
};

use crate::tables::{
    AttrDefsTable, ChanAliasesTable, ChannelsTable, MailTable, MetaTable, ObjectsTable,
    PlayersTable, StructDefsTable, StructInstsTable,
};
use crate::Error;

const DEFAULT_CACHE_SIZE_MB: usize = 50;

/// Objects written per transaction during a bulk import.
const IMPORT_BATCH: usize = 1_000;

/// Concrete store over a single redb file.
#[derive(Clone)]
pub struct MushStore {
    db: Arc<redb::Database>,
}

impl MushStore {
    /// Opens or creates the store file and makes sure every bucket
    /// exists.
    pub fn open(path: impl AsRef<Path>, cache_size: Option<usize>) -> Result<Self, Error> {
        let inner = redb::Database::builder()
            .set_repair_callback(|x| {
                warn!(progress = x.progress() * 100f64, "store file is repairing")
            })
            .set_cache_size(1024 * 1024 * cache_size.unwrap_or(DEFAULT_CACHE_SIZE_MB))
            .create(path)?;

        let out = Self {
            db: Arc::new(inner),
        };

        out.initialize()?;

        Ok(out)
    }

    /// Ephemeral in-memory store, used by tests.
    pub fn memory() -> Result<Self, Error> {
        let db =
            redb::Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;

        let out = Self { db: Arc::new(db) };
        out.initialize()?;

        Ok(out)
    }

    fn initialize(&self) -> Result<(), Error> {
        let wx = self.db.begin_write()?;
        MetaTable::initialize(&wx)?;
        ObjectsTable::initialize(&wx)?;
        AttrDefsTable::initialize(&wx)?;
        PlayersTable::initialize(&wx)?;
        ChannelsTable::initialize(&wx)?;
        ChanAliasesTable::initialize(&wx)?;
        StructDefsTable::initialize(&wx)?;
        StructInstsTable::initialize(&wx)?;
        MailTable::initialize(&wx)?;
        wx.commit()?;
        Ok(())
    }

    /// True when the store already holds a world.
    pub fn has_data(&self) -> Result<bool, Error> {
        let rx = self.db.begin_read()?;
        Ok(ObjectsTable::count(&rx)? > 0)
    }

    pub fn has_comsys_data(&self) -> Result<bool, Error> {
        let rx = self.db.begin_read()?;
        Ok(!ChannelsTable::is_empty(&rx)? || !ChanAliasesTable::is_empty(&rx)?)
    }

    pub fn has_struct_data(&self) -> Result<bool, Error> {
        let rx = self.db.begin_read()?;
        Ok(!StructDefsTable::is_empty(&rx)? || !StructInstsTable::is_empty(&rx)?)
    }

    pub fn has_mail_data(&self) -> Result<bool, Error> {
        let rx = self.db.begin_read()?;
        Ok(!MailTable::is_empty(&rx)?)
    }

    /// Bulk-loads a whole database, batched at [`IMPORT_BATCH`] objects
    /// per transaction. The player index is rebuilt from scratch and
    /// meta is written last so a crashed import never looks complete.
    pub fn import_from_database(&self, db: &Database) -> Result<(), Error> {
        let start = std::time::Instant::now();

        {
            let wx = self.db.begin_write()?;
            for def in db.attr_names.values().sorted_by_key(|d| d.num) {
                AttrDefsTable::put(&wx, def)?;
            }
            wx.commit()?;
        }

        let refs: Vec<Dbref> = db.objects.keys().copied().sorted().collect();
        for chunk in refs.chunks(IMPORT_BATCH) {
            let wx = self.db.begin_write()?;
            for dbref in chunk {
                if let Some(obj) = db.get(*dbref) {
                    ObjectsTable::put(&wx, obj)?;
                }
            }
            wx.commit()?;
        }

        {
            let wx = self.db.begin_write()?;
            PlayersTable::clear(&wx)?;
            for (name, dbref) in &db.players {
                PlayersTable::put(&wx, name, *dbref)?;
            }
            wx.commit()?;
        }

        {
            let wx = self.db.begin_write()?;
            for (key, channel) in &db.channels {
                ChannelsTable::put(&wx, key, channel)?;
            }
            for (key, alias) in &db.chan_aliases {
                ChanAliasesTable::put(&wx, key, alias)?;
            }
            for (key, def) in &db.struct_defs {
                StructDefsTable::put(&wx, key, def)?;
            }
            for (key, inst) in &db.struct_insts {
                StructInstsTable::put(&wx, key, inst)?;
            }
            for (key, msg) in &db.mail {
                MailTable::put(&wx, key, msg)?;
            }
            wx.commit()?;
        }

        {
            let wx = self.db.begin_write()?;
            self.write_meta(&wx, db)?;
            wx.commit()?;
        }

        info!(
            objects = db.object_count(),
            elapsed = ?start.elapsed(),
            "imported database into store"
        );

        Ok(())
    }

    fn write_meta(&self, wx: &WriteTransaction, db: &Database) -> Result<(), Error> {
        MetaTable::put(wx, MetaTable::VERSION, db.version as i64)?;
        MetaTable::put(wx, MetaTable::FORMAT, db.format as i64)?;
        MetaTable::put(wx, MetaTable::FLAGS, db.flags as i64)?;
        MetaTable::put(wx, MetaTable::SIZE, db.size)?;
        MetaTable::put(wx, MetaTable::NEXT_ATTR, db.next_attr as i64)?;
        MetaTable::put(wx, MetaTable::RECORD_PLAYERS, db.record_players)?;
        Ok(())
    }

    /// Reads meta, all attribute definitions and all objects into a
    /// fresh in-memory database. Sidecars are loaded separately by the
    /// subsystems that own them.
    pub fn load_all(&self) -> Result<Database, Error> {
        let rx = self.db.begin_read()?;

        let mut db = Database::new();

        db.version = MetaTable::get(&rx, MetaTable::VERSION)?.unwrap_or(1) as u32;
        db.format = MetaTable::get(&rx, MetaTable::FORMAT)?.unwrap_or(1) as u32;
        db.flags = MetaTable::get(&rx, MetaTable::FLAGS)?.unwrap_or(0) as u32;
        db.record_players = MetaTable::get(&rx, MetaTable::RECORD_PLAYERS)?.unwrap_or(0);

        for def in AttrDefsTable::all(&rx)? {
            db.register_attr(def);
        }

        if let Some(next_attr) = MetaTable::get(&rx, MetaTable::NEXT_ATTR)? {
            db.next_attr = next_attr as i32;
        }

        for obj in ObjectsTable::all(&rx)? {
            db.put(obj);
        }

        if let Some(size) = MetaTable::get(&rx, MetaTable::SIZE)? {
            if size > db.size {
                db.size = size;
            }
        }

        Ok(db)
    }

    pub fn get_object(&self, dbref: Dbref) -> Result<Option<Object>, Error> {
        let rx = self.db.begin_read()?;
        ObjectsTable::get(&rx, dbref)
    }

    pub fn put_object(&self, obj: &Object) -> Result<(), Error> {
        let wx = self.db.begin_write()?;
        ObjectsTable::put(&wx, obj)?;
        wx.commit()?;
        Ok(())
    }

    /// Writes several objects in one atomic transaction.
    pub fn put_objects<'a>(&self, objs: impl IntoIterator<Item = &'a Object>) -> Result<(), Error> {
        let wx = self.db.begin_write()?;
        for obj in objs {
            ObjectsTable::put(&wx, obj)?;
        }
        wx.commit()?;
        Ok(())
    }

    pub fn delete_object(&self, dbref: Dbref) -> Result<(), Error> {
        let wx = self.db.begin_write()?;
        ObjectsTable::delete(&wx, dbref)?;
        wx.commit()?;
        Ok(())
    }

    pub fn put_attr_def(&self, def: &AttrDef) -> Result<(), Error> {
        let wx = self.db.begin_write()?;
        AttrDefsTable::put(&wx, def)?;
        wx.commit()?;
        Ok(())
    }

    pub fn put_meta(&self, db: &Database) -> Result<(), Error> {
        let wx = self.db.begin_write()?;
        self.write_meta(&wx, db)?;
        wx.commit()?;
        Ok(())
    }

    /// Rewrites the player-name index entry for `obj` atomically,
    /// dropping `old_name` when the player was renamed.
    pub fn update_player_index(&self, obj: &Object, old_name: Option<&str>) -> Result<(), Error> {
        let wx = self.db.begin_write()?;

        if let Some(old) = old_name {
            PlayersTable::delete(&wx, old)?;
        }

        if obj.is_player() && !obj.is_going() {
            PlayersTable::put(&wx, &obj.name, obj.dbref)?;
        }

        wx.commit()?;
        Ok(())
    }

    pub fn lookup_player(&self, name: &str) -> Result<Option<Dbref>, Error> {
        let rx = self.db.begin_read()?;
        PlayersTable::get(&rx, name)
    }

    pub fn put_channel(&self, channel: &Channel) -> Result<(), Error> {
        let wx = self.db.begin_write()?;
        ChannelsTable::put(&wx, &channel.name.to_lowercase(), channel)?;
        wx.commit()?;
        Ok(())
    }

    pub fn get_channel(&self, name: &str) -> Result<Option<Channel>, Error> {
        let rx = self.db.begin_read()?;
        ChannelsTable::get(&rx, &name.to_lowercase())
    }

    pub fn delete_channel(&self, name: &str) -> Result<(), Error> {
        let wx = self.db.begin_write()?;
        ChannelsTable::delete(&wx, &name.to_lowercase())?;
        wx.commit()?;
        Ok(())
    }

    pub fn load_channels(&self) -> Result<Vec<Channel>, Error> {
        let rx = self.db.begin_read()?;
        Ok(ChannelsTable::all(&rx)?.into_iter().map(|(_, c)| c).collect())
    }

    pub fn put_chan_alias(&self, alias: &ChanAlias) -> Result<(), Error> {
        let wx = self.db.begin_write()?;
        ChanAliasesTable::put(&wx, &composite_key(alias.player, &alias.alias), alias)?;
        wx.commit()?;
        Ok(())
    }

    pub fn load_chan_aliases(&self) -> Result<Vec<ChanAlias>, Error> {
        let rx = self.db.begin_read()?;
        Ok(ChanAliasesTable::all(&rx)?
            .into_iter()
            .map(|(_, a)| a)
            .collect())
    }

    pub fn get_chan_alias(&self, player: Dbref, alias: &str) -> Result<Option<ChanAlias>, Error> {
        let rx = self.db.begin_read()?;
        ChanAliasesTable::get(&rx, &composite_key(player, alias))
    }

    pub fn delete_chan_alias(&self, player: Dbref, alias: &str) -> Result<(), Error> {
        let wx = self.db.begin_write()?;
        ChanAliasesTable::delete(&wx, &composite_key(player, alias))?;
        wx.commit()?;
        Ok(())
    }

    pub fn put_struct_def(&self, def: &StructDef) -> Result<(), Error> {
        let wx = self.db.begin_write()?;
        StructDefsTable::put(&wx, &composite_key(def.player, &def.name), def)?;
        wx.commit()?;
        Ok(())
    }

    pub fn get_struct_def(&self, player: Dbref, name: &str) -> Result<Option<StructDef>, Error> {
        let rx = self.db.begin_read()?;
        StructDefsTable::get(&rx, &composite_key(player, name))
    }

    pub fn delete_struct_def(&self, player: Dbref, name: &str) -> Result<(), Error> {
        let wx = self.db.begin_write()?;
        StructDefsTable::delete(&wx, &composite_key(player, name))?;
        wx.commit()?;
        Ok(())
    }

    pub fn load_struct_defs(&self) -> Result<Vec<StructDef>, Error> {
        let rx = self.db.begin_read()?;
        Ok(StructDefsTable::all(&rx)?
            .into_iter()
            .map(|(_, d)| d)
            .collect())
    }

    pub fn put_struct_instance(&self, inst: &StructInstance) -> Result<(), Error> {
        let wx = self.db.begin_write()?;
        StructInstsTable::put(&wx, &composite_key(inst.player, &inst.name), inst)?;
        wx.commit()?;
        Ok(())
    }

    pub fn get_struct_instance(
        &self,
        player: Dbref,
        name: &str,
    ) -> Result<Option<StructInstance>, Error> {
        let rx = self.db.begin_read()?;
        StructInstsTable::get(&rx, &composite_key(player, name))
    }

    pub fn delete_struct_instance(&self, player: Dbref, name: &str) -> Result<(), Error> {
        let wx = self.db.begin_write()?;
        StructInstsTable::delete(&wx, &composite_key(player, name))?;
        wx.commit()?;
        Ok(())
    }

    pub fn load_struct_instances(&self) -> Result<Vec<StructInstance>, Error> {
        let rx = self.db.begin_read()?;
        Ok(StructInstsTable::all(&rx)?
            .into_iter()
            .map(|(_, i)| i)
            .collect())
    }

    pub fn put_mail(&self, msg: &MailMessage) -> Result<(), Error> {
        let wx = self.db.begin_write()?;
        MailTable::put(&wx, &mail_key(msg.recipient, msg.id), msg)?;
        wx.commit()?;
        Ok(())
    }

    pub fn get_mail(&self, recipient: Dbref, id: i64) -> Result<Option<MailMessage>, Error> {
        let rx = self.db.begin_read()?;
        MailTable::get(&rx, &mail_key(recipient, id))
    }

    pub fn delete_mail(&self, recipient: Dbref, id: i64) -> Result<(), Error> {
        let wx = self.db.begin_write()?;
        MailTable::delete(&wx, &mail_key(recipient, id))?;
        wx.commit()?;
        Ok(())
    }

    /// All mail for one recipient, ordered by id.
    pub fn load_mail(&self, recipient: Dbref) -> Result<Vec<MailMessage>, Error> {
        let rx = self.db.begin_read()?;
        let prefix = format!("{recipient}:");
        Ok(MailTable::all(&rx)?
            .into_iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, m)| m)
            .sorted_by_key(|m| m.id)
            .collect())
    }

    /// Point-in-time snapshot of the whole store into a fresh database
    /// file at `path`. Every table is copied under one read
    /// transaction, so the result is a complete, openable store even
    /// while writers keep going.
    pub fn backup(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let target = redb::Database::create(path)?;

        let rx = self.db.begin_read()?;
        let wx = target.begin_write()?;

        Self::copy_all(&rx, &wx)?;

        wx.commit()?;
        Ok(())
    }

    fn copy_all(rx: &ReadTransaction, wx: &WriteTransaction) -> Result<(), Error> {
        MetaTable::copy(rx, wx)?;
        ObjectsTable::copy(rx, wx)?;
        AttrDefsTable::copy(rx, wx)?;
        PlayersTable::copy(rx, wx)?;
        ChannelsTable::copy(rx, wx)?;
        ChanAliasesTable::copy(rx, wx)?;
        StructDefsTable::copy(rx, wx)?;
        StructInstsTable::copy(rx, wx)?;
        MailTable::copy(rx, wx)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tinymush_core::{Attr, ObjectType, A_DESC};

    fn sample_db() -> Database {
        let mut db = Database::new();

        let mut room = Object::new(0, ObjectType::Room, "Limbo");
        room.contents = 1;

        let mut wizard = Object::new(1, ObjectType::Player, "Wizard");
        wizard.location = 0;
        wizard.next = 2;
        wizard.owner = 1;
        wizard.pennies = 100;
        wizard.set_attr(Attr::new(A_DESC, "an imposing figure"));

        let mut thing = Object::new(2, ObjectType::Thing, "ball");
        thing.location = 0;
        thing.owner = 1;

        db.put(room);
        db.put(wizard);
        db.put(thing);
        db.record_players = 1;
        db
    }

    #[test]
    fn import_then_load_round_trips() {
        let store = MushStore::memory().unwrap();
        let db = sample_db();

        store.import_from_database(&db).unwrap();
        assert!(store.has_data().unwrap());

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.object_count(), 3);
        assert_eq!(loaded.size, 3);
        assert_eq!(loaded.record_players, 1);
        assert_eq!(loaded.get(1).unwrap(), db.get(1).unwrap());
        assert_eq!(loaded.resolve_name("wizard"), 1);
    }

    #[test]
    fn put_object_is_write_through() {
        let store = MushStore::memory().unwrap();
        store.import_from_database(&sample_db()).unwrap();

        let mut ball = store.get_object(2).unwrap().unwrap();
        ball.pennies = 7;
        store.put_object(&ball).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.get(2).unwrap().pennies, 7);
    }

    #[test]
    fn player_index_updates_atomically() {
        let store = MushStore::memory().unwrap();
        store.import_from_database(&sample_db()).unwrap();

        let mut wizard = store.get_object(1).unwrap().unwrap();
        wizard.name = "Merlin".into();
        store.put_object(&wizard).unwrap();
        store.update_player_index(&wizard, Some("Wizard")).unwrap();

        assert_eq!(store.lookup_player("merlin").unwrap(), Some(1));
        assert_eq!(store.lookup_player("wizard").unwrap(), None);
    }

    #[test]
    fn sidecar_round_trips() {
        let store = MushStore::memory().unwrap();

        let channel = Channel {
            name: "Public".into(),
            owner: 1,
            description: "general chatter".into(),
            ..Default::default()
        };
        store.put_channel(&channel).unwrap();
        assert!(store.has_comsys_data().unwrap());

        let channels = store.load_channels().unwrap();
        assert_eq!(channels, vec![channel]);

        let msg = MailMessage {
            recipient: 3,
            id: 1,
            sender: 1,
            subject: "hello".into(),
            body: "welcome to the game".into(),
            ..Default::default()
        };
        store.put_mail(&msg).unwrap();

        // ids are per-recipient, so another recipient can reuse id 1
        let other = MailMessage {
            recipient: 4,
            id: 1,
            ..msg.clone()
        };
        store.put_mail(&other).unwrap();

        assert_eq!(store.load_mail(3).unwrap(), vec![msg]);
        assert_eq!(store.load_mail(4).unwrap().len(), 1);
    }

    #[test]
    fn backup_produces_openable_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = MushStore::open(dir.path().join("game.redb"), None).unwrap();
        store.import_from_database(&sample_db()).unwrap();

        let backup_path = dir.path().join("game.backup.redb");
        store.backup(&backup_path).unwrap();

        let restored = MushStore::open(&backup_path, None).unwrap();
        let loaded = restored.load_all().unwrap();
        assert_eq!(loaded.object_count(), 3);
        assert_eq!(loaded.resolve_name("wizard"), 1);
    }

    #[test]
    fn delete_object_removes_record() {
        let store = MushStore::memory().unwrap();
        store.import_from_database(&sample_db()).unwrap();

        store.delete_object(2).unwrap();
        assert!(store.get_object(2).unwrap().is_none());
        assert_eq!(store.load_all().unwrap().object_count(), 2);
    }
}
