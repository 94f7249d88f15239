//! Table definitions for the store file, one per bucket. Keys are raw
//! bytes (dbref and integer keys big-endian encoded) or composite
//! strings; values are bincode records.

use redb::{
    ReadTransaction, ReadableTable as _, ReadableTableMetadata as _, TableDefinition,
    WriteTransaction,
};
use serde::{de::DeserializeOwned, Serialize};

use tinymush_core::{AttrDef, ChanAlias, Channel, Dbref, MailMessage, Object, StructDef, StructInstance};

use crate::{attr_key, dbref_key, Error};

pub type BytesTable = TableDefinition<'static, &'static [u8], &'static [u8]>;
pub type NameTable = TableDefinition<'static, &'static str, &'static [u8]>;

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    Ok(bincode::serialize(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
    Ok(bincode::deserialize(bytes)?)
}

fn copy_bytes_table(
    rx: &ReadTransaction,
    wx: &WriteTransaction,
    def: BytesTable,
) -> Result<(), Error> {
    let source = rx.open_table(def)?;
    let mut target = wx.open_table(def)?;

    for entry in source.iter()? {
        let (k, v) = entry?;
        target.insert(k.value(), v.value())?;
    }

    Ok(())
}

fn copy_name_table(
    rx: &ReadTransaction,
    wx: &WriteTransaction,
    def: NameTable,
) -> Result<(), Error> {
    let source = rx.open_table(def)?;
    let mut target = wx.open_table(def)?;

    for entry in source.iter()? {
        let (k, v) = entry?;
        target.insert(k.value(), v.value())?;
    }

    Ok(())
}

pub struct MetaTable;

impl MetaTable {
    pub const DEF: NameTable = TableDefinition::new("meta");

    pub const VERSION: &'static str = "version";
    pub const FORMAT: &'static str = "format";
    pub const FLAGS: &'static str = "flags";
    pub const SIZE: &'static str = "size";
    pub const NEXT_ATTR: &'static str = "nextattr";
    pub const RECORD_PLAYERS: &'static str = "recordplayers";

    pub fn initialize(wx: &WriteTransaction) -> Result<(), Error> {
        wx.open_table(Self::DEF)?;
        Ok(())
    }

    pub fn get(rx: &ReadTransaction, key: &str) -> Result<Option<i64>, Error> {
        let table = rx.open_table(Self::DEF)?;
        let value = table.get(key)?.map(|v| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&v.value()[..8]);
            i64::from_be_bytes(buf)
        });
        Ok(value)
    }

    pub fn put(wx: &WriteTransaction, key: &str, value: i64) -> Result<(), Error> {
        let mut table = wx.open_table(Self::DEF)?;
        table.insert(key, value.to_be_bytes().as_slice())?;
        Ok(())
    }

    pub fn copy(rx: &ReadTransaction, wx: &WriteTransaction) -> Result<(), Error> {
        copy_name_table(rx, wx, Self::DEF)
    }
}

pub struct ObjectsTable;

impl ObjectsTable {
    pub const DEF: BytesTable = TableDefinition::new("objects");

    pub fn initialize(wx: &WriteTransaction) -> Result<(), Error> {
        wx.open_table(Self::DEF)?;
        Ok(())
    }

    pub fn get(rx: &ReadTransaction, dbref: Dbref) -> Result<Option<Object>, Error> {
        let table = rx.open_table(Self::DEF)?;
        match table.get(dbref_key(dbref).as_slice())? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    pub fn put(wx: &WriteTransaction, obj: &Object) -> Result<(), Error> {
        let mut table = wx.open_table(Self::DEF)?;
        table.insert(dbref_key(obj.dbref).as_slice(), encode(obj)?.as_slice())?;
        Ok(())
    }

    pub fn delete(wx: &WriteTransaction, dbref: Dbref) -> Result<(), Error> {
        let mut table = wx.open_table(Self::DEF)?;
        table.remove(dbref_key(dbref).as_slice())?;
        Ok(())
    }

    pub fn all(rx: &ReadTransaction) -> Result<Vec<Object>, Error> {
        let table = rx.open_table(Self::DEF)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_, v) = entry?;
            out.push(decode(v.value())?);
        }
        Ok(out)
    }

    pub fn count(rx: &ReadTransaction) -> Result<u64, Error> {
        let table = rx.open_table(Self::DEF)?;
        Ok(table.len()?)
    }

    pub fn copy(rx: &ReadTransaction, wx: &WriteTransaction) -> Result<(), Error> {
        copy_bytes_table(rx, wx, Self::DEF)
    }
}

pub struct AttrDefsTable;

impl AttrDefsTable {
    pub const DEF: BytesTable = TableDefinition::new("attrdefs");

    pub fn initialize(wx: &WriteTransaction) -> Result<(), Error> {
        wx.open_table(Self::DEF)?;
        Ok(())
    }

    pub fn put(wx: &WriteTransaction, def: &AttrDef) -> Result<(), Error> {
        let mut table = wx.open_table(Self::DEF)?;
        table.insert(attr_key(def.num).as_slice(), encode(def)?.as_slice())?;
        Ok(())
    }

    pub fn all(rx: &ReadTransaction) -> Result<Vec<AttrDef>, Error> {
        let table = rx.open_table(Self::DEF)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_, v) = entry?;
            out.push(decode(v.value())?);
        }
        Ok(out)
    }

    pub fn copy(rx: &ReadTransaction, wx: &WriteTransaction) -> Result<(), Error> {
        copy_bytes_table(rx, wx, Self::DEF)
    }
}

pub struct PlayersTable;

impl PlayersTable {
    pub const DEF: NameTable = TableDefinition::new("players");

    pub fn initialize(wx: &WriteTransaction) -> Result<(), Error> {
        wx.open_table(Self::DEF)?;
        Ok(())
    }

    pub fn get(rx: &ReadTransaction, name: &str) -> Result<Option<Dbref>, Error> {
        let table = rx.open_table(Self::DEF)?;
        let value = table.get(name.to_lowercase().as_str())?.map(|v| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&v.value()[..8]);
            i64::from_be_bytes(buf)
        });
        Ok(value)
    }

    pub fn put(wx: &WriteTransaction, name: &str, dbref: Dbref) -> Result<(), Error> {
        let mut table = wx.open_table(Self::DEF)?;
        table.insert(name.to_lowercase().as_str(), dbref.to_be_bytes().as_slice())?;
        Ok(())
    }

    pub fn delete(wx: &WriteTransaction, name: &str) -> Result<(), Error> {
        let mut table = wx.open_table(Self::DEF)?;
        table.remove(name.to_lowercase().as_str())?;
        Ok(())
    }

    pub fn clear(wx: &WriteTransaction) -> Result<(), Error> {
        wx.delete_table(Self::DEF)?;
        wx.open_table(Self::DEF)?;
        Ok(())
    }

    pub fn copy(rx: &ReadTransaction, wx: &WriteTransaction) -> Result<(), Error> {
        copy_name_table(rx, wx, Self::DEF)
    }
}

macro_rules! sidecar_table {
    ($table:ident, $name:literal, $entity:ty) => {
        pub struct $table;

        impl $table {
            pub const DEF: NameTable = TableDefinition::new($name);

            pub fn initialize(wx: &WriteTransaction) -> Result<(), Error> {
                wx.open_table(Self::DEF)?;
                Ok(())
            }

            pub fn get(rx: &ReadTransaction, key: &str) -> Result<Option<$entity>, Error> {
                let table = rx.open_table(Self::DEF)?;
                match table.get(key)? {
                    Some(value) => Ok(Some(decode(value.value())?)),
                    None => Ok(None),
                }
            }

            pub fn put(wx: &WriteTransaction, key: &str, value: &$entity) -> Result<(), Error> {
                let mut table = wx.open_table(Self::DEF)?;
                table.insert(key, encode(value)?.as_slice())?;
                Ok(())
            }

            pub fn delete(wx: &WriteTransaction, key: &str) -> Result<(), Error> {
                let mut table = wx.open_table(Self::DEF)?;
                table.remove(key)?;
                Ok(())
            }

            pub fn all(rx: &ReadTransaction) -> Result<Vec<(String, $entity)>, Error> {
                let table = rx.open_table(Self::DEF)?;
                let mut out = Vec::new();
                for entry in table.iter()? {
                    let (k, v) = entry?;
                    out.push((k.value().to_owned(), decode(v.value())?));
                }
                Ok(out)
            }

            pub fn is_empty(rx: &ReadTransaction) -> Result<bool, Error> {
                let table = rx.open_table(Self::DEF)?;
                Ok(table.is_empty()?)
            }

            pub fn copy(rx: &ReadTransaction, wx: &WriteTransaction) -> Result<(), Error> {
                copy_name_table(rx, wx, Self::DEF)
            }
        }
    };
}

sidecar_table!(ChannelsTable, "channels", Channel);
sidecar_table!(ChanAliasesTable, "chanaliases", ChanAlias);
sidecar_table!(StructDefsTable, "structdefs", StructDef);
sidecar_table!(StructInstsTable, "structinsts", StructInstance);
sidecar_table!(MailTable, "mail", MailMessage);
