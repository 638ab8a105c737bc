use bytes::{Buf, BufMut};
use crate::core::error::{Error, Result};
use crate::core::types::EntityId;

pub const ADD_TAG: u8 = 1;
pub const REMOVE_TAG: u8 = 2;

/// tag + entity + key length + value length
pub const HEADER_LEN: usize = 1 + 8 + 4 + 4;

const NO_ENTITY: i64 = -1;

/// A logged index mutation.
///
/// `Remove` with no value removes every mapping of the entity under the key;
/// with neither entity nor value it drops the whole key index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Add {
        entity: EntityId,
        key: String,
        value: String,
    },
    Remove {
        entity: Option<EntityId>,
        key: String,
        value: Option<String>,
    },
}

impl Command {
    pub fn add(entity: EntityId, key: impl Into<String>, value: impl Into<String>) -> Self {
        Command::Add { entity, key: key.into(), value: value.into() }
    }

    pub fn remove_value(entity: EntityId, key: impl Into<String>, value: impl Into<String>) -> Self {
        Command::Remove { entity: Some(entity), key: key.into(), value: Some(value.into()) }
    }

    pub fn remove_entity(entity: EntityId, key: impl Into<String>) -> Self {
        Command::Remove { entity: Some(entity), key: key.into(), value: None }
    }

    pub fn drop_key(key: impl Into<String>) -> Self {
        Command::Remove { entity: None, key: key.into(), value: None }
    }

    pub fn key(&self) -> &str {
        match self {
            Command::Add { key, .. } | Command::Remove { key, .. } => key,
        }
    }

    pub fn entity(&self) -> Option<EntityId> {
        match self {
            Command::Add { entity, .. } => Some(*entity),
            Command::Remove { entity, .. } => *entity,
        }
    }

    pub fn value(&self) -> Option<&str> {
        match self {
            Command::Add { value, .. } => Some(value),
            Command::Remove { value, .. } => value.as_deref(),
        }
    }

    pub fn is_drop_key(&self) -> bool {
        matches!(self, Command::Remove { entity: None, value: None, .. })
    }

    fn tag(&self) -> u8 {
        match self {
            Command::Add { .. } => ADD_TAG,
            Command::Remove { .. } => REMOVE_TAG,
        }
    }

    pub fn encoded_len(&self) -> usize {
        let key_units = self.key().encode_utf16().count();
        let value_units = self.value().map_or(0, |v| v.encode_utf16().count());
        HEADER_LEN + 2 * (key_units + value_units)
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        let key: Vec<u16> = self.key().encode_utf16().collect();
        let value: Vec<u16> = self.value().map_or_else(Vec::new, |v| v.encode_utf16().collect());

        buf.put_u8(self.tag());
        buf.put_i64(self.entity().map_or(NO_ENTITY, |e| e.0));
        buf.put_i32(key.len() as i32);
        buf.put_i32(value.len() as i32);
        for unit in key.iter().chain(value.iter()) {
            buf.put_u16(*unit);
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf
    }

    /// Decodes one command from the front of `bytes`.
    ///
    /// Returns the command and the number of bytes it occupied, or `None` if
    /// the record is cut short: a partial record marks the end of the log.
    pub fn decode(bytes: &[u8]) -> Result<Option<(Command, usize)>> {
        if bytes.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut cur = bytes;
        let tag = cur.get_u8();
        let entity = cur.get_i64();
        let key_len = cur.get_i32();
        let value_len = cur.get_i32();

        if tag != ADD_TAG && tag != REMOVE_TAG {
            return Err(Error::corrupt(format!("unknown command tag {}", tag)));
        }
        if key_len < 0 || value_len < 0 {
            return Err(Error::corrupt(format!(
                "negative command lengths key={} value={}",
                key_len, value_len
            )));
        }

        let (key_len, value_len) = (key_len as usize, value_len as usize);
        let total = HEADER_LEN + 2 * (key_len + value_len);
        if bytes.len() < total {
            return Ok(None);
        }

        let key = read_utf16(&mut cur, key_len)?;
        let value = read_utf16(&mut cur, value_len)?;

        let command = match tag {
            ADD_TAG => {
                if entity < 0 {
                    return Err(Error::corrupt(format!("add command with entity {}", entity)));
                }
                Command::Add { entity: EntityId(entity), key, value }
            }
            _ => Command::Remove {
                entity: (entity != NO_ENTITY).then_some(EntityId(entity)),
                key,
                value: (!value.is_empty()).then_some(value),
            },
        };
        Ok(Some((command, total)))
    }
}

fn read_utf16(cur: &mut &[u8], units: usize) -> Result<String> {
    let mut buf = Vec::with_capacity(units);
    for _ in 0..units {
        buf.push(cur.get_u16());
    }
    String::from_utf16(&buf).map_err(|e| Error::corrupt(format!("invalid UTF-16 in command: {}", e)))
}
