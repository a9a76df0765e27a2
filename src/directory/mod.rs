/*!
 * Object Directory
 * Persistent mapping from name (or type identity, or address) to object
 * metadata
 *
 * Named and unique entries are string-keyed; anonymous objects are tracked
 * by offset so destroy-by-pointer and iteration cover them. Listing returns
 * a snapshot: entries inserted or erased afterwards are not reflected.
 */

mod types;

pub use types::{ObjectEntry, ObjectKind};

use crate::core::types::{Offset, STATE_FORMAT_VERSION};
use crate::core::{StoreError, StoreResult};
use crate::os;
use ahash::RandomState;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::io::Cursor;
use std::path::Path;

/// In-memory object directory, serialized into the datastore on close
#[derive(Debug, Default)]
pub struct ObjectDirectory {
    named: DashMap<String, ObjectEntry, RandomState>,
    unique: DashMap<String, ObjectEntry, RandomState>,
    anonymous: DashMap<Offset, ObjectEntry, RandomState>,
}

impl ObjectDirectory {
    pub fn new() -> Self {
        Self {
            named: DashMap::with_hasher(RandomState::new()),
            unique: DashMap::with_hasher(RandomState::new()),
            anonymous: DashMap::with_hasher(RandomState::new()),
        }
    }

    fn keyed(&self, kind: ObjectKind) -> &DashMap<String, ObjectEntry, RandomState> {
        match kind {
            ObjectKind::Named => &self.named,
            ObjectKind::Unique => &self.unique,
            ObjectKind::Anonymous => unreachable!("anonymous entries are offset-keyed"),
        }
    }

    /// Look up a named or unique entry
    pub fn find(&self, kind: ObjectKind, name: &str) -> Option<ObjectEntry> {
        self.keyed(kind).get(name).map(|e| e.value().clone())
    }

    pub fn find_anonymous(&self, offset: Offset) -> Option<ObjectEntry> {
        self.anonymous.get(&offset).map(|e| e.value().clone())
    }

    /// Insert atomically; an existing conflicting entry wins and is
    /// returned as the error value.
    pub fn insert_if_absent(&self, entry: ObjectEntry) -> Result<(), ObjectEntry> {
        match entry.kind {
            ObjectKind::Anonymous => {
                match self.anonymous.entry(entry.offset) {
                    Entry::Occupied(existing) => Err(existing.get().clone()),
                    Entry::Vacant(slot) => {
                        slot.insert(entry);
                        Ok(())
                    }
                }
            }
            kind => match self.keyed(kind).entry(entry.name.clone()) {
                Entry::Occupied(existing) => Err(existing.get().clone()),
                Entry::Vacant(slot) => {
                    slot.insert(entry);
                    Ok(())
                }
            },
        }
    }

    /// Remove a named or unique entry; the caller drives memory release
    pub fn erase(&self, kind: ObjectKind, name: &str) -> Option<ObjectEntry> {
        self.keyed(kind).remove(name).map(|(_, e)| e)
    }

    pub fn erase_anonymous(&self, offset: Offset) -> Option<ObjectEntry> {
        self.anonymous.remove(&offset).map(|(_, e)| e)
    }

    /// Find the entry (of any kind) whose allocation head is `offset`
    pub fn find_by_offset(&self, offset: Offset) -> Option<ObjectEntry> {
        if let Some(entry) = self.find_anonymous(offset) {
            return Some(entry);
        }
        self.named
            .iter()
            .chain(self.unique.iter())
            .find(|e| e.value().offset == offset)
            .map(|e| e.value().clone())
    }

    /// Remove the entry (of any kind) whose allocation head is `offset`
    pub fn erase_by_offset(&self, offset: Offset) -> Option<ObjectEntry> {
        let entry = self.find_by_offset(offset)?;
        match entry.kind {
            ObjectKind::Anonymous => self.erase_anonymous(offset),
            kind => self.erase(kind, &entry.name),
        }
    }

    /// Snapshot of all entries of `kind`
    pub fn list(&self, kind: ObjectKind) -> Vec<ObjectEntry> {
        match kind {
            ObjectKind::Anonymous => self.anonymous.iter().map(|e| e.value().clone()).collect(),
            kind => self.keyed(kind).iter().map(|e| e.value().clone()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.named.len() + self.unique.len() + self.anonymous.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Update an entry's description text in place
    pub fn set_description(&self, entry: &ObjectEntry, text: &str) -> bool {
        match entry.kind {
            ObjectKind::Anonymous => match self.anonymous.get_mut(&entry.offset) {
                Some(mut e) => {
                    e.description = text.to_string();
                    true
                }
                None => false,
            },
            kind => match self.keyed(kind).get_mut(&entry.name) {
                Some(mut e) => {
                    e.description = text.to_string();
                    true
                }
                None => false,
            },
        }
    }

    /// Serialize every entry as length-prefixed little-endian records
    pub fn serialize(&self, path: &Path) -> StoreResult<()> {
        let mut entries = Vec::with_capacity(self.len());
        for map in [&self.named, &self.unique] {
            for e in map.iter() {
                entries.push(e.value().clone());
            }
        }
        for e in self.anonymous.iter() {
            entries.push(e.value().clone());
        }
        // Deterministic order keeps state files byte-stable.
        entries.sort_by_key(|e| (e.kind.as_u8(), e.offset));

        let mut buf = vec![STATE_FORMAT_VERSION];
        buf.write_u32::<LittleEndian>(entries.len() as u32)
            .expect("vec write");
        for entry in &entries {
            write_record(&mut buf, entry);
        }
        os::write_durable(path, &buf)
    }

    /// Exact-round-trip deserialization; any malformation is fatal to open
    pub fn deserialize(path: &Path) -> StoreResult<Self> {
        let data = std::fs::read(path)?;
        if data.is_empty() || data[0] != STATE_FORMAT_VERSION {
            return Err(StoreError::corrupted("named directory header invalid"));
        }
        let mut cursor = Cursor::new(&data[1..]);
        let n = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| StoreError::corrupted("truncated named directory"))?;
        let directory = Self::new();
        for _ in 0..n {
            let entry = read_record(&mut cursor)?;
            let key = match entry.kind {
                ObjectKind::Anonymous => format!("@{}", entry.offset),
                _ => entry.name.clone(),
            };
            if directory.insert_if_absent(entry).is_err() {
                return Err(StoreError::corrupted(format!(
                    "duplicate directory entry {}",
                    key
                )));
            }
        }
        Ok(directory)
    }
}

fn write_record(buf: &mut Vec<u8>, entry: &ObjectEntry) {
    buf.write_u32::<LittleEndian>(entry.name.len() as u32)
        .expect("vec write");
    buf.extend_from_slice(entry.name.as_bytes());
    buf.write_u32::<LittleEndian>(entry.type_id.len() as u32)
        .expect("vec write");
    buf.extend_from_slice(entry.type_id.as_bytes());
    buf.push(entry.kind.as_u8());
    buf.write_i64::<LittleEndian>(entry.offset).expect("vec write");
    buf.write_u64::<LittleEndian>(entry.length).expect("vec write");
    buf.write_u32::<LittleEndian>(entry.description.len() as u32)
        .expect("vec write");
    buf.extend_from_slice(entry.description.as_bytes());
}

fn read_record(cursor: &mut Cursor<&[u8]>) -> StoreResult<ObjectEntry> {
    let corrupt = || StoreError::corrupted("truncated named directory");
    let name = read_string(cursor)?;
    let type_id = read_string(cursor)?;
    let kind = ObjectKind::from_u8(cursor.read_u8().map_err(|_| corrupt())?)
        .ok_or_else(|| StoreError::corrupted("unknown object kind"))?;
    let offset = cursor.read_i64::<LittleEndian>().map_err(|_| corrupt())?;
    let length = cursor.read_u64::<LittleEndian>().map_err(|_| corrupt())?;
    let description = read_string(cursor)?;
    Ok(ObjectEntry {
        name,
        type_id,
        kind,
        offset,
        length,
        description,
    })
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> StoreResult<String> {
    let corrupt = || StoreError::corrupted("truncated named directory");
    let len = cursor.read_u32::<LittleEndian>().map_err(|_| corrupt())? as usize;
    let mut bytes = vec![0u8; len];
    std::io::Read::read_exact(cursor, &mut bytes).map_err(|_| corrupt())?;
    String::from_utf8(bytes).map_err(|_| StoreError::corrupted("directory entry is not UTF-8"))
}
