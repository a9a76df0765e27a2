/*!
 * Directory Types
 * Object kinds and entry metadata
 */

use crate::core::types::Offset;
use serde::{Deserialize, Serialize};

/// The three object kinds: user-named, per-type singleton, and unnamed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Named,
    Unique,
    Anonymous,
}

impl ObjectKind {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ObjectKind::Named => 0,
            ObjectKind::Unique => 1,
            ObjectKind::Anonymous => 2,
        }
    }

    pub(crate) fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ObjectKind::Named),
            1 => Some(ObjectKind::Unique),
            2 => Some(ObjectKind::Anonymous),
            _ => None,
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ObjectKind::Named => write!(f, "named"),
            ObjectKind::Unique => write!(f, "unique"),
            ObjectKind::Anonymous => write!(f, "anonymous"),
        }
    }
}

/// Metadata for one constructed object.
///
/// `length` counts elements, not bytes; the byte span is
/// `length * size_of::<T>()` for the entry's type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectEntry {
    /// Key for named entries, the type token for unique ones, empty for
    /// anonymous ones
    pub name: String,
    /// Token identifying the element type
    pub type_id: String,
    pub kind: ObjectKind,
    pub offset: Offset,
    pub length: u64,
    pub description: String,
}

impl ObjectEntry {
    pub fn new(
        name: impl Into<String>,
        type_id: impl Into<String>,
        kind: ObjectKind,
        offset: Offset,
        length: u64,
    ) -> Self {
        Self {
            name: name.into(),
            type_id: type_id.into(),
            kind,
            offset,
            length,
            description: String::new(),
        }
    }
}
