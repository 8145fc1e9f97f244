use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{QuotaError, Result};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self::new(id)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Owner of a ledger; one ledger spans all of the user's worlds
    UserId
);
string_id!(
    /// Tenant container scoping game content
    WorldId
);
string_id!(
    /// Kind of stored content, e.g. `character` or `item`
    EntityType
);
string_id!(EntityId);

/// Globally unique key of a stored entity, independent of its world
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<EntityType>, entity_id: impl Into<EntityId>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// Ledger entry: last known size of an entity and the world holding it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntity {
    pub size: i64,
    pub world_id: WorldId,
}

/// Size snapshot of a caller's entity, recomputed right before each quota operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMetadata {
    pub world_id: WorldId,
    pub key: EntityKey,
    pub size: i64,
}

impl EntityMetadata {
    pub fn new(world_id: impl Into<WorldId>, key: EntityKey, size: i64) -> Self {
        Self {
            world_id: world_id.into(),
            key,
            size,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.size < 0 {
            return Err(QuotaError::InvalidSize(self.size));
        }
        Ok(())
    }
}
