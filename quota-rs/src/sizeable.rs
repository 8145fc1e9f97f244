//! Byte size of storable content
//!
//! Every content type that counts against a user's quota implements
//! [`Storable`]; the per-type size formula lives with the type itself.

use crate::ledger::{EntityKey, EntityMetadata, WorldId};

/// Deterministic byte size of a value
pub trait Sizeable {
    fn size_in_bytes(&self) -> i64;
}

/// A world-scoped entity whose size is tracked by the ledger
pub trait Storable: Sizeable {
    fn entity_key(&self) -> EntityKey;

    fn world_id(&self) -> WorldId;

    /// Snapshot the entity for a quota check or commit
    fn metadata(&self) -> EntityMetadata {
        EntityMetadata::new(self.world_id(), self.entity_key(), self.size_in_bytes())
    }
}

impl Sizeable for str {
    fn size_in_bytes(&self) -> i64 {
        self.len() as i64
    }
}

impl Sizeable for String {
    fn size_in_bytes(&self) -> i64 {
        self.len() as i64
    }
}

impl Sizeable for u8 {
    fn size_in_bytes(&self) -> i64 {
        1
    }
}

impl<T: Sizeable> Sizeable for Option<T> {
    fn size_in_bytes(&self) -> i64 {
        self.as_ref().map(Sizeable::size_in_bytes).unwrap_or(0)
    }
}

impl<T: Sizeable> Sizeable for Vec<T> {
    fn size_in_bytes(&self) -> i64 {
        self.iter().map(Sizeable::size_in_bytes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Character {
        id: String,
        world: String,
        name: String,
        backstory: Option<String>,
        portrait: Vec<u8>,
    }

    impl Sizeable for Character {
        fn size_in_bytes(&self) -> i64 {
            self.name.size_in_bytes() + self.backstory.size_in_bytes() + self.portrait.size_in_bytes()
        }
    }

    impl Storable for Character {
        fn entity_key(&self) -> EntityKey {
            EntityKey::new("character", self.id.as_str())
        }

        fn world_id(&self) -> WorldId {
            WorldId::new(self.world.as_str())
        }
    }

    #[test]
    fn test_metadata_from_storable() {
        let character = Character {
            id: "c-1".to_string(),
            world: "w-1".to_string(),
            name: "Aria".to_string(),
            backstory: Some("Raised by wolves".to_string()),
            portrait: vec![0u8; 100],
        };

        let metadata = character.metadata();
        assert_eq!(metadata.key, EntityKey::new("character", "c-1"));
        assert_eq!(metadata.world_id, WorldId::new("w-1"));
        assert_eq!(metadata.size, 4 + 16 + 100);
    }

    #[test]
    fn test_collection_sizes() {
        let tags = vec!["elf".to_string(), "ranger".to_string()];
        assert_eq!(tags.size_in_bytes(), 9);
        assert_eq!(None::<String>.size_in_bytes(), 0);
    }
}
