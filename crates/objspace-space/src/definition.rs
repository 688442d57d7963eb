//! Declarative layout of an object space.
//!
//! A definition names every container, the indexes kept for it and the
//! clustered stream each one lives in. Stream 1 always holds the persisted
//! definition itself; the builder hands out the remaining streams in
//! declaration order.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{SpaceError, SpaceResult};

/// Stream holding the encoded definition.
pub const SCHEMA_STREAM: usize = 1;

/// What an index maintains.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    /// At most one object per key value.
    UniqueKey { member: String },
    /// Any number of objects per key value.
    Index { member: String },
    /// Vacant object ids awaiting reuse.
    FreeIndexStore,
    /// Merkle tree over object digests (or, at space level, over
    /// container roots).
    MerkleTree,
}

impl IndexKind {
    pub fn member(&self) -> Option<&str> {
        match self {
            Self::UniqueKey { member } | Self::Index { member } => Some(member),
            Self::FreeIndexStore | Self::MerkleTree => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub reserved_stream: usize,
    pub kind: IndexKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDefinition {
    pub object_type: String,
    /// Stream holding the object slots (or record pointers).
    pub data_stream: usize,
    pub indexes: Vec<IndexDefinition>,
    /// Sizing hint for tooling; not enforced.
    pub average_object_size_bytes: u32,
    /// Slot size for fixed-size containers. `None` stores objects as
    /// variable-length sector records.
    pub fixed_size: Option<u32>,
}

impl ContainerDefinition {
    pub fn free_index(&self) -> Option<&IndexDefinition> {
        self.indexes
            .iter()
            .find(|i| i.kind == IndexKind::FreeIndexStore)
    }

    pub fn has_merkle_tree(&self) -> bool {
        self.indexes.iter().any(|i| i.kind == IndexKind::MerkleTree)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSpaceDefinition {
    pub schema_indexes: Vec<IndexDefinition>,
    pub containers: Vec<ContainerDefinition>,
}

impl ObjectSpaceDefinition {
    pub fn builder() -> DefinitionBuilder {
        DefinitionBuilder::default()
    }

    pub fn container(&self, object_type: &str) -> Option<&ContainerDefinition> {
        self.containers.iter().find(|c| c.object_type == object_type)
    }

    /// Highest stream id the definition uses.
    pub fn last_stream(&self) -> usize {
        let schema = self.schema_indexes.iter().map(|i| i.reserved_stream);
        let containers = self.containers.iter().flat_map(|c| {
            std::iter::once(c.data_stream).chain(c.indexes.iter().map(|i| i.reserved_stream))
        });
        schema.chain(containers).max().unwrap_or(SCHEMA_STREAM)
    }

    /// Check the structural rules: unique container names, distinct
    /// streams after the schema stream, one free index store per container,
    /// at most one Merkle tree and one index of each kind per member, and a
    /// space-level Merkle tree as the only schema index.
    pub fn validate(&self) -> SpaceResult<()> {
        let invalid = |msg: String| Err(SpaceError::InvalidDefinition(msg));
        let mut streams = HashSet::new();
        let mut claim = |stream: usize| -> bool { stream > SCHEMA_STREAM && streams.insert(stream) };

        if self.schema_indexes.len() > 1 {
            return invalid("at most one schema index".into());
        }
        for index in &self.schema_indexes {
            if index.kind != IndexKind::MerkleTree {
                return invalid(format!("schema index {:?} must be a Merkle tree", index.kind));
            }
            if !claim(index.reserved_stream) {
                return invalid(format!("stream {} reused or reserved", index.reserved_stream));
            }
        }

        let mut names = HashSet::new();
        for container in &self.containers {
            let name = &container.object_type;
            if name.is_empty() {
                return invalid("container without a name".into());
            }
            if !names.insert(name.as_str()) {
                return invalid(format!("container {name} declared twice"));
            }
            if container.fixed_size == Some(0) {
                return invalid(format!("container {name} has zero-size slots"));
            }
            if !claim(container.data_stream) {
                return invalid(format!("stream {} reused or reserved", container.data_stream));
            }

            let mut free = 0;
            let mut trees = 0;
            let mut keyed = HashSet::new();
            for index in &container.indexes {
                if !claim(index.reserved_stream) {
                    return invalid(format!("stream {} reused or reserved", index.reserved_stream));
                }
                match &index.kind {
                    IndexKind::FreeIndexStore => free += 1,
                    IndexKind::MerkleTree => trees += 1,
                    IndexKind::UniqueKey { member } | IndexKind::Index { member } => {
                        if member.is_empty() {
                            return invalid(format!("index on {name} without a member"));
                        }
                        let unique = matches!(index.kind, IndexKind::UniqueKey { .. });
                        if !keyed.insert((member.as_str(), unique)) {
                            return invalid(format!("{name}.{member} indexed twice"));
                        }
                    }
                }
            }
            if free != 1 {
                return invalid(format!("container {name} needs exactly one free index store"));
            }
            if trees > 1 {
                return invalid(format!("container {name} has {trees} Merkle trees"));
            }
        }
        Ok(())
    }
}

/// Builds a definition, assigning streams in declaration order.
#[derive(Debug, Default)]
pub struct DefinitionBuilder {
    space_tree: bool,
    containers: Vec<ContainerBuilder>,
}

impl DefinitionBuilder {
    /// Keep a Merkle tree over the container roots.
    pub fn with_space_tree(mut self) -> Self {
        self.space_tree = true;
        self
    }

    pub fn container(mut self, container: ContainerBuilder) -> Self {
        self.containers.push(container);
        self
    }

    pub fn build(self) -> SpaceResult<ObjectSpaceDefinition> {
        let mut next = SCHEMA_STREAM + 1;
        let mut take = || {
            let stream = next;
            next += 1;
            stream
        };
        let schema_indexes = if self.space_tree {
            vec![IndexDefinition {
                reserved_stream: take(),
                kind: IndexKind::MerkleTree,
            }]
        } else {
            Vec::new()
        };
        let mut containers = Vec::with_capacity(self.containers.len());
        for builder in self.containers {
            let data_stream = take();
            let mut kinds = builder.indexes;
            if !kinds.contains(&IndexKind::FreeIndexStore) {
                kinds.push(IndexKind::FreeIndexStore);
            }
            let indexes = kinds
                .into_iter()
                .map(|kind| IndexDefinition {
                    reserved_stream: take(),
                    kind,
                })
                .collect();
            containers.push(ContainerDefinition {
                object_type: builder.object_type,
                data_stream,
                indexes,
                average_object_size_bytes: builder.average_size,
                fixed_size: builder.fixed_size,
            });
        }
        let definition = ObjectSpaceDefinition {
            schema_indexes,
            containers,
        };
        definition.validate()?;
        Ok(definition)
    }
}

#[derive(Debug)]
pub struct ContainerBuilder {
    object_type: String,
    indexes: Vec<IndexKind>,
    average_size: u32,
    fixed_size: Option<u32>,
}

impl ContainerBuilder {
    pub fn new(object_type: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            indexes: Vec::new(),
            average_size: 0,
            fixed_size: None,
        }
    }

    /// Store objects in fixed slots of `size` bytes.
    pub fn fixed_size(mut self, size: u32) -> Self {
        self.fixed_size = Some(size);
        self.average_size = size;
        self
    }

    pub fn average_size(mut self, bytes: u32) -> Self {
        self.average_size = bytes;
        self
    }

    pub fn unique_key(mut self, member: impl Into<String>) -> Self {
        self.indexes.push(IndexKind::UniqueKey {
            member: member.into(),
        });
        self
    }

    pub fn index(mut self, member: impl Into<String>) -> Self {
        self.indexes.push(IndexKind::Index {
            member: member.into(),
        });
        self
    }

    pub fn merkle_tree(mut self) -> Self {
        self.indexes.push(IndexKind::MerkleTree);
        self
    }

    pub fn free_index_store(mut self) -> Self {
        self.indexes.push(IndexKind::FreeIndexStore);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_assigns_streams_in_order() {
        let def = ObjectSpaceDefinition::builder()
            .with_space_tree()
            .container(ContainerBuilder::new("Account").fixed_size(48).unique_key("name").merkle_tree())
            .container(ContainerBuilder::new("Note").index("author"))
            .build()
            .unwrap();
        assert_eq!(def.schema_indexes[0].reserved_stream, 2);
        let account = def.container("Account").unwrap();
        assert_eq!(account.data_stream, 3);
        let streams: Vec<usize> = account.indexes.iter().map(|i| i.reserved_stream).collect();
        assert_eq!(streams, [4, 5, 6]);
        assert_eq!(account.indexes[2].kind, IndexKind::FreeIndexStore);
        let note = def.container("Note").unwrap();
        assert_eq!(note.data_stream, 7);
        assert!(note.free_index().is_some());
        assert_eq!(def.last_stream(), 9);
    }

    #[test]
    fn duplicate_unique_key_is_rejected() {
        let err = ObjectSpaceDefinition::builder()
            .container(ContainerBuilder::new("User").unique_key("email").unique_key("email"))
            .build()
            .unwrap_err();
        assert!(matches!(err, SpaceError::InvalidDefinition(_)));
    }

    #[test]
    fn unique_and_secondary_on_same_member_are_allowed() {
        ObjectSpaceDefinition::builder()
            .container(ContainerBuilder::new("User").unique_key("email").index("email"))
            .build()
            .unwrap();
    }

    #[test]
    fn structural_rules() {
        let two_trees = ObjectSpaceDefinition::builder()
            .container(ContainerBuilder::new("A").merkle_tree().merkle_tree())
            .build();
        assert!(two_trees.is_err());

        let two_free = ObjectSpaceDefinition::builder()
            .container(ContainerBuilder::new("A").free_index_store().free_index_store())
            .build();
        assert!(two_free.is_err());

        let same_name = ObjectSpaceDefinition::builder()
            .container(ContainerBuilder::new("A"))
            .container(ContainerBuilder::new("A"))
            .build();
        assert!(same_name.is_err());

        let mut def = ObjectSpaceDefinition::builder()
            .container(ContainerBuilder::new("A"))
            .build()
            .unwrap();
        def.containers[0].data_stream = SCHEMA_STREAM;
        assert!(def.validate().is_err());

        def.containers[0].data_stream = 2;
        def.schema_indexes.push(IndexDefinition {
            reserved_stream: 9,
            kind: IndexKind::FreeIndexStore,
        });
        assert!(def.validate().is_err());
    }
}
