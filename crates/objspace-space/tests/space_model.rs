//! An object space driven by random operations must agree with a plain
//! in-memory model, before and after reopening.

use std::collections::BTreeMap;
use std::sync::Arc;

use objspace_crypto::{ContentHasher, HashFunction};
use objspace_space::{ContainerBuilder, ObjectSpace, ObjectSpaceDefinition, SpaceError, SpaceObject};
use objspace_store::StorageConfig;
use proptest::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Record {
    code: u16,
    group: u8,
    payload: Vec<u8>,
}

impl SpaceObject for Record {
    const CONTAINER: &'static str = "Record";

    fn member_key(&self, member: &str) -> Option<Vec<u8>> {
        match member {
            "code" => Some(self.code.to_le_bytes().to_vec()),
            "group" => Some(vec![self.group]),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
enum Op {
    Insert(Record),
    Update(usize, Record),
    Delete(usize),
    Commit,
}

fn record() -> impl Strategy<Value = Record> {
    (0u16..24, 0u8..3, prop::collection::vec(any::<u8>(), 0..400)).prop_map(
        |(code, group, payload)| Record {
            code,
            group,
            payload,
        },
    )
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => record().prop_map(Op::Insert),
        2 => (any::<usize>(), record()).prop_map(|(i, r)| Op::Update(i, r)),
        2 => any::<usize>().prop_map(Op::Delete),
        1 => Just(Op::Commit),
    ]
}

fn definition() -> ObjectSpaceDefinition {
    ObjectSpaceDefinition::builder()
        .with_space_tree()
        .container(
            ContainerBuilder::new("Record")
                .average_size(200)
                .unique_key("code")
                .index("group")
                .merkle_tree(),
        )
        .build()
        .unwrap()
}

fn hasher() -> Arc<dyn HashFunction> {
    Arc::new(ContentHasher::MERKLE)
}

/// Pick the `i`-th live id, if any.
fn nth(model: &BTreeMap<u64, Record>, i: usize) -> Option<u64> {
    if model.is_empty() {
        return None;
    }
    model.keys().nth(i % model.len()).copied()
}

fn check(space: &mut ObjectSpace, model: &BTreeMap<u64, Record>) {
    assert_eq!(space.ids::<Record>().unwrap(), model.keys().copied().collect::<Vec<_>>());
    for (id, expected) in model {
        assert_eq!(&space.get::<Record>(*id).unwrap(), expected);
        let by_code = space
            .find_unique::<Record>("code", &expected.code.to_le_bytes())
            .unwrap();
        assert_eq!(by_code, Some(*id));
    }
    for group in 0u8..3 {
        let expected: Vec<u64> = model
            .iter()
            .filter(|(_, r)| r.group == group)
            .map(|(id, _)| *id)
            .collect();
        assert_eq!(space.find::<Record>("group", &[group]).unwrap(), expected);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn space_matches_model(ops in prop::collection::vec(op(), 1..40)) {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::new(dir.path().join("model.db"))
            .with_page_size(256)
            .with_cluster_size(48)
            .with_max_memory(2048);
        let mut space = ObjectSpace::open(&config, definition(), hasher()).unwrap();
        let mut slots = 0u64;
        let mut model: BTreeMap<u64, Record> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(r) => {
                    let taken = model.values().any(|m| m.code == r.code);
                    match space.insert(&r) {
                        Ok(id) => {
                            prop_assert!(!taken);
                            let expected = (0..slots).find(|i| !model.contains_key(i)).unwrap_or(slots);
                            prop_assert_eq!(id, expected);
                            slots = slots.max(id + 1);
                            model.insert(id, r);
                        }
                        Err(SpaceError::DuplicateKey { .. }) => prop_assert!(taken),
                        Err(e) => panic!("insert failed: {e}"),
                    }
                }
                Op::Update(i, r) => {
                    let Some(id) = nth(&model, i) else { continue };
                    let taken = model.iter().any(|(other, m)| *other != id && m.code == r.code);
                    match space.update(id, &r) {
                        Ok(()) => {
                            prop_assert!(!taken);
                            model.insert(id, r);
                        }
                        Err(SpaceError::DuplicateKey { .. }) => prop_assert!(taken),
                        Err(e) => panic!("update failed: {e}"),
                    }
                }
                Op::Delete(i) => {
                    let Some(id) = nth(&model, i) else { continue };
                    space.delete::<Record>(id).unwrap();
                    model.remove(&id);
                }
                Op::Commit => space.commit().unwrap(),
            }
        }
        check(&mut space, &model);
        space.commit().unwrap();
        let root = space.space_root();
        prop_assert!(space.verify().unwrap().is_ok());
        drop(space);

        let mut space = ObjectSpace::load(&config, hasher()).unwrap();
        check(&mut space, &model);
        prop_assert_eq!(space.space_root(), root);
    }
}

#[test]
fn configuration_loads_from_toml() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("toml.db");
    let text = format!(
        "file_path = {:?}\npage_size = 512\ncluster_size = 96\n\n[container_policy]\nkind = \"extent\"\nsectors = 4\n",
        path.display().to_string()
    );
    let config = StorageConfig::from_toml_str(&text).unwrap();
    {
        let mut space = ObjectSpace::open(&config, definition(), hasher()).unwrap();
        space
            .insert(&Record {
                code: 1,
                group: 0,
                payload: vec![7; 1000],
            })
            .unwrap();
        space.commit().unwrap();
        let stats = space.storage_stats();
        assert_eq!(stats.sector_size, 96);
        assert!(stats.streams.iter().all(|(_, capacity)| capacity % 4 == 0));
    }
    let mut space = ObjectSpace::load(&config, hasher()).unwrap();
    assert_eq!(space.get::<Record>(0).unwrap().payload, vec![7; 1000]);
}
