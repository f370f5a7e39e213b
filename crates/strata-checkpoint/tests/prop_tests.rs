//! Property-based tests for strata-checkpoint.
//!
//! Covers:
//! 1. Checkpoint and Command JSON serde roundtrip (arbitrary data)
//! 2. Memory vs Sqlite checkpointer equivalence

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use serde_json::Value;

use strata_checkpoint::prelude::*;

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// Generate an arbitrary JSON value with bounded depth.
fn arb_json_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        (-1_000_000i64..1_000_000).prop_map(|n| Value::Number(n.into())),
        "[a-zA-Z0-9_ \\-]{0,30}".prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::hash_map("[a-zA-Z_]{1,8}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

fn arb_source() -> impl Strategy<Value = CheckpointSource> {
    prop_oneof![
        Just(CheckpointSource::Input),
        Just(CheckpointSource::Loop),
        Just(CheckpointSource::Interrupt),
        Just(CheckpointSource::Update),
        Just(CheckpointSource::Fork),
    ]
}

fn arb_metadata() -> impl Strategy<Value = CheckpointMetadata> {
    (
        arb_source(),
        0..100usize,
        prop::collection::vec("[a-z_]{1,12}".prop_map(String::from), 0..3),
    )
        .prop_map(|(source, step, writers)| CheckpointMetadata {
            source,
            step,
            writers,
        })
}

fn arb_pending_write() -> impl Strategy<Value = PendingWrite> {
    (
        "[a-z0-9\\-]{1,12}",
        "[a-z_]{1,8}",
        "[a-z_]{1,8}",
        arb_json_value(),
    )
        .prop_map(|(task_id, node, channel, value)| PendingWrite {
            task_id,
            node,
            channel,
            value,
        })
}

fn arb_send() -> impl Strategy<Value = SendDirective> {
    ("[a-z_]{1,8}", arb_json_value()).prop_map(|(node, arg)| SendDirective::new(node, arg))
}

fn arb_barriers() -> impl Strategy<Value = BTreeMap<String, BTreeSet<String>>> {
    prop::collection::btree_map(
        "[a-z_]{1,8}",
        prop::collection::btree_set("[a-z_]{1,8}".prop_map(String::from), 0..3),
        0..3,
    )
}

/// Generate an arbitrary Checkpoint.
fn arb_checkpoint() -> impl Strategy<Value = Checkpoint> {
    (
        (
            "[a-z0-9\\-]{1,16}",
            "[a-z0-9\\-]{1,16}",
            proptest::option::of("[a-z0-9\\-]{1,16}".prop_map(String::from)),
            0..50usize,
        ),
        prop::collection::hash_map("[a-z_]{1,8}", arb_json_value(), 0..4),
        prop::collection::vec(arb_pending_write(), 0..3),
        prop::collection::vec("[a-z_]{1,10}".prop_map(String::from), 0..3),
        prop::collection::vec(arb_send(), 0..3),
        arb_barriers(),
        arb_metadata(),
        1_700_000_000i64..1_800_000_000i64,
    )
        .prop_map(
            |(
                (id, thread_id, parent_id, step),
                channel_values,
                pending_writes,
                next_nodes,
                pending_sends,
                barriers,
                metadata,
                ts,
            )| Checkpoint {
                id,
                thread_id,
                parent_id,
                step,
                channel_values,
                pending_writes,
                next_nodes,
                pending_sends,
                barriers,
                metadata,
                created_at: Utc.timestamp_opt(ts, 0).unwrap(),
            },
        )
}

fn arb_command() -> impl Strategy<Value = Command> {
    (
        proptest::option::of(arb_json_value()),
        prop::collection::vec(
            prop_oneof![
                "[a-z_]{1,8}".prop_map(Goto::Node),
                arb_send().prop_map(Goto::Send),
            ],
            0..3,
        ),
        any::<bool>(),
    )
        .prop_map(|(update, goto, parent)| {
            let cmd = Command {
                update,
                goto,
                ..Command::default()
            };
            if parent { cmd.to_parent() } else { cmd }
        })
}

fn linear_checkpoint(thread_id: &str, i: usize, val: Value) -> Checkpoint {
    Checkpoint {
        id: format!("cp-{i}"),
        thread_id: thread_id.into(),
        parent_id: if i > 0 { Some(format!("cp-{}", i - 1)) } else { None },
        step: i,
        channel_values: HashMap::from([("v".into(), val)]),
        pending_writes: vec![],
        next_nodes: vec![],
        pending_sends: vec![],
        barriers: BTreeMap::new(),
        metadata: CheckpointMetadata {
            source: CheckpointSource::Loop,
            step: i,
            writers: vec![],
        },
        created_at: Utc.timestamp_opt(1_700_000_000 + i as i64, 0).unwrap(),
    }
}

// ===========================================================================
// 1. JSON serde roundtrip
// ===========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn checkpoint_json_serde_roundtrip(cp in arb_checkpoint()) {
        let json_str = serde_json::to_string(&cp).unwrap();
        let deserialized: Checkpoint = serde_json::from_str(&json_str).unwrap();
        prop_assert_eq!(deserialized, cp);
    }

    #[test]
    fn command_json_serde_roundtrip(cmd in arb_command()) {
        let json_str = serde_json::to_string(&cmd).unwrap();
        let deserialized: Command = serde_json::from_str(&json_str).unwrap();
        prop_assert_eq!(deserialized, cmd);
    }
}

// ===========================================================================
// 2. Memory vs Sqlite checkpointer equivalence
// ===========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// save then load returns the same checkpoint for both backends.
    #[test]
    fn checkpointer_equivalence_save_load(cp in arb_checkpoint()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mem = MemoryCheckpointer::new();
            let sqlite = SqliteCheckpointer::in_memory().unwrap();

            mem.save(cp.clone()).await.unwrap();
            sqlite.save(cp.clone()).await.unwrap();

            let m = mem.load(&cp.thread_id, Some(&cp.id)).await.unwrap().unwrap();
            let s = sqlite.load(&cp.thread_id, Some(&cp.id)).await.unwrap().unwrap();

            assert_eq!(m, s);
            assert_eq!(m, cp);
        });
    }

    /// Loading without an id returns the same head for both backends.
    #[test]
    fn checkpointer_equivalence_latest(
        steps in prop::collection::vec(arb_json_value(), 1..6),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mem = MemoryCheckpointer::new();
            let sqlite = SqliteCheckpointer::in_memory().unwrap();
            let thread_id = "equiv-thread";

            for (i, val) in steps.iter().enumerate() {
                let cp = linear_checkpoint(thread_id, i, val.clone());
                mem.save(cp.clone()).await.unwrap();
                sqlite.save(cp).await.unwrap();
            }

            let m = mem.load(thread_id, None).await.unwrap().unwrap();
            let s = sqlite.load(thread_id, None).await.unwrap().unwrap();
            assert_eq!(m, s);
            assert_eq!(m.step, steps.len() - 1);
        });
    }

    /// History comes back in save order from both backends, even when
    /// steps were saved out of order.
    #[test]
    fn checkpointer_equivalence_history_order(
        step_order in prop::collection::vec(0..20usize, 1..8),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mem = MemoryCheckpointer::new();
            let sqlite = SqliteCheckpointer::in_memory().unwrap();
            let thread_id = "order-thread";

            let mut seen = HashSet::new();
            let mut saved = Vec::new();
            for &step in &step_order {
                if !seen.insert(step) {
                    continue;
                }
                let cp = linear_checkpoint(thread_id, step, Value::Number(step.into()));
                saved.push(cp.id.clone());
                mem.save(cp.clone()).await.unwrap();
                sqlite.save(cp).await.unwrap();
            }

            let m_list = mem.list_history(thread_id).await.unwrap();
            let s_list = sqlite.list_history(thread_id).await.unwrap();

            assert_eq!(m_list, s_list);
            let ids: Vec<String> = m_list.into_iter().map(|cp| cp.id).collect();
            assert_eq!(ids, saved);
        });
    }

    /// delete_thread then list_history returns empty for both backends.
    #[test]
    fn checkpointer_equivalence_delete(cp in arb_checkpoint()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mem = MemoryCheckpointer::new();
            let sqlite = SqliteCheckpointer::in_memory().unwrap();

            mem.save(cp.clone()).await.unwrap();
            sqlite.save(cp.clone()).await.unwrap();

            mem.delete_thread(&cp.thread_id).await.unwrap();
            sqlite.delete_thread(&cp.thread_id).await.unwrap();

            assert!(mem.list_history(&cp.thread_id).await.unwrap().is_empty());
            assert!(sqlite.list_history(&cp.thread_id).await.unwrap().is_empty());
        });
    }
}
