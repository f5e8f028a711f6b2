use std::collections::HashSet;

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde_json::{json, Value};

use realtime_sync_cell::*;

fn entity(record: Value) -> Entity {
    Entity::from_record(record).unwrap()
}

fn event(kind: ChangeKind, record: Value, seq: u64) -> ChangeEvent {
    ChangeEvent::new(kind, entity(record), seq)
}

fn ids(reconciler: &Reconciler) -> Vec<String> {
    reconciler.entities().iter().map(|e| e.id().to_string()).collect()
}

fn assert_unique(reconciler: &Reconciler) {
    let all = ids(reconciler);
    let unique: HashSet<_> = all.iter().collect();
    assert_eq!(all.len(), unique.len(), "duplicate ids in {:?}", all);
}

#[test]
fn test_inserts_are_newest_first() {
    let mut reconciler = Reconciler::new();

    assert!(reconciler.apply_event(event(ChangeKind::Insert, json!({ "id": 1 }), 1)));
    assert!(reconciler.apply_event(event(ChangeKind::Insert, json!({ "id": 2 }), 2)));

    assert_eq!(ids(&reconciler), vec!["2", "1"]);
}

#[test]
fn test_snapshot_then_update() {
    let mut reconciler = Reconciler::new();
    reconciler.apply_snapshot(vec![entity(json!({ "id": 1, "v": "a" }))], 0);

    reconciler.apply_event(event(ChangeKind::Update, json!({ "id": 1, "v": "b" }), 1));

    assert_eq!(reconciler.len(), 1);
    assert_eq!(reconciler.get("1").unwrap().field("v"), Some(&json!("b")));
}

#[test]
fn test_update_before_snapshot_survives_older_snapshot() {
    let mut reconciler = Reconciler::new();

    // Snapshot requested at seq 0, update observed at seq 1, snapshot resolves last.
    reconciler.apply_event(event(ChangeKind::Update, json!({ "id": 1, "v": "b" }), 1));
    reconciler.apply_snapshot(vec![entity(json!({ "id": 1, "v": "a" }))], 0);

    assert_eq!(reconciler.len(), 1);
    assert_eq!(reconciler.get("1").unwrap().field("v"), Some(&json!("b")));
}

#[test]
fn test_snapshot_newer_than_event_wins() {
    let mut reconciler = Reconciler::new();

    reconciler.apply_event(event(ChangeKind::Update, json!({ "id": 1, "v": "old" }), 1));
    reconciler.apply_snapshot(vec![entity(json!({ "id": 1, "v": "fresh" }))], 1);

    assert_eq!(reconciler.get("1").unwrap().field("v"), Some(&json!("fresh")));
}

#[test]
fn test_insert_racing_snapshot_does_not_duplicate() {
    let mut reconciler = Reconciler::new();
    reconciler.apply_snapshot(
        vec![entity(json!({ "id": "n2" })), entity(json!({ "id": "n1" }))],
        0,
    );

    reconciler.apply_event(event(ChangeKind::Insert, json!({ "id": "n1", "v": 2 }), 1));

    assert_eq!(ids(&reconciler), vec!["n2", "n1"]);
    assert_eq!(reconciler.get("n1").unwrap().field("v"), Some(&json!(2)));
}

#[test]
fn test_update_preserves_position() {
    let mut reconciler = Reconciler::new();
    reconciler.apply_snapshot(
        vec![
            entity(json!({ "id": "c" })),
            entity(json!({ "id": "b" })),
            entity(json!({ "id": "a" })),
        ],
        0,
    );

    reconciler.apply_event(event(ChangeKind::Update, json!({ "id": "b", "is_read": true }), 1));

    assert_eq!(ids(&reconciler), vec!["c", "b", "a"]);
    assert_eq!(reconciler.get("b").unwrap().flag("is_read"), Some(true));
}

#[test]
fn test_update_for_unknown_id_is_prepended() {
    let mut reconciler = Reconciler::new();
    reconciler.apply_snapshot(vec![entity(json!({ "id": "a" }))], 0);

    reconciler.apply_event(event(ChangeKind::Update, json!({ "id": "z" }), 1));

    assert_eq!(ids(&reconciler), vec!["z", "a"]);
}

#[test]
fn test_same_update_twice_is_idempotent() {
    let mut reconciler = Reconciler::new();
    reconciler.apply_snapshot(vec![entity(json!({ "id": 1, "v": "a" }))], 0);

    let update = event(ChangeKind::Update, json!({ "id": 1, "v": "b" }), 1);
    assert!(reconciler.apply_event(update.clone()));
    let once: Vec<Entity> = reconciler.entities().to_vec();

    assert!(!reconciler.apply_event(update));
    assert_eq!(reconciler.entities(), once.as_slice());
}

#[test]
fn test_stale_event_is_ignored() {
    let mut reconciler = Reconciler::new();
    reconciler.apply_event(event(ChangeKind::Update, json!({ "id": 1, "v": "new" }), 5));

    assert!(!reconciler.apply_event(event(ChangeKind::Update, json!({ "id": 1, "v": "old" }), 3)));
    assert_eq!(reconciler.get("1").unwrap().field("v"), Some(&json!("new")));
}

#[test]
fn test_delete_removes_and_blocks_older_snapshot() {
    let mut reconciler = Reconciler::new();
    reconciler.apply_event(event(ChangeKind::Insert, json!({ "id": "n1" }), 1));
    assert!(reconciler.apply_event(event(ChangeKind::Delete, json!({ "id": "n1" }), 2)));
    assert!(reconciler.is_empty());
    assert!(reconciler.is_deleted("n1"));

    // A snapshot requested before the delete still lists the row.
    reconciler.apply_snapshot(vec![entity(json!({ "id": "n1" })), entity(json!({ "id": "n0" }))], 0);

    assert_eq!(ids(&reconciler), vec!["n0"]);
}

#[test]
fn test_snapshot_keeps_event_only_entities_in_front() {
    let mut reconciler = Reconciler::new();
    reconciler.apply_event(event(ChangeKind::Insert, json!({ "id": "live-1" }), 1));
    reconciler.apply_event(event(ChangeKind::Insert, json!({ "id": "live-2" }), 2));

    reconciler.apply_snapshot(
        vec![entity(json!({ "id": "old-2" })), entity(json!({ "id": "old-1" }))],
        0,
    );

    assert_eq!(ids(&reconciler), vec!["live-2", "live-1", "old-2", "old-1"]);
}

#[test]
fn test_resync_snapshot_drops_rows_gone_from_backend() {
    let mut reconciler = Reconciler::new();
    reconciler.apply_snapshot(vec![entity(json!({ "id": "a" })), entity(json!({ "id": "b" }))], 0);
    reconciler.apply_event(event(ChangeKind::Insert, json!({ "id": "c" }), 1));

    // Resync after a reconnect: "b" was deleted while disconnected.
    reconciler.apply_snapshot(vec![entity(json!({ "id": "c" })), entity(json!({ "id": "a" }))], 1);

    assert_eq!(ids(&reconciler), vec!["c", "a"]);
}

#[test]
fn test_duplicate_ids_in_snapshot_collapse() {
    let mut reconciler = Reconciler::new();
    reconciler.apply_snapshot(
        vec![
            entity(json!({ "id": "a", "v": 1 })),
            entity(json!({ "id": "a", "v": 2 })),
        ],
        0,
    );

    assert_eq!(reconciler.len(), 1);
    assert_eq!(reconciler.get("a").unwrap().field("v"), Some(&json!(1)));
}

#[test]
fn test_compact_bounds_versions_without_a_pending_snapshot() {
    let mut reconciler = Reconciler::new();
    reconciler.apply_snapshot(vec![entity(json!({ "id": "a" }))], 0);

    for seq in 1..=500u64 {
        let kind = if seq % 3 == 0 { ChangeKind::Delete } else { ChangeKind::Insert };
        reconciler.apply_event(event(kind, json!({ "id": seq % 50 }), seq));
        reconciler.compact(seq);
        assert_eq!(reconciler.tracked_versions(), 0);
    }

    assert!(!reconciler.is_deleted("3"));
    assert_unique(&reconciler);
}

#[test]
fn test_compact_keeps_versions_newer_than_pending_snapshot() {
    let mut reconciler = Reconciler::new();

    reconciler.apply_event(event(ChangeKind::Insert, json!({ "id": "old" }), 1));
    // Snapshot requested at seq 1 is still in flight.
    reconciler.apply_event(event(ChangeKind::Update, json!({ "id": "a", "v": "live" }), 2));
    reconciler.apply_event(event(ChangeKind::Delete, json!({ "id": "b" }), 3));
    reconciler.compact(1);

    assert_eq!(reconciler.tracked_versions(), 2);
    assert!(reconciler.is_deleted("b"));

    reconciler.apply_snapshot(
        vec![
            entity(json!({ "id": "a", "v": "stale" })),
            entity(json!({ "id": "b" })),
            entity(json!({ "id": "old" })),
        ],
        1,
    );
    reconciler.compact(3);

    assert_eq!(ids(&reconciler), vec!["a", "old"]);
    assert_eq!(reconciler.get("a").unwrap().field("v"), Some(&json!("live")));
    assert_eq!(reconciler.tracked_versions(), 0);
}

#[test]
fn test_uniqueness_and_freshness_under_random_interleavings() {
    let mut rng = StdRng::seed_from_u64(7);

    for _ in 0..200 {
        let mut reconciler = Reconciler::new();
        let mut latest_by_id: std::collections::HashMap<String, (u64, Option<i64>)> =
            std::collections::HashMap::new();

        let snapshot_seq: u64 = rng.gen_range(0..10);
        let snapshot_at_step = rng.gen_range(0..20);
        let snapshot: Vec<Entity> = (0..rng.gen_range(0..6))
            .map(|i| entity(json!({ "id": i, "v": -1 })))
            .collect();

        let mut seq = 0;
        for step in 0..20 {
            if step == snapshot_at_step {
                reconciler.apply_snapshot(snapshot.clone(), snapshot_seq);
                for e in &snapshot {
                    let entry = latest_by_id.entry(e.id().to_string()).or_insert((0, None));
                    if entry.0 <= snapshot_seq {
                        *entry = (snapshot_seq, Some(-1));
                    }
                }
                latest_by_id.retain(|id, (at, _)| {
                    *at > snapshot_seq || snapshot.iter().any(|e| e.id() == id)
                });
            }

            seq += 1;
            let id = rng.gen_range(0..6);
            let kind = match rng.gen_range(0..3) {
                0 => ChangeKind::Insert,
                1 => ChangeKind::Update,
                _ => ChangeKind::Delete,
            };
            let value = seq as i64;
            reconciler.apply_event(event(kind, json!({ "id": id, "v": value }), seq));

            let entry = latest_by_id.entry(id.to_string()).or_insert((0, None));
            if seq > entry.0 {
                *entry = (seq, if kind == ChangeKind::Delete { None } else { Some(value) });
            }

            assert_unique(&reconciler);
        }

        for (id, (_, expected)) in &latest_by_id {
            let actual = reconciler.get(id).and_then(|e| e.field("v")).and_then(Value::as_i64);
            assert_eq!(actual, *expected, "id {} diverged", id);
        }

        for e in reconciler.entities() {
            assert!(
                matches!(latest_by_id.get(e.id()), Some((_, Some(_)))),
                "id {} should not be present",
                e.id()
            );
        }
    }
}
