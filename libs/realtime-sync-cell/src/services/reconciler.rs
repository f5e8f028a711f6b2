use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::models::{ChangeEvent, ChangeKind, Entity};

#[derive(Debug, Clone, Copy)]
struct Version {
    observed_at: u64,
    deleted: bool,
}

/// Merges a snapshot and a live change stream into one newest-first
/// collection that never holds two entries with the same id and always
/// reflects the most recently observed version of each id.
///
/// Every id remembers the sequence number it was last observed at, so
/// stale or re-delivered events are ignored and a snapshot that resolves
/// after newer events cannot roll them back.
#[derive(Debug, Default)]
pub struct Reconciler {
    entries: Vec<Entity>,
    versions: HashMap<String, Version>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the contents with `snapshot`, which was requested when the
    /// session's sequence counter stood at `observed_at`.
    ///
    /// Ids seen by events after `observed_at` keep the event's version, or
    /// stay deleted. Entities only known from such events stay at the front
    /// in their current order, followed by the snapshot in its own order.
    pub fn apply_snapshot(&mut self, snapshot: Vec<Entity>, observed_at: u64) {
        let previous = std::mem::take(&mut self.entries);
        let snapshot_ids: HashSet<&str> = snapshot.iter().map(Entity::id).collect();

        let is_newer = |versions: &HashMap<String, Version>, id: &str| {
            versions
                .get(id)
                .map(|v| v.observed_at > observed_at)
                .unwrap_or(false)
        };

        let mut fresher: HashMap<String, Entity> = HashMap::new();
        let mut merged = Vec::with_capacity(previous.len().max(snapshot.len()));

        for entity in previous {
            if !is_newer(&self.versions, entity.id()) {
                continue;
            }
            if snapshot_ids.contains(entity.id()) {
                fresher.insert(entity.id().to_string(), entity);
            } else {
                merged.push(entity);
            }
        }

        let mut seen: HashSet<String> = merged.iter().map(|e| e.id().to_string()).collect();
        let mut snapshot_versions = Vec::new();

        for entity in snapshot {
            if !seen.insert(entity.id().to_string()) {
                debug!("Snapshot contained duplicate id {}, keeping first", entity.id());
                continue;
            }

            if is_newer(&self.versions, entity.id()) {
                // Observed by a later event: keep that version, or nothing if it was deleted.
                if let Some(current) = fresher.remove(entity.id()) {
                    merged.push(current);
                }
                continue;
            }

            snapshot_versions.push(entity.id().to_string());
            merged.push(entity);
        }

        self.versions.retain(|_, v| v.observed_at > observed_at);
        for id in snapshot_versions {
            self.versions.insert(id, Version { observed_at, deleted: false });
        }

        debug!(
            "Applied snapshot at seq {}: {} entities",
            observed_at,
            merged.len()
        );
        self.entries = merged;
    }

    /// Applies one change. Returns `true` when the collection changed.
    pub fn apply_event(&mut self, event: ChangeEvent) -> bool {
        let ChangeEvent { kind, entity, observed_at } = event;

        if let Some(version) = self.versions.get(entity.id()) {
            if observed_at <= version.observed_at {
                debug!(
                    "Ignoring stale {:?} for {} (seq {} <= {})",
                    kind,
                    entity.id(),
                    observed_at,
                    version.observed_at
                );
                return false;
            }
        }

        let id = entity.id().to_string();
        let position = self.position(&id);

        let changed = match kind {
            ChangeKind::Insert | ChangeKind::Update => {
                match position {
                    Some(index) => self.entries[index] = entity,
                    None => self.entries.insert(0, entity),
                }
                true
            }
            ChangeKind::Delete => match position {
                Some(index) => {
                    self.entries.remove(index);
                    true
                }
                None => false,
            },
        };

        self.versions.insert(
            id,
            Version {
                observed_at,
                deleted: kind == ChangeKind::Delete,
            },
        );

        changed
    }

    /// Forgets versions observed at or before `floor`, tombstones included.
    ///
    /// Only snapshots still in flight need those versions, so the caller
    /// passes the tag of the pending snapshot, or its current sequence
    /// number when none is pending. Snapshots requested later are tagged
    /// above `floor` and treat such ids as authoritative anyway.
    pub fn compact(&mut self, floor: u64) {
        let before = self.versions.len();
        self.versions.retain(|_, v| v.observed_at > floor);

        let dropped = before - self.versions.len();
        if dropped > 0 {
            debug!("Compacted {} versions at or below seq {}", dropped, floor);
        }
    }

    /// Number of ids whose last observed version is still remembered.
    pub fn tracked_versions(&self) -> usize {
        self.versions.len()
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entries
    }

    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.entries.iter().find(|e| e.id() == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `id` was removed by a delete event that is still authoritative.
    pub fn is_deleted(&self, id: &str) -> bool {
        self.versions.get(id).map(|v| v.deleted).unwrap_or(false)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.id() == id)
    }
}
