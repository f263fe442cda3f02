//! Entity state tracking inside one scope.
//!
//! The tracker owns every row a scope has loaded or queued, keyed by
//! `(table, primary key)` so the same row always maps to the same handle.
//! Nothing leaves the tracker except owned [`Record`] snapshots produced by
//! [`Tracker::detach`].

use crate::error::{DbError, DbResult};
use crate::models::{QueryParam, Record};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TRACKER_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a tracked row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Not known to any scope.
    Transient,
    /// Queued for insertion, not yet flushed.
    Pending,
    /// Backed by a stored row and tracked by the scope.
    Persistent,
    /// No longer tracked; only an owned snapshot remains.
    Detached,
}

/// Handle to a row tracked by one scope.
///
/// Handles are only meaningful to the scope that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Managed {
    tracker: u64,
    index: usize,
}

/// Write queued for the next flush.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingOp {
    Insert(Record),
    Update(Record),
    Delete,
}

#[derive(Debug)]
struct Slot {
    table: String,
    pk: String,
    key: Option<QueryParam>,
    values: Record,
    state: EntityState,
    op: Option<PendingOp>,
}

/// Flush work item: which slot, what to write.
#[derive(Debug, Clone)]
pub struct FlushItem {
    pub handle: Managed,
    pub table: String,
    pub pk: String,
    pub key: Option<QueryParam>,
    pub op: PendingOp,
}

#[derive(Debug)]
pub struct Tracker {
    id: u64,
    slots: Vec<Slot>,
    identity: HashMap<(String, String), usize>,
    /// Slots with a queued write, in the order they were first touched.
    queue: Vec<usize>,
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity-map key for a primary key value.
fn identity_key(table: &str, key: &QueryParam) -> (String, String) {
    (table.to_string(), key.to_json().to_string())
}

impl Tracker {
    pub fn new() -> Self {
        Self {
            id: NEXT_TRACKER_ID.fetch_add(1, Ordering::Relaxed),
            slots: Vec::new(),
            identity: HashMap::new(),
            queue: Vec::new(),
        }
    }

    fn slot(&self, handle: Managed) -> DbResult<&Slot> {
        if handle.tracker != self.id {
            return Err(DbError::invalid_input(
                "Entity handle belongs to a different scope",
            ));
        }
        self.slots
            .get(handle.index)
            .ok_or_else(|| DbError::internal("Entity handle out of range"))
    }

    fn slot_mut(&mut self, handle: Managed) -> DbResult<&mut Slot> {
        if handle.tracker != self.id {
            return Err(DbError::invalid_input(
                "Entity handle belongs to a different scope",
            ));
        }
        self.slots
            .get_mut(handle.index)
            .ok_or_else(|| DbError::internal("Entity handle out of range"))
    }

    fn handle(&self, index: usize) -> Managed {
        Managed {
            tracker: self.id,
            index,
        }
    }

    fn enqueue(&mut self, index: usize) {
        if !self.queue.contains(&index) {
            self.queue.push(index);
        }
    }

    /// Live handle for a stored row, if this scope already tracks it.
    pub fn lookup(&self, table: &str, key: &QueryParam) -> Option<Managed> {
        self.identity
            .get(&identity_key(table, key))
            .map(|&index| self.handle(index))
    }

    /// Track a row just read from storage.
    ///
    /// A row already in the identity map keeps its handle; its snapshot is
    /// refreshed but fields with unflushed changes keep the new values.
    pub fn attach(&mut self, table: &str, pk: &str, record: Record) -> DbResult<Managed> {
        let key = record
            .get(pk)
            .cloned()
            .map(QueryParam::from_json)
            .filter(|k| !k.is_null())
            .ok_or_else(|| {
                DbError::invalid_input(format!(
                    "Row from '{}' has no value for primary key '{}'",
                    table, pk
                ))
            })?;

        if let Some(handle) = self.lookup(table, &key) {
            let slot = self.slot_mut(handle)?;
            let mut values = record;
            if let Some(PendingOp::Update(changes)) = &slot.op {
                for (k, v) in changes {
                    values.insert(k.clone(), v.clone());
                }
            }
            slot.values = values;
            return Ok(handle);
        }

        let index = self.slots.len();
        self.identity.insert(identity_key(table, &key), index);
        self.slots.push(Slot {
            table: table.to_string(),
            pk: pk.to_string(),
            key: Some(key),
            values: record,
            state: EntityState::Persistent,
            op: None,
        });
        Ok(self.handle(index))
    }

    /// Queue a new row for insertion.
    pub fn add(&mut self, table: &str, pk: &str, fields: Record) -> Managed {
        let key = fields
            .get(pk)
            .cloned()
            .map(QueryParam::from_json)
            .filter(|k| !k.is_null());
        let index = self.slots.len();
        self.slots.push(Slot {
            table: table.to_string(),
            pk: pk.to_string(),
            key,
            values: fields.clone(),
            state: EntityState::Pending,
            op: Some(PendingOp::Insert(fields)),
        });
        self.enqueue(index);
        self.handle(index)
    }

    /// Stage field changes on a pending or persistent row.
    pub fn set(&mut self, handle: Managed, fields: Record) -> DbResult<()> {
        let slot = self.slot_mut(handle)?;
        match slot.state {
            EntityState::Detached | EntityState::Transient => {
                return Err(DbError::detached(slot.table.clone()));
            }
            EntityState::Pending | EntityState::Persistent => {}
        }
        if fields.contains_key(&slot.pk) && slot.state == EntityState::Persistent {
            let unchanged = fields.get(&slot.pk).cloned().map(QueryParam::from_json) == slot.key;
            if !unchanged {
                return Err(DbError::invalid_input(format!(
                    "Primary key '{}' cannot be changed",
                    slot.pk
                )));
            }
        }

        for (k, v) in &fields {
            slot.values.insert(k.clone(), v.clone());
        }
        match &mut slot.op {
            Some(PendingOp::Insert(pending)) | Some(PendingOp::Update(pending)) => {
                pending.extend(fields);
            }
            Some(PendingOp::Delete) => {
                return Err(DbError::invalid_input(
                    "Cannot modify a row that is queued for deletion",
                ));
            }
            None => {
                if fields.is_empty() {
                    return Ok(());
                }
                slot.op = Some(PendingOp::Update(fields));
            }
        }
        self.enqueue(handle.index);
        Ok(())
    }

    /// Queue a row for deletion. A never-flushed row is simply discarded.
    pub fn remove(&mut self, handle: Managed) -> DbResult<()> {
        let slot = self.slot_mut(handle)?;
        match slot.state {
            EntityState::Detached | EntityState::Transient => {
                Err(DbError::detached(slot.table.clone()))
            }
            EntityState::Pending => {
                slot.op = None;
                slot.state = EntityState::Detached;
                self.queue.retain(|&i| i != handle.index);
                Ok(())
            }
            EntityState::Persistent => {
                slot.op = Some(PendingOp::Delete);
                self.enqueue(handle.index);
                Ok(())
            }
        }
    }

    pub fn state(&self, handle: Managed) -> EntityState {
        self.slot(handle)
            .map(|s| s.state)
            .unwrap_or(EntityState::Transient)
    }

    /// The row is queued for deletion.
    pub fn is_deleted(&self, handle: Managed) -> bool {
        self.slot(handle)
            .map(|s| matches!(s.op, Some(PendingOp::Delete)))
            .unwrap_or(false)
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Current snapshot of a tracked row.
    pub fn values(&self, handle: Managed) -> DbResult<&Record> {
        Ok(&self.slot(handle)?.values)
    }

    pub fn key(&self, handle: Managed) -> DbResult<Option<QueryParam>> {
        Ok(self.slot(handle)?.key.clone())
    }

    pub fn table(&self, handle: Managed) -> DbResult<(&str, &str)> {
        let slot = self.slot(handle)?;
        Ok((&slot.table, &slot.pk))
    }

    /// Take the queued writes in order. Their slots keep their state until
    /// the flush outcome is recorded.
    pub fn drain_pending(&mut self) -> Vec<FlushItem> {
        let queue = std::mem::take(&mut self.queue);
        queue
            .into_iter()
            .filter_map(|index| {
                let slot = self.slots.get_mut(index)?;
                let op = slot.op.take()?;
                Some(FlushItem {
                    handle: Managed {
                        tracker: self.id,
                        index,
                    },
                    table: slot.table.clone(),
                    pk: slot.pk.clone(),
                    key: slot.key.clone(),
                    op,
                })
            })
            .collect()
    }

    /// Put unflushed work back after a failed flush so it is not lost.
    pub fn requeue(&mut self, items: Vec<FlushItem>) {
        for item in items.into_iter().rev() {
            if let Some(slot) = self.slots.get_mut(item.handle.index) {
                slot.op = Some(item.op);
                self.queue.retain(|&i| i != item.handle.index);
                self.queue.insert(0, item.handle.index);
            }
        }
    }

    /// Record a successful insert: the row now has a key and is persistent.
    pub fn mark_inserted(&mut self, handle: Managed, key: QueryParam) -> DbResult<()> {
        let id = identity_key(&self.slot(handle)?.table, &key);
        let slot = self.slot_mut(handle)?;
        slot.values.insert(slot.pk.clone(), key.to_json());
        slot.key = Some(key);
        slot.state = EntityState::Persistent;
        self.identity.insert(id, handle.index);
        Ok(())
    }

    /// Record a successful delete, or a row that vanished underneath us.
    pub fn mark_gone(&mut self, handle: Managed) -> DbResult<()> {
        let slot = self.slot_mut(handle)?;
        slot.state = EntityState::Detached;
        slot.op = None;
        if let Some(key) = slot.key.clone() {
            let id = identity_key(&slot.table, &key);
            self.identity.remove(&id);
        }
        self.queue.retain(|&i| i != handle.index);
        Ok(())
    }

    /// Replace a row's snapshot with freshly loaded values.
    pub fn refresh(&mut self, handle: Managed, record: Record) -> DbResult<()> {
        self.slot_mut(handle)?.values = record;
        Ok(())
    }

    /// Stop tracking a row and hand back an owned snapshot.
    ///
    /// Detaching twice returns the same snapshot again.
    pub fn detach(&mut self, handle: Managed) -> DbResult<Record> {
        let slot = self.slot_mut(handle)?;
        if slot.state != EntityState::Detached {
            slot.state = EntityState::Detached;
            slot.op = None;
            if let Some(key) = slot.key.clone() {
                let id = identity_key(&slot.table, &key);
                self.identity.remove(&id);
            }
            self.queue.retain(|&i| i != handle.index);
        }
        Ok(self.slot(handle)?.values.clone())
    }

    /// Detach every row still tracked. Returns how many were live.
    pub fn detach_all(&mut self) -> usize {
        let mut live = 0;
        for slot in &mut self.slots {
            if slot.state != EntityState::Detached {
                slot.state = EntityState::Detached;
                slot.op = None;
                live += 1;
            }
        }
        self.identity.clear();
        self.queue.clear();
        live
    }

    pub fn len(&self) -> usize {
        self.identity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identity.is_empty()
    }
}

/// Extract a primary key value from a record.
pub fn record_key(record: &Record, pk: &str) -> Option<QueryParam> {
    match record.get(pk) {
        None | Some(JsonValue::Null) => None,
        Some(v) => Some(QueryParam::from_json(v.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(v: JsonValue) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_attach_is_identity_mapped() {
        let mut t = Tracker::new();
        let a = t
            .attach("users", "id", record(json!({"id": 1, "name": "a"})))
            .unwrap();
        let b = t
            .attach("users", "id", record(json!({"id": 1, "name": "a2"})))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(t.state(a), EntityState::Persistent);
        assert_eq!(t.values(a).unwrap()["name"], json!("a2"));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_attach_keeps_unflushed_changes() {
        let mut t = Tracker::new();
        let h = t
            .attach("users", "id", record(json!({"id": 1, "name": "a"})))
            .unwrap();
        t.set(h, record(json!({"name": "changed"}))).unwrap();
        t.attach("users", "id", record(json!({"id": 1, "name": "a"})))
            .unwrap();
        assert_eq!(t.values(h).unwrap()["name"], json!("changed"));
    }

    #[test]
    fn test_attach_requires_primary_key() {
        let mut t = Tracker::new();
        let err = t
            .attach("users", "id", record(json!({"name": "a"})))
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
    }

    #[test]
    fn test_add_then_flush_lifecycle() {
        let mut t = Tracker::new();
        let h = t.add("users", "id", record(json!({"name": "new"})));
        assert_eq!(t.state(h), EntityState::Pending);
        assert!(t.has_pending());

        let items = t.drain_pending();
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0].op, PendingOp::Insert(_)));
        assert!(items[0].key.is_none());

        t.mark_inserted(h, QueryParam::Int(7)).unwrap();
        assert_eq!(t.state(h), EntityState::Persistent);
        assert_eq!(t.lookup("users", &QueryParam::Int(7)), Some(h));
        assert_eq!(t.values(h).unwrap()["id"], json!(7));
    }

    #[test]
    fn test_set_merges_into_pending_insert() {
        let mut t = Tracker::new();
        let h = t.add("users", "id", record(json!({"name": "a"})));
        t.set(h, record(json!({"email": "a@x"}))).unwrap();
        let items = t.drain_pending();
        assert_eq!(items.len(), 1);
        match &items[0].op {
            PendingOp::Insert(fields) => {
                assert_eq!(fields.len(), 2);
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn test_set_rejects_primary_key_change() {
        let mut t = Tracker::new();
        let h = t
            .attach("users", "id", record(json!({"id": 1, "name": "a"})))
            .unwrap();
        assert!(t.set(h, record(json!({"id": 2}))).is_err());
        assert!(t.set(h, record(json!({"id": 1, "name": "b"}))).is_ok());
    }

    #[test]
    fn test_remove_pending_discards_without_write() {
        let mut t = Tracker::new();
        let h = t.add("users", "id", record(json!({"name": "a"})));
        t.remove(h).unwrap();
        assert_eq!(t.state(h), EntityState::Detached);
        assert!(t.drain_pending().is_empty());
    }

    #[test]
    fn test_remove_persistent_queues_delete() {
        let mut t = Tracker::new();
        let h = t
            .attach("users", "id", record(json!({"id": 3})))
            .unwrap();
        t.remove(h).unwrap();
        assert!(t.is_deleted(h));
        assert!(t.set(h, record(json!({"name": "x"}))).is_err());
        let items = t.drain_pending();
        assert!(matches!(items[0].op, PendingOp::Delete));
        t.mark_gone(h).unwrap();
        assert_eq!(t.state(h), EntityState::Detached);
        assert!(t.lookup("users", &QueryParam::Int(3)).is_none());
    }

    #[test]
    fn test_detach_is_idempotent_and_blocks_writes() {
        let mut t = Tracker::new();
        let h = t
            .attach("users", "id", record(json!({"id": 1, "name": "a"})))
            .unwrap();
        let first = t.detach(h).unwrap();
        let second = t.detach(h).unwrap();
        assert_eq!(first, second);
        assert!(matches!(
            t.set(h, record(json!({"name": "b"}))),
            Err(DbError::Detached { .. })
        ));
        assert!(matches!(t.remove(h), Err(DbError::Detached { .. })));
    }

    #[test]
    fn test_handle_from_other_tracker_rejected() {
        let mut a = Tracker::new();
        let mut b = Tracker::new();
        let h = a.attach("users", "id", record(json!({"id": 1}))).unwrap();
        assert!(matches!(b.detach(h), Err(DbError::InvalidInput { .. })));
        assert_eq!(b.state(h), EntityState::Transient);
    }

    #[test]
    fn test_requeue_restores_order() {
        let mut t = Tracker::new();
        let a = t.add("users", "id", record(json!({"name": "a"})));
        let b = t.add("users", "id", record(json!({"name": "b"})));
        let items = t.drain_pending();
        t.requeue(items);
        let again = t.drain_pending();
        assert_eq!(again[0].handle, a);
        assert_eq!(again[1].handle, b);
    }

    #[test]
    fn test_detach_all_counts_live_rows() {
        let mut t = Tracker::new();
        let a = t.attach("users", "id", record(json!({"id": 1}))).unwrap();
        t.attach("users", "id", record(json!({"id": 2}))).unwrap();
        t.detach(a).unwrap();
        assert_eq!(t.detach_all(), 1);
        assert!(t.is_empty());
    }

    #[test]
    fn test_record_key() {
        let r = record(json!({"id": 5, "other": null}));
        assert_eq!(record_key(&r, "id"), Some(QueryParam::Int(5)));
        assert_eq!(record_key(&r, "other"), None);
        assert_eq!(record_key(&r, "missing"), None);
    }
}
