//! Embedded strongly-consistent datastore.
//!
//! Records are serde-encoded values keyed by `(kind, parent, id)`.
//! Transactions buffer writes and apply them atomically on commit; reads
//! inside a transaction see the pre-transaction state. Tasks enqueued
//! inside a transaction reach the task queue only if the transaction
//! commits, so a rolled-back status change never leaves a stray task
//! behind.
//!
//! Transactions on the same rows are serialized by the store, which is
//! what lets concurrent job drivers race for a pool instance safely: the
//! first transaction to delete the row wins, the loser sees NOT_FOUND.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::queue::{TaskCall, TaskSink};

/// Identifies one record: a kind, an optional parent entity id, and the
/// record's own id. Child records (job logs) carry their job's id as
/// parent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    pub kind: &'static str,
    pub parent: Option<String>,
    pub id: String,
}

impl Key {
    pub fn new(kind: &'static str, id: impl Into<String>) -> Self {
        Self {
            kind,
            parent: None,
            id: id.into(),
        }
    }

    pub fn child_of(kind: &'static str, parent: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind,
            parent: Some(parent.into()),
            id: id.into(),
        }
    }
}

/// Query over one kind: optional ancestor, optional `field < bound`
/// filter on a millisecond-timestamp field, optional descending order,
/// optional limit. Results are paged with an opaque [`Cursor`].
#[derive(Debug, Clone)]
pub struct Query {
    kind: &'static str,
    ancestor: Option<String>,
    before: Option<(&'static str, i64)>,
    order_desc: Option<&'static str>,
    limit: Option<usize>,
}

impl Query {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            ancestor: None,
            before: None,
            order_desc: None,
            limit: None,
        }
    }

    /// Restrict to children of the given parent id.
    pub fn ancestor(mut self, parent: impl Into<String>) -> Self {
        self.ancestor = Some(parent.into());
        self
    }

    /// Keep records whose `field` timestamp is strictly before `bound`.
    /// Records without the field are excluded.
    pub fn before(mut self, field: &'static str, bound: DateTime<Utc>) -> Self {
        self.before = Some((field, bound.timestamp_millis()));
        self
    }

    /// Order results by `field` descending (ties broken by id).
    pub fn order_desc(mut self, field: &'static str) -> Self {
        self.order_desc = Some(field);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Opaque pagination cursor; pass back to continue a keys-only scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor(String);

/// One page of a keys-only query. `cursor` is `Some` while more records
/// may remain.
#[derive(Debug)]
pub struct KeyPage {
    pub keys: Vec<Key>,
    pub cursor: Option<Cursor>,
}

enum Mutation {
    Put(Key, Value),
    Delete(Key),
}

/// A single transaction. Reads see the state at transaction start;
/// writes and enqueued tasks take effect only on commit.
pub struct Txn<'a> {
    snapshot: &'a HashMap<Key, Value>,
    mutations: Vec<Mutation>,
    tasks: Vec<TaskCall>,
    id_seq: &'a AtomicU64,
}

impl Txn<'_> {
    pub fn get<T: DeserializeOwned>(&self, key: &Key) -> Result<Option<T>> {
        match self.snapshot.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    pub fn put<T: Serialize>(&mut self, key: &Key, record: &T) -> Result<()> {
        let value = serde_json::to_value(record)?;
        self.mutations.push(Mutation::Put(key.clone(), value));
        Ok(())
    }

    /// Store a child record under a freshly allocated id. Allocated ids
    /// are zero-padded so id order matches allocation order.
    pub fn put_child<T: Serialize>(
        &mut self,
        kind: &'static str,
        parent: &str,
        record: &T,
    ) -> Result<Key> {
        let seq = self.id_seq.fetch_add(1, Ordering::Relaxed);
        let key = Key::child_of(kind, parent, format!("{seq:016}"));
        self.put(&key, record)?;
        Ok(key)
    }

    /// Deleting a missing record is a no-op.
    pub fn delete(&mut self, key: &Key) {
        self.mutations.push(Mutation::Delete(key.clone()));
    }

    /// Enqueue a task to be submitted if and when this transaction
    /// commits.
    pub fn enqueue(&mut self, call: TaskCall) {
        self.tasks.push(call);
    }
}

/// The store itself. Cheap to share via `Arc`.
pub struct Store {
    records: Mutex<HashMap<Key, Value>>,
    sink: Arc<dyn TaskSink>,
    id_seq: AtomicU64,
}

impl Store {
    pub fn new(sink: Arc<dyn TaskSink>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            sink,
            id_seq: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Key, Value>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` as one transaction. An `Err` from the closure rolls back
    /// every buffered write and discards enqueued tasks.
    pub fn run_in_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Txn<'_>) -> Result<T>,
    {
        let mut records = self.lock();

        let (result, mutations, tasks) = {
            let mut tx = Txn {
                snapshot: &records,
                mutations: Vec::new(),
                tasks: Vec::new(),
                id_seq: &self.id_seq,
            };
            let result = f(&mut tx);
            (result, tx.mutations, tx.tasks)
        };

        let value = result?;

        for mutation in mutations {
            match mutation {
                Mutation::Put(key, record) => {
                    records.insert(key, record);
                }
                Mutation::Delete(key) => {
                    records.remove(&key);
                }
            }
        }
        drop(records);

        for call in tasks {
            self.sink.submit(call);
        }

        Ok(value)
    }

    /// Non-transactional read.
    pub fn get<T: DeserializeOwned>(&self, key: &Key) -> Result<Option<T>> {
        match self.lock().get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Non-transactional write.
    pub fn put<T: Serialize>(&self, key: &Key, record: &T) -> Result<()> {
        let value = serde_json::to_value(record)?;
        self.lock().insert(key.clone(), value);
        Ok(())
    }

    /// Run a query and decode the matching records.
    pub fn query<T: DeserializeOwned>(&self, query: &Query) -> Result<Vec<(Key, T)>> {
        let (entries, _) = self.scan(query, None);
        entries
            .into_iter()
            .map(|(key, value)| Ok((key, serde_json::from_value(value)?)))
            .collect()
    }

    /// Run a keys-only query, resuming from `cursor` if given.
    pub fn query_keys(&self, query: &Query, cursor: Option<&Cursor>) -> KeyPage {
        let (entries, cursor) = self.scan(query, cursor);
        KeyPage {
            keys: entries.into_iter().map(|(key, _)| key).collect(),
            cursor,
        }
    }

    fn scan(&self, query: &Query, cursor: Option<&Cursor>) -> (Vec<(Key, Value)>, Option<Cursor>) {
        let records = self.lock();

        let mut matches: Vec<(Key, Value)> = records
            .iter()
            .filter(|(key, value)| {
                if key.kind != query.kind {
                    return false;
                }
                if let Some(ancestor) = &query.ancestor {
                    if key.parent.as_deref() != Some(ancestor.as_str()) {
                        return false;
                    }
                }
                if let Some((field, bound)) = query.before {
                    match value.get(field).and_then(Value::as_i64) {
                        Some(millis) if millis < bound => {}
                        _ => return false,
                    }
                }
                true
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        match query.order_desc {
            Some(field) => matches.sort_by(|(ka, va), (kb, vb)| {
                let a = va.get(field).and_then(Value::as_i64).unwrap_or(i64::MIN);
                let b = vb.get(field).and_then(Value::as_i64).unwrap_or(i64::MIN);
                b.cmp(&a).then_with(|| ka.id.cmp(&kb.id))
            }),
            // Scan order is id-ascending, which is what makes the cursor
            // a plain "resume after this id" marker.
            None => matches.sort_by(|(ka, _), (kb, _)| ka.id.cmp(&kb.id)),
        }

        if let Some(Cursor(after)) = cursor {
            matches.retain(|(key, _)| key.id > *after);
        }

        let mut next_cursor = None;
        if let Some(limit) = query.limit {
            if matches.len() > limit {
                matches.truncate(limit);
                next_cursor = matches.last().map(|(key, _)| Cursor(key.id.clone()));
            }
        }

        (matches, next_cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{TaskCall, TaskSink};
    use serde::Deserialize;

    #[derive(Default)]
    struct NullSink(Mutex<Vec<TaskCall>>);

    impl TaskSink for NullSink {
        fn submit(&self, call: TaskCall) {
            self.0.lock().unwrap().push(call);
        }
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Row {
        name: String,
        stamp: i64,
    }

    fn store_with_sink() -> (Store, Arc<NullSink>) {
        let sink = Arc::new(NullSink::default());
        (Store::new(sink.clone()), sink)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (store, _) = store_with_sink();
        let key = Key::new("Row", "a");
        let row = Row {
            name: "first".into(),
            stamp: 10,
        };

        store.put(&key, &row).unwrap();
        assert_eq!(store.get::<Row>(&key).unwrap(), Some(row));
        assert_eq!(store.get::<Row>(&Key::new("Row", "missing")).unwrap(), None);
    }

    #[test]
    fn test_transaction_commit_applies_writes_and_tasks() {
        let (store, sink) = store_with_sink();
        let key = Key::new("Row", "a");

        store
            .run_in_transaction(|tx| {
                tx.put(
                    &key,
                    &Row {
                        name: "committed".into(),
                        stamp: 1,
                    },
                )?;
                tx.enqueue(TaskCall::ProcessJob {
                    job_id: "j1".into(),
                });
                Ok(())
            })
            .unwrap();

        assert!(store.get::<Row>(&key).unwrap().is_some());
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_transaction_rollback_discards_writes_and_tasks() {
        let (store, sink) = store_with_sink();
        let key = Key::new("Row", "a");

        let result: Result<()> = store.run_in_transaction(|tx| {
            tx.put(
                &key,
                &Row {
                    name: "rolled back".into(),
                    stamp: 1,
                },
            )?;
            tx.enqueue(TaskCall::ProcessJob {
                job_id: "j1".into(),
            });
            Err(crate::error::DreamError::Internal("boom".into()))
        });

        assert!(result.is_err());
        assert!(store.get::<Row>(&key).unwrap().is_none());
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_transaction_reads_pre_transaction_state() {
        let (store, _) = store_with_sink();
        let key = Key::new("Row", "a");

        store
            .run_in_transaction(|tx| {
                tx.put(
                    &key,
                    &Row {
                        name: "new".into(),
                        stamp: 1,
                    },
                )?;
                // Own write is not visible within the same transaction.
                assert!(tx.get::<Row>(&key)?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (store, _) = store_with_sink();
        let key = Key::new("Row", "a");

        store
            .run_in_transaction(|tx| {
                tx.delete(&key);
                tx.delete(&key);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_child_ids_preserve_insertion_order() {
        let (store, _) = store_with_sink();

        store
            .run_in_transaction(|tx| {
                for i in 0..3 {
                    tx.put_child(
                        "Log",
                        "job-1",
                        &Row {
                            name: format!("entry-{i}"),
                            stamp: i,
                        },
                    )?;
                }
                Ok(())
            })
            .unwrap();

        let rows = store
            .query::<Row>(&Query::new("Log").ancestor("job-1"))
            .unwrap();
        let names: Vec<_> = rows.iter().map(|(_, r)| r.name.as_str()).collect();
        assert_eq!(names, ["entry-0", "entry-1", "entry-2"]);
    }

    #[test]
    fn test_query_filter_order_limit() {
        let (store, _) = store_with_sink();
        for (id, stamp) in [("a", 100), ("b", 300), ("c", 200), ("d", 400)] {
            store
                .put(
                    &Key::new("Row", id),
                    &Row {
                        name: id.into(),
                        stamp,
                    },
                )
                .unwrap();
        }

        let bound = DateTime::from_timestamp_millis(400).unwrap();
        let rows = store
            .query::<Row>(
                &Query::new("Row")
                    .before("stamp", bound)
                    .order_desc("stamp")
                    .limit(2),
            )
            .unwrap();

        let names: Vec<_> = rows.iter().map(|(_, r)| r.name.as_str()).collect();
        assert_eq!(names, ["b", "c"]);
    }

    #[test]
    fn test_keys_only_paging() {
        let (store, _) = store_with_sink();
        for i in 0..5 {
            store
                .put(
                    &Key::new("Row", format!("{i:03}")),
                    &Row {
                        name: i.to_string(),
                        stamp: i,
                    },
                )
                .unwrap();
        }

        let query = Query::new("Row").limit(2);
        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = store.query_keys(&query, cursor.as_ref());
            seen.extend(page.keys.into_iter().map(|k| k.id));
            match page.cursor {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }

        assert_eq!(seen, ["000", "001", "002", "003", "004"]);
    }
}
