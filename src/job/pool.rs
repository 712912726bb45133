//! The warm instance pool: acquisition candidates and the shrink sweep.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::app::App;
use crate::datastore::{Key, Query, Store};
use crate::error::Result;
use crate::job::instance::Instance;
use crate::queue::TaskCall;

pub const POOL_INSTANCE_KIND: &str = "PoolInstance";
const POOL_ADD_TIME_FIELD: &str = "pool_add_time";

/// Minutes an instance must sit idle in the pool before the shrink sweep
/// considers it.
const MIN_IDLE_MINUTES: i64 = 15;

/// Minutes since launch before an idle instance is terminated. Amazon
/// bills the first hour up front, so the remainder of that hour is
/// already paid for and the instance may as well stay available.
const MIN_AGE_MINUTES: i64 = 50;

const SHRINK_PAGE_SIZE: usize = 1000;

const CANDIDATE_LIMIT: usize = 100;
const CANDIDATE_WINDOW_SECONDS: i64 = 5;

/// A warm instance nobody is using. Keyed by the instance id, so
/// re-adding the same instance overwrites rather than duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolInstance {
    pub instance: Instance,

    /// When the instance was released into the pool.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub pool_add_time: DateTime<Utc>,
}

impl PoolInstance {
    pub fn key(instance_id: &str) -> Key {
        Key::new(POOL_INSTANCE_KIND, instance_id)
    }

    /// Release `instance` into the pool as of now.
    pub fn from_instance(instance: Instance) -> Self {
        Self {
            instance,
            pool_add_time: Utc::now(),
        }
    }
}

/// Candidate pool instances for a job that needs a worker.
///
/// Takes the 100 most recently added pool rows and keeps the prefix
/// whose `pool_add_time` is within a small window of the newest one.
/// Concentrating load on the hottest instances this way is what lets the
/// shrink sweep find the rest idle and release them. The window widens
/// on retry so a burst of new jobs does not keep piling onto the same
/// handful.
pub fn get_candidate_pool_instances(store: &Store, retry: bool) -> Result<Vec<Key>> {
    let query = Query::new(POOL_INSTANCE_KIND)
        .order_desc(POOL_ADD_TIME_FIELD)
        .limit(CANDIDATE_LIMIT);
    let instances: Vec<(Key, PoolInstance)> = store.query(&query)?;

    let Some((_, newest)) = instances.first() else {
        // An empty list, not an unset one: the driver distinguishes
        // "not fetched yet" from "pool is empty".
        return Ok(Vec::new());
    };

    let mut window = Duration::seconds(CANDIDATE_WINDOW_SECONDS);
    if retry {
        window = window * 5;
    }
    let min_add_time = newest.pool_add_time - window;

    Ok(instances
        .iter()
        .take_while(|(_, pool_instance)| pool_instance.pool_add_time >= min_add_time)
        .map(|(key, _)| key.clone())
        .collect())
}

/// One shrink sweep over the whole pool.
///
/// Queries for rows idle past the idle floor in keys-only pages, then
/// re-checks each candidate inside its own transaction before acting: a
/// job may have adopted the row between query and transaction, and the
/// instance must also be past the billing-age floor. Candidates that
/// fail to process are left for the next sweep.
pub fn shrink_pool(store: &Store) -> Result<()> {
    let mut cursor = None;

    loop {
        let max_pool_add_time = Utc::now() - Duration::minutes(MIN_IDLE_MINUTES);
        let query = Query::new(POOL_INSTANCE_KIND)
            .before(POOL_ADD_TIME_FIELD, max_pool_add_time)
            .limit(SHRINK_PAGE_SIZE);
        let page = store.query_keys(&query, cursor.as_ref());

        for key in &page.keys {
            let result = store.run_in_transaction(|tx| {
                let Some(pool_instance) = tx.get::<PoolInstance>(key)? else {
                    return Ok(());
                };

                if pool_instance.pool_add_time > max_pool_add_time {
                    return Ok(());
                }

                let max_launch_time = Utc::now() - Duration::minutes(MIN_AGE_MINUTES);
                if let Some(launch_time) = pool_instance.instance.launch_time {
                    if launch_time > max_launch_time {
                        return Ok(());
                    }
                }

                tx.delete(key);
                tx.enqueue(TaskCall::TerminateInstance {
                    instance_id: pool_instance.instance.id.clone(),
                });
                tracing::info!(
                    instance_id = %pool_instance.instance.id,
                    "Releasing idle pool instance for termination"
                );

                Ok(())
            });

            if let Err(err) = result {
                tracing::warn!(
                    instance_id = %key.id,
                    error = %err,
                    "Skipping pool shrink candidate"
                );
            }
        }

        match page.cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    Ok(())
}

/// Periodic shrink sweeps until shutdown.
pub async fn run_shrink_loop(store: Arc<Store>, interval: StdDuration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Pool shrinker shutting down");
                break;
            }
            _ = ticker.tick() => {
                if let Err(err) = shrink_pool(&store) {
                    tracing::error!(error = %err, "Pool shrink sweep failed");
                }
            }
        }
    }
}

/// Delayed-task handler: terminate one instance. Naturally idempotent on
/// the provider, so redelivery is harmless.
pub async fn terminate_instance(app: &App, instance_id: &str) -> Result<()> {
    tracing::info!(instance_id, "Terminating instance");
    app.cloud.terminate_instance(instance_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::TaskSink;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<TaskCall>>);

    impl TaskSink for RecordingSink {
        fn submit(&self, call: TaskCall) {
            self.0.lock().unwrap().push(call);
        }
    }

    fn seed(store: &Store, id: &str, added_secs_ago: i64) {
        let pool_instance = PoolInstance {
            instance: Instance {
                id: id.into(),
                ..Instance::default()
            },
            pool_add_time: Utc::now() - Duration::seconds(added_secs_ago),
        };
        store
            .put(&PoolInstance::key(id), &pool_instance)
            .expect("seed should store");
    }

    #[test]
    fn test_candidates_empty_pool() {
        let store = Store::new(Arc::new(RecordingSink::default()));

        let keys = get_candidate_pool_instances(&store, false).unwrap();
        assert!(keys.is_empty());
    }

    #[test]
    fn test_candidates_keep_recent_prefix() {
        let store = Store::new(Arc::new(RecordingSink::default()));
        seed(&store, "i-old", 30);
        seed(&store, "i-mid", 3);
        seed(&store, "i-new", 0);

        let keys = get_candidate_pool_instances(&store, false).unwrap();
        let ids: Vec<_> = keys.iter().map(|k| k.id.as_str()).collect();

        // Newest first; i-old is outside the 5 second window.
        assert_eq!(ids, ["i-new", "i-mid"]);
    }

    #[test]
    fn test_candidates_retry_widens_window() {
        let store = Store::new(Arc::new(RecordingSink::default()));
        seed(&store, "i-old", 20);
        seed(&store, "i-new", 0);

        let first = get_candidate_pool_instances(&store, false).unwrap();
        assert_eq!(first.len(), 1);

        let retried = get_candidate_pool_instances(&store, true).unwrap();
        assert_eq!(retried.len(), 2);
    }
}
