//! Shared wiring for the job subsystems.

use std::sync::Arc;
use std::time::Duration;

use crate::cloud::{CloudProvider, LaunchTemplate};
use crate::datastore::Store;
use crate::storage::ObjectStorage;
use crate::worker::WorkerClient;

/// Everything a driver invocation needs: the datastore, the cloud and
/// storage ports, the worker client, and launch parameters.
///
/// `liveness_probe_delay` is the pause before each liveness probe
/// (5 seconds in production); tests shorten it to keep the suite fast.
pub struct App {
    pub store: Arc<Store>,
    pub cloud: Arc<dyn CloudProvider>,
    pub storage: Arc<dyn ObjectStorage>,
    pub worker: Arc<dyn WorkerClient>,
    pub launch: LaunchTemplate,
    pub liveness_probe_delay: Duration,
}
