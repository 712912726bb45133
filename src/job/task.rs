//! Non-transactional tasks the driver performs between transactions.

use chrono::{DateTime, Duration, Utc};

use crate::app::App;
use crate::datastore::Key;
use crate::error::{DreamError, Result};
use crate::job::pool;
use crate::job::state::{record_dream_failure, Job};

/// Probes before giving up on a liveness check series.
const LIVENESS_ATTEMPTS: u32 = 6;

/// Minutes after launch before a silent instance is declared dead
/// rather than retried.
const LIVENESS_GIVE_UP_MINUTES: i64 = 30;

/// What the driver should do next. Decided inside a transaction,
/// performed outside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Nothing to perform; run the next transaction.
    None,
    /// The job is terminal; stop processing.
    Halt,
    /// Fetch candidate pool instance keys.
    GetPoolInstances,
    /// Issue the idempotent launch request.
    LaunchInstance,
    /// Probe the launched instance until it responds.
    CheckLiveness,
    /// Run the dream round-trip against the worker.
    Dream,
}

/// Scratchpad carrying task results into the next transaction. Lives
/// only for one driver invocation and is never persisted; after a crash
/// the redelivered invocation starts empty and the tasks re-run (all of
/// them are idempotent or keyed).
#[derive(Debug, Default)]
pub struct TaskState {
    /// Candidate pool keys, once fetched. `Some(vec![])` means the pool
    /// was consulted and found empty.
    pub pool_instances: Option<Vec<Key>>,
    pub pool_instances_retrieved_before: bool,

    pub launch: Option<LaunchResult>,

    pub liveness_checked: bool,
    pub liveness_check_success: bool,
    pub liveness_check_public_ip: Option<String>,

    pub dream_done: bool,
    pub dream_output_ref: Option<String>,
}

/// Outcome of an accepted launch request.
#[derive(Debug, Clone)]
pub struct LaunchResult {
    pub instance_id: String,
    pub launch_time: DateTime<Utc>,
}

/// Perform `task`, recording results in `state`.
pub async fn do_task(app: &App, job: &Job, task: Task, state: &mut TaskState) -> Result<()> {
    match task {
        Task::None | Task::Halt => {}

        Task::GetPoolInstances => {
            let candidates = pool::get_candidate_pool_instances(
                &app.store,
                state.pool_instances_retrieved_before,
            )?;
            state.pool_instances = Some(candidates);
            state.pool_instances_retrieved_before = true;
        }

        Task::LaunchInstance => do_launch(app, job, state).await?,

        Task::CheckLiveness => do_check_liveness(app, job, state).await?,

        Task::Dream => do_dream(app, job, state).await?,
    }

    Ok(())
}

/// Ask the provider for one instance. The job id is the client token, so
/// however many times this runs for a job, only one instance exists.
async fn do_launch(app: &App, job: &Job, state: &mut TaskState) -> Result<()> {
    let user_data = job.instance.user_data()?;
    let instance_id = app
        .cloud
        .run_instance(&app.launch, &user_data, &job.id)
        .await?;

    tracing::info!(job_id = %job.id, instance_id = %instance_id, "Launch request accepted");
    state.launch = Some(LaunchResult {
        instance_id,
        launch_time: Utc::now(),
    });

    Ok(())
}

/// Probe the instance until it serves anything over HTTPS. Any response
/// status counts: the point is that the worker process is up and serving
/// our certificate.
///
/// When every probe fails and the launch is more than thirty minutes
/// old, the check is recorded as done without success; the next
/// transaction reads exactly that combination as a dead instance and
/// fails the job. A younger launch instead returns an error so the task
/// queue redelivers the whole driver later.
async fn do_check_liveness(app: &App, job: &Job, state: &mut TaskState) -> Result<()> {
    for _ in 0..LIVENESS_ATTEMPTS {
        tokio::time::sleep(app.liveness_probe_delay).await;

        let ip = match job.instance.public_ip(app.cloud.as_ref()).await {
            Ok(ip) => ip,
            Err(err) => {
                tracing::debug!(job_id = %job.id, error = %err, "Instance IP lookup failed");
                continue;
            }
        };

        match app
            .worker
            .get(&job.instance.worker_target(ip.clone()), "dream")
            .await
        {
            Ok(_) => {
                state.liveness_checked = true;
                state.liveness_check_success = true;
                state.liveness_check_public_ip = Some(ip);
                break;
            }
            Err(err) => {
                tracing::debug!(job_id = %job.id, error = %err, "Liveness probe failed");
            }
        }
    }

    if !state.liveness_check_success {
        let give_up_before = Utc::now() - Duration::minutes(LIVENESS_GIVE_UP_MINUTES);
        let past_ceiling = job
            .instance
            .launch_time
            .map_or(true, |launched| launched < give_up_before);

        if past_ceiling {
            // Checked but not successful: drives the FAILED transition.
            state.liveness_checked = true;
            return Ok(());
        }

        return Err(DreamError::LivenessRetry);
    }

    Ok(())
}

/// The dream round-trip: read the input image, send it to the worker,
/// store the processed result.
async fn do_dream(app: &App, job: &Job, state: &mut TaskState) -> Result<()> {
    let input = app.storage.read_file(&job.input_ref).await?;

    let ip = job.instance.public_ip(app.cloud.as_ref()).await?;
    let path = format!("dream?auth_code={}", job.instance.auth_code);
    let response = app
        .worker
        .post_file(&job.instance.worker_target(ip), &path, "image", input)
        .await?;

    if response.status != 200 {
        // A served-but-rejected request counts against the job; transport
        // errors above stay purely transient.
        record_dream_failure(&app.store, &job.id)?;
        return Err(DreamError::WorkerStatus(response.status));
    }

    let output_name = format!("job/{}/output", job.id);
    let output_ref = app.storage.write_file(&output_name, &response.body).await?;

    tracing::info!(job_id = %job.id, output_ref = %output_ref, "Dream finished");
    state.dream_done = true;
    state.dream_output_ref = Some(output_ref);

    Ok(())
}
