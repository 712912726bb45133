//! Per-job state record and the transactional driver.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::app::App;
use crate::datastore::{Key, Store, Txn};
use crate::error::{DreamError, Result};
use crate::job::instance::Instance;
use crate::job::pool::PoolInstance;
use crate::job::status::Status;
use crate::job::task::{do_task, Task, TaskState};
use crate::queue::TaskCall;
use crate::{tls, token};

pub const JOB_KIND: &str = "Job";
pub const JOB_LOG_KIND: &str = "JobLog";

/// Length of job ids. Doubles as the EC2 client token, which caps it
/// at 64 characters.
const JOB_ID_LENGTH: usize = 64;
const AUTH_CODE_LENGTH: usize = 64;

/// Random picks at a pool instance before treating the pool as empty.
const POOL_PICK_ATTEMPTS: usize = 5;

/// Worker dream failures tolerated before the job is failed and its
/// instance terminated. Counted on the job record so the bound holds
/// across task redeliveries.
const DREAM_MAX_ATTEMPTS: u32 = 5;

/// The persistent state of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job id; also the client token when launching an instance.
    pub id: String,

    /// How far processing has gotten.
    pub status: Status,

    /// Storage handle of the uploaded input image.
    pub input_ref: String,

    /// Storage handle of the processed result, set once it exists.
    pub output_ref: Option<String>,

    /// Dream attempts the worker has rejected so far.
    #[serde(default)]
    pub dream_attempts: u32,

    /// The instance bound to this job.
    pub instance: Instance,
}

/// One status transition, stored as a child record of the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLog {
    pub prev_status: Status,
    pub new_status: Status,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub time: DateTime<Utc>,
}

impl Job {
    pub fn key(id: &str) -> Key {
        Key::new(JOB_KIND, id)
    }
}

/// Register a new job for an uploaded image and schedule its processing.
/// The job record and the processing task commit together, so a stored
/// job always gets processed and a failed registration leaves nothing
/// behind.
pub fn create(store: &Store, input_ref: &str) -> Result<String> {
    let id = token::generate(JOB_ID_LENGTH);
    let job = Job {
        id: id.clone(),
        status: Status::New,
        input_ref: input_ref.to_string(),
        output_ref: None,
        dream_attempts: 0,
        instance: Instance::default(),
    };

    store.run_in_transaction(|tx| {
        tx.put(&Job::key(&id), &job)?;
        tx.enqueue(TaskCall::ProcessJob { job_id: id.clone() });
        Ok(())
    })?;

    tracing::info!(job_id = %id, input_ref, "Registered new job");
    Ok(id)
}

/// Delayed-task handler: drive one job as far as it will go.
///
/// Each iteration runs one transaction that inspects the job and decides
/// the next task, then performs that task outside the transaction. An
/// error from either half surfaces to the task queue, which redelivers
/// the whole invocation later with a fresh scratchpad; the transactional
/// half being a pure function of stored state makes that safe.
pub async fn process_job(app: &App, job_id: &str) -> Result<()> {
    let mut state = TaskState::default();

    loop {
        let (job, task) = app.store.run_in_transaction(|tx| {
            let mut job: Job = tx
                .get(&Job::key(job_id))?
                .ok_or_else(|| DreamError::JobNotFound(job_id.to_string()))?;
            let task = job.process(tx, &mut state)?;
            Ok((job, task))
        })?;

        if task == Task::Halt {
            return Ok(());
        }

        do_task(app, &job, task, &mut state).await?;
    }
}

/// Count one rejected dream attempt against the job. Persisted so the
/// count survives task redelivery; jobs that have moved on are left
/// untouched.
pub(crate) fn record_dream_failure(store: &Store, job_id: &str) -> Result<()> {
    store.run_in_transaction(|tx| {
        let Some(mut job) = tx.get::<Job>(&Job::key(job_id))? else {
            return Ok(());
        };
        if job.status != Status::HaveInstance {
            return Ok(());
        }

        job.dream_attempts += 1;
        tracing::warn!(
            job_id = %job.id,
            attempts = job.dream_attempts,
            "Worker rejected dream attempt"
        );
        tx.put(&Job::key(&job.id), &job)?;
        Ok(())
    })
}

impl Job {
    /// One transactional step: decide the next task and buffer the
    /// record updates for it. Terminal jobs halt before writing
    /// anything, so redelivered tasks for finished jobs cost one read.
    pub(crate) fn process(&mut self, tx: &mut Txn<'_>, state: &mut TaskState) -> Result<Task> {
        match self.status {
            Status::Done | Status::Failed => return Ok(Task::Halt),

            Status::New => {
                let Some(candidates) = state.pool_instances.clone() else {
                    return Ok(Task::GetPoolInstances);
                };

                match self.adopt_pool_instance(tx, &candidates)? {
                    Some(pool_instance) => {
                        self.instance = pool_instance.instance;
                        self.change_status(Status::HaveInstance, tx)?;
                    }
                    None => {
                        // Nothing adoptable; prepare everything a fresh
                        // instance needs before the launch task runs, so
                        // retried launches send identical UserData.
                        let material = tls::generate_self_signed()?;
                        self.instance.certificate = material.certificate_pem;
                        self.instance.private_key = Some(material.private_key_pem);
                        self.instance.auth_code = token::generate(AUTH_CODE_LENGTH);
                        self.change_status(Status::MustLaunchInstance, tx)?;
                    }
                }
            }

            Status::MustLaunchInstance => {
                let Some(launch) = state.launch.clone() else {
                    return Ok(Task::LaunchInstance);
                };

                self.instance.id = launch.instance_id;
                self.instance.launch_time = Some(launch.launch_time);
                // The key has been handed to the instance via UserData;
                // it is never stored again.
                self.instance.private_key = None;
                self.change_status(Status::LaunchingInstance, tx)?;
            }

            Status::LaunchingInstance => {
                if !state.liveness_checked {
                    return Ok(Task::CheckLiveness);
                }

                if !state.liveness_check_success {
                    tx.enqueue(TaskCall::TerminateInstance {
                        instance_id: self.instance.id.clone(),
                    });
                    self.change_status(Status::Failed, tx)?;
                } else {
                    self.instance.ip = state.liveness_check_public_ip.clone();
                    self.change_status(Status::HaveInstance, tx)?;
                }
            }

            Status::HaveInstance => {
                if self.dream_attempts >= DREAM_MAX_ATTEMPTS {
                    // The worker keeps rejecting this image; conclude the
                    // job and stop paying for the instance.
                    tx.enqueue(TaskCall::TerminateInstance {
                        instance_id: self.instance.id.clone(),
                    });
                    self.change_status(Status::Failed, tx)?;
                } else if !state.dream_done {
                    return Ok(Task::Dream);
                } else {
                    self.output_ref = state.dream_output_ref.clone();
                    self.change_status(Status::FinishedWithInstance, tx)?;
                }
            }

            Status::FinishedWithInstance => {
                // Release the instance back to the pool in the same
                // transaction that finishes the job: at no point do a
                // live job and a pool row both claim it.
                let pool_instance = PoolInstance::from_instance(self.instance.clone());
                tx.put(&PoolInstance::key(&pool_instance.instance.id), &pool_instance)?;
                self.change_status(Status::Done, tx)?;
            }
        }

        tx.put(&Job::key(&self.id), self)?;
        Ok(Task::None)
    }

    /// Try to adopt one candidate pool instance. Picks uniformly at
    /// random; a missing row means another job won that instance, so
    /// pick again, up to five times. At most one row is ever deleted.
    /// `None` means the caller should fall back to launching.
    fn adopt_pool_instance(
        &self,
        tx: &mut Txn<'_>,
        candidates: &[Key],
    ) -> Result<Option<PoolInstance>> {
        if candidates.is_empty() {
            return Ok(None);
        }

        let mut rng = rand::thread_rng();
        for _ in 0..POOL_PICK_ATTEMPTS {
            let key = &candidates[rng.gen_range(0..candidates.len())];
            match tx.get::<PoolInstance>(key)? {
                Some(pool_instance) => {
                    tx.delete(key);
                    return Ok(Some(pool_instance));
                }
                None => continue,
            }
        }

        Ok(None)
    }

    /// Move to `new_status`, buffering a JobLog row for the transition.
    fn change_status(&mut self, new_status: Status, tx: &mut Txn<'_>) -> Result<()> {
        let log = JobLog {
            prev_status: self.status,
            new_status,
            time: Utc::now(),
        };
        tx.put_child(JOB_LOG_KIND, &self.id, &log)?;

        tracing::info!(
            job_id = %self.id,
            from = %self.status,
            to = %new_status,
            "Job status change"
        );
        self.status = new_status;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::TaskSink;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<TaskCall>>);

    impl TaskSink for RecordingSink {
        fn submit(&self, call: TaskCall) {
            self.0.lock().unwrap().push(call);
        }
    }

    fn new_job(id: &str) -> Job {
        Job {
            id: id.into(),
            status: Status::New,
            input_ref: "/b/test/job/input".into(),
            output_ref: None,
            dream_attempts: 0,
            instance: Instance::default(),
        }
    }

    #[test]
    fn test_new_job_first_asks_for_candidates() {
        let store = Store::new(Arc::new(RecordingSink::default()));
        let mut job = new_job("j1");
        let mut state = TaskState::default();

        let task = store
            .run_in_transaction(|tx| job.process(tx, &mut state))
            .unwrap();

        assert_eq!(task, Task::GetPoolInstances);
        assert_eq!(job.status, Status::New);
    }

    #[test]
    fn test_all_picks_missing_falls_back_to_launch() {
        let store = Store::new(Arc::new(RecordingSink::default()));
        let mut job = new_job("j1");
        let mut state = TaskState::default();
        // Candidates that were all adopted by other jobs already.
        state.pool_instances = Some(vec![
            PoolInstance::key("i-gone-1"),
            PoolInstance::key("i-gone-2"),
        ]);

        let task = store
            .run_in_transaction(|tx| job.process(tx, &mut state))
            .unwrap();

        assert_eq!(task, Task::None);
        assert_eq!(job.status, Status::MustLaunchInstance);
        assert!(job.instance.private_key.is_some());
        assert!(!job.instance.auth_code.is_empty());
    }

    #[test]
    fn test_terminal_job_halts_without_writes() {
        let store = Store::new(Arc::new(RecordingSink::default()));
        let mut job = new_job("j1");
        job.status = Status::Done;
        let mut state = TaskState::default();

        let task = store
            .run_in_transaction(|tx| job.process(tx, &mut state))
            .unwrap();

        assert_eq!(task, Task::Halt);
        // Nothing was stored, not even the job itself.
        assert!(store.get::<Job>(&Job::key("j1")).unwrap().is_none());
    }

    #[test]
    fn test_exhausted_dream_attempts_fail_job() {
        let sink = Arc::new(RecordingSink::default());
        let store = Store::new(sink.clone());
        let mut job = new_job("j1");
        job.status = Status::HaveInstance;
        job.instance.id = "i-worn".into();
        job.dream_attempts = DREAM_MAX_ATTEMPTS;

        let mut state = TaskState::default();
        let task = store
            .run_in_transaction(|tx| job.process(tx, &mut state))
            .unwrap();

        assert_eq!(task, Task::None);
        assert_eq!(job.status, Status::Failed);
        assert_eq!(
            sink.0.lock().unwrap().as_slice(),
            [TaskCall::TerminateInstance {
                instance_id: "i-worn".into()
            }]
        );
    }

    #[test]
    fn test_liveness_failure_fails_job_and_enqueues_terminate() {
        let sink = Arc::new(RecordingSink::default());
        let store = Store::new(sink.clone());
        let mut job = new_job("j1");
        job.status = Status::LaunchingInstance;
        job.instance.id = "i-dead".into();

        let mut state = TaskState::default();
        state.liveness_checked = true;
        state.liveness_check_success = false;

        let task = store
            .run_in_transaction(|tx| job.process(tx, &mut state))
            .unwrap();

        assert_eq!(task, Task::None);
        assert_eq!(job.status, Status::Failed);
        assert_eq!(
            sink.0.lock().unwrap().as_slice(),
            [TaskCall::TerminateInstance {
                instance_id: "i-dead".into()
            }]
        );
    }
}
