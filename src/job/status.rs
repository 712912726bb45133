use serde::{Deserialize, Serialize};

/// How far a job has gotten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    New,
    MustLaunchInstance,
    LaunchingInstance,
    HaveInstance,
    FinishedWithInstance,
    Done,
    Failed,
}

impl Status {
    /// Terminal statuses never change again; a driver seeing one halts
    /// immediately.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Done | Status::Failed)
    }

    /// User-facing progress line for the job page.
    pub fn description(&self) -> &'static str {
        match self {
            Status::New => "Looking for free dream server...",
            Status::MustLaunchInstance | Status::LaunchingInstance => "Launching dream server...",
            Status::HaveInstance => "Dreaming...",
            Status::FinishedWithInstance | Status::Done => "Finished.",
            Status::Failed => "Failed to process image.",
        }
    }

    /// Whether the output image exists yet.
    pub fn output_ready(&self) -> bool {
        matches!(self, Status::FinishedWithInstance | Status::Done)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::New => write!(f, "new"),
            Status::MustLaunchInstance => write!(f, "must_launch_instance"),
            Status::LaunchingInstance => write!(f, "launching_instance"),
            Status::HaveInstance => write!(f, "have_instance"),
            Status::FinishedWithInstance => write!(f, "finished_with_instance"),
            Status::Done => write!(f, "done"),
            Status::Failed => write!(f, "failed"),
        }
    }
}
