pub mod link_policy;
pub mod orchestrator;
pub mod task;

pub use link_policy::LinkPolicy;
pub use orchestrator::{
    DownloadOrchestrator, DownloadRunReport, PollReport, ReconcileReport, SubmitReport,
};
pub use task::{DownloadTask, FileArtifact};
