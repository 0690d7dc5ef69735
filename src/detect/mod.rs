pub mod backend;
pub mod poller;
pub mod types;

pub use backend::{DetectBackend, HttpBackend};
pub use poller::{poll_job, PollConfig, PollOutcome, DEFAULT_POLL_INTERVAL};
pub use types::{
    canonicalize_metrics, effective_params, DetectParams, DetectResponse, DetectionMetrics,
    EnqueueResponse, InputFile, JobState, JobStatusResponse, ModelItem, ModelsResponse,
};
