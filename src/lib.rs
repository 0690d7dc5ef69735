pub mod detect;
pub mod pipeline;
pub mod report;
pub mod storage;
pub mod utils;

pub use detect::{
    canonicalize_metrics, effective_params, poll_job, DetectBackend, DetectParams, DetectResponse,
    DetectionMetrics, HttpBackend, InputFile, PollConfig, PollOutcome,
};
pub use pipeline::{
    GalleryItem, ImageRef, PipelineController, SessionState, Task, TaskMode, TaskStatus,
};
pub use report::{ChartImages, FontSources, FontState, ReportConfig, ReportGenerator};
pub use storage::LocalStore;
