pub mod controller;
pub mod state;

pub use controller::PipelineController;
pub use state::{
    GalleryItem, ImageRef, SessionState, Task, TaskMode, TaskStatus, LOG_CAPACITY,
};
