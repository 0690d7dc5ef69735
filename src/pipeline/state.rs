use std::collections::VecDeque;

use chrono::Local;
use serde::Serialize;
use uuid::Uuid;

use crate::detect::types::{DetectParams, DetectionMetrics, InputFile, ModelItem};

/// The log is a bounded ring: newest first, oldest evicted past this cap.
pub const LOG_CAPACITY: usize = 100;

const INITIAL_PROGRESS: &str = "未开始";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    Sync,
    Queue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Error)
    }
}

/// Per-file unit of detection work, tracked for display. Mutated in place as
/// its status advances; never deleted.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub filename: String,
    pub mode: TaskMode,
    pub status: TaskStatus,
    pub message: Option<String>,
    pub metrics: Option<DetectionMetrics>,
}

impl Task {
    pub fn new(filename: impl Into<String>, mode: TaskMode) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            filename: filename.into(),
            mode,
            status: TaskStatus::Running,
            message: None,
            metrics: None,
        }
    }

    /// Advances the status. Terminal states stick: a finished task never
    /// re-enters `Running`.
    pub fn transition(&mut self, status: TaskStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        true
    }
}

/// Reference to an image: raw bytes held in memory, or a URL fetched lazily
/// by the report generator.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageRef {
    Embedded(Vec<u8>),
    Remote(String),
}

/// One completed detection, retained for display and reporting. Created
/// exactly once; `params` are the ones in effect at submission time.
#[derive(Debug, Clone)]
pub struct GalleryItem {
    pub id: String,
    pub filename: String,
    pub input: ImageRef,
    pub output: Option<ImageRef>,
    pub metrics: DetectionMetrics,
    pub params: DetectParams,
    pub batch_id: Option<String>,
    pub batch_order: Option<u32>,
}

/// Session-scoped pipeline state: selected files, per-file tasks, the result
/// gallery, the log ring, and the preview of the latest result. Owned by the
/// controller; no I/O happens here.
#[derive(Debug)]
pub struct SessionState {
    pub models: Vec<ModelItem>,
    pub files: Vec<InputFile>,
    pub busy: bool,
    pub params: DetectParams,
    /// Params of the most recently recorded result.
    pub last_params: DetectParams,
    pub metrics: DetectionMetrics,
    pub preview_input: Option<ImageRef>,
    pub preview_output: Option<ImageRef>,
    pub progress: String,
    pub tasks: Vec<Task>,
    pub gallery: Vec<GalleryItem>,
    logs: VecDeque<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        let params = DetectParams::default();
        Self {
            models: Vec::new(),
            files: Vec::new(),
            busy: false,
            last_params: params.clone(),
            params,
            metrics: DetectionMetrics::default(),
            preview_input: None,
            preview_output: None,
            progress: INITIAL_PROGRESS.to_string(),
            tasks: Vec::new(),
            gallery: Vec::new(),
            logs: VecDeque::new(),
        }
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepends a timestamped line and evicts anything past the cap.
    pub fn push_log(&mut self, msg: &str) {
        let line = format!("{} - {}", Local::now().format("%H:%M:%S"), msg);
        self.logs.push_front(line);
        self.logs.truncate(LOG_CAPACITY);
    }

    /// Newest first.
    pub fn logs(&self) -> impl Iterator<Item = &str> {
        self.logs.iter().map(String::as_str)
    }

    pub fn log_len(&self) -> usize {
        self.logs.len()
    }

    /// Replaces the selected files and resets the per-batch state.
    pub fn set_files(&mut self, files: Vec<InputFile>) {
        self.gallery.clear();
        self.tasks.clear();
        self.progress = if files.is_empty() {
            INITIAL_PROGRESS.to_string()
        } else {
            format!("已选择 {} 张图片", files.len())
        };
        self.preview_input = files.first().map(|f| ImageRef::Embedded(f.bytes.clone()));
        self.files = files;
    }

    /// Creates a `Running` task at the head of the list and returns its id.
    pub fn begin_task(&mut self, filename: &str, mode: TaskMode) -> String {
        let task = Task::new(filename, mode);
        let id = task.id.clone();
        self.tasks.insert(0, task);
        id
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|task| task.id == id)
    }

    pub fn fail_task(&mut self, id: &str, message: &str) {
        if let Some(task) = self.task_mut(id) {
            if task.transition(TaskStatus::Error) {
                task.message = Some(message.to_string());
            }
        }
    }

    pub fn complete_task(&mut self, id: &str, metrics: DetectionMetrics) {
        if let Some(task) = self.task_mut(id) {
            if task.transition(TaskStatus::Done) {
                task.metrics = Some(metrics);
                task.message = Some("完成".to_string());
            }
        }
    }

    /// Records a completed detection: gallery head insert, preview and
    /// metrics refresh, and a snapshot of the effective params.
    pub fn record_result(&mut self, item: GalleryItem) {
        self.preview_input = Some(item.input.clone());
        self.preview_output = item.output.clone();
        self.metrics = item.metrics.clone();
        self.last_params = item.params.clone();
        self.gallery.insert(0, item);
    }

    /// Attaches a user-defined batch label to a gallery item.
    pub fn set_item_batch(
        &mut self,
        id: &str,
        batch_id: Option<String>,
        batch_order: Option<u32>,
    ) -> bool {
        match self.gallery.iter_mut().find(|item| item.id == id) {
            Some(item) => {
                item.batch_id = batch_id;
                item.batch_order = batch_order;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(filename: &str) -> GalleryItem {
        GalleryItem {
            id: Uuid::new_v4().to_string(),
            filename: filename.to_string(),
            input: ImageRef::Embedded(vec![1, 2, 3]),
            output: None,
            metrics: DetectionMetrics::default(),
            params: DetectParams::default(),
            batch_id: None,
            batch_order: None,
        }
    }

    #[test]
    fn log_ring_never_exceeds_capacity_and_is_newest_first() {
        let mut state = SessionState::new();
        for i in 0..250 {
            state.push_log(&format!("line {i}"));
        }
        assert_eq!(state.log_len(), LOG_CAPACITY);
        let first = state.logs().next().unwrap();
        assert!(first.ends_with("line 249"));
        let last = state.logs().last().unwrap();
        assert!(last.ends_with("line 150"));
    }

    #[test]
    fn gallery_is_newest_first() {
        let mut state = SessionState::new();
        for name in ["a.png", "b.png", "c.png"] {
            state.record_result(item(name));
        }
        let names: Vec<_> = state.gallery.iter().map(|i| i.filename.as_str()).collect();
        assert_eq!(names, ["c.png", "b.png", "a.png"]);
    }

    #[test]
    fn record_result_updates_preview_and_last_params() {
        let mut state = SessionState::new();
        let mut result = item("a.png");
        result.params.model = "custom.pt".to_string();
        result.metrics.count = Some(4);
        state.record_result(result);
        assert_eq!(state.last_params.model, "custom.pt");
        assert_eq!(state.metrics.count, Some(4));
        assert_eq!(state.preview_input, Some(ImageRef::Embedded(vec![1, 2, 3])));
    }

    #[test]
    fn terminal_task_status_is_sticky() {
        let mut task = Task::new("a.png", TaskMode::Sync);
        assert!(task.transition(TaskStatus::Error));
        assert!(!task.transition(TaskStatus::Running));
        assert!(!task.transition(TaskStatus::Done));
        assert_eq!(task.status, TaskStatus::Error);
    }

    #[test]
    fn set_files_resets_tasks_and_gallery() {
        let mut state = SessionState::new();
        state.record_result(item("old.png"));
        state.begin_task("old.png", TaskMode::Sync);
        state.set_files(vec![InputFile::new("new.png", vec![9])]);
        assert!(state.gallery.is_empty());
        assert!(state.tasks.is_empty());
        assert_eq!(state.progress, "已选择 1 张图片");
        assert_eq!(state.preview_input, Some(ImageRef::Embedded(vec![9])));
    }
}
