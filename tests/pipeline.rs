use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;

use corroscan::detect::types::{
    DetectParams, DetectResponse, EnqueueResponse, InputFile, JobState, JobStatusResponse,
    ModelItem, ModelsResponse,
};
use corroscan::{DetectBackend, PipelineController, PollConfig, TaskStatus};

/// Scripted backend: responses pop in order; `job_status` answers `running`
/// once its script runs out.
#[derive(Default)]
struct MockBackend {
    detect: Mutex<VecDeque<Result<DetectResponse>>>,
    enqueue: Mutex<VecDeque<Result<EnqueueResponse>>>,
    jobs: Mutex<VecDeque<JobStatusResponse>>,
    poll_count: AtomicUsize,
}

impl MockBackend {
    fn script_detect(&self, response: Result<DetectResponse>) {
        self.detect.lock().unwrap().push_back(response);
    }

    fn script_enqueue(&self, response: Result<EnqueueResponse>) {
        self.enqueue.lock().unwrap().push_back(response);
    }

    fn script_job(&self, response: JobStatusResponse) {
        self.jobs.lock().unwrap().push_back(response);
    }
}

#[async_trait]
impl DetectBackend for &MockBackend {
    async fn list_models(&self) -> Result<ModelsResponse> {
        Ok(ModelsResponse {
            success: true,
            models: vec![ModelItem {
                key: "yolo11s.pt".to_string(),
                name: "YOLO11s".to_string(),
            }],
        })
    }

    async fn detect(&self, _file: &InputFile, _params: &DetectParams) -> Result<DetectResponse> {
        self.detect
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("unscripted detect call")))
    }

    async fn enqueue(&self, _file: &InputFile, _params: &DetectParams) -> Result<EnqueueResponse> {
        self.enqueue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("unscripted enqueue call")))
    }

    async fn job_status(&self, _job_id: &str) -> Result<JobStatusResponse> {
        self.poll_count.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(JobStatusResponse {
                status: JobState::Running,
                result: None,
                message: None,
            }))
    }
}

fn ok_detect(count: u64) -> DetectResponse {
    DetectResponse {
        success: true,
        image_base64: None,
        metrics: Some(json!({ "检测数量": count, "面积比例": 0.1, "平均置信度": 0.8 })),
        params: None,
        message: None,
    }
}

fn input(name: &str) -> InputFile {
    InputFile::new(name, vec![0u8; 8])
}

#[tokio::test]
async fn sync_batch_creates_one_terminal_task_per_file() {
    let backend = MockBackend::default();
    backend.script_detect(Ok(ok_detect(2)));
    backend.script_detect(Ok(DetectResponse {
        success: false,
        message: Some("权重缺失".to_string()),
        ..DetectResponse::default()
    }));
    backend.script_detect(Err(anyhow!("connection reset")));

    let controller = PipelineController::new(&backend);
    controller
        .set_files(vec![input("a.png"), input("b.png"), input("c.png")])
        .await;
    controller.detect_sync().await;

    let state = controller.state();
    let state = state.lock().await;
    assert_eq!(state.tasks.len(), 3);
    assert!(state.tasks.iter().all(|t| t.status.is_terminal()));
    // Tasks are newest-first, so c.png sits at the head.
    assert_eq!(state.tasks[0].filename, "c.png");
    assert_eq!(state.tasks[0].status, TaskStatus::Error);
    assert_eq!(state.tasks[0].message.as_deref(), Some("请求异常"));
    assert_eq!(state.tasks[1].status, TaskStatus::Error);
    assert_eq!(state.tasks[1].message.as_deref(), Some("权重缺失"));
    assert_eq!(state.tasks[2].status, TaskStatus::Done);
    assert_eq!(state.gallery.len(), 1);
    assert_eq!(state.progress, "完成");
    assert!(!state.busy);
}

#[tokio::test]
async fn gallery_reads_newest_first() {
    let backend = MockBackend::default();
    for count in 1..=3 {
        backend.script_detect(Ok(ok_detect(count)));
    }

    let controller = PipelineController::new(&backend);
    controller
        .set_files(vec![input("a.png"), input("b.png"), input("c.png")])
        .await;
    controller.detect_sync().await;

    let state = controller.state();
    let state = state.lock().await;
    let names: Vec<_> = state.gallery.iter().map(|i| i.filename.as_str()).collect();
    assert_eq!(names, ["c.png", "b.png", "a.png"]);
    // Preview and last params track the most recent result.
    assert_eq!(state.metrics.count, Some(3));
}

#[tokio::test]
async fn empty_file_list_is_a_noop() {
    let backend = MockBackend::default();
    let controller = PipelineController::new(&backend);
    controller.detect_sync().await;
    controller.detect_queue().await;

    let state = controller.state();
    let state = state.lock().await;
    assert!(state.tasks.is_empty());
    assert_eq!(state.progress, "未开始");
    assert!(!state.busy);
}

#[tokio::test(start_paused = true)]
async fn queued_job_resolves_after_exactly_two_polls() {
    let backend = MockBackend::default();
    backend.script_enqueue(Ok(EnqueueResponse {
        success: true,
        job_id: Some("j1".to_string()),
        message: None,
    }));
    backend.script_job(JobStatusResponse {
        status: JobState::Running,
        result: None,
        message: None,
    });
    backend.script_job(JobStatusResponse {
        status: JobState::Done,
        result: Some(ok_detect(3)),
        message: None,
    });

    let controller = PipelineController::new(&backend);
    controller.set_files(vec![input("a.png")]).await;
    controller.detect_queue().await;

    assert_eq!(backend.poll_count.load(Ordering::SeqCst), 2);
    let state = controller.state();
    let state = state.lock().await;
    assert_eq!(state.tasks[0].status, TaskStatus::Done);
    assert_eq!(
        state.tasks[0].metrics.as_ref().and_then(|m| m.count),
        Some(3)
    );
    assert_eq!(state.gallery.len(), 1);
    assert!(state.logs().any(|line| line.contains("队列完成: a.png")));
}

#[tokio::test]
async fn enqueue_failure_skips_polling_and_continues() {
    let backend = MockBackend::default();
    backend.script_enqueue(Ok(EnqueueResponse {
        success: false,
        job_id: None,
        message: Some("队列已满".to_string()),
    }));
    backend.script_enqueue(Ok(EnqueueResponse {
        success: true,
        job_id: Some("j2".to_string()),
        message: None,
    }));
    backend.script_job(JobStatusResponse {
        status: JobState::Done,
        result: Some(ok_detect(1)),
        message: None,
    });

    let controller = PipelineController::new(&backend);
    controller.set_files(vec![input("a.png"), input("b.png")]).await;
    controller.detect_queue().await;

    // Only the second file's job was ever polled.
    assert_eq!(backend.poll_count.load(Ordering::SeqCst), 1);
    let state = controller.state();
    let state = state.lock().await;
    assert_eq!(state.tasks.len(), 2);
    let a_task = state.tasks.iter().find(|t| t.filename == "a.png").unwrap();
    assert_eq!(a_task.status, TaskStatus::Error);
    assert_eq!(a_task.message.as_deref(), Some("队列已满"));
    let b_task = state.tasks.iter().find(|t| t.filename == "b.png").unwrap();
    assert_eq!(b_task.status, TaskStatus::Done);
}

#[tokio::test(start_paused = true)]
async fn job_error_surfaces_the_backend_message() {
    let backend = MockBackend::default();
    backend.script_enqueue(Ok(EnqueueResponse {
        success: true,
        job_id: Some("j3".to_string()),
        message: None,
    }));
    backend.script_job(JobStatusResponse {
        status: JobState::Error,
        result: None,
        message: Some("推理崩溃".to_string()),
    });

    let controller = PipelineController::new(&backend);
    controller.set_files(vec![input("a.png")]).await;
    controller.detect_queue().await;

    let state = controller.state();
    let state = state.lock().await;
    assert_eq!(state.tasks[0].status, TaskStatus::Error);
    assert_eq!(state.tasks[0].message.as_deref(), Some("推理崩溃"));
    assert!(state.gallery.is_empty());
}

#[tokio::test(start_paused = true)]
async fn poll_deadline_fails_the_task_instead_of_hanging() {
    let backend = MockBackend::default();
    backend.script_enqueue(Ok(EnqueueResponse {
        success: true,
        job_id: Some("j4".to_string()),
        message: None,
    }));
    // No job script: the mock keeps answering `running`.

    let controller = PipelineController::new(&backend)
        .with_poll_config(PollConfig::default().with_deadline(Duration::from_secs(2)));
    controller.set_files(vec![input("a.png")]).await;
    controller.detect_queue().await;

    let state = controller.state();
    let state = state.lock().await;
    assert_eq!(state.tasks[0].status, TaskStatus::Error);
    assert_eq!(state.tasks[0].message.as_deref(), Some("轮询超时"));
    assert_eq!(state.progress, "完成");
}

#[tokio::test]
async fn fetch_models_keeps_a_valid_selection() {
    let backend = MockBackend::default();
    let controller = PipelineController::new(&backend);
    controller.fetch_models().await;

    let state = controller.state();
    let mut state = state.lock().await;
    assert_eq!(state.models.len(), 1);
    // Default selection matches the listed model and is kept.
    assert_eq!(state.params.model, "yolo11s.pt");

    // A stale selection falls back to the first listed model.
    state.params.model = "gone.pt".to_string();
    drop(state);
    controller.fetch_models().await;
    let state = controller.state();
    let state = state.lock().await;
    assert_eq!(state.params.model, "yolo11s.pt");
}
