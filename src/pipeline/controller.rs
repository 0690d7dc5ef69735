use std::sync::Arc;

use base64::{prelude::BASE64_STANDARD, Engine};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::detect::backend::DetectBackend;
use crate::detect::poller::{poll_job, PollConfig, PollOutcome};
use crate::detect::types::{
    canonicalize_metrics, effective_params, DetectParams, DetectResponse, InputFile,
};

use super::state::{GalleryItem, ImageRef, SessionState, TaskMode};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_warn};

/// Explicit per-session pipeline context: backend port, shared session state,
/// poll settings, and a cancellation token covering queued jobs. Create one
/// per session/view and drop it when the session ends.
pub struct PipelineController<B> {
    backend: B,
    state: Arc<Mutex<SessionState>>,
    poll: PollConfig,
    cancel: CancellationToken,
}

impl<B: DetectBackend> PipelineController<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            state: Arc::new(Mutex::new(SessionState::new())),
            poll: PollConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn state(&self) -> Arc<Mutex<SessionState>> {
        self.state.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels the in-flight poll loop (if any); the remaining batch stops.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Loads the backend model list. Only overwrites the selected model when
    /// the current selection is missing from the list, so a user choice is
    /// never clobbered. All failures are local: a log line, nothing else.
    pub async fn fetch_models(&self) {
        match self.backend.list_models().await {
            Ok(res) if res.success && !res.models.is_empty() => {
                let mut state = self.state.lock().await;
                let current = state.params.model.clone();
                let has_current = res.models.iter().any(|m| m.key == current);
                if current.is_empty() || !has_current {
                    state.params.model = res.models[0].key.clone();
                }
                state.models = res.models;
                state.push_log("模型列表加载成功");
            }
            Ok(res) => {
                log_error!("model list load failed: {:?}", res.models);
                self.state.lock().await.push_log("模型列表加载失败");
            }
            Err(err) => {
                log_warn!("model list request failed: {err:?}");
                self.state.lock().await.push_log("模型列表加载异常");
            }
        }
    }

    pub async fn set_files(&self, files: Vec<InputFile>) {
        self.state.lock().await.set_files(files);
    }

    /// Takes the file list for one batch run, flipping `busy` on. Returns
    /// `None` when there is nothing to do.
    async fn begin_batch(&self) -> Option<Vec<InputFile>> {
        let mut state = self.state.lock().await;
        if state.files.is_empty() {
            return None;
        }
        state.busy = true;
        state.progress = "检测中...".to_string();
        Some(state.files.clone())
    }

    async fn finish_batch(&self, progress: &str) {
        let mut state = self.state.lock().await;
        state.progress = progress.to_string();
        state.busy = false;
    }

    /// Runs synchronous detection over the selected files, strictly one at a
    /// time. Every failure is local to its file; the batch always continues.
    pub async fn detect_sync(&self) {
        let Some(files) = self.begin_batch().await else {
            return;
        };
        let total = files.len();
        let mut done = 0usize;

        for file in &files {
            let (task_id, current) = {
                let mut state = self.state.lock().await;
                let task_id = state.begin_task(&file.filename, TaskMode::Sync);
                (task_id, state.params.clone())
            };

            match self.backend.detect(file, &current).await {
                Ok(res) if res.success => {
                    self.handle_result(res, file, &task_id, &current).await;
                }
                Ok(res) => {
                    log_error!("detect failed for {}: {:?}", file.filename, res.message);
                    let message = res.message.unwrap_or_else(|| "检测失败".to_string());
                    let mut state = self.state.lock().await;
                    state.progress = message.clone();
                    state.fail_task(&task_id, &message);
                    state.push_log(&format!("检测失败: {}", file.filename));
                }
                Err(err) => {
                    log_error!("detect request error for {}: {err:?}", file.filename);
                    let mut state = self.state.lock().await;
                    state.progress = "请求异常，查看日志".to_string();
                    state.fail_task(&task_id, "请求异常");
                    state.push_log(&format!("请求异常: {}", file.filename));
                }
            }

            done += 1;
            self.state.lock().await.progress = format!("完成 {done}/{total}");
        }

        self.finish_batch("完成").await;
    }

    /// Runs queued detection: enqueue each file, then poll its job to a
    /// terminal state before the next file starts. An enqueue failure skips
    /// polling for that file; cancellation stops the remaining batch.
    pub async fn detect_queue(&self) {
        let Some(files) = self.begin_batch().await else {
            return;
        };
        let total = files.len();
        let mut done = 0usize;
        let mut cancelled = false;

        for file in &files {
            let (task_id, current) = {
                let mut state = self.state.lock().await;
                state.preview_input = Some(ImageRef::Embedded(file.bytes.clone()));
                let task_id = state.begin_task(&file.filename, TaskMode::Queue);
                (task_id, state.params.clone())
            };

            let job_id = match self.backend.enqueue(file, &current).await {
                Ok(enq) if enq.success && enq.job_id.is_some() => {
                    let job_id = enq.job_id.unwrap_or_default();
                    let mut state = self.state.lock().await;
                    state.push_log(&format!("已入队: {}, job={}", file.filename, job_id));
                    job_id
                }
                Ok(enq) => {
                    log_error!("enqueue failed for {}: {:?}", file.filename, enq.message);
                    let message = enq.message.unwrap_or_else(|| "入队失败".to_string());
                    let mut state = self.state.lock().await;
                    state.fail_task(&task_id, &message);
                    state.push_log(&format!("入队失败: {}", file.filename));
                    continue;
                }
                Err(err) => {
                    log_error!("enqueue request error for {}: {err:?}", file.filename);
                    let mut state = self.state.lock().await;
                    state.fail_task(&task_id, "入队异常");
                    state.push_log(&format!("入队异常: {}", file.filename));
                    continue;
                }
            };

            match poll_job(&self.backend, &job_id, &self.poll, &self.cancel).await {
                PollOutcome::Done(res) => {
                    self.handle_result(res, file, &task_id, &current).await;
                    let mut state = self.state.lock().await;
                    state.push_log(&format!("队列完成: {}", file.filename));
                }
                PollOutcome::Failed(message) => {
                    let mut state = self.state.lock().await;
                    state.fail_task(&task_id, &message);
                    state.push_log(&format!("队列任务错误: {}", file.filename));
                }
                PollOutcome::TimedOut => {
                    let mut state = self.state.lock().await;
                    state.fail_task(&task_id, "轮询超时");
                    state.push_log(&format!("轮询超时: {}", file.filename));
                }
                PollOutcome::Cancelled => {
                    let mut state = self.state.lock().await;
                    state.fail_task(&task_id, "已取消");
                    state.push_log(&format!("已取消: {}", file.filename));
                    cancelled = true;
                }
            }

            if cancelled {
                break;
            }

            done += 1;
            self.state.lock().await.progress = format!("完成 {done}/{total}");
        }

        self.finish_batch(if cancelled { "已取消" } else { "完成" })
            .await;
    }

    /// Applies one successful detection: canonicalize the payload, finish the
    /// task, refresh the preview, prepend the gallery item, log.
    async fn handle_result(
        &self,
        res: DetectResponse,
        file: &InputFile,
        task_id: &str,
        submitted: &DetectParams,
    ) {
        let output = res.image_base64.as_deref().and_then(|b64| {
            match BASE64_STANDARD.decode(b64) {
                Ok(bytes) => Some(ImageRef::Embedded(bytes)),
                Err(err) => {
                    log_warn!("invalid image_base64 for {}: {err}", file.filename);
                    None
                }
            }
        });
        let metrics = canonicalize_metrics(res.metrics.as_ref());
        let params = effective_params(res.params.as_ref(), submitted);
        let count_label = metrics
            .count
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());

        let item = GalleryItem {
            id: Uuid::new_v4().to_string(),
            filename: file.filename.clone(),
            input: ImageRef::Embedded(file.bytes.clone()),
            output,
            metrics: metrics.clone(),
            params: params.clone(),
            batch_id: None,
            batch_order: None,
        };

        let mut state = self.state.lock().await;
        if metrics.count.unwrap_or(0) == 0 {
            state.progress = "模型未检出目标（count=0），可尝试降低 conf 或换权重".to_string();
        }
        state.complete_task(task_id, metrics);
        state.push_log(&format!(
            "检测成功: {}, count={}, model={}",
            file.filename, count_label, params.model
        ));
        state.record_result(item);
    }
}
