use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Detection configuration snapshot. Attached immutably to every result so a
/// gallery item keeps the params that actually produced it, even if the user
/// changes the session params mid-batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectParams {
    pub model: String,
    pub conf: f64,
    pub iou: f64,
    pub imgsz: u32,
    pub max_det: u32,
}

impl Default for DetectParams {
    fn default() -> Self {
        Self {
            model: "yolo11s.pt".to_string(),
            conf: 0.25,
            iou: 0.45,
            imgsz: 640,
            max_det: 300,
        }
    }
}

/// Backend-derived metrics. Never recomputed client-side; absent fields stay
/// absent rather than defaulting to zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionMetrics {
    pub count: Option<u64>,
    pub area_ratio: Option<f64>,
    pub avg_conf: Option<f64>,
}

/// One file queued for detection: raw bytes plus the display name.
#[derive(Debug, Clone)]
pub struct InputFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl InputFile {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read input file {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.png".to_string());
        Ok(Self { filename, bytes })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelItem {
    pub key: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelsResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub models: Vec<ModelItem>,
}

/// Response of the synchronous detect endpoint, also embedded in a finished
/// job. `metrics` and `params` are loosely typed on the wire and go through
/// [`canonicalize_metrics`] / [`effective_params`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DetectResponse {
    #[serde(default)]
    pub success: bool,
    pub image_base64: Option<String>,
    pub metrics: Option<Value>,
    pub params: Option<Value>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnqueueResponse {
    #[serde(default)]
    pub success: bool,
    pub job_id: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Done,
    Error,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Error)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobStatusResponse {
    pub status: JobState,
    pub result: Option<DetectResponse>,
    pub message: Option<String>,
}

// The backend reports metrics under either localized or canonical keys.
const COUNT_KEYS: [&str; 2] = ["检测数量", "count"];
const AREA_RATIO_KEYS: [&str; 2] = ["面积比例", "area_ratio"];
const AVG_CONF_KEYS: [&str; 2] = ["平均置信度", "avg_conf"];

fn lookup<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| value.get(*key))
}

/// Maps a raw metrics object into [`DetectionMetrics`], preferring the
/// localized key scheme over the canonical one. Total over malformed input:
/// anything that is not a JSON object (or holds the wrong value types) simply
/// yields absent fields. Idempotent on already-canonical input.
pub fn canonicalize_metrics(raw: Option<&Value>) -> DetectionMetrics {
    let Some(raw) = raw else {
        return DetectionMetrics::default();
    };
    DetectionMetrics {
        count: lookup(raw, &COUNT_KEYS).and_then(Value::as_u64),
        area_ratio: lookup(raw, &AREA_RATIO_KEYS).and_then(Value::as_f64),
        avg_conf: lookup(raw, &AVG_CONF_KEYS).and_then(Value::as_f64),
    }
}

/// Merges the params echoed by the backend over the params submitted with the
/// request. Missing or malformed fields keep the submitted value.
pub fn effective_params(raw: Option<&Value>, submitted: &DetectParams) -> DetectParams {
    let Some(raw) = raw else {
        return submitted.clone();
    };
    DetectParams {
        model: raw
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| submitted.model.clone()),
        conf: raw.get("conf").and_then(Value::as_f64).unwrap_or(submitted.conf),
        iou: raw.get("iou").and_then(Value::as_f64).unwrap_or(submitted.iou),
        imgsz: raw
            .get("imgsz")
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .unwrap_or(submitted.imgsz),
        max_det: raw
            .get("max_det")
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .unwrap_or(submitted.max_det),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonicalize_prefers_localized_keys() {
        let raw = json!({
            "检测数量": 7,
            "count": 2,
            "面积比例": 0.31,
            "平均置信度": 0.88
        });
        let metrics = canonicalize_metrics(Some(&raw));
        assert_eq!(metrics.count, Some(7));
        assert_eq!(metrics.area_ratio, Some(0.31));
        assert_eq!(metrics.avg_conf, Some(0.88));
    }

    #[test]
    fn canonicalize_falls_back_to_canonical_keys() {
        let raw = json!({ "count": 2, "area_ratio": 0.1 });
        let metrics = canonicalize_metrics(Some(&raw));
        assert_eq!(metrics.count, Some(2));
        assert_eq!(metrics.area_ratio, Some(0.1));
        assert_eq!(metrics.avg_conf, None);
    }

    #[test]
    fn canonicalize_is_idempotent() {
        let raw = json!({ "检测数量": 3, "area_ratio": 0.5, "avg_conf": 0.9 });
        let first = canonicalize_metrics(Some(&raw));
        let reencoded = serde_json::to_value(&first).unwrap();
        let second = canonicalize_metrics(Some(&reencoded));
        assert_eq!(first, second);
    }

    #[test]
    fn canonicalize_is_total_over_malformed_input() {
        for raw in [
            json!(null),
            json!("not an object"),
            json!([1, 2, 3]),
            json!({ "count": "three", "area_ratio": {}, "平均置信度": [] }),
        ] {
            let metrics = canonicalize_metrics(Some(&raw));
            assert_eq!(metrics, DetectionMetrics::default());
        }
        assert_eq!(canonicalize_metrics(None), DetectionMetrics::default());
    }

    #[test]
    fn effective_params_overrides_per_field() {
        let submitted = DetectParams::default();
        let raw = json!({ "model": "rust-seg.pt", "conf": 0.6, "imgsz": "bad" });
        let merged = effective_params(Some(&raw), &submitted);
        assert_eq!(merged.model, "rust-seg.pt");
        assert_eq!(merged.conf, 0.6);
        assert_eq!(merged.iou, submitted.iou);
        assert_eq!(merged.imgsz, submitted.imgsz);
        assert_eq!(merged.max_det, submitted.max_det);
    }
}
