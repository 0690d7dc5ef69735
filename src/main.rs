use std::{path::PathBuf, time::Duration};

use anyhow::Result;
use clap::{Parser, Subcommand};

use corroscan::{
    DetectBackend, HttpBackend, InputFile, PipelineController, PollConfig, ReportConfig,
    ReportGenerator, TaskStatus,
};

#[derive(Parser)]
#[command(name = "corroscan", about = "Corrosion detection client and report generator")]
struct Cli {
    /// Base URL of the detection backend
    #[arg(long, default_value = "http://127.0.0.1:8000")]
    api_base: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the models available on the backend
    Models,
    /// Run detection over image files, optionally exporting a PDF report
    Detect {
        /// Image files to process, in order
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Enqueue jobs and poll them instead of synchronous detection
        #[arg(long)]
        queue: bool,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        conf: Option<f64>,
        #[arg(long)]
        iou: Option<f64>,
        #[arg(long)]
        imgsz: Option<u32>,
        #[arg(long)]
        max_det: Option<u32>,
        /// Give up on a queued job after this many seconds of polling
        #[arg(long)]
        poll_timeout: Option<u64>,
        /// Batch label attached to every item of this run
        #[arg(long)]
        batch: Option<String>,
        /// Write a PDF report of the completed detections
        #[arg(long)]
        report: bool,
        /// Output directory for the report
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let backend = HttpBackend::new(&cli.api_base);

    match cli.command {
        Command::Models => {
            let res = backend.list_models().await?;
            if !res.success || res.models.is_empty() {
                println!("no models available");
                return Ok(());
            }
            for model in res.models {
                println!("{}\t{}", model.key, model.name);
            }
        }
        Command::Detect {
            files,
            queue,
            model,
            conf,
            iou,
            imgsz,
            max_det,
            poll_timeout,
            batch,
            report,
            out_dir,
        } => {
            let mut poll = PollConfig::default();
            if let Some(secs) = poll_timeout {
                poll = poll.with_deadline(Duration::from_secs(secs));
            }
            let controller = PipelineController::new(backend).with_poll_config(poll);

            // Ctrl-C aborts the in-flight poll loop and the remaining batch.
            let cancel = controller.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            });

            let inputs = files
                .iter()
                .map(InputFile::from_path)
                .collect::<Result<Vec<_>>>()?;
            controller.set_files(inputs).await;
            controller.fetch_models().await;

            {
                let state = controller.state();
                let mut state = state.lock().await;
                if let Some(model) = model {
                    state.params.model = model;
                }
                if let Some(conf) = conf {
                    state.params.conf = conf;
                }
                if let Some(iou) = iou {
                    state.params.iou = iou;
                }
                if let Some(imgsz) = imgsz {
                    state.params.imgsz = imgsz;
                }
                if let Some(max_det) = max_det {
                    state.params.max_det = max_det;
                }
            }

            if queue {
                controller.detect_queue().await;
            } else {
                controller.detect_sync().await;
            }

            let state = controller.state();
            let items = {
                let mut state = state.lock().await;
                if let Some(batch) = &batch {
                    let ids: Vec<String> =
                        state.gallery.iter().map(|item| item.id.clone()).collect();
                    for id in ids {
                        state.set_item_batch(&id, Some(batch.clone()), Some(1));
                    }
                }

                println!("{}", state.progress);
                for task in state.tasks.iter().rev() {
                    let marker = match task.status {
                        TaskStatus::Done => "ok",
                        TaskStatus::Error => "failed",
                        TaskStatus::Pending | TaskStatus::Running => "pending",
                    };
                    let detail = task.message.clone().unwrap_or_default();
                    println!("{:8} {} {}", marker, task.filename, detail);
                }
                state.gallery.clone()
            };

            if report && !items.is_empty() {
                let mut generator = ReportGenerator::new(ReportConfig {
                    output_dir: out_dir,
                    ..ReportConfig::default()
                });
                if let Some(path) = generator.generate(&items, None).await? {
                    println!("report written to {}", path.display());
                }
            }
        }
    }

    Ok(())
}
