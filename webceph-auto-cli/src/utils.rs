use anyhow::{bail, Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use tracing::{warn, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use webceph_auto::{
    ImageAsset, ImageKind, LogLevel, PatientRecord, PipelineEvent, StageSnapshot, StageStatus,
};

/// Stderr plus a daily log file. Keep the returned guard alive until exit so
/// buffered lines reach the file.
pub fn init_logging() -> Result<WorkerGuard> {
    use tracing_appender::rolling;
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let log_level = env::var("LOG_LEVEL")
        .map(|level| match level.to_lowercase().as_str() {
            "error" => Level::ERROR,
            "warn" => Level::WARN,
            "info" => Level::INFO,
            "debug" => Level::DEBUG,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    let log_dir = if let Ok(custom_dir) = env::var("WEBCEPH_LOG_DIR") {
        PathBuf::from(custom_dir)
    } else {
        dirs::data_local_dir()
            .unwrap_or_else(env::temp_dir)
            .join("WebCephAuto")
            .join("logs")
    };
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Failed to create log directory {}: {e}", log_dir.display());
    }

    let file_appender = rolling::daily(&log_dir, "webceph-auto.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(log_level.into()));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .try_init()
        .context("logging was already initialised")?;

    Ok(guard)
}

pub fn load_patient(path: &Path) -> Result<PatientRecord> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading patient file {}", path.display()))?;
    let patient: PatientRecord = serde_json::from_str(&content)
        .with_context(|| format!("parsing patient file {}", path.display()))?;
    patient.validate()?;
    Ok(patient)
}

/// X-ray images first, then face photos; every file must exist.
pub fn collect_images(xrays: &[PathBuf], faces: &[PathBuf]) -> Result<Vec<ImageAsset>> {
    let images: Vec<ImageAsset> = xrays
        .iter()
        .map(|p| ImageAsset::new(p.clone(), ImageKind::Xray))
        .chain(faces.iter().map(|p| ImageAsset::new(p.clone(), ImageKind::Face)))
        .collect();

    if images.is_empty() {
        warn!("No images given; the upload stage will fail");
    }
    for image in &images {
        if !image.path.is_file() {
            bail!("{} not found: {}", image.kind, image.path.display());
        }
    }
    Ok(images)
}

pub fn print_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::StageStarted { label, .. } => println!("▶ {label}"),
        PipelineEvent::StageCompleted {
            success, message, ..
        } => {
            let mark = if *success { "✅" } else { "❌" };
            println!("  {mark} {message}");
        }
        PipelineEvent::Progress { percent } => println!("  [{percent:>3}%]"),
        PipelineEvent::Log { message, level } => match level {
            LogLevel::Warning => println!("  ⚠ {message}"),
            LogLevel::Error => println!("  ✖ {message}"),
            LogLevel::Info | LogLevel::Success => {}
        },
        PipelineEvent::StatusChanged { .. } => {}
    }
}

pub fn print_summary(stages: &[StageSnapshot]) {
    println!();
    for stage in stages {
        let mark = match stage.status {
            StageStatus::Completed => "✅",
            StageStatus::Failed => "❌",
            StageStatus::Running => "…",
            StageStatus::Pending => "·",
        };
        match &stage.message {
            Some(message) => println!("{mark} {:<18} {message}", stage.display_name),
            None => println!("{mark} {}", stage.display_name),
        }
    }
}
