use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use chrono::Local;
use clap::{Parser, Subcommand};
use lapse::VERSION;
use lapse::capture::{Camera, capture_job};
use lapse::config::{Config, get_config_path, get_history_path, load_config, save_config};
use lapse::export::{ExportJob, export_job};
use lapse::imaging::{ImageCodec, RasterCodec};
use lapse::schedule::{IntervalUnit, Trigger};
use lapse::scheduler::{JobFactory, Scheduler};
use lapse::sources::{HttpImageSource, ImageSource};
use lapse::store::HistoryStore;
use lapse::tasks::{JobBody, TaskKind, TaskManager, TaskStatus};
use lapse::video::{FfmpegEncoder, RenderOptions, RenderProgress, VideoEncoder};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "lapse",
    about = "lapse: scheduled timelapse capture, export and render daemon"
)]
struct Cli {
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create a default config file
    Init,
    /// Run the capture/export scheduler daemon
    Run {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Grab one frame from a camera right now
    Capture {
        camera: String,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Run one export right now
    Export {
        export: String,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print sample fire times for a schedule
    Preview {
        #[arg(long, default_value = "0")]
        second: String,
        #[arg(long, default_value = "*")]
        minute: String,
        #[arg(long, default_value = "*")]
        hour: String,
        /// Interval amount; when set, second/minute/hour are ignored
        #[arg(long)]
        every: Option<u32>,
        #[arg(long, default_value = "minutes")]
        unit: String,
        #[arg(long, default_value_t = 10)]
        count: usize,
    },
    /// Show the configured cameras and exports
    Status {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    Version,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Init => cmd_init(),
        Commands::Run { config } => cmd_run(config.as_deref()).await,
        Commands::Capture { camera, config } => cmd_capture(&camera, config.as_deref()).await,
        Commands::Export { export, config } => cmd_export(&export, config.as_deref()).await,
        Commands::Preview {
            second,
            minute,
            hour,
            every,
            unit,
            count,
        } => cmd_preview(&second, &minute, &hour, every, &unit, count),
        Commands::Status { config } => cmd_status(config.as_deref()).await,
        Commands::Version => {
            println!("lapse v{VERSION}");
            Ok(())
        }
    }
}

fn cmd_init() -> Result<()> {
    let config_path = get_config_path()?;
    if config_path.exists() {
        println!("Config already exists at {}", config_path.display());
        return Ok(());
    }
    save_config(&Config::default(), Some(&config_path))?;
    println!("Created config at {}", config_path.display());
    println!("Add cameras and exports there, then start the daemon with: lapse run");
    Ok(())
}

fn ffmpeg_override(config: &Config) -> Option<&str> {
    (!config.ffmpeg_path.is_empty()).then_some(config.ffmpeg_path.as_str())
}

/// Resolves ffmpeg when a render actually starts, keeping the scheduler
/// tick free of filesystem probing. Jobs without a chained render never
/// touch it.
struct DeferredFfmpeg {
    override_path: Option<String>,
}

#[async_trait]
impl VideoEncoder for DeferredFfmpeg {
    async fn render(
        &self,
        frames: &[PathBuf],
        output: &Path,
        options: &RenderOptions,
        progress: Option<RenderProgress<'_>>,
    ) -> Result<PathBuf> {
        let encoder = FfmpegEncoder::resolve(self.override_path.as_deref())?;
        encoder.render(frames, output, options, progress).await
    }
}

fn deferred_encoder(config: &Config) -> Arc<dyn VideoEncoder> {
    Arc::new(DeferredFfmpeg {
        override_path: ffmpeg_override(config).map(str::to_string),
    })
}

/// Build job bodies for scheduler subjects from the current config. A
/// subject that no longer resolves produces a body that fails its task;
/// the scheduler itself stays oblivious.
fn job_factory(
    config: Arc<Mutex<Config>>,
    source: Arc<dyn ImageSource>,
    codec: Arc<dyn ImageCodec>,
    history: Arc<HistoryStore>,
) -> JobFactory {
    Arc::new(move |subject| {
        let built: Result<JobBody> = (|| {
            let config = config.lock().expect("config lock poisoned");
            match subject.kind {
                TaskKind::Capture => {
                    let camera_config = config
                        .cameras
                        .get(&subject.id)
                        .ok_or_else(|| anyhow!("camera {} is not configured", subject.id))?;
                    let camera = Arc::new(Camera::from_config(&subject.id, camera_config)?);
                    Ok(capture_job(
                        camera,
                        source.clone(),
                        codec.clone(),
                        history.clone(),
                    ))
                }
                TaskKind::Export => {
                    let export_config = config
                        .exports
                        .get(&subject.id)
                        .ok_or_else(|| anyhow!("export {} is not configured", subject.id))?;
                    let job = ExportJob::from_config(&subject.id, export_config)?;
                    let encoder = deferred_encoder(&config);
                    Ok(export_job(job, codec.clone(), encoder, history.clone()))
                }
                TaskKind::Render => bail!("render tasks are only chained from exports"),
            }
        })();
        match built {
            Ok(body) => body,
            Err(err) => Box::new(move |_ctx| Box::pin(async move { Err(err) })),
        }
    })
}

async fn cmd_run(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let history = Arc::new(HistoryStore::new(
        get_history_path()?,
        config.scheduler.history_limit,
    ));
    history.load().await?;

    let tasks = TaskManager::new(
        config.scheduler.max_workers,
        Duration::from_secs(config.scheduler.task_retention_seconds),
    );
    let source: Arc<dyn ImageSource> = Arc::new(HttpImageSource::new()?);
    let codec: Arc<dyn ImageCodec> = Arc::new(RasterCodec);
    let shared = Arc::new(Mutex::new(config.clone()));
    let factory = job_factory(shared.clone(), source, codec, history);

    let scheduler = Scheduler::new(
        tasks,
        factory,
        Duration::from_secs(config.scheduler.tick_seconds.max(1)),
    );
    scheduler.reload(config.subjects());
    scheduler.start();
    println!(
        "lapse daemon running: {} cameras, {} exports (ctrl-c to stop)",
        config.cameras.len(),
        config.exports.len()
    );

    wait_for_shutdown(config_path, &shared, &scheduler).await?;
    scheduler.stop();
    println!("stopped");
    Ok(())
}

/// Block until ctrl-c. On unix, SIGHUP re-reads the config file and swaps
/// the scheduler's subject set without dropping in-flight tasks.
#[cfg(unix)]
async fn wait_for_shutdown(
    config_path: Option<&Path>,
    shared: &Arc<Mutex<Config>>,
    scheduler: &Scheduler,
) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => return result.map_err(Into::into),
            _ = hangup.recv() => match load_config(config_path) {
                Ok(new_config) => {
                    scheduler.reload(new_config.subjects());
                    *shared.lock().expect("config lock poisoned") = new_config;
                    println!("config reloaded");
                }
                Err(err) => eprintln!("config reload failed: {err:#}"),
            },
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(
    _config_path: Option<&Path>,
    _shared: &Arc<Mutex<Config>>,
    _scheduler: &Scheduler,
) -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

/// Poll a one-shot task and mirror its progress to the terminal.
async fn watch_task(manager: &Arc<TaskManager>, id: &str) -> Result<()> {
    let mut last_message = String::new();
    loop {
        let snapshot = manager
            .get(id)
            .ok_or_else(|| anyhow!("task {id} disappeared"))?;
        if snapshot.message != last_message && !snapshot.message.is_empty() {
            println!("[{:>3.0}%] {}", snapshot.progress, snapshot.message);
            last_message = snapshot.message.clone();
        }
        match snapshot.status {
            TaskStatus::Completed => {
                println!("done in {:.1}s", snapshot.elapsed);
                return Ok(());
            }
            TaskStatus::Failed => bail!(
                "task failed: {}",
                snapshot.error.unwrap_or_else(|| "unknown error".to_string())
            ),
            TaskStatus::Cancelled => {
                println!("cancelled");
                return Ok(());
            }
            TaskStatus::Pending | TaskStatus::Running => {
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        }
    }
}

async fn cmd_capture(camera_id: &str, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let camera_config = config
        .cameras
        .get(camera_id)
        .ok_or_else(|| anyhow!("camera {camera_id} is not configured"))?;
    let camera = Arc::new(Camera::from_config(camera_id, camera_config)?);
    let history = Arc::new(HistoryStore::new(
        get_history_path()?,
        config.scheduler.history_limit,
    ));
    history.load().await?;

    let manager = TaskManager::new(1, Duration::from_secs(60));
    let id = manager.submit(
        TaskKind::Capture,
        camera_id,
        capture_job(
            camera,
            Arc::new(HttpImageSource::new()?),
            Arc::new(RasterCodec),
            history,
        ),
    );
    watch_task(&manager, &id).await
}

async fn cmd_export(export_id: &str, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let export_config = config
        .exports
        .get(export_id)
        .ok_or_else(|| anyhow!("export {export_id} is not configured"))?;
    let job = ExportJob::from_config(export_id, export_config)
        .with_context(|| format!("export {export_id} is invalid"))?;
    // resolve eagerly for a one-shot run so a missing ffmpeg fails up front
    let encoder: Arc<dyn VideoEncoder> = if job.video().is_some() {
        Arc::new(FfmpegEncoder::resolve(ffmpeg_override(&config))?)
    } else {
        deferred_encoder(&config)
    };
    let history = Arc::new(HistoryStore::new(
        get_history_path()?,
        config.scheduler.history_limit,
    ));
    history.load().await?;

    let manager = TaskManager::new(1, Duration::from_secs(60));
    let id = manager.submit(
        TaskKind::Export,
        export_id,
        export_job(job, Arc::new(RasterCodec), encoder, history),
    );
    watch_task(&manager, &id).await
}

fn parse_unit(text: &str) -> Result<IntervalUnit> {
    match text {
        "seconds" => Ok(IntervalUnit::Seconds),
        "minutes" => Ok(IntervalUnit::Minutes),
        "hours" => Ok(IntervalUnit::Hours),
        other => bail!("unknown interval unit {other:?} (seconds|minutes|hours)"),
    }
}

fn cmd_preview(
    second: &str,
    minute: &str,
    hour: &str,
    every: Option<u32>,
    unit: &str,
    count: usize,
) -> Result<()> {
    let now = Local::now().naive_local();
    let trigger = match every {
        Some(amount) => Trigger::interval(amount, parse_unit(unit)?, now)?,
        None => Trigger::cron(second, minute, hour)?,
    };
    println!("{trigger}");
    for at in trigger.preview(now.date(), count) {
        println!("  {at}");
    }
    Ok(())
}

async fn cmd_status(config_path: Option<&Path>) -> Result<()> {
    let path = match config_path {
        Some(p) => p.to_path_buf(),
        None => get_config_path()?,
    };
    let config = load_config(Some(&path))?;
    println!("Config: {}", path.display());

    println!("Cameras:");
    if config.cameras.is_empty() {
        println!("  (none)");
    }
    for (id, camera) in &config.cameras {
        println!(
            "  {id}: {} [{}] {} schedules",
            if camera.name.is_empty() { id } else { &camera.name },
            if camera.enabled { "enabled" } else { "disabled" },
            camera.schedules.len()
        );
    }

    println!("Exports:");
    if config.exports.is_empty() {
        println!("  (none)");
    }
    for (id, export) in &config.exports {
        println!(
            "  {id}: {} [{}] hour={} minute={} mode={}",
            if export.name.is_empty() { id } else { &export.name },
            if export.enabled { "enabled" } else { "disabled" },
            export.hour,
            export.minute,
            export.match_mode
        );
    }

    match FfmpegEncoder::resolve(ffmpeg_override(&config)) {
        Ok(encoder) => println!("ffmpeg: {}", encoder.binary().display()),
        Err(_) => println!("ffmpeg: not found (video rendering unavailable)"),
    }

    let history = HistoryStore::new(get_history_path()?, config.scheduler.history_limit);
    history.load().await?;
    println!(
        "History: {} captures, {} exports, {} renders",
        history.captures().await.len(),
        history.exports().await.len(),
        history.renders().await.len()
    );
    Ok(())
}
