use crate::config::CameraConfig;
use crate::imaging::{ImageCodec, Transform};
use crate::sources::{ImageSource, validate_image_url};
use crate::store::HistoryStore;
use crate::tasks::{JobBody, JobOutcome};
use crate::utils::{expand_tilde, safe_filename};
use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

/// Capture files carry their timestamp in the name; the image set index
/// parses it back out with the same shape.
pub const FILENAME_FORMAT: &str = "%Y-%m-%d-%H%M%S";

/// An IP camera that serves still images over HTTP. The URL is validated
/// at construction, so a camera that exists is always fetchable in form.
#[derive(Debug, Clone)]
pub struct Camera {
    pub id: String,
    pub name: String,
    url: Url,
    auth: Option<(String, String)>,
    pub output_dir: PathBuf,
    prefix: String,
    ext: String,
    transform: Transform,
}

impl Camera {
    pub fn from_config(id: &str, config: &CameraConfig) -> Result<Self> {
        let url = validate_image_url(&config.url)?;
        let auth = if config.user.is_empty() {
            None
        } else {
            Some((config.user.clone(), config.password.clone()))
        };
        let name = if config.name.is_empty() {
            id.to_string()
        } else {
            config.name.clone()
        };
        Ok(Self {
            id: id.to_string(),
            name,
            url,
            auth,
            output_dir: expand_tilde(&config.output_dir),
            prefix: safe_filename(&config.prefix),
            ext: config.ext.clone(),
            transform: Transform {
                resize: config
                    .resize
                    .then_some((config.resize_width, config.resize_height)),
                jpeg_quality: config.quality,
            },
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn filename(&self, at: NaiveDateTime) -> String {
        format!("{}{}.{}", self.prefix, at.format(FILENAME_FORMAT), self.ext)
    }
}

/// Fetch one frame and write it to the camera's output directory.
pub async fn capture_once(
    camera: &Camera,
    source: &dyn ImageSource,
    codec: &dyn ImageCodec,
) -> Result<PathBuf> {
    let auth = camera
        .auth
        .as_ref()
        .map(|(user, password)| (user.as_str(), password.as_str()));
    let bytes = source.fetch(&camera.url, auth).await?;
    let bytes = codec.transform(&bytes, &camera.transform)?;
    tokio::fs::create_dir_all(&camera.output_dir)
        .await
        .with_context(|| format!("cannot create {}", camera.output_dir.display()))?;
    let path = camera
        .output_dir
        .join(camera.filename(Local::now().naive_local()));
    tokio::fs::write(&path, bytes)
        .await
        .with_context(|| format!("cannot write {}", path.display()))?;
    info!("captured {} -> {}", camera.name, path.display());
    Ok(path)
}

/// Job body for a scheduled or manual capture. Every attempt lands in the
/// history, failures included; the error still propagates so the task
/// records it.
pub fn capture_job(
    camera: Arc<Camera>,
    source: Arc<dyn ImageSource>,
    codec: Arc<dyn ImageCodec>,
    history: Arc<HistoryStore>,
) -> JobBody {
    Box::new(move |ctx| {
        Box::pin(async move {
            if ctx.is_cancelled() {
                return Ok(JobOutcome::Cancelled);
            }
            ctx.report(0, 1, format!("Fetching {}", camera.name));
            match capture_once(&camera, source.as_ref(), codec.as_ref()).await {
                Ok(path) => {
                    ctx.report(1, 1, format!("Saved {}", path.display()));
                    if let Err(err) = history
                        .add_capture(&camera.id, Some(path.display().to_string()), None)
                        .await
                    {
                        warn!("could not record capture for {}: {err:#}", camera.id);
                    }
                    Ok(JobOutcome::Completed)
                }
                Err(err) => {
                    if let Err(store_err) = history
                        .add_capture(&camera.id, None, Some(format!("{err:#}")))
                        .await
                    {
                        warn!("could not record capture for {}: {store_err:#}", camera.id);
                    }
                    Err(err)
                }
            }
        })
    })
}
