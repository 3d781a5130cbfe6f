use crate::config::ExportConfig;
use crate::imageset::ImageSet;
use crate::imaging::{ImageCodec, Transform};
use crate::schedule::ValidationError;
use crate::store::HistoryStore;
use crate::tasks::{JobBody, JobOutcome};
use crate::timefilter::{DateSpan, FilterSpec, MatchMode};
use crate::utils::expand_tilde;
use crate::video::{RenderOptions, VideoEncoder};
use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct VideoSettings {
    pub options: RenderOptions,
    pub output: PathBuf,
}

/// A fully validated export: filter spec, writer options and optional
/// chained render. Building one from config fails fast on a bad mask,
/// date or mode, before anything is scanned.
#[derive(Debug, Clone)]
pub struct ExportJob {
    pub id: String,
    pub name: String,
    input_dir: PathBuf,
    output_dir: PathBuf,
    ext: String,
    spec: FilterSpec,
    transform: Transform,
    prefix: String,
    zero_padding: usize,
    video: Option<VideoSettings>,
}

fn parse_date(text: &str) -> Result<NaiveDate, ValidationError> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map_err(|_| ValidationError::BadDate(text.to_string()))
}

fn date_span(from: &str, to: &str) -> Result<DateSpan, ValidationError> {
    let span = match (from.is_empty(), to.is_empty()) {
        (true, true) => DateSpan::All,
        (false, true) => DateSpan::Range {
            from: parse_date(from)?,
            to: NaiveDate::MAX,
        },
        (true, false) => DateSpan::Range {
            from: NaiveDate::MIN,
            to: parse_date(to)?,
        },
        (false, false) => DateSpan::Range {
            from: parse_date(from)?,
            to: parse_date(to)?,
        },
    };
    Ok(span)
}

impl ExportJob {
    pub fn from_config(id: &str, config: &ExportConfig) -> Result<Self, ValidationError> {
        let mode = match config.match_mode.as_str() {
            "exact" => MatchMode::Exact,
            "nearest" => MatchMode::Nearest {
                window: Duration::minutes(config.fuzz_minutes),
            },
            other => return Err(ValidationError::BadMode(other.to_string())),
        };
        let span = date_span(&config.date_from, &config.date_to)?;
        let spec = FilterSpec::new(span, &config.hour, &config.minute, mode)?;

        let output_dir = expand_tilde(&config.output_dir);
        let video = config.create_video.then(|| VideoSettings {
            options: RenderOptions {
                fps: config.video_fps,
                codec: config.video_codec.clone(),
                ..RenderOptions::default()
            },
            output: if config.video_output.is_empty() {
                PathBuf::from(format!(
                    "{}.mp4",
                    output_dir.display().to_string().trim_end_matches('/')
                ))
            } else {
                expand_tilde(&config.video_output)
            },
        });

        Ok(Self {
            id: id.to_string(),
            name: if config.name.is_empty() {
                id.to_string()
            } else {
                config.name.clone()
            },
            input_dir: expand_tilde(&config.input_dir),
            output_dir,
            ext: config.ext.clone(),
            spec,
            transform: Transform {
                resize: config
                    .resize
                    .then_some((config.resize_width, config.resize_height)),
                jpeg_quality: Some(config.quality),
            },
            prefix: config.prefix.clone(),
            zero_padding: config.zero_padding,
            video,
        })
    }

    pub fn video(&self) -> Option<&VideoSettings> {
        self.video.as_ref()
    }

    fn frame_name(&self, index: usize) -> String {
        format!(
            "{}{:0width$}.{}",
            self.prefix,
            index,
            self.ext,
            width = self.zero_padding
        )
    }
}

/// Create the output directory and clear leftovers from a previous run so
/// the sequence numbering starts clean.
async fn prepare_output_dir(dir: &Path, ext: &str) -> Result<usize> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("cannot create {}", dir.display()))?;
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let matches_ext = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(ext));
        if matches_ext && tokio::fs::remove_file(&path).await.is_ok() {
            removed += 1;
        }
    }
    if removed > 0 {
        debug!("cleared {removed} stale frames from {}", dir.display());
    }
    Ok(removed)
}

/// Job body for a scheduled or manual export: index the input directory,
/// select frames through the time filter, write the numbered sequence and
/// optionally chain a video render. Cancellation is checked per frame;
/// frames already written stay in place.
pub fn export_job(
    job: ExportJob,
    codec: Arc<dyn ImageCodec>,
    encoder: Arc<dyn VideoEncoder>,
    history: Arc<HistoryStore>,
) -> JobBody {
    Box::new(move |ctx| {
        Box::pin(async move {
            ctx.report(0, 0, "Indexing image set");
            let set = ImageSet::load(&job.input_dir, &job.ext)?;
            let selected = job.spec.select(set.items());
            info!(
                "export {}: {} of {} frames selected",
                job.id,
                selected.len(),
                set.len()
            );
            if selected.is_empty() {
                ctx.report(0, 0, "No images matched the time filter");
                history
                    .add_export(
                        &job.name,
                        &job.input_dir.display().to_string(),
                        &job.output_dir.display().to_string(),
                        0,
                    )
                    .await?;
                return Ok(JobOutcome::Completed);
            }

            prepare_output_dir(&job.output_dir, &job.ext).await?;
            let total = selected.len() as u64;
            let mut written: Vec<PathBuf> = Vec::with_capacity(selected.len());
            for (index, source) in selected.iter().enumerate() {
                if ctx.is_cancelled() {
                    history
                        .add_export(
                            &job.name,
                            &job.input_dir.display().to_string(),
                            &job.output_dir.display().to_string(),
                            written.len(),
                        )
                        .await?;
                    return Ok(JobOutcome::Cancelled);
                }
                let bytes = tokio::fs::read(source)
                    .await
                    .with_context(|| format!("cannot read {}", source.display()))?;
                let bytes = codec.transform(&bytes, &job.transform)?;
                let dest = job.output_dir.join(job.frame_name(index));
                tokio::fs::write(&dest, bytes)
                    .await
                    .with_context(|| format!("cannot write {}", dest.display()))?;
                written.push(dest);
                ctx.report(
                    (index + 1) as u64,
                    total,
                    format!("Writing frame {} of {total}", index + 1),
                );
            }
            history
                .add_export(
                    &job.name,
                    &job.input_dir.display().to_string(),
                    &job.output_dir.display().to_string(),
                    written.len(),
                )
                .await?;

            if let Some(video) = &job.video {
                ctx.report(0, total, "Starting video render");
                let progress =
                    |frame: u64, frames: u64| ctx.report(frame, frames, "Encoding video");
                let output = encoder
                    .render(&written, &video.output, &video.options, Some(&progress))
                    .await?;
                let size = tokio::fs::metadata(&output)
                    .await
                    .map(|m| m.len())
                    .unwrap_or(0);
                history
                    .add_render(
                        &job.name,
                        &output.display().to_string(),
                        video.options.fps,
                        size,
                    )
                    .await?;
            }
            Ok(JobOutcome::Completed)
        })
    })
}
