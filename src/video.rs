use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RenderOptions {
    pub fps: u32,
    pub codec: String,
    pub pixel_fmt: String,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            fps: 24,
            codec: "libx264".to_string(),
            pixel_fmt: "yuv420p".to_string(),
        }
    }
}

/// Per-frame progress callback: (frames done, frames total).
pub type RenderProgress<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

/// The external encoder seam. The export job only knows this contract.
#[async_trait]
pub trait VideoEncoder: Send + Sync {
    async fn render(
        &self,
        frames: &[PathBuf],
        output: &Path,
        options: &RenderOptions,
        progress: Option<RenderProgress<'_>>,
    ) -> Result<PathBuf>;
}

/// Renders an ordered frame list to a video by invoking ffmpeg with a
/// concat-demuxer input list and parsing its `-progress` output.
pub struct FfmpegEncoder {
    binary: PathBuf,
}

impl FfmpegEncoder {
    /// Use the configured binary when one is set, otherwise find ffmpeg on
    /// the PATH.
    pub fn resolve(configured: Option<&str>) -> Result<Self> {
        let binary = match configured.filter(|p| !p.is_empty()) {
            Some(path) => {
                let path = PathBuf::from(path);
                if !path.is_file() {
                    bail!("configured ffmpeg not found at {}", path.display());
                }
                path
            }
            None => which::which("ffmpeg").context("ffmpeg not found on PATH")?,
        };
        Ok(Self { binary })
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

/// The concat demuxer wants single quotes closed, escaped and reopened.
fn concat_line(path: &Path) -> String {
    let escaped = path.display().to_string().replace('\'', "'\\''");
    format!("file '{escaped}'\n")
}

fn build_args(list_file: &Path, output: &Path, options: &RenderOptions) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-r".to_string(),
        options.fps.to_string(),
        "-f".to_string(),
        "concat".to_string(),
        "-safe".to_string(),
        "0".to_string(),
        "-i".to_string(),
        list_file.display().to_string(),
        "-c:v".to_string(),
        options.codec.clone(),
        "-pix_fmt".to_string(),
        options.pixel_fmt.clone(),
        "-progress".to_string(),
        "pipe:1".to_string(),
        output.display().to_string(),
    ]
}

#[async_trait]
impl VideoEncoder for FfmpegEncoder {
    async fn render(
        &self,
        frames: &[PathBuf],
        output: &Path,
        options: &RenderOptions,
        progress: Option<RenderProgress<'_>>,
    ) -> Result<PathBuf> {
        if frames.is_empty() {
            bail!("no frames to render");
        }
        let total = frames.len() as u64;
        info!(
            "rendering {total} frames to {} at {} fps",
            output.display(),
            options.fps
        );

        let list_file = output.with_extension("frames.txt");
        let mut list = String::new();
        for frame in frames {
            list.push_str(&concat_line(frame));
        }
        tokio::fs::write(&list_file, list)
            .await
            .with_context(|| format!("cannot write frame list {}", list_file.display()))?;

        let args = build_args(&list_file, output, options);
        debug!("running {} {}", self.binary.display(), args.join(" "));
        let result = run_with_progress(&self.binary, &args, total, progress).await;
        let _ = tokio::fs::remove_file(&list_file).await;
        result?;
        Ok(output.to_path_buf())
    }
}

async fn run_with_progress(
    binary: &Path,
    args: &[String],
    total: u64,
    progress: Option<RenderProgress<'_>>,
) -> Result<()> {
    let mut child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to start {}", binary.display()))?;

    // drain stderr concurrently so a chatty encoder cannot deadlock on a
    // full pipe; keep the tail for error reporting
    let stderr = child.stderr.take().ok_or_else(|| anyhow!("no stderr pipe"))?;
    let drain = tokio::spawn(async move {
        let mut tail: Vec<String> = Vec::new();
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tail.push(line);
            if tail.len() > 20 {
                tail.remove(0);
            }
        }
        tail.join("\n")
    });

    let frame_re = Regex::new(r"^frame=(\d+)").expect("frame pattern is valid");
    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(caps) = frame_re.captures(line.trim()) {
                if let (Some(cb), Ok(frame)) = (progress, caps[1].parse::<u64>()) {
                    cb(frame.min(total), total);
                }
            }
        }
    }

    let status = child.wait().await.context("waiting for ffmpeg failed")?;
    let stderr_tail = drain.await.unwrap_or_default();
    if !status.success() {
        bail!(
            "ffmpeg failed (exit {}): {stderr_tail}",
            status.code().unwrap_or(-1)
        );
    }
    Ok(())
}
