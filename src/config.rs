use crate::schedule::ScheduleRule;
use crate::scheduler::Subject;
use crate::tasks::TaskKind;
use crate::utils::get_data_path;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CameraConfig {
    pub name: String,
    pub url: String,
    pub user: String,
    pub password: String,
    pub enabled: bool,
    pub output_dir: String,
    pub prefix: String,
    pub ext: String,
    pub quality: Option<u8>,
    pub resize: bool,
    pub resize_width: u32,
    pub resize_height: u32,
    pub schedules: Vec<ScheduleRule>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            url: String::new(),
            user: String::new(),
            password: String::new(),
            enabled: true,
            output_dir: String::new(),
            prefix: String::new(),
            ext: "jpg".to_string(),
            quality: None,
            resize: false,
            resize_width: 1920,
            resize_height: 1080,
            schedules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExportConfig {
    pub name: String,
    pub enabled: bool,
    pub input_dir: String,
    pub output_dir: String,
    pub ext: String,
    pub hour: String,
    pub minute: String,
    pub match_mode: String,
    pub fuzz_minutes: i64,
    pub date_from: String,
    pub date_to: String,
    pub resize: bool,
    pub resize_width: u32,
    pub resize_height: u32,
    pub quality: u8,
    pub prefix: String,
    pub zero_padding: usize,
    pub create_video: bool,
    pub video_fps: u32,
    pub video_codec: String,
    pub video_output: String,
    pub schedules: Vec<ScheduleRule>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            input_dir: String::new(),
            output_dir: String::new(),
            ext: "jpg".to_string(),
            hour: "*".to_string(),
            minute: "0".to_string(),
            match_mode: "nearest".to_string(),
            fuzz_minutes: 5,
            date_from: String::new(),
            date_to: String::new(),
            resize: false,
            resize_width: 1920,
            resize_height: 1080,
            quality: 50,
            prefix: String::new(),
            zero_padding: 5,
            create_video: false,
            video_fps: 24,
            video_codec: "libx264".to_string(),
            video_output: String::new(),
            schedules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerConfig {
    pub tick_seconds: u64,
    pub max_workers: usize,
    pub task_retention_seconds: u64,
    pub history_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_seconds: 1,
            max_workers: 4,
            task_retention_seconds: 300,
            history_limit: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub cameras: HashMap<String, CameraConfig>,
    pub exports: HashMap<String, ExportConfig>,
    pub scheduler: SchedulerConfig,
    pub ffmpeg_path: String,
}

impl Config {
    /// Flatten cameras and exports into scheduler subjects. Disabled
    /// entries are carried with their flag so the scheduler can report
    /// them; it never matches their rules.
    pub fn subjects(&self) -> Vec<Subject> {
        let mut subjects = Vec::new();
        for (id, camera) in &self.cameras {
            subjects.push(Subject {
                id: id.clone(),
                kind: TaskKind::Capture,
                enabled: camera.enabled,
                rules: camera.schedules.clone(),
            });
        }
        for (id, export) in &self.exports {
            subjects.push(Subject {
                id: id.clone(),
                kind: TaskKind::Export,
                enabled: export.enabled,
                rules: export.schedules.clone(),
            });
        }
        subjects.sort_by(|a, b| a.id.cmp(&b.id));
        subjects
    }
}

pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_data_path()?.join("config.json"))
}

pub fn get_history_path() -> Result<PathBuf> {
    Ok(get_data_path()?.join("history.json"))
}

pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let path = match config_path {
        Some(p) => p.to_path_buf(),
        None => get_config_path()?,
    };

    if !path.exists() {
        return Ok(Config::default());
    }

    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let config = serde_json::from_str(&raw)
        .with_context(|| format!("invalid JSON in {}", path.display()))?;
    Ok(config)
}

pub fn save_config(config: &Config, config_path: Option<&Path>) -> Result<()> {
    let path = match config_path {
        Some(p) => p.to_path_buf(),
        None => get_config_path()?,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, text)?;
    Ok(())
}
