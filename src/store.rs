use crate::utils::{short_id, timestamp};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureEntry {
    pub id: String,
    pub camera: String,
    pub time: String,
    pub success: bool,
    pub file: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportEntry {
    pub id: String,
    pub name: String,
    pub input_dir: String,
    pub output_dir: String,
    pub image_count: usize,
    pub time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderEntry {
    pub id: String,
    pub name: String,
    pub output: String,
    pub fps: u32,
    pub file_size: u64,
    pub time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct History {
    version: u32,
    captures: Vec<CaptureEntry>,
    exports: Vec<ExportEntry>,
    renders: Vec<RenderEntry>,
}

impl Default for History {
    fn default() -> Self {
        Self {
            version: 1,
            captures: Vec::new(),
            exports: Vec::new(),
            renders: Vec::new(),
        }
    }
}

/// Bounded newest-first record of what ran: captures, exports, renders.
/// Persisted as JSON; a missing or corrupt file just means an empty
/// history.
pub struct HistoryStore {
    path: PathBuf,
    limit: usize,
    data: Mutex<History>,
}

impl HistoryStore {
    pub fn new(path: PathBuf, limit: usize) -> Self {
        Self {
            path,
            limit: limit.max(1),
            data: Mutex::new(History::default()),
        }
    }

    pub async fn load(&self) -> Result<()> {
        if !self.path.exists() {
            *self.data.lock().await = History::default();
            return Ok(());
        }
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let history: History = serde_json::from_str(&raw).unwrap_or_default();
        *self.data.lock().await = history;
        Ok(())
    }

    async fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let text = {
            let data = self.data.lock().await;
            serde_json::to_string_pretty(&*data)?
        };
        tokio::fs::write(&self.path, text).await?;
        Ok(())
    }

    pub async fn add_capture(
        &self,
        camera: &str,
        file: Option<String>,
        error: Option<String>,
    ) -> Result<CaptureEntry> {
        let entry = CaptureEntry {
            id: short_id(),
            camera: camera.to_string(),
            time: timestamp(),
            success: error.is_none(),
            file,
            error,
        };
        {
            let mut data = self.data.lock().await;
            data.captures.insert(0, entry.clone());
            data.captures.truncate(self.limit);
        }
        self.save().await?;
        Ok(entry)
    }

    pub async fn add_export(
        &self,
        name: &str,
        input_dir: &str,
        output_dir: &str,
        image_count: usize,
    ) -> Result<ExportEntry> {
        let entry = ExportEntry {
            id: short_id(),
            name: name.to_string(),
            input_dir: input_dir.to_string(),
            output_dir: output_dir.to_string(),
            image_count,
            time: timestamp(),
        };
        {
            let mut data = self.data.lock().await;
            data.exports.insert(0, entry.clone());
            data.exports.truncate(self.limit);
        }
        self.save().await?;
        Ok(entry)
    }

    pub async fn add_render(
        &self,
        name: &str,
        output: &str,
        fps: u32,
        file_size: u64,
    ) -> Result<RenderEntry> {
        let entry = RenderEntry {
            id: short_id(),
            name: name.to_string(),
            output: output.to_string(),
            fps,
            file_size,
            time: timestamp(),
        };
        {
            let mut data = self.data.lock().await;
            data.renders.insert(0, entry.clone());
            data.renders.truncate(self.limit);
        }
        self.save().await?;
        Ok(entry)
    }

    pub async fn captures(&self) -> Vec<CaptureEntry> {
        self.data.lock().await.captures.clone()
    }

    pub async fn exports(&self) -> Vec<ExportEntry> {
        self.data.lock().await.exports.clone()
    }

    pub async fn renders(&self) -> Vec<RenderEntry> {
        self.data.lock().await.renders.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
