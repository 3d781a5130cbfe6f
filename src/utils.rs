use chrono::Local;
use std::path::{Path, PathBuf};

pub fn ensure_dir(path: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(path)?;
    Ok(path.to_path_buf())
}

pub fn get_data_path() -> std::io::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| std::io::Error::other("cannot resolve home directory"))?;
    ensure_dir(&home.join(".lapse"))
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn today_date() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

pub fn timestamp() -> String {
    Local::now().to_rfc3339()
}

pub fn safe_filename(name: &str) -> String {
    let mut out = name.to_string();
    for ch in ['<', '>', ':', '"', '/', '\\', '|', '?', '*'] {
        out = out.replace(ch, "_");
    }
    out.trim().to_string()
}

/// Short random identifier used for tasks and history entries.
pub fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_filename_strips_reserved_chars() {
        assert_eq!(safe_filename("cam: front/door?"), "cam_ front_door_");
    }

    #[test]
    fn short_id_is_eight_chars() {
        let id = short_id();
        assert_eq!(id.len(), 8);
        assert_ne!(id, short_id());
    }
}
