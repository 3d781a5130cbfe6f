use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Capture files are named `<prefix>YYYY-MM-DD-HHMMSS.<ext>`; seconds are
/// optional and default to zero. Anything before the date is tolerated.
pub const TIMESTAMP_PATTERN: &str =
    r"(?P<year>\d{4})-(?P<month>\d{2})-(?P<day>\d{2})-(?P<hour>\d{2})(?P<minute>\d{2})(?P<second>\d{2})?";

pub fn timestamp_pattern() -> Regex {
    Regex::new(TIMESTAMP_PATTERN).expect("builtin timestamp pattern is valid")
}

/// Parse a capture timestamp out of a file name. Returns `None` when the
/// name does not carry one or the digits do not form a real instant.
pub fn parse_timestamp(name: &str, pattern: &Regex) -> Option<NaiveDateTime> {
    let caps = pattern.captures(name)?;
    let group = |key: &str| caps.name(key).and_then(|m| m.as_str().parse::<u32>().ok());
    let year = caps.name("year")?.as_str().parse::<i32>().ok()?;
    let date = NaiveDate::from_ymd_opt(year, group("month")?, group("day")?)?;
    let second = group("second").unwrap_or(0);
    date.and_hms_opt(group("hour")?, group("minute")?, second)
}

/// A directory of captured frames indexed by the timestamps in their file
/// names, ascending. Unparsable names are skipped, not errors.
#[derive(Debug, Clone, Default)]
pub struct ImageSet {
    items: Vec<(NaiveDateTime, PathBuf)>,
}

impl ImageSet {
    pub fn load(dir: &Path, ext: &str) -> Result<Self> {
        Self::load_with_pattern(dir, ext, &timestamp_pattern())
    }

    pub fn load_with_pattern(dir: &Path, ext: &str, pattern: &Regex) -> Result<Self> {
        let mut items = Vec::new();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("cannot read image directory {}", dir.display()))?;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let matches_ext = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(ext));
            if !matches_ext {
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            match parse_timestamp(name, pattern) {
                Some(at) => items.push((at, path)),
                None => debug!("skipping {name}: no timestamp in file name"),
            }
        }
        Ok(Self::from_entries(items))
    }

    pub fn from_entries(mut items: Vec<(NaiveDateTime, PathBuf)>) -> Self {
        items.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        Self { items }
    }

    pub fn items(&self) -> &[(NaiveDateTime, PathBuf)] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The distinct calendar days covered, ascending.
    pub fn days(&self) -> Vec<NaiveDate> {
        let mut days: Vec<NaiveDate> = self.items.iter().map(|(at, _)| at.date()).collect();
        days.dedup();
        days
    }
}
