//! Row store: the ordered list of event rows the pipeline reads and writes.
//!
//! [`JsonRowStore`] keeps the rows in a JSON array on disk. Every
//! [`RowStore::save_row`] rewrites the file through a temporary sibling and a
//! rename, so a crash never leaves a half-written file behind.

use crate::error::StoreError;
use crate::models::Event;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, instrument, warn};

#[async_trait(?Send)]
pub trait RowStore {
    fn rows(&self) -> &[Event];

    /// Make sure every row carries `columns`. Returns how many were added.
    fn ensure_columns(&mut self, columns: &[&str]) -> usize;

    /// Replace row `index` and persist it.
    async fn save_row(&mut self, index: usize, row: &Event) -> bool;

    /// Stop persisting incidental changes until [`RowStore::resume_autosave`].
    fn pause_autosave(&mut self);

    async fn resume_autosave(&mut self, flush: bool) -> Result<(), StoreError>;
}

#[derive(Debug)]
pub struct JsonRowStore {
    path: PathBuf,
    rows: Vec<Event>,
    autosave_paused: bool,
    dirty: bool,
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn known_columns() -> BTreeSet<String> {
    match serde_json::to_value(Event::default()) {
        Ok(serde_json::Value::Object(map)) => map.into_iter().map(|(k, _)| k).collect(),
        _ => BTreeSet::new(),
    }
}

impl JsonRowStore {
    /// Load rows from `path`. A missing file is an empty store.
    #[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let rows = match fs::read_to_string(&path).await {
            Ok(raw) if raw.trim().is_empty() => Vec::new(),
            Ok(raw) => serde_json::from_str::<Vec<Event>>(&raw).map_err(|source| StoreError::Parse {
                path: path.display().to_string(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Rows file not found; starting empty");
                Vec::new()
            }
            Err(e) => return Err(io_error(&path, e)),
        };
        info!(rows = rows.len(), "Loaded rows");
        Ok(Self {
            path,
            rows,
            autosave_paused: false,
            dirty: false,
        })
    }

    async fn flush(&mut self) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(&self.rows).map_err(|source| StoreError::Parse {
            path: self.path.display().to_string(),
            source,
        })?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, json).await.map_err(|e| io_error(&tmp, e))?;
        fs::rename(&tmp, &self.path).await.map_err(|e| io_error(&self.path, e))?;
        self.dirty = false;
        debug!(rows = self.rows.len(), "Rows written");
        Ok(())
    }
}

#[async_trait(?Send)]
impl RowStore for JsonRowStore {
    fn rows(&self) -> &[Event] {
        &self.rows
    }

    fn ensure_columns(&mut self, columns: &[&str]) -> usize {
        let known = known_columns();
        let mut added = 0;
        for column in columns.iter().filter(|c| !known.contains(**c)) {
            let mut touched = false;
            for row in &mut self.rows {
                if !row.extra.contains_key(*column) {
                    row.extra
                        .insert(column.to_string(), serde_json::Value::String(String::new()));
                    touched = true;
                }
            }
            if touched {
                added += 1;
            }
        }
        if added > 0 {
            self.dirty = true;
            info!(added, "Added missing columns");
        }
        added
    }

    #[instrument(level = "info", skip_all, fields(index, id = %row.id))]
    async fn save_row(&mut self, index: usize, row: &Event) -> bool {
        let Some(slot) = self.rows.get_mut(index) else {
            warn!(error = %StoreError::OutOfRange(index), "Row not saved");
            return false;
        };
        *slot = row.clone();
        match self.flush().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Row not saved");
                self.dirty = true;
                false
            }
        }
    }

    fn pause_autosave(&mut self) {
        self.autosave_paused = true;
    }

    async fn resume_autosave(&mut self, flush: bool) -> Result<(), StoreError> {
        self.autosave_paused = false;
        if flush && self.dirty {
            self.flush().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    const ROWS: &str = r#"[
        {"id": 1, "titleEn": "Quake hits Japan", "gnUrl": "https://news.google.com/rss/articles/x", "sqk": "3"},
        {"id": "2", "titleEn": "Markets rally", "verifyStatus": "ok"}
    ]"#;

    #[tokio::test]
    async fn test_open_and_unknown_columns_survive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.json");
        fs::write(&path, ROWS).await.unwrap();

        let mut store = JsonRowStore::open(&path).await.unwrap();
        assert_eq!(store.rows().len(), 2);
        assert_eq!(store.rows()[0].id, "1");
        assert!(store.rows()[1].is_done());

        let mut row = store.rows()[0].clone();
        row.summary = "done".into();
        assert!(store.save_row(0, &row).await);

        let reloaded = JsonRowStore::open(&path).await.unwrap();
        assert_eq!(reloaded.rows()[0].summary, "done");
        assert_eq!(reloaded.rows()[0].extra["sqk"], serde_json::json!("3"));
        assert!(!dir.path().join("rows.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_save_out_of_range() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.json");
        fs::write(&path, ROWS).await.unwrap();
        let mut store = JsonRowStore::open(&path).await.unwrap();
        assert!(!store.save_row(5, &Event::default()).await);
    }

    #[tokio::test]
    async fn test_ensure_columns_and_resume_flush() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.json");
        fs::write(&path, ROWS).await.unwrap();
        let mut store = JsonRowStore::open(&path).await.unwrap();

        store.pause_autosave();
        assert_eq!(store.ensure_columns(&["titleEn", "verifyStatus", "reviewer"]), 1);
        assert_eq!(store.ensure_columns(&["reviewer"]), 0);
        store.resume_autosave(true).await.unwrap();

        let raw = fs::read_to_string(&path).await.unwrap();
        assert!(raw.contains("\"reviewer\""));
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = JsonRowStore::open(dir.path().join("none.json")).await.unwrap();
        assert!(store.rows().is_empty());
    }

    #[tokio::test]
    async fn test_bad_json_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.json");
        fs::write(&path, "{not json").await.unwrap();
        assert!(matches!(
            JsonRowStore::open(&path).await,
            Err(StoreError::Parse { .. })
        ));
    }
}
