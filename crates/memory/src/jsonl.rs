//! JSON-lines persistence for memory records.
//!
//! Each line is one JSON-encoded `MemoryRecord`. The whole file is
//! rewritten on every mutation; the store holds its write lock while
//! doing so, so two writers never interleave.

use std::path::Path;

use tanren_core::error::MemoryError;
use tanren_core::memory::MemoryRecord;
use tracing::warn;

/// Load records from a JSONL file.
///
/// A missing file is an empty store. Lines that fail to parse are skipped
/// with a warning so one bad write does not lose the rest of the history.
pub async fn load_records(path: &Path) -> Result<Vec<MemoryRecord>, MemoryError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(MemoryError::Storage(format!(
                "Failed to read memory file {}: {e}",
                path.display()
            )));
        }
    };

    Ok(content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(n, line)| match serde_json::from_str::<MemoryRecord>(line) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(line = n + 1, error = %e, "Skipping corrupted memory record");
                None
            }
        })
        .collect())
}

/// Write all records to `path`, creating parent directories as needed.
pub async fn write_records(path: &Path, records: &[MemoryRecord]) -> Result<(), MemoryError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            MemoryError::Storage(format!("Failed to create memory directory: {e}"))
        })?;
    }

    let mut content = String::new();
    for record in records {
        let line = serde_json::to_string(record).map_err(|e| {
            MemoryError::Storage(format!("Failed to serialize memory record: {e}"))
        })?;
        content.push_str(&line);
        content.push('\n');
    }

    tokio::fs::write(path, content)
        .await
        .map_err(|e| MemoryError::Storage(format!("Failed to write memory file: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::io::Write;

    fn record(id: &str) -> MemoryRecord {
        MemoryRecord {
            id: id.into(),
            user_text: format!("question {id}"),
            assistant_text: format!("answer {id}"),
            embedding: vec![0.1, 0.2],
            created_at: Utc::now(),
            session_id: None,
        }
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let records = load_records(&dir.path().join("none.jsonl")).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn write_creates_parents_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("records.jsonl");

        write_records(&path, &[record("a"), record("b")]).await.unwrap();
        let loaded = load_records(&path).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].id, "b");
        assert_eq!(loaded[0].embedding, vec![0.1, 0.2]);
    }

    #[tokio::test]
    async fn corrupted_lines_are_skipped() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "{}", serde_json::to_string(&record("1")).unwrap()).unwrap();
        writeln!(tmp, "this is not json").unwrap();
        writeln!(tmp).unwrap();
        writeln!(tmp, "{}", serde_json::to_string(&record("2")).unwrap()).unwrap();

        let loaded = load_records(tmp.path()).await.unwrap();
        let ids: Vec<&str> = loaded.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
    }
}
