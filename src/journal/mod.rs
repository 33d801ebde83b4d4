//! Journal (C5): append-only durable log of `(seq, record)` entries plus a
//! committed-sequence marker, per spec.md §4.5.
//!
//! Grounded in the teacher's `buffer_batcher`'s SQLite-WAL idea of a durable
//! safety net ahead of the in-memory batch, but implemented as the file-pair
//! layout spec.md requires rather than a second SQLite table.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::instrument;

use crate::error::JournalError;
use crate::model::CanonicalLogRecord;

/// Append-only journal. `None` inner state means journaling is disabled
/// (spec.md §4.5 "Disablement"): every operation becomes a no-op.
pub struct Journal {
    inner: Option<Inner>,
}

struct Inner {
    path: PathBuf,
    commit_path: PathBuf,
    file: Mutex<File>,
    next_seq: AtomicU64,
    committed_seq: AtomicU64,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("enabled", &self.inner.is_some())
            .field("committed_seq", &self.committed_seq())
            .finish()
    }
}

impl Journal {
    /// Opens (creating if absent) the journal file pair at `path`. Pass
    /// `enabled = false` to construct a fully disabled journal that creates
    /// no files, per spec.md §4.5.
    #[instrument(name = "journal::open", skip_all, level = "debug")]
    pub fn open(path: &Path, enabled: bool) -> Result<Self, JournalError> {
        if !enabled {
            tracing::info!("journaling disabled, no files will be created");
            return Ok(Self { inner: None });
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).read(true).open(path)?;
        let commit_path = commit_path_for(path);
        let committed_seq = read_committed_seq(&commit_path)?;
        let max_seq = scan_max_seq(path)?;

        tracing::info!(path = %path.display(), committed_seq, max_seq, "journal opened");

        Ok(Self {
            inner: Some(Inner {
                path: path.to_path_buf(),
                commit_path,
                file: Mutex::new(file),
                next_seq: AtomicU64::new(max_seq + 1),
                committed_seq: AtomicU64::new(committed_seq),
            }),
        })
    }

    /// Replays every entry with `seq > committed_seq`, in ascending order,
    /// into `f`. No-op when journaling is disabled.
    #[instrument(name = "journal::replay", skip_all, level = "info")]
    pub fn replay<F>(&self, mut f: F) -> Result<u64, JournalError>
    where
        F: FnMut(u64, CanonicalLogRecord),
    {
        let Some(inner) = &self.inner else { return Ok(0) };
        let committed_seq = inner.committed_seq.load(Ordering::SeqCst);
        let file = File::open(&inner.path)?;
        let reader = BufReader::new(file);
        let mut replayed = 0u64;
        let mut offset = 0u64;

        for line in reader.lines() {
            let line = line?;
            let line_len = line.len() as u64 + 1;
            let start_offset = offset;
            offset += line_len;
            if line.is_empty() {
                continue;
            }
            let entry: JournalLine = serde_json::from_str(&line)
                .map_err(|source| JournalError::Malformed { offset: start_offset, source })?;
            if entry.seq <= committed_seq {
                continue;
            }
            f(entry.seq, entry.record);
            replayed += 1;
        }

        tracing::info!(replayed, committed_seq, "journal replay complete");
        Ok(replayed)
    }

    /// Appends one record, returning its assigned `seq`. Returns `0` when
    /// journaling is disabled.
    pub fn append(&self, record: &CanonicalLogRecord) -> Result<u64, JournalError> {
        let Some(inner) = &self.inner else { return Ok(0) };
        let seq = inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let line = JournalLineRef { seq, record };
        let mut encoded = serde_json::to_vec(&line).map_err(|source| JournalError::Malformed {
            offset: 0,
            source,
        })?;
        encoded.push(b'\n');

        let mut file = inner.file.lock().unwrap_or_else(|poison| poison.into_inner());
        file.write_all(&encoded)?;
        crate::metrics::JOURNAL_APPENDS_TOTAL.inc();
        Ok(seq)
    }

    /// Advances `committed_seq` to `seq` and fsyncs, per spec.md §4.5's
    /// per-commit durability policy (resolved in DESIGN.md). A no-op if
    /// `seq <= committed_seq` already, or if journaling is disabled.
    #[instrument(name = "journal::commit", skip_all, level = "debug")]
    pub fn commit(&self, seq: u64) -> Result<(), JournalError> {
        let Some(inner) = &self.inner else { return Ok(()) };
        loop {
            let current = inner.committed_seq.load(Ordering::SeqCst);
            if seq <= current {
                return Ok(());
            }
            if inner
                .committed_seq
                .compare_exchange(current, seq, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }

        {
            let file = inner.file.lock().unwrap_or_else(|poison| poison.into_inner());
            file.sync_data()?;
        }
        write_commit_marker(&inner.commit_path, seq)?;
        crate::metrics::JOURNAL_COMMITS_TOTAL.inc();
        Ok(())
    }

    pub fn committed_seq(&self) -> u64 {
        self.inner.as_ref().map(|i| i.committed_seq.load(Ordering::SeqCst)).unwrap_or(0)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Idempotent; the journal holds no background task, only an open file
    /// handle, so closing just drops it.
    pub fn close(self) {
        tracing::debug!("journal closed");
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct JournalLine {
    seq: u64,
    record: CanonicalLogRecord,
}

#[derive(serde::Serialize)]
struct JournalLineRef<'a> {
    seq: u64,
    record: &'a CanonicalLogRecord,
}

fn commit_path_for(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".commit");
    PathBuf::from(s)
}

fn read_committed_seq(commit_path: &Path) -> Result<u64, JournalError> {
    match std::fs::read_to_string(commit_path) {
        Ok(contents) => Ok(contents.trim().parse().unwrap_or(0)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err.into()),
    }
}

fn scan_max_seq(path: &Path) -> Result<u64, JournalError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };
    let mut max_seq = 0u64;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        if let Ok(entry) = serde_json::from_str::<JournalLine>(&line) {
            max_seq = max_seq.max(entry.seq);
        }
    }
    Ok(max_seq)
}

/// Writes `committed_seq` atomically via write-to-temp + rename, per spec.md §4.5.
fn write_commit_marker(commit_path: &Path, seq: u64) -> Result<(), JournalError> {
    let tmp_path = commit_path.with_extension("commit.tmp");
    {
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(format!("{seq}\n").as_bytes())?;
        tmp.sync_all()?;
    }
    std::fs::rename(&tmp_path, commit_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CanonicalLogRecord, Severity};
    use std::collections::BTreeMap;

    fn sample_record(message: &str) -> CanonicalLogRecord {
        CanonicalLogRecord {
            receive_timestamp: chrono::Utc::now(),
            origin_timestamp_nanos: 0,
            severity_label: Severity::Info,
            severity_number: 9,
            message: message.to_string(),
            raw_line: "{}".to_string(),
            attributes: BTreeMap::new(),
            app: "default".to_string(),
            service: None,
            hostname: None,
            pid: None,
            event_id: None,
            source: Some("tcp".to_string()),
        }
    }

    #[test]
    fn disabled_journal_creates_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.log");
        let journal = Journal::open(&path, false).unwrap();
        assert_eq!(journal.append(&sample_record("hi")).unwrap(), 0);
        assert!(!path.exists());
    }

    #[test]
    fn append_assigns_monotonic_seq() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.log");
        let journal = Journal::open(&path, true).unwrap();
        let seq1 = journal.append(&sample_record("a")).unwrap();
        let seq2 = journal.append(&sample_record("b")).unwrap();
        assert!(seq2 > seq1);
    }

    #[test]
    fn commit_is_monotonic_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.log");
        let journal = Journal::open(&path, true).unwrap();
        journal.append(&sample_record("a")).unwrap();
        journal.append(&sample_record("b")).unwrap();
        journal.commit(2).unwrap();
        assert_eq!(journal.committed_seq(), 2);
        journal.commit(1).unwrap();
        assert_eq!(journal.committed_seq(), 2);
    }

    #[test]
    fn replay_emits_only_uncommitted_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.log");
        {
            let journal = Journal::open(&path, true).unwrap();
            for i in 0..30 {
                journal.append(&sample_record(&format!("rec-{i}"))).unwrap();
            }
            journal.commit(22).unwrap();
        }

        let reopened = Journal::open(&path, true).unwrap();
        let mut replayed = Vec::new();
        reopened.replay(|seq, record| replayed.push((seq, record.message))).unwrap();
        assert_eq!(replayed.len(), 8);
        assert_eq!(replayed[0].0, 23);
    }

    #[test]
    fn reopen_after_commit_resumes_seq_space() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.log");
        {
            let journal = Journal::open(&path, true).unwrap();
            journal.append(&sample_record("a")).unwrap();
            journal.append(&sample_record("b")).unwrap();
            journal.commit(2).unwrap();
        }
        let reopened = Journal::open(&path, true).unwrap();
        let seq = reopened.append(&sample_record("c")).unwrap();
        assert_eq!(seq, 3);
    }
}
