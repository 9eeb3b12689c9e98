use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::Result;
use crate::snapshot::{FIELD_SEPARATOR, MAX_HOPS};

/// Column group repeated once per hop slot in the persisted header.
const HOP_COLUMNS: [&str; 9] = [
    "Host", "Hop", "Loss %", "Sent", "Recv", "Best", "Avrg", "Worst", "Last",
];

/// Accumulates serialized snapshot lines in memory and drains them to one
/// file per flush epoch, appending when several flushes share an epoch.
///
/// Appends and flushes both happen on the poll thread, so the buffer never
/// sees concurrent mutation. A failed flush keeps every buffered line for the
/// next tick.
pub struct HistoryBatcher {
    dir: PathBuf,
    flush_interval: Duration,
    last_flush: Instant,
    buffer: Vec<String>,
}

impl HistoryBatcher {
    pub fn new(dir: impl Into<PathBuf>, flush_interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            flush_interval,
            last_flush: Instant::now(),
            buffer: Vec::new(),
        }
    }

    /// Queues one serialized snapshot line. Never blocks.
    pub fn append(&mut self, line: String) {
        self.buffer.push(line);
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Flushes when the interval has elapsed. Returns whether a flush ran.
    /// On failure the interval clock still advances, so the retry happens on
    /// the next epoch rather than every tick.
    pub fn flush_tick(&mut self) -> Result<bool> {
        if self.last_flush.elapsed() < self.flush_interval {
            return Ok(false);
        }
        self.last_flush = Instant::now();
        self.flush()?;
        Ok(true)
    }

    /// Drains the buffer to a fresh file named from the current UTC instant.
    /// An empty buffer writes nothing.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_at(Utc::now())
    }

    fn flush_at(&mut self, stamp: DateTime<Utc>) -> Result<()> {
        if self.buffer.is_empty() {
            debug!("history buffer empty, skipping flush");
            return Ok(());
        }

        // Already-exists is success, not an error.
        fs::create_dir_all(&self.dir)?;

        let path = self
            .dir
            .join(format!("datalist_{}.txt", stamp.format("%Y_%m_%d_%H_%M")));
        // File names have minute precision, so flushes landing in the same
        // minute share an epoch file. Append keeps the earlier lines; the
        // header is written only when the file is new.
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        if file.metadata()?.len() == 0 {
            file.write_all(Self::header().as_bytes())?;
        }
        for line in &self.buffer {
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
        }
        file.flush()?;

        // Cleared only once the write has fully succeeded.
        info!(lines = self.buffer.len(), path = %path.display(), "flushed history");
        self.buffer.clear();
        Ok(())
    }

    /// Header line: the session fields once, then the hop column group
    /// repeated for every slot.
    pub fn header() -> String {
        let sep = FIELD_SEPARATOR;
        let group = HOP_COLUMNS.join(sep.to_string().as_str());
        let mut header = format!("Date (UTC){sep}ComputerName{sep}UserName{sep}");
        for _ in 0..MAX_HOPS {
            header.push_str(&group);
            header.push(sep);
        }
        header.push('\n');
        header
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_only_file_dir(tmp: &tempfile::TempDir) -> PathBuf {
        // A regular file where the data directory should be makes
        // create_dir_all fail.
        let path = tmp.path().join("blocked");
        fs::write(&path, b"x").unwrap();
        path.join("data")
    }

    #[test]
    fn empty_buffer_writes_no_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("data");
        let mut batcher = HistoryBatcher::new(&dir, Duration::ZERO);

        batcher.flush().unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn successful_flush_writes_header_and_clears_buffer() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("data");
        let mut batcher = HistoryBatcher::new(&dir, Duration::ZERO);
        batcher.append("line-one".into());
        batcher.append("line-two".into());

        assert!(batcher.flush_tick().unwrap());
        assert_eq!(batcher.pending(), 0);

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].as_ref().unwrap().file_name();
        let name = name.to_string_lossy().into_owned();
        assert!(name.starts_with("datalist_"));
        assert!(name.ends_with(".txt"));

        let content = fs::read_to_string(entries[0].as_ref().unwrap().path()).unwrap();
        let mut lines = content.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("Date (UTC),ComputerName,UserName,"));
        assert_eq!(header.matches("Host,Hop,Loss %").count(), MAX_HOPS);
        assert_eq!(lines.next(), Some("line-one"));
        assert_eq!(lines.next(), Some("line-two"));
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn same_epoch_flushes_append_to_one_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("data");
        let mut batcher = HistoryBatcher::new(&dir, Duration::ZERO);
        let stamp = Utc::now();

        batcher.append("first-epoch".into());
        batcher.flush_at(stamp).unwrap();
        batcher.append("second-epoch".into());
        batcher.flush_at(stamp).unwrap();

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let content = fs::read_to_string(entries[0].as_ref().unwrap().path()).unwrap();
        // One header, then both flushes' lines in order.
        assert_eq!(content.matches("Date (UTC)").count(), 1);
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "first-epoch");
        assert_eq!(lines[2], "second-epoch");
    }

    #[test]
    fn failed_flush_retains_buffer() {
        let tmp = tempfile::tempdir().unwrap();
        let mut batcher = HistoryBatcher::new(read_only_file_dir(&tmp), Duration::ZERO);
        batcher.append("precious".into());

        assert!(batcher.flush().is_err());
        assert_eq!(batcher.pending(), 1);

        // The line survives for a later, healthy flush.
        let dir = tmp.path().join("data");
        batcher.dir = dir.clone();
        batcher.flush().unwrap();
        assert_eq!(batcher.pending(), 0);
        assert!(dir.exists());
    }

    #[test]
    fn flush_tick_respects_interval() {
        let tmp = tempfile::tempdir().unwrap();
        let mut batcher = HistoryBatcher::new(tmp.path().join("data"), Duration::from_secs(3600));
        batcher.append("held".into());

        assert!(!batcher.flush_tick().unwrap());
        assert_eq!(batcher.pending(), 1);
    }
}
