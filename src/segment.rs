//! Random access over one day's normal tier file.
//!
//! The file is a flat sequence of CRLF-terminated absolute records. A crash
//! during an append can leave a trailing line without its terminator; such a
//! file is "corrupted" and [`SegmentFile::repair`] truncates it back to the
//! last complete line. Earlier lines are never touched.
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::codec::leading_id;
use crate::error::{IoContext, Result};

pub const CRLF: &[u8; 2] = b"\r\n";
const CHUNK: u64 = 4096;

#[derive(Debug, Clone)]
pub struct SegmentFile {
    path: PathBuf,
}

impl SegmentFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn len(&self) -> Result<u64> {
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e).at(&self.path),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn open_read(&self) -> Result<Option<File>> {
        match File::open(&self.path) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).at(&self.path),
        }
    }

    /// Id of the first record, if any complete line exists.
    pub fn first_id(&self) -> Result<Option<u64>> {
        let Some(mut file) = self.open_read()? else {
            return Ok(None);
        };
        let mut head = Vec::with_capacity(64);
        let mut chunk = [0u8; 64];
        loop {
            let n = file.read(&mut chunk).at(&self.path)?;
            if n == 0 {
                return Ok(None);
            }
            head.extend_from_slice(&chunk[..n]);
            if let Some(end) = head.iter().position(|b| *b == b' ' || *b == b'\r') {
                return Ok(leading_id(&head[..end]));
            }
        }
    }

    /// Id of the last complete line, scanning backward from the end.
    pub fn last_id(&self) -> Result<Option<u64>> {
        let Some(mut file) = self.open_read()? else {
            return Ok(None);
        };
        let len = file.metadata().at(&self.path)?.len();
        // Position just past the last CRLF, i.e. the end of the last complete line.
        let Some(end) = self.find_backward(&mut file, len)? else {
            return Ok(None);
        };
        let line_end = end.saturating_sub(CRLF.len() as u64);
        let start = self.find_backward(&mut file, line_end)?.unwrap_or(0);
        file.seek(SeekFrom::Start(start)).at(&self.path)?;
        let mut line = vec![0u8; (line_end - start) as usize];
        file.read_exact(&mut line).at(&self.path)?;
        Ok(leading_id(&line))
    }

    /// Returns the offset just after the last `\n` strictly before `before`.
    fn find_backward(&self, file: &mut File, before: u64) -> Result<Option<u64>> {
        let mut end = before;
        let mut buf = vec![0u8; CHUNK as usize];
        while end > 0 {
            let start = end.saturating_sub(CHUNK);
            let n = (end - start) as usize;
            file.seek(SeekFrom::Start(start)).at(&self.path)?;
            file.read_exact(&mut buf[..n]).at(&self.path)?;
            if let Some(i) = buf[..n].iter().rposition(|b| *b == b'\n') {
                return Ok(Some(start + i as u64 + 1));
            }
            end = start;
        }
        Ok(None)
    }

    /// True when the file is non-empty and does not end with CRLF.
    pub fn is_corrupted(&self) -> Result<bool> {
        let Some(mut file) = self.open_read()? else {
            return Ok(false);
        };
        let len = file.metadata().at(&self.path)?.len();
        if len == 0 {
            return Ok(false);
        }
        if len < CRLF.len() as u64 {
            return Ok(true);
        }
        let mut tail = [0u8; 2];
        file.seek(SeekFrom::End(-(CRLF.len() as i64))).at(&self.path)?;
        file.read_exact(&mut tail).at(&self.path)?;
        Ok(&tail != CRLF)
    }

    /// Truncates a trailing partial line. Returns whether anything was cut.
    pub fn repair(&self) -> Result<bool> {
        if !self.is_corrupted()? {
            return Ok(false);
        }
        let mut file = OpenOptions::new().read(true).write(true).open(&self.path).at(&self.path)?;
        let len = file.metadata().at(&self.path)?.len();
        let keep = self.find_backward(&mut file, len)?.unwrap_or(0);
        file.set_len(keep).at(&self.path)?;
        file.sync_all().at(&self.path)?;
        warn!(path = %self.path.display(), cut = len - keep, "truncated partial trailing line");
        Ok(true)
    }

    /// Appends already-terminated lines in one write call.
    pub fn append(&self, text: &[u8]) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).at(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path).at(&self.path)?;
        file.write_all(text).at(&self.path)?;
        file.flush().at(&self.path)?;
        debug!(path = %self.path.display(), bytes = text.len(), "appended");
        Ok(())
    }

    pub fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).at(&self.path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(content: &[u8]) -> (tempfile::TempDir, SegmentFile) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("execution20240101.log");
        fs::write(&path, content).unwrap();
        (dir, SegmentFile::new(path))
    }

    #[test]
    fn reads_first_and_last_ids() {
        let (_dir, seg) = segment(b"5 a 03 1 1\r\n6 b 03 1 1\r\n70 c 03 1 1\r\n");
        assert_eq!(seg.first_id().unwrap(), Some(5));
        assert_eq!(seg.last_id().unwrap(), Some(70));
        assert!(!seg.is_corrupted().unwrap());
    }

    #[test]
    fn last_id_spans_chunk_boundaries() {
        let mut content = Vec::new();
        for id in 1..=2_000u64 {
            content.extend_from_slice(format!("{id} 2024-01-01T00:00:00.000 03 100.5 0.01\r\n").as_bytes());
        }
        let (_dir, seg) = segment(&content);
        assert_eq!(seg.last_id().unwrap(), Some(2_000));
    }

    #[test]
    fn repair_truncates_at_last_complete_line() {
        let (_dir, seg) = segment(b"1 a 03 1 1\r\n2 b 03 1 1\r\n3 c 0");
        assert!(seg.is_corrupted().unwrap());
        assert!(seg.repair().unwrap());
        assert_eq!(fs::read(seg.path()).unwrap(), b"1 a 03 1 1\r\n2 b 03 1 1\r\n".to_vec());
        assert_eq!(seg.last_id().unwrap(), Some(2));
        assert!(!seg.repair().unwrap());
        assert_eq!(seg.len().unwrap(), 24);
    }

    #[test]
    fn single_partial_line_repairs_to_empty() {
        let (_dir, seg) = segment(b"1 a 0");
        assert!(seg.repair().unwrap());
        assert!(seg.is_empty().unwrap());
        assert_eq!(seg.last_id().unwrap(), None);
        assert_eq!(seg.first_id().unwrap(), None);
    }

    #[test]
    fn missing_file_is_empty_and_clean() {
        let dir = tempfile::tempdir().unwrap();
        let seg = SegmentFile::new(dir.path().join("none.log"));
        assert!(!seg.exists());
        assert!(!seg.is_corrupted().unwrap());
        assert_eq!(seg.last_id().unwrap(), None);
        seg.append(b"9 x 03 1 1\r\n").unwrap();
        assert_eq!(seg.first_id().unwrap(), Some(9));
    }
}
