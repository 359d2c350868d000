//! Sink that writes raw frames to disk for offline inspection.

use super::sink::{FrameSink, SinkError};
use crate::capture::FrameBuffer;
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Writes each delivered frame into a directory.
///
/// Files are named `dump-<unix millis>-<W>x<H>.<ext>`, or `dump-<W>x<H>.<ext>`
/// when timestamps are disabled (each frame then overwrites the last).
#[derive(Debug)]
pub struct FrameDumper {
    dir: PathBuf,
    timestamped: bool,
    limit: Option<u64>,
    written: AtomicU64,
}

impl FrameDumper {
    /// Creates the directory if needed.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, SinkError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            timestamped: true,
            limit: None,
            written: AtomicU64::new(0),
        })
    }

    /// Drops the timestamp from file names.
    pub fn without_timestamp(mut self) -> Self {
        self.timestamped = false;
        self
    }

    /// Stops writing after `limit` frames.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Frames written so far.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    fn path_for(&self, frame: &FrameBuffer) -> PathBuf {
        let ext = frame.format().extension();
        let name = if self.timestamped {
            format!(
                "dump-{}-{}x{}.{}",
                Utc::now().timestamp_millis(),
                frame.width(),
                frame.height(),
                ext
            )
        } else {
            format!("dump-{}x{}.{}", frame.width(), frame.height(), ext)
        };
        self.dir.join(name)
    }
}

impl FrameSink for FrameDumper {
    fn on_frame_available(&self, frame: &FrameBuffer) -> Result<(), SinkError> {
        if let Some(limit) = self.limit {
            if self.written() >= limit {
                return Ok(());
            }
        }
        let path = self.path_for(frame);
        fs::write(&path, frame.data())?;
        self.written.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(path = %path.display(), sequence = frame.sequence(), "frame dumped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{PixelFormat, RawFrame};

    fn buffer(sequence: u64) -> FrameBuffer {
        FrameBuffer::detached(RawFrame::new(vec![7u8; 6], 2, 2, PixelFormat::Nv21, sequence))
    }

    #[test]
    fn test_dump_without_timestamp_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let dumper = FrameDumper::new(dir.path()).unwrap().without_timestamp();
        dumper.on_frame_available(&buffer(1)).unwrap();
        dumper.on_frame_available(&buffer(2)).unwrap();

        let path = dir.path().join("dump-2x2.NV21");
        assert_eq!(fs::read(path).unwrap(), vec![7u8; 6]);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
        assert_eq!(dumper.written(), 2);
    }

    #[test]
    fn test_dump_limit() {
        let dir = tempfile::tempdir().unwrap();
        let dumper = FrameDumper::new(dir.path().join("nested")).unwrap().with_limit(1);
        dumper.on_frame_available(&buffer(1)).unwrap();
        dumper.on_frame_available(&buffer(2)).unwrap();
        assert_eq!(dumper.written(), 1);

        let name = fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .file_name();
        let name = name.to_string_lossy();
        assert!(name.starts_with("dump-"));
        assert!(name.ends_with("-2x2.NV21"));
    }
}
