use std::io::{Read, Seek, SeekFrom};

use tracing::info;

/// Wraps an archive reader and logs extraction progress in 10% steps of
/// compressed bytes consumed
pub struct ProgressReader<R> {
    inner: R,
    label: String,
    total: u64,
    position: u64,
    reported_decile: u64,
}

impl<R> ProgressReader<R> {
    pub fn new(inner: R, total: u64, label: impl Into<String>) -> Self {
        Self {
            inner,
            label: label.into(),
            total,
            position: 0,
            reported_decile: 0,
        }
    }

    fn advance_to(&mut self, position: u64) {
        self.position = position;
        if self.total == 0 {
            return;
        }
        let decile = (self.position.min(self.total) * 10) / self.total;
        if decile > self.reported_decile {
            self.reported_decile = decile;
            info!("Unpacking {}: {}%", self.label, decile * 10);
        }
    }
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.advance_to(self.position + read as u64);
        Ok(read)
    }
}

impl<R: Seek> Seek for ProgressReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let position = self.inner.seek(pos)?;
        self.advance_to(position);
        Ok(position)
    }
}
