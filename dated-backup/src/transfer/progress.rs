//! Transfer accounting for copies and uploads.

use serde::Serialize;
use std::time::{Duration, Instant};

/// Totals for one tree transfer (local copy or remote upload)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferStats {
    pub directories: usize,
    pub files: usize,
    pub bytes: u64,
}

impl TransferStats {
    pub fn record_directory(&mut self) {
        self.directories += 1;
    }

    pub fn record_file(&mut self, bytes: u64) {
        self.files += 1;
        self.bytes += bytes;
    }
}

/// Measures a transfer and renders its throughput
pub struct TransferTimer {
    start_time: Instant,
}

impl TransferTimer {
    pub fn start() -> Self {
        Self { start_time: Instant::now() }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average speed in bytes/second over the whole transfer
    pub fn average_speed(&self, bytes: u64) -> u64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (bytes as f64 / elapsed) as u64
        } else {
            0
        }
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}
