//! Shared status area: observation inputs in, ingest outputs back.
//!
//! A single mutex guards the whole map so a writer can make several reads
//! and writes appear atomic to everyone else. Holders must never block on a
//! ring while the lock is held.

use std::collections::BTreeMap;

use parking_lot::{Mutex, MutexGuard};

use crate::{STATUS_RECORD_SIZE, STATUS_TOTAL_SIZE};

#[derive(Default)]
pub struct StatusBuffer {
    inner: Mutex<BTreeMap<String, String>>,
}

pub struct StatusGuard<'a>(MutexGuard<'a, BTreeMap<String, String>>);

impl StatusBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the buffer. All related reads and writes of one logical
    /// update happen under a single acquisition.
    pub fn lock(&self) -> StatusGuard<'_> {
        StatusGuard(self.inner.lock())
    }
}

impl StatusGuard<'_> {
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(|v| v.parse().ok())
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.0.get(key).and_then(|v| v.parse().ok())
    }

    pub fn get_i32(&self, key: &str) -> Option<i32> {
        self.0.get(key).and_then(|v| v.parse().ok())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(|v| v.parse().ok())
    }

    pub fn put_str(&mut self, key: &str, val: &str) {
        self.0.insert(key.to_owned(), val.to_owned());
    }

    pub fn put_u64(&mut self, key: &str, val: u64) {
        self.put_str(key, &val.to_string());
    }

    pub fn put_u32(&mut self, key: &str, val: u32) {
        self.put_str(key, &val.to_string());
    }

    pub fn put_i32(&mut self, key: &str, val: i32) {
        self.put_str(key, &val.to_string());
    }

    pub fn put_f64(&mut self, key: &str, val: f64) {
        self.put_str(key, &val.to_string());
    }

    /// Read-accumulate-write, the usual pattern for the global counters
    pub fn add_u64(&mut self, key: &str, delta: u64) {
        let total = self.get_u64(key).unwrap_or(0) + delta;
        self.put_u64(key, total);
    }

    /// Write the buffer contents as fixed 80-byte records into `dst`,
    /// terminated by an END card. `dst` must be STATUS_TOTAL_SIZE bytes.
    pub fn render_into(&self, dst: &mut [u8]) {
        debug_assert_eq!(dst.len(), STATUS_TOTAL_SIZE);
        dst.fill(b' ');
        let max_records = STATUS_TOTAL_SIZE / STATUS_RECORD_SIZE - 1;
        for (i, (key, val)) in self.0.iter().take(max_records).enumerate() {
            write_record(&mut dst[i * STATUS_RECORD_SIZE..], key, val);
        }
        let n = self.0.len().min(max_records);
        write_key(&mut dst[n * STATUS_RECORD_SIZE..], "END");
    }
}

fn write_key(rec: &mut [u8], key: &str) {
    let mut padded = [b' '; 8];
    let k = key.as_bytes();
    padded[..k.len().min(8)].copy_from_slice(&k[..k.len().min(8)]);
    rec[..8].copy_from_slice(&padded);
}

fn write_record(rec: &mut [u8], key: &str, val: &str) {
    let body = if val.parse::<f64>().is_ok() {
        format!("{:<8}= {:>20}", key, val)
    } else {
        format!("{:<8}= '{}'", key, val)
    };
    let bytes = body.as_bytes();
    let n = bytes.len().min(STATUS_RECORD_SIZE);
    rec[..n].copy_from_slice(&bytes[..n]);
    rec[n..STATUS_RECORD_SIZE].fill(b' ');
}

fn record_value(rec: &[u8]) -> Option<String> {
    let body = std::str::from_utf8(&rec[10..STATUS_RECORD_SIZE]).ok()?;
    let trimmed = body.trim();
    let unquoted = trimmed
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .map(str::trim)
        .unwrap_or(trimmed);
    Some(unquoted.to_owned())
}

/// Find a record by key in a rendered header image
pub fn find_record(header: &[u8], key: &str) -> Option<String> {
    let mut want = [b' '; 8];
    write_key(&mut want, key);
    for rec in header.chunks_exact(STATUS_RECORD_SIZE) {
        if rec[..8] == want[..] {
            return record_value(rec);
        }
        if &rec[..3] == b"END" {
            break;
        }
    }
    None
}

/// Overwrite a record in a rendered header image, or append it just before
/// the END card. Finalize uses this to stamp the per-block counters on top
/// of the status snapshot.
pub fn upsert_record(header: &mut [u8], key: &str, val: &str) {
    let mut want = [b' '; 8];
    write_key(&mut want, key);
    let n_records = header.len() / STATUS_RECORD_SIZE;
    for i in 0..n_records {
        let start = i * STATUS_RECORD_SIZE;
        let is_end = &header[start..start + 3] == b"END";
        if header[start..start + 8] == want[..] || is_end {
            write_record(&mut header[start..], key, val);
            if is_end && i + 1 < n_records {
                write_key(&mut header[(i + 1) * STATUS_RECORD_SIZE..], "END");
            }
            return;
        }
    }
}
