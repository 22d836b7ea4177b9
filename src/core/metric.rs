// src/core/metric.rs

//! Per-node statistics published through INFO entries and surfaced in the
//! `resql_info` table. The blob is a flat sequence of length-prefixed
//! strings; the state machine stores it verbatim and the database layer
//! splits it into columns.

use crate::core::buffer::{Buf, RawBuf};
use chrono::{Local, TimeZone};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use sysinfo::System;

/// Number of stat strings in an encoded metrics blob, matching the
/// `resql_info` columns after name/connected/role/urls.
pub const METRIC_FIELDS: usize = 33;

pub struct Metric {
    dir: PathBuf,
    start: Instant,
    start_ms: u64,
    fsync_max_ns: u64,
    fsync_total_ns: u64,
    fsync_count: u64,
    ss_success: bool,
    ss_size: u64,
    ss_max_ms: u64,
    ss_total_ms: u64,
    ss_count: u64,
    recv_bytes: u64,
    send_bytes: u64,
}

fn bytes_to_size(n: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut val = n as f64;
    let mut unit = 0;
    while val >= 1024.0 && unit < UNITS.len() - 1 {
        val /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", val, UNITS[unit])
}

fn dir_free(path: &Path) -> u64 {
    use std::os::unix::ffi::OsStrExt;

    let cpath = match std::ffi::CString::new(path.as_os_str().as_bytes()) {
        Ok(p) => p,
        Err(_) => return 0,
    };

    let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut st) };
    if rc != 0 {
        return 0;
    }

    st.f_bavail as u64 * st.f_frsize
}

fn dir_used(path: &Path) -> u64 {
    std::fs::read_dir(path)
        .map(|entries| {
            entries
                .flatten()
                .filter_map(|e| e.metadata().ok())
                .map(|m| m.len())
                .sum()
        })
        .unwrap_or(0)
}

impl Metric {
    pub fn new(dir: &Path) -> Metric {
        Metric {
            dir: dir.to_path_buf(),
            start: Instant::now(),
            start_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO)
                .as_millis() as u64,
            fsync_max_ns: 0,
            fsync_total_ns: 0,
            fsync_count: 0,
            ss_success: true,
            ss_size: 0,
            ss_max_ms: 0,
            ss_total_ms: 0,
            ss_count: 0,
            recv_bytes: 0,
            send_bytes: 0,
        }
    }

    pub fn fsync(&mut self, elapsed_ns: u64) {
        self.fsync_max_ns = self.fsync_max_ns.max(elapsed_ns);
        self.fsync_total_ns += elapsed_ns;
        self.fsync_count += 1;
    }

    pub fn snapshot(&mut self, success: bool, time_ms: u64, size: u64) {
        self.ss_success = success;
        if success {
            self.ss_size = size;
            self.ss_max_ms = self.ss_max_ms.max(time_ms);
            self.ss_total_ms += time_ms;
            self.ss_count += 1;
        }
    }

    pub fn recv(&mut self, bytes: u64) {
        self.recv_bytes += bytes;
    }

    pub fn send(&mut self, bytes: u64) {
        self.send_bytes += bytes;
    }

    /// Encodes the 33 stat strings in `resql_info` column order.
    pub fn encode(&self, buf: &mut Buf) {
        let mut sys = System::new();
        sys.refresh_memory();

        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64;
        let uptime = self.start.elapsed().as_secs();

        let fmt_ms = |ms: u64| format!("{ms}");
        let fmt_date = |ms: u64| match Local.timestamp_millis_opt(ms as i64) {
            chrono::LocalResult::Single(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
            _ => String::new(),
        };

        buf.put_str(env!("CARGO_PKG_VERSION"));
        buf.put_str(""); // git branch
        buf.put_str(""); // git commit
        buf.put_str(System::host_name().unwrap_or_default().as_str());
        buf.put_str(System::cpu_arch().as_str());
        buf.put_str(&std::process::id().to_string());
        buf.put_str(&fmt_date(now_ms));
        buf.put_str(&fmt_date(self.start_ms));
        buf.put_str(&fmt_ms(self.start_ms));
        buf.put_str(&uptime.to_string());
        buf.put_str(&format!("{:.2}", uptime as f64 / 86400.0));
        buf.put_str(""); // cpu sys
        buf.put_str(""); // cpu user
        buf.put_str(&self.recv_bytes.to_string());
        buf.put_str(&self.send_bytes.to_string());
        buf.put_str(&bytes_to_size(self.recv_bytes));
        buf.put_str(&bytes_to_size(self.send_bytes));
        buf.put_str(&sys.total_memory().to_string());
        buf.put_str(&bytes_to_size(sys.total_memory()));
        buf.put_str(&sys.used_memory().to_string());
        buf.put_str(&bytes_to_size(sys.used_memory()));
        buf.put_str(&format!("{:.3}", self.fsync_max_ns as f64 / 1e6));
        buf.put_str(&format!(
            "{:.3}",
            self.fsync_total_ns as f64 / 1e6 / self.fsync_count.max(1) as f64
        ));
        buf.put_str(if self.ss_success { "true" } else { "false" });
        buf.put_str(&self.ss_size.to_string());
        buf.put_str(&bytes_to_size(self.ss_size));
        buf.put_str(&self.ss_max_ms.to_string());
        buf.put_str(&format!(
            "{:.0}",
            self.ss_total_ms as f64 / self.ss_count.max(1) as f64
        ));
        buf.put_str(&self.dir.display().to_string());
        let used = dir_used(&self.dir);
        buf.put_str(&used.to_string());
        buf.put_str(&bytes_to_size(used));
        let free = dir_free(&self.dir);
        buf.put_str(&free.to_string());
        buf.put_str(&bytes_to_size(free));
    }
}

/// Splits an encoded metrics blob back into its stat strings. Returns `None`
/// when the blob is malformed or incomplete.
pub fn decode_fields(blob: &[u8]) -> Option<Vec<String>> {
    let mut r = RawBuf::new(blob);
    let mut out = Vec::with_capacity(METRIC_FIELDS);

    for _ in 0..METRIC_FIELDS {
        out.push(r.get_string());
    }

    r.valid().then_some(out)
}

/// Free bytes available in a directory, for the disk-full recovery check.
pub fn free_space(path: &Path) -> u64 {
    dir_free(path)
}
