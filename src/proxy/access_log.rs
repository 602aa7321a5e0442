use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use parking_lot::Mutex;
use serde::Serialize;

/// How a request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Relayed,
    Tunneled,
    Denied,
    AuthRequired,
    UpstreamFailed,
    DevtoolsProbe,
}

/// One access-log line.
#[derive(Debug, Clone, Serialize)]
pub struct AccessLogEntry<'a> {
    pub ip: &'a str,
    pub method: &'a str,
    pub host: &'a str,
    pub path: &'a str,
    pub status: u16,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub outcome: Outcome,
    pub us: u64,
}

#[derive(Serialize)]
struct Line<'a> {
    ts: String,
    #[serde(flatten)]
    entry: &'a AccessLogEntry<'a>,
}

/// Per-request access logger that writes one JSON line per request.
/// Uses `File` directly so every line is visible as soon as it is written.
pub struct AccessLogger {
    writer: Mutex<File>,
}

impl AccessLogger {
    /// Open (or create) the access log file in append mode.
    pub fn new(path: &str) -> std::io::Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            writer: Mutex::new(file),
        })
    }

    pub fn log(&self, entry: &AccessLogEntry<'_>) {
        let line = Line {
            ts: chrono::Utc::now()
                .format("%Y-%m-%dT%H:%M:%S%.3fZ")
                .to_string(),
            entry,
        };

        let Ok(json) = serde_json::to_string(&line) else {
            return;
        };

        let mut f = self.writer.lock();
        let _ = writeln!(f, "{}", json);
    }
}
