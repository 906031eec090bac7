use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Offending payloads are excerpted so one bad scheme can't bloat the log.
const PAYLOAD_EXCERPT_MAX: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStage {
    Fetch,
    Clean,
    Write,
}

#[derive(Debug, Serialize)]
struct ErrorRecord<'a> {
    timestamp: DateTime<Utc>,
    scheme: &'a str,
    stage: ErrorStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    error_kind: &'a str,
    error: &'a str,
}

/// Append-only JSONL sink for ingestion failures. Logging never fails the
/// caller: a write error degrades to a console warning and the run goes on.
pub struct ErrorLogger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ErrorLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(
        &self,
        scheme: &str,
        stage: ErrorStage,
        payload: Option<&str>,
        error_kind: &str,
        error: &str,
    ) {
        let record = ErrorRecord {
            timestamp: Utc::now(),
            scheme,
            stage,
            data: payload.map(excerpt),
            error_kind,
            error,
        };
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                warn!(scheme, error = %e, "failed to serialize error record");
                return;
            }
        };

        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let appended = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = appended {
            eprintln!(
                "warning: failed to append error record to {}: {e}",
                self.path.display()
            );
        }
    }
}

fn excerpt(s: &str) -> String {
    if s.len() <= PAYLOAD_EXCERPT_MAX {
        return s.to_string();
    }
    let mut cut = PAYLOAD_EXCERPT_MAX;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = s[..cut].to_string();
    out.push('…');
    out
}
