use bigdecimal::BigDecimal;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::error_log::{ErrorLogger, ErrorStage};
use crate::database_ops::{db::Db, nav_store::NavRow};

const DEFAULT_CHUNK_SIZE: usize = 500;

/// Writes normalized rows for one scheme. Partial failure inside a row set
/// never stops the remaining rows; the return value is always the number of
/// rows that ended in a persisted state.
pub struct NavWriter {
    db: Db,
    errors: Arc<ErrorLogger>,
    chunk_size: usize,
}

impl NavWriter {
    pub fn new(db: Db, errors: Arc<ErrorLogger>) -> Self {
        Self {
            db,
            errors,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Chunking bounds memory pressure on very long histories and gives the
    /// operator per-chunk progress; correctness is identical either way.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub async fn upsert_navs(&self, scheme_id: &str, rows: &[NavRow]) -> u64 {
        if rows.is_empty() {
            return 0;
        }

        let mut written = 0u64;
        let mut skipped = 0u64;
        let mut failed = 0u64;
        let chunks = rows.len().div_ceil(self.chunk_size);

        for (chunk_idx, chunk) in rows.chunks(self.chunk_size).enumerate() {
            for row in chunk {
                if let Err(reason) = validate_row(row) {
                    debug!(scheme = scheme_id, date = %row.date, reason, "skipping invalid row");
                    skipped += 1;
                    continue;
                }
                match self.db.upsert_nav(row).await {
                    Ok(_) => written += 1,
                    Err(e) => {
                        failed += 1;
                        warn!(scheme = scheme_id, date = %row.date, error = %e, "nav upsert failed");
                        self.errors.log(
                            scheme_id,
                            ErrorStage::Write,
                            Some(&format!("{row:?}")),
                            "db",
                            &format!("{e:#}"),
                        );
                    }
                }
            }
            if chunks > 1 {
                debug!(
                    scheme = scheme_id,
                    chunk = chunk_idx + 1,
                    chunks,
                    written,
                    "chunk written"
                );
            }
        }

        if skipped > 0 || failed > 0 {
            info!(scheme = scheme_id, written, skipped, failed, "scheme write summary");
        }
        written
    }
}

/// Last line of defense before the database: rows arriving here have been
/// cleaned already, but the writer still refuses obvious garbage.
fn validate_row(row: &NavRow) -> Result<(), &'static str> {
    if row.scheme_id.trim().is_empty() {
        return Err("empty scheme id");
    }
    if row.nav < BigDecimal::from(0) {
        return Err("negative nav");
    }
    Ok(())
}
