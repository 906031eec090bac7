use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use indexmap::IndexSet;
use tokio::sync::Semaphore;
use tracing::{error, info};

use super::checkpoint::{CheckpointManager, CheckpointState, RunParams, RunStatus};
use super::cleaner::{clean_nav_history, CleanParams};
use super::error_log::{ErrorLogger, ErrorStage};
use super::fetcher::{error_kind, MfapiClient};
use super::writer::NavWriter;

/// Terminal result of one scheme's pipeline. A scheme either completed
/// (possibly with zero rows) or failed with a logged error; failed schemes
/// stay out of the checkpoint so a resumed run re-attempts them.
#[derive(Debug, Clone)]
pub struct SchemeOutcome {
    pub scheme_id: String,
    pub written: u64,
    pub error: Option<String>,
}

/// The per-scheme unit of work the coordinator dispatches. Production uses
/// [`NavPipeline`]; tests substitute fakes to drive the state machine.
#[async_trait]
pub trait SchemePipeline: Send + Sync + 'static {
    async fn process(&self, scheme_id: &str) -> SchemeOutcome;
}

/// fetch → clean → write for one scheme, end to end. Failures degrade to a
/// logged outcome; nothing here can abort the surrounding run.
pub struct NavPipeline {
    client: MfapiClient,
    writer: NavWriter,
    errors: Arc<ErrorLogger>,
    clean: CleanParams,
}

impl NavPipeline {
    pub fn new(
        client: MfapiClient,
        writer: NavWriter,
        errors: Arc<ErrorLogger>,
        clean: CleanParams,
    ) -> Self {
        Self {
            client,
            writer,
            errors,
            clean,
        }
    }
}

#[async_trait]
impl SchemePipeline for NavPipeline {
    async fn process(&self, scheme_id: &str) -> SchemeOutcome {
        let fetch = match self.client.fetch_nav_history(scheme_id).await {
            Ok(fetch) => fetch,
            Err(e) => {
                let message = format!("{e:#}");
                self.errors
                    .log(scheme_id, ErrorStage::Fetch, None, error_kind(&e), &message);
                return SchemeOutcome {
                    scheme_id: scheme_id.to_string(),
                    written: 0,
                    error: Some(message),
                };
            }
        };

        let rows = clean_nav_history(&fetch, scheme_id, &self.clean, &self.errors);
        let written = self.writer.upsert_navs(scheme_id, &rows).await;
        SchemeOutcome {
            scheme_id: scheme_id.to_string(),
            written,
            error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub max_concurrency: usize,
    pub checkpoint_every: usize,
    pub resume: bool,
    pub limit: Option<usize>,
    pub params: RunParams,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            checkpoint_every: 50,
            resume: false,
            limit: None,
            params: RunParams::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub total_schemes: usize,
    pub completed: u64,
    pub total_written: u64,
    pub total_errors: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(RunStats),
    Interrupted(RunStats),
}

/// Drives the whole run: Idle → Dispatching → Draining per batch, then
/// Completed, or Interrupted when the shutdown future fires. All mutable
/// aggregate state lives on this task; workers only return outcomes.
pub struct Coordinator<P: SchemePipeline> {
    pipeline: Arc<P>,
    checkpoints: CheckpointManager,
    config: RunConfig,
}

impl<P: SchemePipeline> Coordinator<P> {
    pub fn new(pipeline: Arc<P>, checkpoints: CheckpointManager, config: RunConfig) -> Self {
        Self {
            pipeline,
            checkpoints,
            config,
        }
    }

    pub async fn run<F>(&self, schemes: IndexSet<String>, shutdown: F) -> Result<RunOutcome>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);

        let mut processed: IndexSet<String> = IndexSet::new();
        if self.config.resume {
            if let Some(prev) = self.checkpoints.load() {
                processed.extend(prev.processed_schemes);
                println!(
                    "[ingest] resuming: {} schemes already processed",
                    processed.len()
                );
            }
        }

        let mut work: Vec<String> = schemes
            .into_iter()
            .filter(|s| !processed.contains(s))
            .collect();
        if let Some(limit) = self.config.limit {
            work.truncate(limit);
        }

        let mut stats = RunStats {
            total_schemes: work.len(),
            ..Default::default()
        };
        if work.is_empty() {
            println!("[ingest] no new schemes to process");
            return Ok(RunOutcome::Completed(stats));
        }

        let batch_size = self.config.checkpoint_every.max(1);
        let total_batches = work.len().div_ceil(batch_size);
        println!(
            "[ingest] starting ingestion of {} schemes ({} batches of up to {})",
            work.len(),
            total_batches,
            batch_size
        );

        let gate = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let start = Instant::now();

        for (batch_idx, batch) in work.chunks(batch_size).enumerate() {
            let batch_num = batch_idx + 1;
            println!(
                "[ingest] batch {batch_num}/{total_batches} ({} schemes)",
                batch.len()
            );

            let mut tasks: FuturesUnordered<tokio::task::JoinHandle<SchemeOutcome>> =
                FuturesUnordered::new();
            let mut aborts = Vec::with_capacity(batch.len());
            for scheme in batch {
                let pipeline = Arc::clone(&self.pipeline);
                let gate = Arc::clone(&gate);
                let scheme = scheme.clone();
                let handle = tokio::spawn(async move {
                    let _permit = gate.acquire_owned().await.ok();
                    pipeline.process(&scheme).await
                });
                aborts.push(handle.abort_handle());
                tasks.push(handle);
            }

            while !tasks.is_empty() {
                tokio::select! {
                    _ = &mut shutdown => {
                        println!("[ingest] interrupt received; cancelling in-flight schemes");
                        for abort in &aborts {
                            abort.abort();
                        }
                        while tasks.next().await.is_some() {}
                        self.save_checkpoint(&processed, &stats, RunStatus::Interrupted);
                        println!(
                            "[ingest] interrupted after {}/{} schemes; checkpoint preserved",
                            stats.completed, stats.total_schemes
                        );
                        return Ok(RunOutcome::Interrupted(stats));
                    }
                    joined = tasks.next() => {
                        let Some(joined) = joined else { break };
                        match joined {
                            Ok(outcome) => {
                                self.collect(outcome, &mut processed, &mut stats, start);
                            }
                            Err(e) if e.is_cancelled() => {}
                            Err(e) => {
                                stats.completed += 1;
                                stats.total_errors += 1;
                                error!(error = %e, "scheme task failed to join");
                            }
                        }
                    }
                }
            }

            self.save_checkpoint(&processed, &stats, RunStatus::Running);
            println!(
                "[ingest] batch {batch_num}/{total_batches} done. written={} errors={}",
                stats.total_written, stats.total_errors
            );
        }

        // A clean run leaves nothing to resume; with errors the checkpoint
        // stays so the operator can see and retry exactly what failed.
        if stats.total_errors == 0 {
            self.checkpoints.clear();
        }
        println!(
            "[ingest] finished: {} rows written, {} errors across {} schemes",
            stats.total_written, stats.total_errors, stats.total_schemes
        );
        Ok(RunOutcome::Completed(stats))
    }

    fn collect(
        &self,
        outcome: SchemeOutcome,
        processed: &mut IndexSet<String>,
        stats: &mut RunStats,
        start: Instant,
    ) {
        stats.completed += 1;
        match &outcome.error {
            Some(err) => {
                stats.total_errors += 1;
                println!("[ingest] [ERROR] {}: {err}", outcome.scheme_id);
            }
            None => {
                stats.total_written += outcome.written;
                processed.insert(outcome.scheme_id.clone());
                info!(scheme = %outcome.scheme_id, rows = outcome.written, "scheme complete");
            }
        }

        let total = stats.total_schemes as u64;
        let elapsed = start.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            stats.completed as f64 / elapsed
        } else {
            0.0
        };
        let remaining = total.saturating_sub(stats.completed);
        let eta_secs = if rate > 0.0 {
            (remaining as f64 / rate) as u64
        } else {
            0
        };
        let percent = if total > 0 {
            stats.completed as f64 * 100.0 / total as f64
        } else {
            100.0
        };
        println!(
            "[ingest] progress {}/{} ({percent:.1}%), ETA ~ {}",
            stats.completed,
            total,
            format_duration(eta_secs)
        );
    }

    fn save_checkpoint(&self, processed: &IndexSet<String>, stats: &RunStats, status: RunStatus) {
        let state = CheckpointState {
            timestamp: Utc::now(),
            processed_schemes: processed.iter().cloned().collect(),
            total_written: stats.total_written,
            total_errors: stats.total_errors,
            completed: stats.completed,
            status,
            args: self.config.params.clone(),
        };
        self.checkpoints.save(&state);
    }
}

pub fn format_duration(total_secs: u64) -> String {
    let h = total_secs / 3600;
    let m = (total_secs % 3600) / 60;
    let s = total_secs % 60;
    if h > 0 {
        format!("{h}h {m}m {s}s")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn scheme_set(codes: &[&str]) -> IndexSet<String> {
        codes.iter().map(|s| s.to_string()).collect()
    }

    fn manager_in(dir: &tempfile::TempDir) -> CheckpointManager {
        CheckpointManager::new(dir.path().join("ckpt.json"))
    }

    /// Tracks the high-water mark of simultaneously running pipelines.
    struct CountingPipeline {
        in_flight: AtomicUsize,
        max_seen: AtomicUsize,
    }

    #[async_trait]
    impl SchemePipeline for CountingPipeline {
        async fn process(&self, scheme_id: &str) -> SchemeOutcome {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            SchemeOutcome {
                scheme_id: scheme_id.to_string(),
                written: 1,
                error: None,
            }
        }
    }

    /// Records which schemes were processed; schemes in `failing` error out,
    /// schemes in `hanging` signal once and then never return.
    #[derive(Default)]
    struct ScriptedPipeline {
        seen: Mutex<Vec<String>>,
        failing: HashSet<String>,
        hanging: HashSet<String>,
        hang_started: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl SchemePipeline for ScriptedPipeline {
        async fn process(&self, scheme_id: &str) -> SchemeOutcome {
            if self.hanging.contains(scheme_id) {
                if let Some(notify) = &self.hang_started {
                    notify.notify_one();
                }
                std::future::pending::<()>().await;
            }
            self.seen.lock().unwrap().push(scheme_id.to_string());
            if self.failing.contains(scheme_id) {
                return SchemeOutcome {
                    scheme_id: scheme_id.to_string(),
                    written: 0,
                    error: Some("simulated failure".into()),
                };
            }
            SchemeOutcome {
                scheme_id: scheme_id.to_string(),
                written: 2,
                error: None,
            }
        }
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_the_gate() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(CountingPipeline {
            in_flight: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
        });
        let config = RunConfig {
            max_concurrency: 2,
            checkpoint_every: 50,
            ..Default::default()
        };
        let coordinator = Coordinator::new(Arc::clone(&pipeline), manager_in(&dir), config);

        let schemes = scheme_set(&["s1", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10"]);
        let outcome = coordinator
            .run(schemes, std::future::pending())
            .await
            .unwrap();

        assert!(pipeline.max_seen.load(Ordering::SeqCst) <= 2);
        match outcome {
            RunOutcome::Completed(stats) => {
                assert_eq!(stats.completed, 10);
                assert_eq!(stats.total_written, 10);
                assert_eq!(stats.total_errors, 0);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        // Clean completion clears the checkpoint.
        assert!(!dir.path().join("ckpt.json").exists());
    }

    #[tokio::test]
    async fn resume_skips_already_processed_schemes() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(&dir);
        manager.save(&CheckpointState {
            timestamp: Utc::now(),
            processed_schemes: vec!["a".into(), "b".into()],
            total_written: 10,
            total_errors: 0,
            completed: 2,
            status: RunStatus::Running,
            args: RunParams::default(),
        });

        let pipeline = Arc::new(ScriptedPipeline::default());
        let config = RunConfig {
            resume: true,
            ..Default::default()
        };
        let coordinator = Coordinator::new(Arc::clone(&pipeline), manager, config);

        let outcome = coordinator
            .run(scheme_set(&["a", "b", "c", "d"]), std::future::pending())
            .await
            .unwrap();

        let mut seen = pipeline.seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["c", "d"]);
        match outcome {
            RunOutcome::Completed(stats) => assert_eq!(stats.completed, 2),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn limit_caps_the_working_set() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(ScriptedPipeline::default());
        let config = RunConfig {
            limit: Some(2),
            ..Default::default()
        };
        let coordinator = Coordinator::new(Arc::clone(&pipeline), manager_in(&dir), config);

        coordinator
            .run(scheme_set(&["a", "b", "c", "d"]), std::future::pending())
            .await
            .unwrap();
        assert_eq!(pipeline.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_schemes_stay_out_of_the_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(ScriptedPipeline {
            failing: HashSet::from(["bad".to_string()]),
            ..Default::default()
        });
        let coordinator = Coordinator::new(
            Arc::clone(&pipeline),
            manager_in(&dir),
            RunConfig::default(),
        );

        let outcome = coordinator
            .run(scheme_set(&["good", "bad"]), std::future::pending())
            .await
            .unwrap();

        match outcome {
            RunOutcome::Completed(stats) => {
                assert_eq!(stats.total_errors, 1);
                assert_eq!(stats.total_written, 2);
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        // With errors the checkpoint is kept, and the failed scheme is
        // absent so a resumed run retries it.
        let saved = CheckpointManager::new(dir.path().join("ckpt.json"))
            .load()
            .expect("checkpoint kept after errors");
        assert!(saved.processed_schemes.contains(&"good".to_string()));
        assert!(!saved.processed_schemes.contains(&"bad".to_string()));
    }

    #[tokio::test]
    async fn interruption_preserves_only_drained_batches() {
        let dir = tempfile::tempdir().unwrap();
        let hang_started = Arc::new(Notify::new());
        let pipeline = Arc::new(ScriptedPipeline {
            hanging: HashSet::from(["slow1".to_string(), "slow2".to_string()]),
            hang_started: Some(Arc::clone(&hang_started)),
            ..Default::default()
        });
        let config = RunConfig {
            checkpoint_every: 2,
            ..Default::default()
        };
        let coordinator = Coordinator::new(Arc::clone(&pipeline), manager_in(&dir), config);

        let shutdown = {
            let started = Arc::clone(&hang_started);
            async move { started.notified().await }
        };
        let outcome = coordinator
            .run(
                scheme_set(&["a1", "a2", "slow1", "slow2", "z1", "z2"]),
                shutdown,
            )
            .await
            .unwrap();

        match outcome {
            RunOutcome::Interrupted(stats) => assert_eq!(stats.completed, 2),
            other => panic!("unexpected outcome {other:?}"),
        }

        let saved = CheckpointManager::new(dir.path().join("ckpt.json"))
            .load()
            .expect("interrupted checkpoint persisted");
        let mut processed = saved.processed_schemes.clone();
        processed.sort();
        assert_eq!(processed, vec!["a1", "a2"]);
        assert_eq!(saved.status, RunStatus::Interrupted);
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(42), "42s");
        assert_eq!(format_duration(65), "1m 5s");
        assert_eq!(format_duration(3600 + 120 + 3), "1h 2m 3s");
        assert_eq!(format_duration(0), "0s");
    }
}
