//! Sandbox Runner
//!
//! Runs untrusted verification payloads in an isolated blocking worker
//! with panic containment and a hard wall-clock timeout. A worker that
//! times out is abandoned, never reused; the next call always gets a
//! fresh context. Faults inside the worker terminate only the worker.

use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CoreError, CoreResult};
use crate::types::{StoreSnapshot, Verdict, VerifyCheck};

use super::program::evaluate_checks;

/// One verification request: checks plus the read-only snapshot they may
/// inspect. The snapshot is moved into the worker; the live store is
/// unreachable from inside.
pub struct VerificationJob {
    pub checks: Vec<VerifyCheck>,
    pub snapshot: StoreSnapshot,
    pub timeout_ms: Option<u64>,
}

/// Per-instance sandbox counters.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxMetrics {
    pub runs: u64,
    pub faults_contained: u64,
    pub workers_replaced: u64,
}

pub struct SandboxRunner {
    default_timeout_ms: u64,
    metrics: Mutex<SandboxMetrics>,
}

impl SandboxRunner {
    pub fn new(default_timeout_ms: u64) -> Self {
        Self {
            default_timeout_ms,
            metrics: Mutex::new(SandboxMetrics::default()),
        }
    }

    pub fn metrics(&self) -> SandboxMetrics {
        *self.metrics.lock().expect("sandbox metrics lock")
    }

    /// Verify a job. Failed checks and contained faults come back as a
    /// failed [`Verdict`]; only a wall-clock overrun is an `Err`
    /// (`Timeout`), after which the worker has been discarded.
    pub async fn verify(&self, job: VerificationJob) -> CoreResult<Verdict> {
        let timeout_ms = job.timeout_ms.unwrap_or(self.default_timeout_ms);
        let VerificationJob {
            checks, snapshot, ..
        } = job;
        self.run_isolated(timeout_ms, move || evaluate_checks(&checks, &snapshot))
            .await
    }

    /// Run `work` in a fresh isolated worker under `timeout_ms`.
    async fn run_isolated<F>(&self, timeout_ms: u64, work: F) -> CoreResult<Verdict>
    where
        F: FnOnce() -> Verdict + Send + 'static,
    {
        {
            let mut metrics = self.metrics.lock().expect("sandbox metrics lock");
            metrics.runs += 1;
        }

        let handle = tokio::task::spawn_blocking(move || {
            std::panic::catch_unwind(AssertUnwindSafe(work))
        });

        match tokio::time::timeout(Duration::from_millis(timeout_ms), handle).await {
            // Worker exceeded its bound. Dropping the handle abandons the
            // worker; it is never handed another job.
            Err(_) => {
                let mut metrics = self.metrics.lock().expect("sandbox metrics lock");
                metrics.workers_replaced += 1;
                warn!(timeout_ms, "sandbox worker timed out, replacing context");
                Err(CoreError::Timeout {
                    reason: "verification exceeded wall-clock bound".to_string(),
                    timeout_ms,
                })
            }
            // Worker finished but the payload panicked: contained.
            Ok(Ok(Err(panic))) => {
                let mut metrics = self.metrics.lock().expect("sandbox metrics lock");
                metrics.faults_contained += 1;
                let detail = panic
                    .downcast_ref::<String>()
                    .cloned()
                    .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                    .unwrap_or_else(|| "payload fault".to_string());
                Ok(Verdict {
                    success: false,
                    results: Vec::new(),
                    output: Vec::new(),
                    errors: vec![format!("verification payload faulted: {detail}")],
                })
            }
            // The worker task itself died (cancelled or panicked past the
            // containment boundary). Still isolated from the caller.
            Ok(Err(join_err)) => {
                let mut metrics = self.metrics.lock().expect("sandbox metrics lock");
                metrics.faults_contained += 1;
                Ok(Verdict {
                    success: false,
                    results: Vec::new(),
                    output: Vec::new(),
                    errors: vec![format!("sandbox worker lost: {join_err}")],
                })
            }
            Ok(Ok(Ok(verdict))) => Ok(verdict),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ArtifactKind;

    fn snapshot_with(path: &str, content: &str) -> StoreSnapshot {
        let mut snapshot = StoreSnapshot::default();
        snapshot.set(path, content.as_bytes().to_vec(), ArtifactKind::Text);
        snapshot
    }

    #[tokio::test]
    async fn test_verify_passing_checks() {
        let runner = SandboxRunner::new(1_000);
        let verdict = runner
            .verify(VerificationJob {
                checks: vec![VerifyCheck::Equals {
                    path: "/a.txt".to_string(),
                    expected: "v1".to_string(),
                }],
                snapshot: snapshot_with("/a.txt", "v1"),
                timeout_ms: None,
            })
            .await
            .unwrap();
        assert!(verdict.success);
    }

    #[tokio::test]
    async fn test_verify_failing_checks() {
        let runner = SandboxRunner::new(1_000);
        let verdict = runner
            .verify(VerificationJob {
                checks: vec![VerifyCheck::Exists {
                    path: "/missing".to_string(),
                }],
                snapshot: StoreSnapshot::default(),
                timeout_ms: None,
            })
            .await
            .unwrap();
        assert!(!verdict.success);
    }

    #[tokio::test]
    async fn test_panic_is_contained_and_context_recovers() {
        let runner = SandboxRunner::new(1_000);

        let verdict = runner
            .run_isolated(1_000, || panic!("payload blew up"))
            .await
            .unwrap();
        assert!(!verdict.success);
        assert!(verdict.errors[0].contains("payload blew up"));

        // The fault never poisons the next call.
        let verdict = runner
            .verify(VerificationJob {
                checks: vec![VerifyCheck::Equals {
                    path: "/a.txt".to_string(),
                    expected: "ok".to_string(),
                }],
                snapshot: snapshot_with("/a.txt", "ok"),
                timeout_ms: None,
            })
            .await
            .unwrap();
        assert!(verdict.success);
        assert_eq!(runner.metrics().faults_contained, 1);
    }

    #[tokio::test]
    async fn test_timeout_replaces_worker_and_next_call_succeeds() {
        let runner = SandboxRunner::new(10_000);

        let result = runner
            .run_isolated(50, || loop {
                std::thread::sleep(Duration::from_millis(20));
            })
            .await;
        match result {
            Err(CoreError::Timeout { timeout_ms, .. }) => assert_eq!(timeout_ms, 50),
            other => panic!("expected Timeout, got {other:?}"),
        }
        assert_eq!(runner.metrics().workers_replaced, 1);

        // A fresh context serves the next verification.
        let verdict = runner
            .verify(VerificationJob {
                checks: vec![VerifyCheck::Equals {
                    path: "/a.txt".to_string(),
                    expected: "fresh".to_string(),
                }],
                snapshot: snapshot_with("/a.txt", "fresh"),
                timeout_ms: Some(1_000),
            })
            .await
            .unwrap();
        assert!(verdict.success);
    }
}
