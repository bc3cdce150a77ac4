//! Resilient invocation of the extraction engine for one work unit.
//!
//! A unit moves through
//! `Pending → Dispatched → (Succeeded | Retrying → Dispatched | Failed)`.
//! The transitions live in [`RetryState`], a pure state machine with no I/O,
//! so attempt counting and tier escalation are testable on their own.
//! [`ExtractionInvoker`] drives it: probe, dispatch under a timeout, classify,
//! back off, repeat.
//!
//! ## Tier selection
//!
//! Each attempt runs on `min(probed tier, ceiling)`. The probe is consulted
//! before every dispatch, so a unit that starts on the fallback tier because
//! the device is busy does not drag later units down with it. The ceiling is
//! per unit and only ever moves down: two consecutive transient failures on
//! the accelerated tier, or one out-of-memory failure there, pin the rest of
//! the unit's attempts to the fallback tier.
//!
//! ## Backoff
//!
//! Exponential: attempt `n` (n ≥ 2) waits `backoff_ms * 2^(n-2)`.

use crate::cancel::CancelToken;
use crate::document::WorkUnit;
use crate::error::UnitError;
use crate::output::{EngineLog, UnitResult};
use crate::pipeline::engine::{EngineFailure, EngineRequest, ExtractionEngine, FailureCategory};
use crate::pipeline::probe::{ExecutionTier, ResourceProbe, ResourceSnapshot, TierThresholds};
use crate::progress::ProgressCallback;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Consecutive transient failures on the accelerated tier after which a unit
/// is pinned to the fallback tier.
pub const ACCELERATED_FAILURE_LIMIT: u32 = 2;

// ── State machine ────────────────────────────────────────────────────────

/// Lifecycle of one work unit inside the invoker. Attempts are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Pending,
    Dispatched { attempt: u32, tier: ExecutionTier },
    /// Waiting out the backoff before `attempt`.
    Retrying { attempt: u32, ceiling: ExecutionTier },
    Succeeded { attempt: u32, tier: ExecutionTier },
    Failed { attempts: u32, fatal: bool },
}

impl UnitState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitState::Succeeded { .. } | UnitState::Failed { .. })
    }
}

/// Retry bound and backoff base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first. 2 means at most three dispatches.
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before dispatching `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 2u64.saturating_pow(attempt - 2);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

/// What the driver does after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Retry { delay: Duration },
    GiveUp { fatal: bool },
}

/// Per-unit retry bookkeeping.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    state: UnitState,
    attempts: u32,
    ceiling: ExecutionTier,
    accelerated_streak: u32,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: UnitState::Pending,
            attempts: 0,
            ceiling: ExecutionTier::Accelerated,
            accelerated_streak: 0,
        }
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    /// Dispatches made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Highest tier the next attempt may use.
    pub fn ceiling(&self) -> ExecutionTier {
        self.ceiling
    }

    /// Move to `Dispatched` and return the tier this attempt runs on.
    pub fn dispatch(&mut self, probed: ExecutionTier) -> ExecutionTier {
        debug_assert!(
            matches!(self.state, UnitState::Pending | UnitState::Retrying { .. }),
            "dispatch from {:?}",
            self.state
        );
        self.attempts += 1;
        let tier = probed.min(self.ceiling);
        self.state = UnitState::Dispatched {
            attempt: self.attempts,
            tier,
        };
        tier
    }

    pub fn record_success(&mut self) {
        if let UnitState::Dispatched { attempt, tier } = self.state {
            self.state = UnitState::Succeeded { attempt, tier };
        }
    }

    /// Classify a failed attempt and decide whether to go again.
    pub fn record_failure(&mut self, category: FailureCategory) -> Transition {
        let tier = match self.state {
            UnitState::Dispatched { tier, .. } => tier,
            _ => self.ceiling,
        };

        if !category.is_retryable() {
            self.state = UnitState::Failed {
                attempts: self.attempts,
                fatal: true,
            };
            return Transition::GiveUp { fatal: true };
        }

        if tier == ExecutionTier::Accelerated {
            self.accelerated_streak += 1;
            if self.accelerated_streak >= ACCELERATED_FAILURE_LIMIT
                || category == FailureCategory::ResourceExhausted
            {
                self.ceiling = ExecutionTier::Fallback;
            }
        } else {
            self.accelerated_streak = 0;
        }

        if self.attempts >= self.policy.max_attempts() {
            self.state = UnitState::Failed {
                attempts: self.attempts,
                fatal: false,
            };
            return Transition::GiveUp { fatal: false };
        }

        let next = self.attempts + 1;
        self.state = UnitState::Retrying {
            attempt: next,
            ceiling: self.ceiling,
        };
        Transition::Retry {
            delay: self.policy.backoff(next),
        }
    }
}

// ── Invoker ──────────────────────────────────────────────────────────────

/// Runs work units through the engine with timeout, retry and tier fallback.
///
/// Shared by all concurrent unit tasks; holds no per-unit state.
pub struct ExtractionInvoker {
    engine: Arc<dyn ExtractionEngine>,
    probe: Arc<dyn ResourceProbe>,
    thresholds: TierThresholds,
    policy: RetryPolicy,
    timeout: Duration,
    progress: Option<ProgressCallback>,
}

impl ExtractionInvoker {
    pub fn new(
        engine: Arc<dyn ExtractionEngine>,
        probe: Arc<dyn ResourceProbe>,
        thresholds: TierThresholds,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            engine,
            probe,
            thresholds,
            policy,
            timeout,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Option<ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Read the probe off the async runtime; `nvidia-smi` can take a while.
    pub async fn snapshot(&self) -> ResourceSnapshot {
        let probe = Arc::clone(&self.probe);
        tokio::task::spawn_blocking(move || probe.snapshot())
            .await
            .unwrap_or_else(|e| {
                warn!("Resource probe task failed: {}", e);
                ResourceSnapshot::unavailable()
            })
    }

    pub async fn probe_tier(&self) -> ExecutionTier {
        self.snapshot().await.select_tier(self.thresholds)
    }

    /// Drive one unit to a terminal [`UnitResult`].
    ///
    /// `images` are the unit's rendered pages in order. Each attempt writes
    /// into its own directory under `scratch`. Never returns an error: every
    /// outcome, cancellation included, is recorded on the result.
    pub async fn invoke(
        &self,
        unit: &WorkUnit,
        images: &[PathBuf],
        scratch: &Path,
        cancel: &CancelToken,
    ) -> UnitResult {
        let start = Instant::now();
        let mut retry = RetryState::new(self.policy);
        let mut tier = ExecutionTier::Fallback;

        loop {
            if cancel.is_cancelled() {
                return self.cancelled(unit, &retry, tier, start);
            }

            let probed = self.probe_tier().await;
            tier = retry.dispatch(probed);
            let attempt = retry.attempts();
            if probed == ExecutionTier::Fallback && retry.ceiling() == ExecutionTier::Accelerated {
                debug!(unit = unit.index, attempt, "Accelerated tier unavailable, using fallback");
            }

            let request = EngineRequest {
                unit_index: unit.index,
                pages: unit.pages,
                images: images.to_vec(),
                tier,
                output_dir: scratch.join(format!("unit_{:04}_attempt_{}", unit.index, attempt)),
            };
            info!(
                unit = unit.index,
                attempt,
                %tier,
                pages = %unit.pages,
                "Dispatching unit to {}",
                self.engine.name()
            );
            let attempt_start = Instant::now();

            let outcome = match tokio::fs::create_dir_all(&request.output_dir).await {
                Err(e) => Some(Err(EngineFailure::new(
                    FailureCategory::SpawnFailed,
                    format!("cannot create {}: {}", request.output_dir.display(), e),
                ))),
                Ok(()) => tokio::select! {
                    _ = cancel.cancelled() => None,
                    r = tokio::time::timeout(self.timeout, self.engine.extract(&request)) => {
                        Some(r.unwrap_or_else(|_| {
                            Err(EngineFailure::new(
                                FailureCategory::Timeout,
                                format!("no result within {:.1}s", self.timeout.as_secs_f64()),
                            ))
                        }))
                    }
                },
            };

            let Some(outcome) = outcome else {
                warn!(unit = unit.index, attempt, "Cancelled while in flight");
                return self.cancelled(unit, &retry, tier, start);
            };

            let failure = match outcome {
                Ok(out) => {
                    retry.record_success();
                    info!(
                        unit = unit.index,
                        attempt,
                        %tier,
                        elapsed_ms = attempt_start.elapsed().as_millis() as u64,
                        "Unit succeeded ({} bytes)",
                        out.markdown.len()
                    );
                    return UnitResult {
                        index: unit.index,
                        pages: unit.pages,
                        markdown: out.markdown,
                        tier,
                        attempts: attempt,
                        duration_ms: start.elapsed().as_millis() as u64,
                        engine_log: Some(EngineLog {
                            stdout: out.stdout,
                            stderr: out.stderr,
                        }),
                        error: None,
                    };
                }
                Err(failure) => failure,
            };

            warn!(
                unit = unit.index,
                attempt,
                %tier,
                category = %failure.category,
                elapsed_ms = attempt_start.elapsed().as_millis() as u64,
                "Attempt failed: {}",
                failure.message
            );

            match retry.record_failure(failure.category) {
                Transition::Retry { delay } => {
                    let next = retry.attempts() + 1;
                    warn!(
                        unit = unit.index,
                        "Retry {}/{} after {}ms (ceiling {})",
                        next - 1,
                        self.policy.max_retries,
                        delay.as_millis(),
                        retry.ceiling()
                    );
                    if let Some(cb) = &self.progress {
                        cb.on_unit_retry(unit.index, next, failure.category);
                    }
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                return self.cancelled(unit, &retry, tier, start);
                            }
                            _ = sleep(delay) => {}
                        }
                    }
                }
                Transition::GiveUp { fatal } => {
                    let error = if fatal {
                        UnitError::FatalInvocation {
                            index: unit.index,
                            pages: unit.pages,
                            category: failure.category,
                            detail: failure.message,
                        }
                    } else {
                        UnitError::TransientInvocation {
                            index: unit.index,
                            pages: unit.pages,
                            category: failure.category,
                            attempts: attempt,
                            detail: failure.message,
                        }
                    };
                    error!("{}", error);
                    return UnitResult {
                        index: unit.index,
                        pages: unit.pages,
                        markdown: String::new(),
                        tier,
                        attempts: attempt,
                        duration_ms: start.elapsed().as_millis() as u64,
                        engine_log: None,
                        error: Some(error),
                    };
                }
            }
        }
    }

    fn cancelled(
        &self,
        unit: &WorkUnit,
        retry: &RetryState,
        tier: ExecutionTier,
        start: Instant,
    ) -> UnitResult {
        UnitResult {
            index: unit.index,
            pages: unit.pages,
            markdown: String::new(),
            tier,
            attempts: retry.attempts(),
            duration_ms: start.elapsed().as_millis() as u64,
            engine_log: None,
            error: Some(UnitError::Cancelled {
                index: unit.index,
                pages: unit.pages,
            }),
        }
    }
}
