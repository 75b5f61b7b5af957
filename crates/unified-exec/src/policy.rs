//! Failure policy and result normalization
//!
//! Adapters hand their raw process output (or the error that prevented
//! one) to a [`ResultContext`], which applies the policy uniformly:
//!
//! - `nothrow: Some(true)` never raises, except for request validation errors
//! - `nothrow: Some(false)` always raises on failure
//! - `nothrow: None` defers to `throw_on_non_zero_exit`

use crate::error::{Error, Result};
use crate::options::AdapterKind;
use crate::process::RawOutput;
use crate::result::ExecutionResult;
use crate::timeout::{self, Outcome, TIMEOUT_EXIT_CODE};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Exit code of a result produced from a captured transport error
pub const TRANSPORT_FAILURE_EXIT_CODE: i32 = -1;

/// Engine-level failure defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailurePolicy {
    /// Raise on non-zero exit when the request does not say
    pub throw_on_non_zero_exit: bool,
    /// Report timeouts as exit 124 even when the policy raises
    pub standardize_timeouts: bool,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            throw_on_non_zero_exit: true,
            standardize_timeouts: false,
        }
    }
}

impl FailurePolicy {
    /// Whether a failure raises, given the per-call override
    pub fn throws(&self, nothrow: Option<bool>) -> bool {
        match nothrow {
            Some(nothrow) => !nothrow,
            None => self.throw_on_non_zero_exit,
        }
    }
}

/// Per-execution bookkeeping used to build the final result
#[derive(Debug, Clone)]
pub struct ResultContext {
    adapter: AdapterKind,
    command: String,
    timeout: Option<Duration>,
    nothrow: Option<bool>,
    policy: FailurePolicy,
    started_at: DateTime<Utc>,
    start: Instant,
}

impl ResultContext {
    /// Start timing an execution
    pub fn new(
        adapter: AdapterKind,
        command: impl Into<String>,
        timeout: Option<Duration>,
        nothrow: Option<bool>,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            adapter,
            command: command.into(),
            timeout,
            nothrow,
            policy,
            started_at: Utc::now(),
            start: Instant::now(),
        }
    }

    /// The resolved command
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Time left before the request's bound; `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.timeout
            .map(|timeout| timeout.saturating_sub(self.start.elapsed()))
    }

    /// Run a step that precedes the command itself (pod lookup, container
    /// creation, connecting) within what is left of the request's bound
    pub async fn within<T, F>(&self, step: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match timeout::supervise(step, self.remaining()).await {
            Outcome::Completed(result) => result,
            Outcome::TimedOut => {
                debug!(
                    "{} command `{}` ran out of time before starting",
                    self.adapter, self.command
                );
                Err(Error::Timeout {
                    command: self.command.clone(),
                    timeout_ms: self.timeout_ms(),
                })
            }
        }
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout.map(|t| t.as_millis() as u64).unwrap_or(0)
    }

    fn throws(&self) -> bool {
        self.policy.throws(self.nothrow)
    }

    /// Normalize raw output into a result, or the error the policy calls for
    pub fn finish(&self, raw: RawOutput) -> Result<ExecutionResult> {
        if raw.timed_out {
            return self.finish_timed_out(raw);
        }

        let status = raw.status;
        let stdout = raw.stdout_lossy();
        let stderr = raw.stderr_lossy();
        let result = ExecutionResult {
            stdout,
            stderr,
            stdout_bytes: raw.stdout,
            exit_code: status.normalized_code(),
            signal: status.signal_name(),
            ok: status.success(),
            command: self.command.clone(),
            adapter: self.adapter,
            duration: raw.duration,
            started_at: raw.started_at,
            finished_at: raw.finished_at,
            cause: None,
        };

        if !result.ok && self.throws() {
            debug!(
                "{} command `{}` failed with exit code {}",
                self.adapter, self.command, result.exit_code
            );
            return Err(result.into_error());
        }
        Ok(result)
    }

    fn finish_timed_out(&self, raw: RawOutput) -> Result<ExecutionResult> {
        let timeout_ms = self.timeout_ms();
        if self.throws() && !self.policy.standardize_timeouts {
            return Err(Error::Timeout {
                command: self.command.clone(),
                timeout_ms,
            });
        }

        let mut stderr = raw.stderr_lossy();
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&timeout::annotation(self.adapter, timeout_ms));
        Ok(ExecutionResult {
            stdout: raw.stdout_lossy(),
            stderr,
            stdout_bytes: raw.stdout,
            exit_code: TIMEOUT_EXIT_CODE,
            signal: None,
            ok: false,
            command: self.command.clone(),
            adapter: self.adapter,
            duration: raw.duration,
            started_at: raw.started_at,
            finished_at: raw.finished_at,
            cause: None,
        })
    }

    /// Turn an error into a failed result when the policy does not raise
    ///
    /// Validation errors always propagate.
    pub fn recover(&self, err: Error) -> Result<ExecutionResult> {
        if matches!(err, Error::Timeout { .. }) {
            return self.finish_timed_out(RawOutput::expired(self.started_at, self.start.elapsed()));
        }
        if err.is_validation() || self.throws() {
            return Err(err);
        }
        if let Some(result) = err.result() {
            return Ok(result.clone());
        }
        debug!("{} execution failed, captured as result: {}", self.adapter, err);
        let finished_at = Utc::now();
        Ok(ExecutionResult {
            stdout: String::new(),
            stderr: String::new(),
            stdout_bytes: Vec::new(),
            exit_code: TRANSPORT_FAILURE_EXIT_CODE,
            signal: None,
            ok: false,
            command: self.command.clone(),
            adapter: self.adapter,
            duration: self.start.elapsed(),
            started_at: self.started_at,
            finished_at,
            cause: Some(Arc::new(err)),
        })
    }

    /// [`finish`](Self::finish) on success, [`recover`](Self::recover) on error
    pub fn conclude(&self, outcome: Result<RawOutput>) -> Result<ExecutionResult> {
        match outcome {
            Ok(raw) => self.finish(raw),
            Err(err) => self.recover(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ExitStatus;

    fn raw(code: i32, timed_out: bool) -> RawOutput {
        let now = Utc::now();
        RawOutput {
            stdout: b"partial\n".to_vec(),
            stderr: b"warn".to_vec(),
            status: ExitStatus {
                code: if timed_out { None } else { Some(code) },
                signal: if timed_out { Some(9) } else { None },
            },
            timed_out,
            started_at: now,
            finished_at: now,
            duration: Duration::from_millis(5),
        }
    }

    fn ctx(nothrow: Option<bool>, policy: FailurePolicy) -> ResultContext {
        ResultContext::new(
            AdapterKind::Docker,
            "sleep 10",
            Some(Duration::from_millis(100)),
            nothrow,
            policy,
        )
    }

    #[test]
    fn test_precedence() {
        let throwing = FailurePolicy::default();
        let lenient = FailurePolicy {
            throw_on_non_zero_exit: false,
            ..FailurePolicy::default()
        };
        assert!(throwing.throws(None));
        assert!(!lenient.throws(None));
        assert!(!throwing.throws(Some(true)));
        assert!(lenient.throws(Some(false)));
    }

    #[test]
    fn test_non_zero_exit_raises_adapter_error() {
        let err = ctx(None, FailurePolicy::default()).finish(raw(2, false)).unwrap_err();
        assert!(matches!(err, Error::Docker { .. }));
        assert_eq!(err.result().unwrap().exit_code, 2);
    }

    #[test]
    fn test_non_zero_exit_under_nothrow() {
        let result = ctx(Some(true), FailurePolicy::default())
            .finish(raw(2, false))
            .unwrap();
        assert!(!result.ok);
        assert_eq!(result.exit_code, 2);
        assert_eq!(result.stderr, "warn");
    }

    #[test]
    fn test_timeout_raises_with_command_and_bound() {
        let err = ctx(None, FailurePolicy::default()).finish(raw(0, true)).unwrap_err();
        match err {
            Error::Timeout {
                command,
                timeout_ms,
            } => {
                assert_eq!(command, "sleep 10");
                assert_eq!(timeout_ms, 100);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_timeout_under_nothrow_is_124() {
        let result = ctx(Some(true), FailurePolicy::default())
            .finish(raw(0, true))
            .unwrap();
        assert_eq!(result.exit_code, 124);
        assert!(!result.ok);
        assert_eq!(result.stdout, "partial\n");
        assert!(result.stderr.starts_with("warn\n"));
        assert!(result.stderr.contains("[docker]"));
        assert!(result.stderr.contains("100ms"));
        assert!(result.timed_out());
    }

    #[test]
    fn test_standardized_timeouts_never_raise() {
        let policy = FailurePolicy {
            throw_on_non_zero_exit: true,
            standardize_timeouts: true,
        };
        let result = ctx(Some(false), policy).finish(raw(0, true)).unwrap();
        assert_eq!(result.exit_code, 124);
    }

    #[test]
    fn test_recover_captures_transport_errors() {
        let context = ctx(Some(true), FailurePolicy::default());
        let result = context
            .recover(Error::connection("db", "Connection refused"))
            .unwrap();
        assert!(!result.ok);
        assert_eq!(result.exit_code, TRANSPORT_FAILURE_EXIT_CODE);
        assert!(result.stdout.is_empty() && result.stderr.is_empty());
        assert!(matches!(
            result.cause.as_deref(),
            Some(Error::Connection { .. })
        ));
    }

    #[smol_potat::test]
    async fn test_slow_step_consumes_the_bound() {
        let context = ctx(Some(true), FailurePolicy::default());
        let err = context
            .within(async {
                smol::Timer::after(Duration::from_secs(5)).await;
                Ok::<_, Error>(())
            })
            .await
            .unwrap_err();
        assert_eq!(context.remaining(), Some(Duration::ZERO));

        let result = context.recover(err).unwrap();
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.stderr.contains("[docker] command timed out after 100ms"));

        let err = ctx(None, FailurePolicy::default())
            .recover(Error::Timeout {
                command: "sleep 10".to_string(),
                timeout_ms: 100,
            })
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Timeout);
    }

    #[smol_potat::test]
    async fn test_fast_step_passes_through() {
        let context = ctx(None, FailurePolicy::default());
        let value = context.within(async { Ok::<_, Error>(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert!(context.remaining().unwrap() <= Duration::from_millis(100));

        let unbounded = ResultContext::new(
            AdapterKind::Local,
            "true",
            None,
            None,
            FailurePolicy::default(),
        );
        assert_eq!(unbounded.remaining(), None);
    }

    #[test]
    fn test_recover_never_swallows_validation() {
        let context = ctx(Some(true), FailurePolicy::default());
        let err = context
            .recover(Error::execution(AdapterKind::Docker, "no container"))
            .unwrap_err();
        assert!(err.is_validation());
    }
}
