//! Racing work against a time bound

use crate::options::AdapterKind;
use futures_lite::future;
use smol::Timer;
use std::future::Future;
use std::time::Duration;

/// Exit code reported for a standardized timeout
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Marker placed in stderr of a standardized timeout result
pub const TIMEOUT_MARKER: &str = "timed out after";

/// How a supervised future ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The future finished first
    Completed(T),
    /// The bound elapsed first; the future was dropped
    TimedOut,
}

impl<T> Outcome<T> {
    /// Whether the bound elapsed
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Outcome::TimedOut)
    }
}

/// Run `work` to completion or until `bound` elapses; `None` is unbounded
pub async fn supervise<F>(work: F, bound: Option<Duration>) -> Outcome<F::Output>
where
    F: Future,
{
    match bound {
        None => Outcome::Completed(work.await),
        Some(bound) => {
            future::or(async { Outcome::Completed(work.await) }, async {
                Timer::after(bound).await;
                Outcome::TimedOut
            })
            .await
        }
    }
}

/// The stderr annotation appended to a standardized timeout result
pub fn annotation(adapter: AdapterKind, timeout_ms: u64) -> String {
    format!("[{}] command {} {}ms", adapter, TIMEOUT_MARKER, timeout_ms)
}

/// Forcibly terminate a process and everything in its process group
#[cfg(unix)]
pub(crate) fn kill_process_tree(child: &mut async_process::Child) {
    if !kill_process_group(child.id()) {
        let _ = child.kill();
    }
}

/// Forcibly terminate a process
#[cfg(not(unix))]
pub(crate) fn kill_process_tree(child: &mut async_process::Child) {
    let _ = child.kill();
}

/// SIGKILL the process group led by `pid`; false if the signal could not be sent
#[cfg(unix)]
pub(crate) fn kill_process_group(pid: u32) -> bool {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(pid as i32);
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!("killpg({}) failed: {}", pgid, e);
            false
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn kill_process_group(_pid: u32) -> bool {
    false
}
