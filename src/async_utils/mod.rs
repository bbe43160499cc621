//! Asynchronous utilities for use with Tokio.
//!
//! The pipeline is a single cooperative task, but it leans on three kinds of
//! blocking work: external commands (poppler, tesseract), CPU-heavy image
//! processing, and HTTP calls. The helpers here keep those from stalling the
//! runtime and give each one a wall-clock budget.

use std::{panic, time::Duration};

use anyhow::anyhow;
use tokio::time;

use crate::prelude::*;

pub mod io;

/// Report any command failures, and include any error output.
///
/// Standard output is logged at debug level, and non-empty standard error at
/// warn level.
pub fn check_for_command_failure(
    command_name: &str,
    output: &std::process::Output,
) -> Result<()> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    debug!(
        command_name = command_name,
        output = %stdout,
        "Standard output from command"
    );
    if !stderr.trim().is_empty() {
        warn!(
            command_name = command_name,
            output = %stderr.trim(),
            "Standard error from command",
        );
    }

    if output.status.success() {
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}

/// Wrapper around [`tokio::task::spawn_blocking`] that propagates panics from
/// the background task.
pub async fn spawn_blocking_propagating_panics<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => value,
        Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
        // Blocking tasks are never aborted, so this only happens during
        // runtime shutdown.
        Err(err) => panic!("blocking task was cancelled: {err}"),
    }
}

/// Run `future` with a wall-clock budget. Running out of time is reported as
/// an error naming `what`.
pub async fn with_timeout<T, Fut>(what: &str, budget: Duration, future: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match time::timeout(budget, future).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!(
            "{what} timed out after {:.1}s",
            budget.as_secs_f64()
        )),
    }
}
