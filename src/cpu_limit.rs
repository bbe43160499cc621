//! Tools for limiting the number of concurrent CPU-bound tasks.

use std::sync::LazyLock;

use tokio::sync::Semaphore;

use crate::prelude::*;

/// One permit per core, shared by the region detectors and by `pdftocairo`.
static CPU_SEMAPHORE: LazyLock<Semaphore> =
    LazyLock::new(|| Semaphore::new(num_cpus::get().max(1)));

/// Call an async function while holding a permit from the CPU semaphore.
///
/// Detectors for a page run in parallel on the blocking pool, and each one
/// wants a full core. External rasterization wants at least one as well.
#[instrument(level = "trace", skip_all)]
pub async fn with_cpu_semaphore<Func, Fut, R>(f: Func) -> Result<R>
where
    Func: FnOnce() -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let permit = CPU_SEMAPHORE
        .acquire()
        .await
        .context("Could not acquire CPU permit")?;
    let result = f().await;
    drop(permit);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permit_is_released_after_error() {
        let before = CPU_SEMAPHORE.available_permits();
        let result: Result<()> = with_cpu_semaphore(|| async { Err(anyhow!("nope")) }).await;
        assert!(result.is_err());
        assert_eq!(CPU_SEMAPHORE.available_permits(), before);
    }
}
