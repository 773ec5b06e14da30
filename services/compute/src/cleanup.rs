//! Shutdown callbacks.

use std::sync::Mutex;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tracing::{debug, error, info};

type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Runs registered cleanup callbacks once, at shutdown.
///
/// Callbacks run in reverse registration order, each under the same
/// deadline. A failing or slow callback is logged and does not stop the
/// rest.
pub struct CleanupManager {
    timeout: Duration,
    callbacks: Mutex<Vec<(String, CleanupFn)>>,
}

impl CleanupManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn register<F>(&self, name: impl Into<String>, callback: F)
    where
        F: FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        debug!(name = %name, "Registered cleanup callback");
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((name, Box::new(callback)));
    }

    /// Runs every registered callback. Returns how many failed.
    pub async fn cleanup(&self) -> usize {
        let callbacks = std::mem::take(
            &mut *self.callbacks.lock().unwrap_or_else(|e| e.into_inner()),
        );

        let mut failed = 0;
        for (name, callback) in callbacks.into_iter().rev() {
            match tokio::time::timeout(self.timeout, callback()).await {
                Ok(Ok(())) => debug!(name = %name, "Cleanup finished"),
                Ok(Err(e)) => {
                    failed += 1;
                    error!(name = %name, error = %e, "Cleanup failed");
                }
                Err(_) => {
                    failed += 1;
                    error!(name = %name, timeout = ?self.timeout, "Cleanup timed out");
                }
            }
        }
        if failed == 0 {
            info!("Cleanup complete");
        }
        failed
    }
}

impl std::fmt::Debug for CleanupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .callbacks
            .lock()
            .map(|c| c.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default();
        f.debug_struct("CleanupManager")
            .field("timeout", &self.timeout)
            .field("callbacks", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_runs_in_reverse_order() {
        let manager = CleanupManager::new(Duration::from_secs(1));
        let order = Arc::new(Mutex::new(Vec::new()));

        for name in ["storage", "containers"] {
            let order = Arc::clone(&order);
            manager.register(name, move || {
                async move {
                    order.lock().unwrap().push(name);
                    anyhow::Ok(())
                }
                .boxed()
            });
        }

        assert_eq!(manager.cleanup().await, 0);
        assert_eq!(*order.lock().unwrap(), vec!["containers", "storage"]);
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_others() {
        let manager = CleanupManager::new(Duration::from_millis(50));
        let ran = Arc::new(Mutex::new(false));

        {
            let ran = Arc::clone(&ran);
            manager.register("last", move || {
                async move {
                    *ran.lock().unwrap() = true;
                    anyhow::Ok(())
                }
                .boxed()
            });
        }
        manager.register("slow", || {
            tokio::time::sleep(Duration::from_secs(5))
                .map(|_| anyhow::Ok(()))
                .boxed()
        });
        manager.register("broken", || async { Err::<(), _>(anyhow::anyhow!("boom")) }.boxed());

        assert_eq!(manager.cleanup().await, 2);
        assert!(*ran.lock().unwrap());
    }

    #[tokio::test]
    async fn test_callbacks_run_once() {
        let manager = CleanupManager::new(Duration::from_secs(1));
        manager.register("once", || async { anyhow::Ok(()) }.boxed());
        assert_eq!(manager.cleanup().await, 0);
        assert!(format!("{manager:?}").contains("callbacks: []"));
    }
}
