use anyhow::Result;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::task::JoinSet;

use crate::ipc::BoxFuture;

/// Callback run after every successful (re)connection
pub type ConnectHook = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub fn connect_hook<F, Fut>(hook: F) -> ConnectHook
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(hook()))
}

#[derive(Debug, thiserror::Error)]
#[error("{} of {total} connect hooks failed: {}", .failures.len(), .failures.join("; "))]
pub struct ConnectHookError {
    pub total: usize,
    pub failures: Vec<String>,
}

#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: Arc<RwLock<Vec<ConnectHook>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, hook: ConnectHook) {
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start every hook, then wait for all of them
    pub async fn run_all(&self) -> Result<(), ConnectHookError> {
        let hooks = self
            .hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let total = hooks.len();

        let mut running = JoinSet::new();
        for hook in hooks {
            running.spawn(hook());
        }

        let mut failures = Vec::new();
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push(format!("{e:#}")),
                Err(e) => failures.push(format!("hook task failed: {e}")),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ConnectHookError { total, failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Barrier;

    #[tokio::test]
    async fn test_run_all_runs_duplicates() {
        let registry = HookRegistry::new();
        let calls = Arc::new(AtomicU32::new(0));

        let hook = {
            let calls = calls.clone();
            connect_hook(move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };
        registry.add(hook.clone());
        registry.add(hook);

        registry.run_all().await.expect("hooks succeed");
        registry.run_all().await.expect("hooks succeed");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_hooks_run_concurrently() {
        // each hook waits for the other, so sequential execution would deadlock
        let barrier = Arc::new(Barrier::new(2));
        let registry = HookRegistry::new();
        for _ in 0..2 {
            let barrier = barrier.clone();
            registry.add(connect_hook(move || {
                let barrier = barrier.clone();
                async move {
                    barrier.wait().await;
                    Ok(())
                }
            }));
        }

        tokio::time::timeout(std::time::Duration::from_secs(5), registry.run_all())
            .await
            .expect("hooks must not run one after another")
            .expect("hooks succeed");
    }

    #[tokio::test]
    async fn test_failures_are_aggregated() {
        let registry = HookRegistry::new();
        registry.add(connect_hook(|| async { Err(anyhow::anyhow!("first")) }));
        registry.add(connect_hook(|| async { Ok(()) }));
        registry.add(connect_hook(|| async { Err(anyhow::anyhow!("second")) }));

        let err = registry.run_all().await.expect_err("two hooks fail");
        assert_eq!(err.total, 3);
        assert_eq!(err.failures.len(), 2);
        assert!(err.failures.iter().any(|f| f == "first"));
        assert!(err.failures.iter().any(|f| f == "second"));
    }

    #[tokio::test]
    async fn test_empty_registry_succeeds() {
        assert!(HookRegistry::new().run_all().await.is_ok());
    }
}
