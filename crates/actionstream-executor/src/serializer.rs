//! Per-sandbox mutual exclusion for interpreter execution.

use std::{future::Future, sync::Arc};

use actionstream_core::SandboxId;
use dashmap::DashMap;
use tokio::sync::Mutex;

/// Registry of one lock per sandbox, created on first use.
///
/// Waiters on the same sandbox are served in arrival order; there is no
/// timeout. Different sandboxes never contend.
#[derive(Default)]
pub struct ExecutionSerializer {
    locks: DashMap<SandboxId, Arc<Mutex<()>>>,
}

impl ExecutionSerializer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for `sandbox_id`, inserting it if absent.
    #[must_use]
    pub fn lock_for(&self, sandbox_id: &SandboxId) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(sandbox_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Run `work` while holding the sandbox's lock.
    pub async fn run_exclusive<F, T>(&self, sandbox_id: &SandboxId, work: F) -> T
    where
        F: Future<Output = T>,
    {
        let lock = self.lock_for(sandbox_id);
        let _guard = lock.lock().await;
        tracing::trace!(%sandbox_id, "Acquired execution lock");
        work.await
    }

    /// Number of sandboxes that have a lock.
    #[must_use]
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    async fn timed(serializer: Arc<ExecutionSerializer>, sandbox: &str) -> (Instant, Instant) {
        serializer
            .run_exclusive(&sandbox.to_string(), async {
                let start = Instant::now();
                tokio::time::sleep(Duration::from_millis(50)).await;
                (start, Instant::now())
            })
            .await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_same_sandbox_never_overlaps() {
        let serializer = Arc::new(ExecutionSerializer::new());
        let (a, b) = tokio::join!(
            timed(Arc::clone(&serializer), "s1"),
            timed(Arc::clone(&serializer), "s1")
        );
        let (first, second) = if a.0 <= b.0 { (a, b) } else { (b, a) };
        assert!(first.1 <= second.0, "intervals overlap");
        assert_eq!(serializer.lock_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_different_sandboxes_overlap() {
        let serializer = Arc::new(ExecutionSerializer::new());
        let (a, b) = tokio::join!(
            timed(Arc::clone(&serializer), "s1"),
            timed(Arc::clone(&serializer), "s2")
        );
        assert!(a.0 < b.1 && b.0 < a.1, "expected overlapping intervals");
        assert_eq!(serializer.lock_count(), 2);
    }

    #[tokio::test]
    async fn test_waiters_served_in_arrival_order() {
        let serializer = Arc::new(ExecutionSerializer::new());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sandbox = "s1".to_string();

        let lock = serializer.lock_for(&sandbox);
        let held = lock.lock().await;
        let mut handles = Vec::new();
        for n in 0..4 {
            let serializer = Arc::clone(&serializer);
            let order = Arc::clone(&order);
            let sandbox = sandbox.clone();
            handles.push(tokio::spawn(async move {
                serializer
                    .run_exclusive(&sandbox, async { order.lock().unwrap().push(n) })
                    .await;
            }));
            // let each waiter enqueue before the next one arrives
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), [0, 1, 2, 3]);
    }
}
