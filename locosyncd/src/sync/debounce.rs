use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

type Pending = Arc<Mutex<HashMap<String, (u64, JoinHandle<()>)>>>;

/// Runs the last job submitted under a key once the key has been quiet for
/// `delay`. Resubmitting cancels the job that has not fired yet.
#[derive(Debug, Clone)]
pub struct Debouncer {
    delay: Duration,
    pending: Pending,
    generation: Arc<AtomicU64>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn submit<F>(&self, key: impl Into<String>, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let pending = Arc::clone(&self.pending);
        let delay = self.delay;
        let own_key = key.clone();

        // Held across spawn so the timer cannot fire before it is registered.
        let mut map = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut map = pending.lock().unwrap_or_else(PoisonError::into_inner);
                match map.get(&own_key) {
                    Some((current, _)) if *current == generation => {
                        map.remove(&own_key);
                    }
                    _ => return,
                }
            }
            job.await;
        });
        if let Some((_, previous)) = map.insert(key, (generation, handle)) {
            previous.abort();
        }
    }

    pub fn cancel(&self, key: &str) -> bool {
        let removed = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        match removed {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn resubmitting_coalesces_into_last_job() {
        let debouncer = Debouncer::new(Duration::from_millis(40));
        let runs = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(AtomicUsize::new(0));
        for value in 1..=5 {
            let runs = Arc::clone(&runs);
            let last = Arc::clone(&last);
            debouncer.submit("drive", async move {
                runs.fetch_add(1, Ordering::SeqCst);
                last.store(value, Ordering::SeqCst);
            });
        }
        assert!(debouncer.is_pending("drive"));
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(last.load(Ordering::SeqCst), 5);
        assert!(!debouncer.is_pending("drive"));
    }

    #[tokio::test]
    async fn keys_are_independent_and_cancellable() {
        let debouncer = Debouncer::new(Duration::from_millis(30));
        let runs = Arc::new(AtomicUsize::new(0));
        for key in ["a", "b"] {
            let runs = Arc::clone(&runs);
            debouncer.submit(key, async move {
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(debouncer.cancel("a"));
        assert!(!debouncer.cancel("missing"));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
