use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

type Calls<T> = Arc<Mutex<HashMap<String, watch::Receiver<Option<T>>>>>;

/// Collapses concurrent calls with the same key into one execution.
pub struct Group<T> {
    calls: Calls<T>,
}

impl<T: Clone + Send + Sync + 'static> Default for Group<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Group<T> {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns `None` only if the task running the work died before producing a value.
    pub async fn do_call<F, Fut>(&self, key: String, f: F) -> Option<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut rx = {
            let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
            match calls.get(&key) {
                Some(rx) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    calls.insert(key.clone(), rx.clone());
                    let done = Done {
                        calls: Arc::clone(&self.calls),
                        key,
                    };
                    tokio::spawn(async move {
                        let val = f().await;
                        drop(done);
                        let _ = tx.send(Some(val));
                    });
                    rx
                }
            }
        };

        let val = rx.wait_for(Option::is_some).await.ok()?;
        val.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

struct Done<T> {
    calls: Calls<T>,
    key: String,
}

impl<T> Drop for Done<T> {
    fn drop(&mut self) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}
