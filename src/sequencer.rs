//! Per-session FIFO execution of history-mutating work.
//!
//! Each session key owns a ticket mutex; tasks for the same key run one at a
//! time in the order they arrive, while tasks for different keys interleave
//! freely. A task's failure is returned to its own caller only and never
//! stalls the chain behind it. Entries for idle keys are removed so the map
//! stays bounded by the number of sessions with pending work.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;

/// Per-key FIFO serializer for session state mutation.
#[derive(Debug, Clone, Default)]
pub struct SessionSequencer {
    chains: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl SessionSequencer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after every previously enqueued task for `session_id` has
    /// settled, and before any later one starts.
    ///
    /// The tokio mutex is fair, so callers are admitted in the order they
    /// requested the key's lock.
    pub async fn run<T>(&self, session_id: &str, task: impl Future<Output = T>) -> T {
        let slot = {
            let mut chains = self.chains.lock().unwrap();
            Arc::clone(chains.entry(session_id.to_owned()).or_default())
        };

        let result = {
            let _turn = slot.lock().await;
            task.await
        };

        // Drop the key's entry once nothing is pending on it. A stale entry
        // left behind by a panicking task is reclaimed by the next run.
        let mut chains = self.chains.lock().unwrap();
        if let Some(current) = chains.get(session_id) {
            if Arc::ptr_eq(current, &slot) && Arc::strong_count(current) == 2 {
                chains.remove(session_id);
            }
        }
        result
    }

    /// Number of session keys with pending or running tasks.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.chains.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[tokio::test]
    async fn serializes_tasks_for_one_session() {
        let seq = SessionSequencer::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3 {
            let seq = seq.clone();
            let log = Arc::clone(&log);
            handles.push(tokio::spawn(async move {
                seq.run("alpha", async {
                    log.lock().unwrap().push(format!("start{i}"));
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    log.lock().unwrap().push(format!("end{i}"));
                })
                .await;
            }));
            // Pin down arrival order at the key's lock.
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(
            *log.lock().unwrap(),
            vec!["start0", "end0", "start1", "end1", "start2", "end2"]
        );
    }

    #[tokio::test]
    async fn distinct_sessions_interleave() {
        let seq = SessionSequencer::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        let slow = {
            let seq = seq.clone();
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                seq.run("slow", async {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    log.lock().unwrap().push("slow");
                })
                .await;
            })
        };
        tokio::task::yield_now().await;

        seq.run("fast", async {
            log.lock().unwrap().push("fast");
        })
        .await;
        slow.await.unwrap();

        // The fast key was not held up behind the slow one.
        assert_eq!(*log.lock().unwrap(), vec!["fast", "slow"]);
    }

    #[tokio::test]
    async fn failing_task_does_not_stall_the_chain() {
        let seq = SessionSequencer::new();

        let failed: Result<(), &str> = seq.run("alpha", async { Err("boom") }).await;
        assert!(failed.is_err());

        let ok: Result<u32, &str> = seq.run("alpha", async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));
    }

    #[tokio::test]
    async fn panicking_task_does_not_poison_the_key() {
        let seq = SessionSequencer::new();

        let panicked = {
            let seq = seq.clone();
            tokio::spawn(async move {
                seq.run("alpha", async { panic!("task bug") }).await;
            })
        };
        assert!(panicked.await.is_err());

        let value = seq.run("alpha", async { 42 }).await;
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn idle_entries_are_removed() {
        let seq = SessionSequencer::new();

        seq.run("alpha", async {}).await;
        seq.run("beta", async {}).await;

        assert_eq!(seq.active_sessions(), 0);
    }
}
