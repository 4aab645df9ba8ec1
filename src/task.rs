//! Named subtask bookkeeping for the experiment runtime.
//!
//! Every subtask is spawned through a [`TaskSet`], which funnels each
//! completion (first error, clean return or panic) into one stream the
//! orchestrator consumes. A panic inside a subtask is converted into an
//! error at this boundary.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::{anyhow, Error, Result};
use tokio::sync::mpsc;
use tracing::{error, warn};

struct Completion {
    name: &'static str,
    error: Option<Error>,
}

/// A set of named running subtasks.
pub struct TaskSet {
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
    pending: HashSet<&'static str>,
    finished: HashMap<&'static str, Option<Error>>,
}

impl TaskSet {
    pub fn new() -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        Self {
            completion_tx,
            completion_rx,
            pending: HashSet::new(),
            finished: HashMap::new(),
        }
    }

    /// Spawns a named subtask. Its result is retrieved through one of the
    /// `wait_*` methods.
    pub fn spawn<F>(&mut self, name: &'static str, fut: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let tx = self.completion_tx.clone();
        self.pending.insert(name);

        tokio::spawn(async move {
            // The inner spawn isolates panics: the JoinError carries them
            // back here instead of unwinding through the runtime.
            let error = match tokio::spawn(fut).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(join) if join.is_panic() => Some(anyhow!("subtask panicked: {join}")),
                Err(join) => Some(anyhow!("subtask aborted: {join}")),
            };
            let _ = tx.send(Completion { name, error });
        });
    }

    /// Names of subtasks that have not completed yet.
    pub fn pending(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.pending.iter().copied()
    }

    fn record(&mut self, completion: Completion) {
        self.pending.remove(completion.name);
        self.finished.insert(completion.name, completion.error);
    }

    /// Waits until any subtask in `names` completes, returning its name and
    /// error. Completions of other subtasks are retained for later waits.
    pub async fn wait_any(&mut self, names: &[&'static str]) -> (&'static str, Option<Error>) {
        for &name in names {
            if self.finished.contains_key(name) {
                return (name, self.finished.get_mut(name).and_then(Option::take));
            }
        }

        loop {
            let Some(completion) = self.completion_rx.recv().await else {
                unreachable!("completion channel never closes: TaskSet holds a sender");
            };
            let name = completion.name;
            self.record(completion);
            if names.contains(&name) {
                return (name, self.finished.get_mut(name).and_then(Option::take));
            }
        }
    }

    /// Waits for one specific subtask. Returns immediately when it already
    /// completed; the error can only be taken once.
    pub async fn wait_for(&mut self, name: &'static str) -> Option<Error> {
        self.wait_any(&[name]).await.1
    }

    /// Waits for every remaining subtask, logging the ones that keep
    /// running past exponentially growing thresholds.
    pub async fn wait_all(&mut self, initial_delay: Duration) {
        const MAX_DELAY: Duration = Duration::from_secs(10);

        let mut delay = initial_delay.max(Duration::from_millis(1));
        let mut total = Duration::ZERO;

        while !self.pending.is_empty() {
            tokio::select! {
                completion = self.completion_rx.recv() => {
                    let Some(completion) = completion else {
                        unreachable!("completion channel never closes: TaskSet holds a sender");
                    };
                    if let Some(err) = &completion.error {
                        error!(task = completion.name, error = %err,
                               "task terminated with error");
                    }
                    self.record(completion);
                }
                _ = tokio::time::sleep(delay) => {
                    total += delay;
                    for name in &self.pending {
                        warn!(task = %name, after = ?total, "task still running");
                    }
                    delay = (delay * 2).min(MAX_DELAY);
                }
            }
        }
    }
}

impl Default for TaskSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    #[tokio::test]
    async fn test_wait_any_returns_first_completion() {
        let mut tasks = TaskSet::new();
        tasks.spawn("slow", async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });
        tasks.spawn("fast", async { bail!("boom") });

        let (name, err) = tasks.wait_any(&["slow", "fast"]).await;
        assert_eq!(name, "fast");
        assert_eq!(err.expect("error").to_string(), "boom");
    }

    #[tokio::test]
    async fn test_wait_for_after_wait_any_consumed_it() {
        let mut tasks = TaskSet::new();
        tasks.spawn("only", async { Ok(()) });

        let (name, err) = tasks.wait_any(&["only"]).await;
        assert_eq!(name, "only");
        assert!(err.is_none());

        // A second wait sees the already-recorded completion.
        assert!(tasks.wait_for("only").await.is_none());
    }

    #[tokio::test]
    async fn test_panic_is_converted_to_error() {
        let mut tasks = TaskSet::new();
        tasks.spawn("panicky", async { panic!("unexpected") });

        let err = tasks.wait_for("panicky").await.expect("error");
        assert!(err.to_string().contains("panicked"), "{err}");
    }

    #[tokio::test]
    async fn test_wait_all_drains_everything() {
        let mut tasks = TaskSet::new();
        tasks.spawn("a", async { Ok(()) });
        tasks.spawn("b", async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            bail!("late failure")
        });

        tasks.wait_all(Duration::from_millis(5)).await;
        assert_eq!(tasks.pending().count(), 0);
    }
}
