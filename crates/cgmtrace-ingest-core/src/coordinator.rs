use std::collections::HashSet;
use std::future::Future;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct RunState {
    inflight: HashSet<String>,
    dirty: HashSet<String>,
}

/// Coalesces concurrent parse/analysis runs of the same file.
///
/// A run requested while another is in flight is folded into a single
/// follow-up run executed by the current owner once it completes.
#[derive(Debug, Default)]
pub struct FileRunCoordinator {
    state: Mutex<RunState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome<T> {
    /// The caller ran the work, possibly several times; the last result is kept.
    Completed { result: T, runs: u32 },
    /// Another caller owns the file and will rerun on our behalf.
    Deferred,
}

impl FileRunCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the caller now owns the run for `file_id`.
    pub fn try_begin(&self, file_id: &str) -> bool {
        let mut state = self.state.lock().expect("run state mutex poisoned");
        if state.inflight.contains(file_id) {
            state.dirty.insert(file_id.to_string());
            return false;
        }
        state.inflight.insert(file_id.to_string());
        true
    }

    /// Finishes a run. Returns `true` when a rerun is owed; ownership is kept
    /// in that case.
    pub fn complete(&self, file_id: &str) -> bool {
        let mut state = self.state.lock().expect("run state mutex poisoned");
        if state.dirty.remove(file_id) {
            return true;
        }
        state.inflight.remove(file_id);
        false
    }

    /// Drops ownership of `file_id` along with any rerun owed to it.
    fn abandon(&self, file_id: &str) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.inflight.remove(file_id);
        state.dirty.remove(file_id);
    }

    pub fn is_inflight(&self, file_id: &str) -> bool {
        let state = self.state.lock().expect("run state mutex poisoned");
        state.inflight.contains(file_id)
    }

    /// Runs `work` for `file_id` unless another run is in flight, repeating it
    /// while further requests arrive during execution.
    pub async fn run<T, F, Fut>(&self, file_id: &str, mut work: F) -> RunOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.try_begin(file_id) {
            return RunOutcome::Deferred;
        }

        let mut guard = RunGuard::new(self, file_id);
        let mut runs = 0u32;
        loop {
            let result = work().await;
            runs += 1;
            if !self.complete(file_id) {
                guard.mark_finished();
                return RunOutcome::Completed { result, runs };
            }
        }
    }
}

/// Releases a run's ownership when its future is dropped before finishing.
struct RunGuard<'a> {
    coordinator: &'a FileRunCoordinator,
    file_id: &'a str,
    finished: bool,
}

impl<'a> RunGuard<'a> {
    fn new(coordinator: &'a FileRunCoordinator, file_id: &'a str) -> Self {
        Self {
            coordinator,
            file_id,
            finished: false,
        }
    }

    fn mark_finished(&mut self) {
        self.finished = true;
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.coordinator.abandon(self.file_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn second_begin_marks_dirty_and_forces_rerun() {
        let coordinator = FileRunCoordinator::new();
        assert!(coordinator.try_begin("a"));
        assert!(!coordinator.try_begin("a"));
        assert!(!coordinator.try_begin("a"));

        assert!(coordinator.complete("a"));
        assert!(coordinator.is_inflight("a"));
        assert!(!coordinator.complete("a"));
        assert!(!coordinator.is_inflight("a"));
    }

    #[test]
    fn files_are_independent() {
        let coordinator = FileRunCoordinator::new();
        assert!(coordinator.try_begin("a"));
        assert!(coordinator.try_begin("b"));
        assert!(!coordinator.complete("a"));
        assert!(!coordinator.complete("b"));
    }

    #[tokio::test]
    async fn run_repeats_when_requested_mid_flight() {
        let coordinator = Arc::new(FileRunCoordinator::new());
        let calls = Arc::new(AtomicU32::new(0));

        let outcome = {
            let coordinator_inner = coordinator.clone();
            let calls = calls.clone();
            coordinator
                .run("f", move || {
                    let coordinator_inner = coordinator_inner.clone();
                    let calls = calls.clone();
                    async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst);
                        if n == 0 {
                            // A concurrent request lands while we are running.
                            assert!(!coordinator_inner.try_begin("f"));
                        }
                        n
                    }
                })
                .await
        };

        assert_eq!(outcome, RunOutcome::Completed { result: 1, runs: 2 });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!coordinator.is_inflight("f"));
    }

    #[tokio::test]
    async fn aborted_run_releases_the_file() {
        let coordinator = Arc::new(FileRunCoordinator::new());
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();

        let task = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                let mut started_tx = Some(started_tx);
                coordinator
                    .run("f", move || {
                        if let Some(tx) = started_tx.take() {
                            let _ = tx.send(());
                        }
                        async {
                            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                            1
                        }
                    })
                    .await
            })
        };

        started_rx.await.expect("run started");
        assert!(coordinator.is_inflight("f"));
        // A request while in flight leaves a rerun owed; abandoning must drop it too.
        assert!(!coordinator.try_begin("f"));

        task.abort();
        assert!(task.await.expect_err("aborted").is_cancelled());
        assert!(!coordinator.is_inflight("f"));

        let outcome = coordinator.run("f", || async { 2 }).await;
        assert_eq!(outcome, RunOutcome::Completed { result: 2, runs: 1 });
        assert!(!coordinator.is_inflight("f"));
    }

    #[tokio::test]
    async fn run_defers_when_already_inflight() {
        let coordinator = FileRunCoordinator::new();
        assert!(coordinator.try_begin("f"));
        let outcome = coordinator.run("f", || async { 1 }).await;
        assert_eq!(outcome, RunOutcome::Deferred);
        assert!(coordinator.complete("f"));
    }
}
