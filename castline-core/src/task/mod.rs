use std::collections::HashMap;
use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// A named background task with its own cancellation token.
struct CastlineTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl CastlineTask {
    /// Spawns `f` on the runtime, handing it a child of `parent`.
    fn spawn<F, Fut>(parent: &CancellationToken, f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = parent.child_token();
        let handle = tokio::spawn(f(token.clone()));
        Self { token, handle }
    }

    fn cancel(&self) {
        self.token.cancel();
    }

    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Keyed set of timers and loops owned by one actor.
///
/// Spawning under a name that is already running cancels the old task
/// first, so there is at most one health monitor, one reconnect timer,
/// and so on. Dropping the set cancels everything.
pub struct TaskSet {
    root: CancellationToken,
    tasks: HashMap<&'static str, CastlineTask>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::with_parent(&CancellationToken::new())
    }

    /// Tasks are also cancelled when `parent` is.
    pub fn with_parent(parent: &CancellationToken) -> Self {
        Self {
            root: parent.child_token(),
            tasks: HashMap::new(),
        }
    }

    /// Spawn `f` under `name`, replacing any task of the same name.
    pub fn spawn<F, Fut>(&mut self, name: &'static str, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.reap();
        let task = CastlineTask::spawn(&self.root, f);
        if let Some(old) = self.tasks.insert(name, task) {
            old.cancel();
        }
        trace!(task = name, "task spawned");
    }

    /// Cancel the task called `name`. Returns whether one was running.
    pub fn cancel(&mut self, name: &str) -> bool {
        match self.tasks.remove(name) {
            Some(task) => {
                let running = !task.is_finished();
                task.cancel();
                running
            }
            None => false,
        }
    }

    /// Cancel every task; the set stays usable.
    pub fn cancel_all(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.cancel();
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.tasks.get(name).is_some_and(|t| !t.is_finished())
    }

    /// Number of tasks not yet finished.
    pub fn len(&self) -> usize {
        self.tasks.values().filter(|t| !t.is_finished()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A token cancelled together with this set.
    pub fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// Forget tasks that already ran to completion.
    fn reap(&mut self) {
        self.tasks.retain(|_, t| !t.is_finished());
    }
}

impl Default for TaskSet {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

// ── Tests ────────────────────────────────────────────────────────
