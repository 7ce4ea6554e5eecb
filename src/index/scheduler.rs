//! Debounced refresh scheduling for the sorted index.
//!
//! Per namespace the scheduler remembers when the last rebuild started, when
//! the last refresh was requested and whether a deferred rebuild is already
//! queued:
//!
//! - idle, or the last rebuild started at least one window ago: rebuild now
//! - inside the window with nothing queued: queue one deferred rebuild at the
//!   end of the window
//! - inside the window with a deferred rebuild queued: coalesce
//!
//! When a deferred rebuild fires it only runs if a request arrived after the
//! last rebuild started. A burst of writes therefore costs at most two full
//! rebuilds per window. All timers live in a single background task; the
//! table mutex is never held across a store call.

use crate::error::ContentResult;
use crate::index::SortIndexMaintainer;
use crate::storage::Namespace;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Outcome of a refresh request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshDecision {
    /// Rebuild immediately.
    RunNow,
    /// A rebuild is queued for the given instant.
    Deferred(Instant),
    /// Already covered by a queued rebuild.
    Coalesced,
}

#[derive(Clone, Copy, Debug, Default)]
struct RefreshState {
    last_run: Option<Instant>,
    last_request: Option<Instant>,
    deadline: Option<Instant>,
}

/// Per-namespace debounce bookkeeping.
#[derive(Debug)]
pub struct DebounceTable {
    window: Duration,
    states: HashMap<String, RefreshState>,
}

impl DebounceTable {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            states: HashMap::new(),
        }
    }

    /// Records a refresh request made at `now`.
    pub fn request(&mut self, namespace: &str, now: Instant) -> RefreshDecision {
        let window = self.window;
        let state = self.states.entry(namespace.to_string()).or_default();
        state.last_request = Some(now);

        match state.last_run {
            Some(last) if now < last + window => match state.deadline {
                Some(_) => RefreshDecision::Coalesced,
                None => {
                    let deadline = last + window;
                    state.deadline = Some(deadline);
                    RefreshDecision::Deferred(deadline)
                }
            },
            _ => {
                state.last_run = Some(now);
                RefreshDecision::RunNow
            }
        }
    }

    /// Called when a deferred rebuild comes due. Returns whether it should run.
    pub fn fire(&mut self, namespace: &str, now: Instant) -> bool {
        let Some(state) = self.states.get_mut(namespace) else {
            return false;
        };
        state.deadline = None;

        let stale = match (state.last_request, state.last_run) {
            (Some(request), Some(run)) => request > run,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if stale {
            state.last_run = Some(now);
        }
        stale
    }

    /// Records a rebuild that bypassed the debounce.
    pub fn mark_run(&mut self, namespace: &str, now: Instant) {
        let state = self.states.entry(namespace.to_string()).or_default();
        state.last_run = Some(now);
    }
}

enum Command {
    Rebuild(String),
    Defer { namespace: String, deadline: Instant },
}

/// Front end used by the repository to request sorted-index refreshes.
pub struct RefreshScheduler {
    table: Arc<Mutex<DebounceTable>>,
    maintainer: Arc<SortIndexMaintainer>,
    tx: mpsc::UnboundedSender<Command>,
}

impl RefreshScheduler {
    /// Creates the scheduler and spawns its worker on `runtime`.
    pub fn spawn(
        maintainer: Arc<SortIndexMaintainer>,
        window: Duration,
        runtime: &Handle,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let table = Arc::new(Mutex::new(DebounceTable::new(window)));
        let (tx, rx) = mpsc::unbounded_channel();

        let worker = RefreshWorker {
            table: table.clone(),
            maintainer: maintainer.clone(),
            rx,
            timers: BinaryHeap::new(),
        };
        let handle = runtime.spawn(worker.run());

        (
            Arc::new(Self {
                table,
                maintainer,
                tx,
            }),
            handle,
        )
    }

    /// Asks for an eventual rebuild of the sorted index of `namespace`.
    pub fn request_refresh(&self, namespace: &Namespace) {
        if !namespace.is_primary() {
            return;
        }

        let decision = self.table.lock().request(namespace.kind(), Instant::now());
        debug!(namespace = %namespace, ?decision, "Sort refresh requested");

        let command = match decision {
            RefreshDecision::RunNow => Command::Rebuild(namespace.kind().to_string()),
            RefreshDecision::Deferred(deadline) => Command::Defer {
                namespace: namespace.kind().to_string(),
                deadline,
            },
            RefreshDecision::Coalesced => return,
        };
        if self.tx.send(command).is_err() {
            warn!(namespace = %namespace, "Refresh worker is gone, sort request dropped");
        }
    }

    /// Rebuilds the sorted index of `namespace` on the calling thread.
    pub fn refresh_now(&self, namespace: &Namespace) -> ContentResult<usize> {
        if !namespace.is_primary() {
            return Ok(0);
        }
        self.table.lock().mark_run(namespace.kind(), Instant::now());
        self.maintainer.rebuild(namespace)
    }
}

struct RefreshWorker {
    table: Arc<Mutex<DebounceTable>>,
    maintainer: Arc<SortIndexMaintainer>,
    rx: mpsc::UnboundedReceiver<Command>,
    timers: BinaryHeap<Reverse<(Instant, String)>>,
}

impl RefreshWorker {
    async fn run(mut self) {
        debug!("Sort refresh worker started");

        loop {
            let next = self.timers.peek().map(|Reverse((deadline, _))| *deadline);
            let sleep_until = tokio::time::Instant::from_std(next.unwrap_or_else(Instant::now));

            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(Command::Rebuild(namespace)) => self.rebuild(namespace).await,
                    Some(Command::Defer { namespace, deadline }) => {
                        self.timers.push(Reverse((deadline, namespace)));
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(sleep_until), if next.is_some() => {
                    self.fire_due().await;
                }
            }
        }

        debug!("Sort refresh worker stopped");
    }

    async fn fire_due(&mut self) {
        let now = Instant::now();
        while let Some(Reverse((deadline, _))) = self.timers.peek() {
            if *deadline > now {
                break;
            }
            let Some(Reverse((_, namespace))) = self.timers.pop() else {
                break;
            };

            let run = self.table.lock().fire(&namespace, Instant::now());
            if run {
                self.rebuild(namespace).await;
            } else {
                debug!(namespace = %namespace, "Deferred sort skipped, index already fresh");
            }
        }
    }

    async fn rebuild(&self, kind: String) {
        let maintainer = self.maintainer.clone();
        let namespace = Namespace::primary(&kind);
        let result = tokio::task::spawn_blocking(move || maintainer.rebuild(&namespace)).await;

        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(namespace = %kind, "Sort index rebuild failed: {}", e),
            Err(e) => warn!(namespace = %kind, "Sort index rebuild task panicked: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{NamespaceDescriptor, TypeRegistry};
    use crate::storage::{Backend, BackendConfig};
    use tempfile::TempDir;

    const WINDOW: Duration = Duration::from_millis(100);

    #[test]
    fn test_first_request_runs_now() {
        let mut table = DebounceTable::new(WINDOW);
        let t0 = Instant::now();
        assert_eq!(table.request("Post", t0), RefreshDecision::RunNow);
        assert_eq!(table.request("Page", t0), RefreshDecision::RunNow);
    }

    #[test]
    fn test_burst_defers_once() {
        let mut table = DebounceTable::new(WINDOW);
        let t0 = Instant::now();
        assert_eq!(table.request("Post", t0), RefreshDecision::RunNow);
        assert_eq!(
            table.request("Post", t0 + Duration::from_millis(10)),
            RefreshDecision::Deferred(t0 + WINDOW)
        );
        for i in 0..50 {
            assert_eq!(
                table.request("Post", t0 + Duration::from_millis(11 + i)),
                RefreshDecision::Coalesced
            );
        }

        assert!(table.fire("Post", t0 + WINDOW));
        // The window restarts at the deferred rebuild
        assert_eq!(
            table.request("Post", t0 + WINDOW + Duration::from_millis(1)),
            RefreshDecision::Deferred(t0 + WINDOW + WINDOW)
        );
    }

    #[test]
    fn test_fire_skips_when_fresh_rebuild_happened() {
        let mut table = DebounceTable::new(WINDOW);
        let t0 = Instant::now();
        table.request("Post", t0);
        table.request("Post", t0 + Duration::from_millis(5));
        table.mark_run("Post", t0 + Duration::from_millis(20));

        assert!(!table.fire("Post", t0 + WINDOW));
    }

    #[test]
    fn test_request_after_window_runs_now() {
        let mut table = DebounceTable::new(WINDOW);
        let t0 = Instant::now();
        table.request("Post", t0);
        assert_eq!(table.request("Post", t0 + WINDOW), RefreshDecision::RunNow);
    }

    #[tokio::test]
    async fn test_burst_triggers_at_most_two_rebuilds() {
        let temp_dir = TempDir::new().unwrap();
        let backend = Backend::new(BackendConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();
        let registry = Arc::new(TypeRegistry::new().register(NamespaceDescriptor::new("Post")));
        let maintainer = Arc::new(SortIndexMaintainer::new(backend, registry));

        let (scheduler, handle) =
            RefreshScheduler::spawn(maintainer.clone(), Duration::from_millis(300), &Handle::current());

        let ns = Namespace::primary("Post");
        for _ in 0..100 {
            scheduler.request_refresh(&ns);
        }
        tokio::time::sleep(Duration::from_millis(900)).await;

        let rebuilds = maintainer.rebuild_count();
        assert!(rebuilds >= 1 && rebuilds <= 2, "rebuilds = {}", rebuilds);
        handle.abort();
    }
}
