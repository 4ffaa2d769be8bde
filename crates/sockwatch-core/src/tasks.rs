//! Background task supervision
//!
//! Every long-running task gets its own one-shot stop channel, so stopping
//! sends exactly one signal per task and a task can never miss or steal
//! another task's signal. Shutdown then joins all of them against a single
//! deadline.

use crate::error::ShutdownError;
use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Receiving end of a task's stop channel
pub type StopSignal = oneshot::Receiver<()>;

struct Supervised {
    name: String,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Set of spawned tasks that are stopped together
#[derive(Default)]
pub struct TaskGroup {
    tasks: Vec<Supervised>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` with a fresh stop signal
    pub fn spawn<F, Fut>(&mut self, name: impl Into<String>, task: F)
    where
        F: FnOnce(StopSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let (stop, signal) = oneshot::channel();
        let handle = tokio::spawn(task(signal));
        debug!("Spawned task {}", name);
        self.tasks.push(Supervised { name, stop, handle });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.name.as_str()).collect()
    }

    /// Signal every task once, then wait up to `drain` for all of them.
    /// Tasks still running at the deadline are aborted and reported.
    pub async fn shutdown(self, drain: Duration) -> Result<(), ShutdownError> {
        let mut running = Vec::with_capacity(self.tasks.len());
        for task in self.tasks {
            // a task that already finished dropped its receiver
            let _ = task.stop.send(());
            running.push((task.name, task.handle));
        }

        let deadline = Instant::now() + drain;
        let mut pending = Vec::new();
        for (name, mut handle) in running {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => debug!("Task {} stopped", name),
                Ok(Err(e)) => warn!("Task {} ended abnormally: {}", name, e),
                Err(_) => {
                    handle.abort();
                    pending.push(name);
                }
            }
        }

        if pending.is_empty() {
            Ok(())
        } else {
            warn!("Tasks did not drain in {:?}: {:?}", drain, pending);
            Err(ShutdownError::DrainTimeout { pending })
        }
    }
}

/// Run `body` every `period` until `stop` fires
///
/// The first run happens one period after start. A run in progress always
/// completes before the stop signal is looked at again.
pub async fn run_periodic<F, Fut>(name: &str, period: Duration, mut stop: StopSignal, mut body: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = &mut stop => {
                debug!("{} received stop signal", name);
                break;
            }
            _ = ticker.tick() => body().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_shutdown_signals_every_task() {
        let stopped = Arc::new(AtomicUsize::new(0));
        let mut group = TaskGroup::new();
        for i in 0..6 {
            let stopped = Arc::clone(&stopped);
            group.spawn(format!("task-{i}"), move |stop| async move {
                let _ = stop.await;
                stopped.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(group.len(), 6);

        group.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(stopped.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_shutdown_reports_stuck_task() {
        let mut group = TaskGroup::new();
        group.spawn("well-behaved", |stop| async move {
            let _ = stop.await;
        });
        group.spawn("stuck", |_stop| async move {
            std::future::pending::<()>().await;
        });

        match group.shutdown(Duration::from_millis(50)).await {
            Err(ShutdownError::DrainTimeout { pending }) => assert_eq!(pending, vec!["stuck"]),
            other => panic!("expected drain timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_tolerates_finished_task() {
        let mut group = TaskGroup::new();
        group.spawn("done", |_stop| async {});
        tokio::task::yield_now().await;
        assert!(group.shutdown(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_periodic_ticks_until_stopped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        let counter = Arc::clone(&runs);
        let handle = tokio::spawn(async move {
            run_periodic("ticker", Duration::from_secs(1), rx, move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        // a second group can be brought up once the first is fully down
        for round in 0..2 {
            let mut group = TaskGroup::new();
            let (ready_tx, ready_rx) = oneshot::channel();
            group.spawn(format!("round-{round}"), move |stop| async move {
                let _ = ready_tx.send(());
                let _ = stop.await;
            });
            ready_rx.await.unwrap();
            group.shutdown(Duration::from_secs(1)).await.unwrap();
        }
    }
}
