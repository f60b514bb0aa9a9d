use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// how long `exit()` lets pending tasks finish before the loops are torn down
pub const EXIT_GRACE_PERIOD: Duration = Duration::from_secs(2);

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// waits for spawned tasks to complete, for at most `grace`
async fn drain(grace: Duration) {
    let deadline = Instant::now() + grace;
    let metrics = Handle::current().metrics();
    while metrics.num_alive_tasks() > 0 && Instant::now() < deadline {
        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
    }
}

struct Worker {
    handle: Handle,
    shutdown: Option<oneshot::Sender<Duration>>,
    thread: Option<JoinHandle<()>>,
}

/// A fixed number of single threaded event loops. Each loop is kept alive by a pending
///  shutdown token until `stop()` or `exit()`, and work is spread across loops round robin.
pub struct IoServicePool {
    name: String,
    size: usize,
    workers: Mutex<Vec<Worker>>,
    next: AtomicUsize,
}

impl std::fmt::Debug for IoServicePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IoServicePool{{name:{}, size:{}, running:{}}}", self.name, self.size, self.is_running())
    }
}

impl IoServicePool {
    pub fn new(name: impl Into<String>, size: usize) -> IoServicePool {
        IoServicePool {
            name: name.into(),
            size: size.max(1),
            workers: Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_running(&self) -> bool {
        !self.workers.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }

    /// Starts the loops. Calling this on a running pool does nothing.
    pub fn start(&self) -> anyhow::Result<()> {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if !workers.is_empty() {
            return Ok(());
        }

        for i in 0..self.size {
            let runtime = Builder::new_current_thread()
                .enable_all()
                .build()?;
            let handle = runtime.handle().clone();
            let (shutdown, shutdown_rx) = oneshot::channel::<Duration>();

            let thread = std::thread::Builder::new()
                .name(format!("{}-{}", self.name, i))
                .spawn(move || {
                    runtime.block_on(async move {
                        let grace = shutdown_rx.await.unwrap_or(Duration::ZERO);
                        drain(grace).await;
                    });
                    runtime.shutdown_background();
                })?;

            workers.push(Worker {
                handle,
                shutdown: Some(shutdown),
                thread: Some(thread),
            });
        }

        info!("started I/O pool {} with {} threads", self.name, self.size);
        Ok(())
    }

    /// round robin over the loops, `None` if the pool is not running
    pub fn next_handle(&self) -> Option<Handle> {
        let workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if workers.is_empty() {
            return None;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % workers.len();
        Some(workers[idx].handle.clone())
    }

    /// Aborts all pending work and joins the threads
    pub fn stop(&self) {
        self.shutdown(Duration::ZERO);
    }

    /// Gives pending work [`EXIT_GRACE_PERIOD`] to finish, then joins the threads
    pub fn exit(&self) {
        self.shutdown(EXIT_GRACE_PERIOD);
    }

    fn shutdown(&self, grace: Duration) {
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        if workers.is_empty() {
            return;
        }

        debug!("shutting down I/O pool {} with grace period {:?}", self.name, grace);
        let mut workers = workers;
        for w in workers.iter_mut() {
            if let Some(shutdown) = w.shutdown.take() {
                let _ = shutdown.send(grace);
            }
        }

        let current = std::thread::current().id();
        for w in workers.iter_mut() {
            if let Some(thread) = w.thread.take() {
                if thread.thread().id() == current {
                    // a loop shutting down its own pool cannot join itself
                    continue;
                }
                if thread.join().is_err() {
                    warn!("I/O thread of pool {} panicked", self.name);
                }
            }
        }
        info!("stopped I/O pool {}", self.name);
    }
}

impl Drop for IoServicePool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashSet;

    #[test]
    fn test_round_robin_over_threads() {
        let pool = IoServicePool::new("test-io", 3);
        pool.start().unwrap();
        pool.start().unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        for _ in 0..6 {
            let tx = tx.clone();
            pool.next_handle().unwrap().spawn(async move {
                tx.send(std::thread::current().name().unwrap_or_default().to_string()).unwrap();
            });
        }

        let names = (0..6)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect::<FxHashSet<_>>();
        assert_eq!(names, ["test-io-0", "test-io-1", "test-io-2"].into_iter().map(String::from).collect());

        pool.stop();
        pool.stop();
        assert!(!pool.is_running());
        assert!(pool.next_handle().is_none());
    }

    #[test]
    fn test_exit_lets_pending_work_finish() {
        let pool = IoServicePool::new("test-exit", 1);
        pool.start().unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        pool.next_handle().unwrap().spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(()).unwrap();
        });
        pool.exit();

        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_restart_after_stop() {
        let pool = IoServicePool::new("test-restart", 2);
        pool.start().unwrap();
        pool.stop();
        pool.start().unwrap();
        assert!(pool.is_running());
        assert!(pool.next_handle().is_some());
    }
}
