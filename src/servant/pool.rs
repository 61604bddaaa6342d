use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::servant::worker::{TicketHandler, WorkerHandle, WorkerState};
use crate::tickets::TicketQueue;

/// Worker as listed by [`ServantPool::workers`].
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub id: u32,
    pub state: WorkerState,
}

#[derive(Default)]
struct Workers {
    active: Vec<WorkerHandle>,
    silent: Vec<WorkerHandle>,
}

/// Set of workers draining one [`TicketQueue`], sized to the number of held
/// tickets up to `max_workers`. Parked workers are kept and resumed before
/// new ones are spawned.
pub struct ServantPool {
    queue: Arc<TicketQueue>,
    handler: Arc<dyn TicketHandler>,
    max_workers: usize,
    interval: Duration,
    next_id: AtomicU32,
    workers: Mutex<Workers>,
    reschedule: Arc<Notify>,
    shutdown: CancellationToken,
    listener: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ServantPool {
    /// Create the pool and start listening to the queue's size changes.
    pub fn start(
        queue: Arc<TicketQueue>,
        handler: Arc<dyn TicketHandler>,
        max_workers: usize,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            queue,
            handler,
            max_workers,
            interval,
            next_id: AtomicU32::new(0),
            workers: Mutex::new(Workers::default()),
            reschedule: Arc::new(Notify::new()),
            shutdown,
            listener: std::sync::Mutex::new(None),
        });

        let listener = tokio::spawn(Self::listen(pool.clone()));
        if let Ok(mut slot) = pool.listener.lock() {
            *slot = Some(listener);
        }
        pool
    }

    async fn listen(pool: Arc<Self>) {
        let mut sizes = pool.queue.size_changes();
        loop {
            tokio::select! {
                _ = pool.shutdown.cancelled() => break,
                changed = sizes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let size = *sizes.borrow_and_update();
                    pool.resize_if_need(size).await;
                }
            }
        }
        tracing::debug!("Servant pool listener exited");
    }

    /// Match the active worker count to `ticket_count`, bounded by
    /// `max_workers`.
    pub async fn resize_if_need(&self, ticket_count: usize) {
        let mut workers = self.workers.lock().await;
        let active = workers.active.len();
        if ticket_count < active {
            self.park_workers(&mut workers, active - ticket_count);
        } else if ticket_count > active && self.max_workers > active {
            self.activate_workers(&mut workers, ticket_count.min(self.max_workers) - active);
        }
    }

    /// Add up to `n` active workers, resuming parked ones first.
    pub async fn add_servant(&self, n: usize) {
        let mut workers = self.workers.lock().await;
        self.activate_workers(&mut workers, n);
    }

    /// Park the `n` most recently activated workers.
    pub async fn remove_servant(&self, n: usize) {
        let mut workers = self.workers.lock().await;
        self.park_workers(&mut workers, n);
    }

    pub async fn servant_count(&self) -> usize {
        self.workers.lock().await.active.len()
    }

    /// Active workers first, then parked ones.
    pub async fn workers(&self) -> Vec<WorkerInfo> {
        let workers = self.workers.lock().await;
        workers
            .active
            .iter()
            .chain(workers.silent.iter())
            .map(|w| WorkerInfo {
                id: w.id(),
                state: w.state(),
            })
            .collect()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Ask the master for an early dispatch cycle. Never blocks; repeated
    /// requests before the registration loop reacts collapse into one.
    pub fn request_master_reschedule(&self) {
        self.reschedule.notify_one();
    }

    /// Signal consumed by the registration loop.
    pub fn reschedule_signal(&self) -> Arc<Notify> {
        self.reschedule.clone()
    }

    /// Stop every worker and wait for them to exit. Safe to call twice.
    pub async fn stop(&self) {
        self.shutdown.cancel();

        let listener = self.listener.lock().ok().and_then(|mut slot| slot.take());
        if let Some(listener) = listener {
            if let Err(e) = listener.await {
                tracing::error!(error = %e, "Servant pool listener panicked");
            }
        }

        let stopped = {
            let mut workers = self.workers.lock().await;
            let mut all = std::mem::take(&mut workers.active);
            all.append(&mut workers.silent);
            all
        };
        if stopped.is_empty() {
            return;
        }
        let count = stopped.len();
        for worker in &stopped {
            worker.stop();
        }
        for worker in stopped {
            worker.join().await;
        }
        tracing::info!(workers = count, "Servant pool stopped");
    }

    fn activate_workers(&self, workers: &mut Workers, n: usize) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let n = n.min(self.max_workers.saturating_sub(workers.active.len()));
        if n == 0 {
            return;
        }

        let resumed = n.min(workers.silent.len());
        for worker in workers.silent.drain(..resumed) {
            worker.resume();
            workers.active.push(worker);
        }
        for _ in resumed..n {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            workers.active.push(WorkerHandle::spawn(
                id,
                self.queue.clone(),
                self.handler.clone(),
                self.interval,
                self.shutdown.child_token(),
            ));
        }
        tracing::info!(
            active = workers.active.len(),
            resumed,
            spawned = n - resumed,
            "Increased workers"
        );
    }

    fn park_workers(&self, workers: &mut Workers, n: usize) {
        let n = n.min(workers.active.len());
        if n == 0 {
            return;
        }
        let keep = workers.active.len() - n;
        for worker in workers.active.drain(keep..) {
            worker.park();
            workers.silent.push(worker);
        }
        tracing::info!(active = workers.active.len(), "Decreased workers");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::tickets::{Ticket, TicketSet};

    fn noop_pool(max_workers: usize) -> Arc<ServantPool> {
        let handler = |_ticket: Ticket| async { Ok::<(), HandlerError>(()) };
        ServantPool::start(
            Arc::new(TicketQueue::new()),
            Arc::new(handler),
            max_workers,
            Duration::from_millis(1),
            CancellationToken::new(),
        )
    }

    async fn active_ids(pool: &ServantPool) -> Vec<u32> {
        pool.workers
            .lock()
            .await
            .active
            .iter()
            .map(|w| w.id())
            .collect()
    }

    #[tokio::test]
    async fn add_is_bounded_by_max_workers() {
        let pool = noop_pool(3);
        pool.add_servant(5).await;
        assert_eq!(pool.servant_count().await, 3);
        pool.add_servant(1).await;
        assert_eq!(pool.servant_count().await, 3);
        pool.stop().await;
    }

    #[tokio::test]
    async fn remove_parks_most_recent_and_add_resumes_them() {
        let pool = noop_pool(4);
        pool.add_servant(4).await;
        assert_eq!(active_ids(&pool).await, vec![1, 2, 3, 4]);

        pool.remove_servant(2).await;
        assert_eq!(active_ids(&pool).await, vec![1, 2]);

        pool.add_servant(2).await;
        let mut ids = active_ids(&pool).await;
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        pool.stop().await;
    }

    #[tokio::test]
    async fn parked_worker_stays_parked_after_rapid_remove_add_remove() {
        let pool = noop_pool(1);
        pool.add_servant(1).await;

        pool.remove_servant(1).await;
        pool.add_servant(1).await;
        pool.remove_servant(1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(pool.servant_count().await, 0);
        let workers = pool.workers().await;
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].state, WorkerState::Silent);

        // The cap still holds: the parked worker is resumed, not a new one spawned
        pool.add_servant(1).await;
        assert_eq!(active_ids(&pool).await, vec![1]);
        assert_eq!(pool.workers().await.len(), 1);
        pool.stop().await;
    }

    #[tokio::test]
    async fn remove_is_clamped_to_active() {
        let pool = noop_pool(2);
        pool.add_servant(2).await;
        pool.remove_servant(10).await;
        assert_eq!(pool.servant_count().await, 0);
        assert_eq!(pool.workers().await.len(), 2);
        pool.stop().await;
    }

    #[tokio::test]
    async fn resize_follows_ticket_count() {
        let pool = noop_pool(3);
        pool.resize_if_need(2).await;
        assert_eq!(pool.servant_count().await, 2);
        pool.resize_if_need(10).await;
        assert_eq!(pool.servant_count().await, 3);
        pool.resize_if_need(1).await;
        assert_eq!(pool.servant_count().await, 1);
        pool.resize_if_need(0).await;
        assert_eq!(pool.servant_count().await, 0);
        pool.stop().await;
    }

    #[tokio::test]
    async fn queue_size_changes_drive_resize() {
        let queue = Arc::new(TicketQueue::new());
        let handler = |_ticket: Ticket| async { Ok::<(), HandlerError>(()) };
        let pool = ServantPool::start(
            queue.clone(),
            Arc::new(handler),
            4,
            Duration::from_millis(1),
            CancellationToken::new(),
        );

        let tickets: TicketSet = (0..3)
            .map(|i| Ticket::persistent(format!("t{}", i), Vec::<u8>::new()))
            .collect();
        queue.set(tickets).unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while pool.servant_count().await != 3 {
            assert!(tokio::time::Instant::now() < deadline, "pool never grew");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_final() {
        let pool = noop_pool(2);
        pool.add_servant(2).await;
        pool.stop().await;
        pool.stop().await;
        assert_eq!(pool.servant_count().await, 0);
        pool.add_servant(1).await;
        assert_eq!(pool.servant_count().await, 0);
    }
}
