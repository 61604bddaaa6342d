use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::{mpsc, watch, Mutex};

use crate::error::{ClusterError, Result};
use crate::tickets::ticket::{Ticket, TicketSet, TicketType};

/// Per-servant holder and distributor of the locally assigned tickets.
///
/// Every successful [`set`](TicketQueue::set) opens a new revision. Tickets
/// carry the revision they were accepted under, and anything older than the
/// current minimum is discarded both on [`recycle`](TicketQueue::recycle) and
/// when a worker takes it from the relay, so a reassignment can never be
/// undone by a ticket that was still in flight.
pub struct TicketQueue {
    current: ArcSwap<TicketSet>,
    next_revision: AtomicU64,
    min_revision: AtomicU64,
    relay_tx: mpsc::UnboundedSender<Ticket>,
    relay_rx: Mutex<mpsc::UnboundedReceiver<Ticket>>,
    size_tx: watch::Sender<usize>,
}

impl Default for TicketQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TicketQueue {
    pub fn new() -> Self {
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let (size_tx, _) = watch::channel(0);
        Self {
            current: ArcSwap::from_pointee(TicketSet::new()),
            next_revision: AtomicU64::new(0),
            min_revision: AtomicU64::new(0),
            relay_tx,
            relay_rx: Mutex::new(relay_rx),
            size_tx,
        }
    }

    /// Replace the held set.
    ///
    /// Fails with [`ClusterError::ConcurrentSet`] and no side effects if another
    /// `set` swapped the snapshot after this call read it.
    pub fn set(&self, tickets: TicketSet) -> Result<()> {
        let observed = self.current.load_full();
        // Reserved after the load: a later successful swap always carries a
        // larger revision than any swap it replaced.
        let revision = self.next_revision.fetch_add(1, Ordering::AcqRel) + 1;

        let stamped: TicketSet = tickets
            .into_iter()
            .map(|mut t| {
                t.stamp(revision);
                t
            })
            .collect();
        let stamped = Arc::new(stamped);

        let previous = self.current.compare_and_swap(&observed, Arc::clone(&stamped));
        if !Arc::ptr_eq(&*previous, &observed) {
            tracing::warn!(revision, "Ticket set lost a concurrent update");
            return Err(ClusterError::ConcurrentSet);
        }
        self.min_revision.fetch_max(revision, Ordering::AcqRel);

        for ticket in stamped.iter() {
            // The receiver lives as long as the queue.
            let _ = self.relay_tx.send(ticket.clone());
        }
        // Read under the watch lock so the last writer publishes the held size.
        self.size_tx.send_modify(|size| *size = self.current.load().len());

        tracing::debug!(
            revision,
            tickets = stamped.len(),
            summary = %stamped.summary(),
            "Ticket set replaced"
        );
        Ok(())
    }

    /// Snapshot of the held set; empty if never set.
    pub fn get(&self) -> Arc<TicketSet> {
        self.current.load_full()
    }

    /// Wait for the next current ticket. Stale tickets found in the relay are
    /// dropped here. Cancel safe.
    pub async fn recv(&self) -> Option<Ticket> {
        let mut relay = self.relay_rx.lock().await;
        while let Some(ticket) = relay.recv().await {
            if ticket.revision() >= self.min_revision() {
                return Some(ticket);
            }
            tracing::trace!(
                ticket_id = %ticket.id,
                revision = ticket.revision(),
                "Dropped stale ticket"
            );
        }
        None
    }

    /// Put a processed ticket back into the stream unless it is ephemeral or
    /// belongs to a superseded revision.
    pub fn recycle(&self, ticket: Ticket) {
        if ticket.kind == TicketType::Ephemeral {
            return;
        }
        if ticket.revision() < self.min_revision() {
            tracing::trace!(ticket_id = %ticket.id, "Skip recycling superseded ticket");
            return;
        }
        let _ = self.relay_tx.send(ticket);
    }

    /// Most-recent ticket count published by `set`. Intermediate values are
    /// overwritten if nobody observed them.
    pub fn size_changes(&self) -> watch::Receiver<usize> {
        self.size_tx.subscribe()
    }

    /// Revision of the most recent successful `set`.
    pub fn min_revision(&self) -> u64 {
        self.min_revision.load(Ordering::Acquire)
    }
}
