//! Progress bus
//!
//! Fans out confirmed progress events for a job to zero or more live
//! observers over `tokio::sync::broadcast`, and keeps a bounded per-job
//! replay tail for snapshot queries. Publishing never blocks: a slow
//! observer lags (and is resynchronized from the durable log by its
//! transport handler) instead of exerting back-pressure on the job.
//!
//! The bus owns only transient fan-out state. Full, gap-free replay always
//! comes from the job store's persisted event log; the tail here is a
//! convenience for cheap "recent activity" queries and may evict old events
//! freely.

use auris_common::events::ProgressEvent;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Per-job fan-out channel plus bounded replay tail
struct JobChannel {
    tx: broadcast::Sender<ProgressEvent>,
    tail: VecDeque<ProgressEvent>,
}

/// Fan-out and snapshot access for job progress events
pub struct ProgressBus {
    channels: Mutex<HashMap<Uuid, JobChannel>>,
    /// Broadcast channel capacity per job (per-observer buffer bound)
    capacity: usize,
    /// Replay tail length per job
    tail_len: usize,
}

impl ProgressBus {
    pub fn new(capacity: usize, tail_len: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity,
            tail_len,
        }
    }

    /// Publish one confirmed event to all current subscribers.
    ///
    /// Events must already be persisted by the store; the bus does not check
    /// ordering, it preserves the order in which it is handed events.
    pub fn publish(&self, event: ProgressEvent) {
        let mut channels = self.channels.lock().expect("bus lock");
        let channel = channels
            .entry(event.job_id())
            .or_insert_with(|| self.new_channel());

        channel.tail.push_back(event.clone());
        while channel.tail.len() > self.tail_len {
            channel.tail.pop_front();
        }

        // Err means no live subscribers, which is fine
        if let Err(e) = channel.tx.send(event) {
            debug!("No live subscribers for job event: {}", e.0.event_type());
        }
    }

    /// Publish a batch in order
    pub fn publish_all(&self, events: impl IntoIterator<Item = ProgressEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    /// Attach a live observer to a job's event stream.
    ///
    /// The receiver only sees events published after this call; callers that
    /// need history must replay the durable log first and use sequence
    /// numbers to splice the two without gaps or duplicates (subscribe
    /// before reading the log, then drop live events at or below the last
    /// replayed sequence).
    pub fn subscribe(&self, job_id: Uuid) -> broadcast::Receiver<ProgressEvent> {
        let mut channels = self.channels.lock().expect("bus lock");
        channels
            .entry(job_id)
            .or_insert_with(|| self.new_channel())
            .tx
            .subscribe()
    }

    /// Recent event tail for a job (bounded; oldest evicted first)
    pub fn snapshot(&self, job_id: Uuid) -> Vec<ProgressEvent> {
        self.channels
            .lock()
            .expect("bus lock")
            .get(&job_id)
            .map(|c| c.tail.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of live observers on a job
    pub fn subscriber_count(&self, job_id: Uuid) -> usize {
        self.channels
            .lock()
            .expect("bus lock")
            .get(&job_id)
            .map(|c| c.tx.receiver_count())
            .unwrap_or(0)
    }

    /// Drop a terminal job's channel.
    ///
    /// Already-attached receivers drain whatever is buffered and then see
    /// `Closed`; new observers recover the job's history from the store.
    pub fn retire(&self, job_id: Uuid) {
        self.channels.lock().expect("bus lock").remove(&job_id);
    }

    fn new_channel(&self) -> JobChannel {
        let (tx, _) = broadcast::channel(self.capacity);
        JobChannel {
            tx,
            tail: VecDeque::new(),
        }
    }
}
