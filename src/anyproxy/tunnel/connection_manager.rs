//! Per-endpoint logical-connection table: one instance per tunnel, shared by
//! the gateway and client state machines. §4.3 of the design: a single lock
//! covers both the LC table and the per-LC queue table so add/remove stay
//! atomic, queues are bounded with a backpressure policy that closes the LC
//! rather than blocking or dropping silently, and exactly one task per LC
//! ever touches its local handle.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use crate::anyproxy::metrics::Metrics;
use crate::anyproxy::tunnel::protocol::{ConnId, Frame};

pub const QUEUE_CAPACITY: usize = 64;

/// What an LC's owner (gateway: local pipe, client: dialed socket) does with
/// frames routed to it. `Data`/`ConnectResponse` handling differs by
/// endpoint; `Close` is handled uniformly by the manager itself.
#[async_trait]
pub trait LocalHandle: Send + Sync {
    /// Called for every frame other than `Close` routed to this LC.
    /// Returning `false` tells the manager to tear the LC down (e.g. a
    /// local-socket write failed, or a `ConnectResponse{ok=false}` arrived).
    async fn on_frame(&self, frame: Frame) -> bool;

    /// Invoked exactly once during teardown.
    async fn close(&self);
}

struct LcEntry {
    queue_tx: mpsc::Sender<Frame>,
}

pub struct ConnectionManager {
    entries: Mutex<HashMap<ConnId, LcEntry>>,
    writer: mpsc::Sender<Frame>,
    metrics: Arc<Metrics>,
}

impl ConnectionManager {
    pub fn new(writer: mpsc::Sender<Frame>, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            writer,
            metrics,
        })
    }

    /// Registers a new LC and spawns its consumer task. Returns `false` if
    /// `conn_id` is already registered (it must be unique for the tunnel's
    /// lifetime).
    pub async fn add(self: &Arc<Self>, conn_id: ConnId, handle: Arc<dyn LocalHandle>) -> bool {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&conn_id) {
            return false;
        }

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        entries.insert(conn_id, LcEntry { queue_tx: tx });
        self.metrics.inc_lcs_opened();
        drop(entries);

        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_consumer(conn_id, handle, rx).await;
        });
        true
    }

    async fn run_consumer(
        self: Arc<Self>,
        conn_id: ConnId,
        handle: Arc<dyn LocalHandle>,
        mut rx: mpsc::Receiver<Frame>,
    ) {
        while let Some(frame) = rx.recv().await {
            if matches!(frame, Frame::Close { .. }) {
                break;
            }
            if !handle.on_frame(frame).await {
                self.send_close(conn_id).await;
                break;
            }
        }
        self.cleanup(conn_id, &handle).await;
    }

    /// Non-blocking route of a frame to its LC's queue. On queue-full the LC
    /// is closed and a `Close` frame is sent to the peer; on an unknown
    /// `conn_id` the frame is silently dropped (§4.3).
    pub async fn route(&self, frame: Frame) {
        let Some(conn_id) = frame.conn_id() else {
            return;
        };

        let queue_tx = {
            let entries = self.entries.lock().await;
            entries.get(&conn_id).map(|e| e.queue_tx.clone())
        };
        let Some(queue_tx) = queue_tx else {
            return;
        };

        match queue_tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(?conn_id, "per-LC queue overflow, closing logical connection");
                self.metrics.inc_queue_overflow_closes();
                self.send_close(conn_id).await;
                // The consumer may still drain the queue and exit on its
                // own; force removal so a stuck consumer can't wedge the
                // table indefinitely.
                self.entries.lock().await.remove(&conn_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.entries.lock().await.remove(&conn_id);
            }
        }
    }

    async fn send_close(&self, conn_id: ConnId) {
        let _ = self.writer.send(Frame::Close { conn_id }).await;
    }

    /// Atomically removes the LC and closes its local handle exactly once.
    /// Idempotent: a second call for the same `conn_id` is a no-op.
    pub async fn cleanup(&self, conn_id: ConnId, handle: &Arc<dyn LocalHandle>) {
        let removed = self.entries.lock().await.remove(&conn_id).is_some();
        if removed {
            self.metrics.inc_lcs_closed();
        }
        handle.close().await;
    }

    /// Removes an LC by id alone (used when the caller doesn't hold the
    /// handle, e.g. tunnel-level teardown already iterating entries).
    pub async fn remove(&self, conn_id: ConnId) -> bool {
        let removed = self.entries.lock().await.remove(&conn_id).is_some();
        if removed {
            self.metrics.inc_lcs_closed();
        }
        removed
    }

    pub async fn contains(&self, conn_id: ConnId) -> bool {
        self.entries.lock().await.contains_key(&conn_id)
    }

    /// Tears down every live LC; invoked on tunnel teardown. Dropping the
    /// queue senders here lets each consumer's `rx.recv()` return `None` and
    /// exit on its own, at which point it calls back into `cleanup`.
    pub async fn close_all(&self) {
        let mut entries = self.entries.lock().await;
        let n = entries.len();
        entries.clear();
        drop(entries);
        if n > 0 {
            self.metrics.lcs_closed.fetch_add(n as u64, std::sync::atomic::Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct RecordingHandle {
        frames_seen: AtomicUsize,
        closed: AtomicBool,
        accept: bool,
    }

    #[async_trait]
    impl LocalHandle for RecordingHandle {
        async fn on_frame(&self, _frame: Frame) -> bool {
            self.frames_seen.fetch_add(1, Ordering::SeqCst);
            self.accept
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn conn_id(b: u8) -> ConnId {
        [b; 20]
    }

    #[tokio::test]
    async fn add_rejects_duplicate_conn_id() {
        let (tx, _rx) = mpsc::channel(8);
        let mgr = ConnectionManager::new(tx, Arc::new(Metrics::new()));
        let handle = Arc::new(RecordingHandle {
            frames_seen: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            accept: true,
        });
        assert!(mgr.add(conn_id(1), handle.clone()).await);
        assert!(!mgr.add(conn_id(1), handle).await);
    }

    #[tokio::test]
    async fn route_to_unknown_conn_id_is_silently_dropped() {
        let (tx, _rx) = mpsc::channel(8);
        let mgr = ConnectionManager::new(tx, Arc::new(Metrics::new()));
        mgr.route(Frame::Close { conn_id: conn_id(9) }).await;
    }

    #[tokio::test]
    async fn close_frame_triggers_cleanup() {
        let (tx, _rx) = mpsc::channel(8);
        let mgr = ConnectionManager::new(tx, Arc::new(Metrics::new()));
        let handle = Arc::new(RecordingHandle {
            frames_seen: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            accept: true,
        });
        let id = conn_id(2);
        mgr.add(id, handle.clone()).await;
        mgr.route(Frame::Close { conn_id: id }).await;

        // consumer task runs asynchronously; give it a chance to observe.
        for _ in 0..50 {
            if handle.closed.load(Ordering::SeqCst) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(handle.closed.load(Ordering::SeqCst));
        assert!(!mgr.contains(id).await);
    }

    #[tokio::test]
    async fn handler_rejecting_a_frame_tears_down_the_lc_and_emits_close() {
        let (tx, mut rx) = mpsc::channel(8);
        let mgr = ConnectionManager::new(tx, Arc::new(Metrics::new()));
        let handle = Arc::new(RecordingHandle {
            frames_seen: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            accept: false,
        });
        let id = conn_id(3);
        mgr.add(id, handle.clone()).await;
        mgr.route(Frame::Data {
            conn_id: id,
            payload: bytes::Bytes::from_static(b"x"),
        })
        .await;

        let sent = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sent, Frame::Close { conn_id: id });
    }

    #[tokio::test]
    async fn overflowing_a_stuck_queue_closes_the_lc_without_affecting_others() {
        let (tx, mut rx) = mpsc::channel(8);
        let mgr = ConnectionManager::new(tx, Arc::new(Metrics::new()));

        // A handle whose on_frame never returns keeps the consumer from
        // draining the queue, simulating a stuck local socket.
        struct StuckHandle;
        #[async_trait]
        impl LocalHandle for StuckHandle {
            async fn on_frame(&self, _frame: Frame) -> bool {
                std::future::pending::<()>().await;
                true
            }
            async fn close(&self) {}
        }

        let stuck = conn_id(4);
        mgr.add(stuck, Arc::new(StuckHandle)).await;

        let other = conn_id(5);
        let other_handle = Arc::new(RecordingHandle {
            frames_seen: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            accept: true,
        });
        mgr.add(other, other_handle.clone()).await;

        // QUEUE_CAPACITY + 2 is enough to overflow the stuck LC's queue
        // regardless of exactly how many frames its consumer had a chance
        // to dequeue before stalling.
        for _ in 0..QUEUE_CAPACITY + 2 {
            mgr.route(Frame::Data {
                conn_id: stuck,
                payload: bytes::Bytes::from_static(b"x"),
            })
            .await;
        }

        let sent = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sent, Frame::Close { conn_id: stuck });

        // The other LC on the same tunnel is unaffected.
        mgr.route(Frame::Data {
            conn_id: other,
            payload: bytes::Bytes::from_static(b"hello"),
        })
        .await;
        for _ in 0..50 {
            if other_handle.frames_seen.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(other_handle.frames_seen.load(Ordering::SeqCst) > 0);
        assert!(mgr.contains(other).await);
    }
}
