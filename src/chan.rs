// ─────────────────────────────────────────────────────────────────────────────
// chan.rs — Latest-only channel
//
// A one-slot channel: `send` overwrites any unread value, `recv` takes it,
// `recv_latest` drains a pending value without suspending. Used for the
// target-position input and the clock-update signal, where only the newest
// value matters.
// ─────────────────────────────────────────────────────────────────────────────
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

struct Slot<T> {
    value: Option<T>,
    closed: bool,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    notify: Notify,
}

pub struct LatestSender<T> {
    shared: Arc<Shared<T>>,
}

pub struct LatestReceiver<T> {
    shared: Arc<Shared<T>>,
}

pub fn latest_channel<T>() -> (LatestSender<T>, LatestReceiver<T>) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot {
            value: None,
            closed: false,
        }),
        notify: Notify::new(),
    });
    (
        LatestSender {
            shared: shared.clone(),
        },
        LatestReceiver { shared },
    )
}

impl<T> LatestSender<T> {
    /// Stores `value`, overwriting any unread one. Sending on a closed
    /// channel is a no-op.
    pub fn send(&self, value: T) {
        let mut slot = self.shared.slot.lock().unwrap();
        if slot.closed {
            return;
        }
        slot.value = Some(value);
        // notify_one keeps a permit when nobody is waiting yet, so a send
        // racing a receiver registration cannot be lost.
        self.shared.notify.notify_one();
    }

    /// Closes the channel. A pending value stays readable; after it is
    /// drained, `recv` returns `None`.
    pub fn close(&self) {
        self.shared.slot.lock().unwrap().closed = true;
        self.shared.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.slot.lock().unwrap().closed
    }
}

impl<T> LatestReceiver<T> {
    /// Waits for a value. Returns `None` once the channel is closed and
    /// drained (end-of-stream).
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            {
                let mut slot = self.shared.slot.lock().unwrap();
                if let Some(v) = slot.value.take() {
                    return Some(v);
                }
                if slot.closed {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }

    /// Takes a pending value if one is queued, otherwise hands `fallback`
    /// back unchanged. Never suspends.
    pub fn recv_latest(&mut self, fallback: T) -> T {
        self.shared
            .slot
            .lock()
            .unwrap()
            .value
            .take()
            .unwrap_or(fallback)
    }

    /// Closes the channel from the receiving side (owner shutdown).
    pub fn close(&self) {
        self.shared.slot.lock().unwrap().closed = true;
        self.shared.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_overwrites_unread_value() {
        let (tx, mut rx) = latest_channel();
        tx.send(1);
        tx.send(2);
        tx.send(3);
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn test_recv_latest_prefers_pending_value() {
        let (tx, mut rx) = latest_channel();
        assert_eq!(rx.recv_latest(7), 7);
        tx.send(42);
        assert_eq!(rx.recv_latest(7), 42);
        // drained: fallback again
        assert_eq!(rx.recv_latest(7), 7);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let (tx, mut rx) = latest_channel();
        tx.send(5);
        tx.close();
        assert_eq!(rx.recv().await, Some(5));
        assert_eq!(rx.recv().await, None);
        // send after close is a no-op
        tx.send(6);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_send() {
        let (tx, mut rx) = latest_channel::<u32>();
        let handle = tokio::spawn(async move { rx.recv().await });
        tokio::task::yield_now().await;
        tx.send(9);
        assert_eq!(handle.await.unwrap(), Some(9));
    }
}
