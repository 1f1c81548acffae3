//! Bounded per-connection outbound queue.
//!
//! Many producers push encoded frames; a single write loop pops them. The
//! queue never grows past its capacity: what happens on a full queue is
//! decided by the [`DeliveryPolicy`] of each push. Closing is one-shot and
//! carries an optional close reason for the write loop to send.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use switchyard_protocol::EncodedEvent;
use switchyard_transport::CloseReason;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::delivery::{Delivery, DeliveryPolicy};

/// Default number of pending frames per connection.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

enum Rejected {
    Full(EncodedEvent),
    Closed,
}

/// A bounded multi-producer, single-consumer frame queue.
#[derive(Debug)]
pub struct OutboundQueue {
    buf: Mutex<VecDeque<EncodedEvent>>,
    capacity: usize,
    closed: AtomicBool,
    close_reason: OnceLock<CloseReason>,
    readable: Notify,
    writable: Notify,
    shutdown: Notify,
}

impl OutboundQueue {
    /// Create a queue holding at most `capacity` frames.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buf: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            closed: AtomicBool::new(false),
            close_reason: OnceLock::new(),
            readable: Notify::new(),
            writable: Notify::new(),
            shutdown: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<EncodedEvent>> {
        self.buf.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn offer(&self, frame: EncodedEvent) -> Result<(), Rejected> {
        let mut buf = self.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(Rejected::Closed);
        }
        if buf.len() >= self.capacity {
            return Err(Rejected::Full(frame));
        }
        buf.push_back(frame);
        drop(buf);
        self.readable.notify_one();
        Ok(())
    }

    /// Push without waiting; a full queue drops the new frame.
    pub fn try_push(&self, frame: EncodedEvent) -> Delivery {
        match self.offer(frame) {
            Ok(()) => Delivery::Queued,
            Err(Rejected::Full(_)) => Delivery::Dropped,
            Err(Rejected::Closed) => Delivery::Closed,
        }
    }

    /// Push without waiting; a full queue evicts its oldest frame.
    pub fn push_evicting(&self, frame: EncodedEvent) -> Delivery {
        let mut buf = self.lock();
        if self.closed.load(Ordering::Acquire) {
            return Delivery::Closed;
        }
        let outcome = if buf.len() >= self.capacity {
            buf.pop_front();
            Delivery::Evicted
        } else {
            Delivery::Queued
        };
        buf.push_back(frame);
        drop(buf);
        self.readable.notify_one();
        outcome
    }

    /// Push, waiting up to `timeout` for room.
    pub async fn push_timeout(&self, frame: EncodedEvent, timeout: Duration) -> Delivery {
        let deadline = Instant::now() + timeout;
        let mut frame = frame;
        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.offer(frame) {
                Ok(()) => return Delivery::Queued,
                Err(Rejected::Closed) => return Delivery::Closed,
                Err(Rejected::Full(back)) => frame = back,
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Delivery::Dropped;
            }
        }
    }

    /// Push according to `policy`.
    pub async fn deliver(&self, frame: EncodedEvent, policy: DeliveryPolicy) -> Delivery {
        match policy {
            DeliveryPolicy::DropNewest => self.try_push(frame),
            DeliveryPolicy::DropOldest => self.push_evicting(frame),
            DeliveryPolicy::Block { timeout_ms } if timeout_ms == 0 => self.try_push(frame),
            DeliveryPolicy::Block { timeout_ms } => {
                self.push_timeout(frame, Duration::from_millis(timeout_ms))
                    .await
            }
        }
    }

    /// Pop the next frame without waiting.
    pub fn try_pop(&self) -> Option<EncodedEvent> {
        let frame = self.lock().pop_front();
        if frame.is_some() {
            self.writable.notify_waiters();
        }
        frame
    }

    /// Wait for the next frame.
    ///
    /// Frames queued before the close are still returned; `None` means the
    /// queue is closed and drained.
    pub async fn pop(&self) -> Option<EncodedEvent> {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(frame) = self.try_pop() {
                return Some(frame);
            }
            if self.is_closed() {
                return None;
            }

            notified.await;
        }
    }

    /// Close the queue.
    ///
    /// Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        let buf = self.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        drop(buf);

        self.readable.notify_waiters();
        self.writable.notify_waiters();
        self.shutdown.notify_waiters();
        true
    }

    /// Close the queue and record the close frame the writer should send.
    ///
    /// The reason is ignored if the queue was already closed.
    pub fn close_with(&self, reason: CloseReason) -> bool {
        let buf = self.lock();
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let _ = self.close_reason.set(reason);
        drop(buf);
        self.close()
    }

    /// Wait until the queue is closed.
    pub async fn closed(&self) {
        let notified = self.shutdown.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_closed() {
            return;
        }
        notified.await;
    }

    /// Reason recorded by [`close_with`](Self::close_with), if any.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().cloned()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new(DEFAULT_OUTBOUND_CAPACITY)
    }
}
