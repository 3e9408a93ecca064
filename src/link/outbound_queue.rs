use std::collections::VecDeque;
use std::sync::Mutex;
use bytes::Bytes;
use tracing::trace;

use crate::link::link_error::LinkError;

/// FIFO of payloads waiting to be sent.
///
/// [OutboundQueue::enqueue] reports whether the queue was empty before, and that is the
///  'was-empty handoff': the caller that observes the empty -> non-empty transition is the one
///  (and only one) responsible for starting a drain chain. Everybody else just appends.
///
/// The drain chain leaves the payload it is currently sending at the front and removes it only
///  when the send completes (see [OutboundQueue::complete_front]). So the queue is non-empty
///  exactly while a drain chain is active, and there is no separate 'sending' flag to keep in
///  sync.
///
/// Payloads are [Bytes], so handing the front payload to an in-flight send is a reference count
///  increment rather than a copy.
#[derive(Default)]
pub struct OutboundQueue {
    queue: Mutex<VecDeque<Bytes>>,
}

impl OutboundQueue {
    pub fn new() -> OutboundQueue {
        Default::default()
    }

    /// returns `true` if the queue was empty before this call
    #[must_use]
    pub fn enqueue(&self, payload: Bytes) -> bool {
        let mut queue = self.lock();
        let was_empty = queue.is_empty();
        queue.push_back(payload);
        trace!("enqueued outbound payload, {} pending", queue.len());
        was_empty
    }

    /// Removes and returns the front payload, for callers that are done with it as soon as they
    ///  pop it.
    ///
    /// The drain chain in [crate::link::connection::ConnectionActor] does not use this: it leaves
    ///  the in-flight payload at the front ([OutboundQueue::front]) and pops it with
    ///  [OutboundQueue::complete_front] after the send, so that the queue stays non-empty while
    ///  the send is in flight.
    pub fn dequeue(&self) -> Result<Bytes, LinkError> {
        self.lock()
            .pop_front()
            .ok_or(LinkError::EmptyQueueAccess)
    }

    /// This is a snapshot and may be outdated by the time the caller looks at it
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn front(&self) -> Option<Bytes> {
        self.lock().front().cloned()
    }

    /// Removes the front payload after its send completed, returning `true` if there are more
    ///  payloads to send. Removing and checking happen under the same lock, so a concurrent
    ///  [OutboundQueue::enqueue] either sees the queue non-empty (and leaves the payload to the
    ///  running chain) or empty (after this chain has decided to stop).
    pub fn complete_front(&self) -> Result<bool, LinkError> {
        let mut queue = self.lock();
        if queue.pop_front().is_none() {
            return Err(LinkError::EmptyQueueAccess);
        }
        Ok(!queue.is_empty())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Bytes>> {
        // the guarded code never panics, but we keep working with the data if it ever does
        self.queue.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use super::*;

    #[test]
    fn test_was_empty_handoff() {
        let queue = OutboundQueue::new();
        assert!(queue.is_empty());

        assert!(queue.enqueue(Bytes::from_static(b"command")));
        assert!(!queue.enqueue(Bytes::from_static(b"takeoff")));
        assert!(!queue.enqueue(Bytes::from_static(b"land")));
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.dequeue().unwrap(), Bytes::from_static(b"command"));
        assert_eq!(queue.dequeue().unwrap(), Bytes::from_static(b"takeoff"));
        assert_eq!(queue.dequeue().unwrap(), Bytes::from_static(b"land"));
        assert!(queue.is_empty());

        assert!(queue.enqueue(Bytes::from_static(b"command")));
    }

    #[test]
    fn test_dequeue_empty() {
        let queue = OutboundQueue::new();
        assert!(matches!(queue.dequeue(), Err(LinkError::EmptyQueueAccess)));
        assert!(matches!(queue.complete_front(), Err(LinkError::EmptyQueueAccess)));
        assert!(queue.front().is_none());
    }

    #[test]
    fn test_front_stays_until_completed() {
        let queue = OutboundQueue::new();
        assert!(queue.enqueue(Bytes::from_static(b"a")));
        assert!(!queue.enqueue(Bytes::from_static(b"b")));

        assert_eq!(queue.front(), Some(Bytes::from_static(b"a")));
        assert_eq!(queue.front(), Some(Bytes::from_static(b"a")));

        assert!(queue.complete_front().unwrap());
        assert_eq!(queue.front(), Some(Bytes::from_static(b"b")));

        // the in-flight payload still occupies the queue, so this is no handoff
        assert!(!queue.enqueue(Bytes::from_static(b"c")));

        assert!(queue.complete_front().unwrap());
        assert!(!queue.complete_front().unwrap());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_concurrent_enqueue_single_handoff() {
        let queue = Arc::new(OutboundQueue::new());

        let handles = (0..8)
            .map(|t| {
                let queue = queue.clone();
                thread::spawn(move || {
                    (0..100)
                        .filter(|i| queue.enqueue(Bytes::from(format!("{}-{}", t, i))))
                        .count()
                })
            })
            .collect::<Vec<_>>();

        let num_handoffs: usize = handles.into_iter()
            .map(|h| h.join().unwrap())
            .sum();

        assert_eq!(num_handoffs, 1);
        assert_eq!(queue.len(), 800);
    }

    #[test]
    fn test_order_per_producer() {
        let queue = OutboundQueue::new();
        for i in 0..50 {
            let _ = queue.enqueue(Bytes::from(i.to_string()));
        }
        for i in 0..50 {
            assert_eq!(queue.dequeue().unwrap(), Bytes::from(i.to_string()));
        }
    }
}
