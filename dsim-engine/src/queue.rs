//! Process-local message queue.
//!
//! Reader tasks call [`MessageQueue::enqueue`]; the owning process thread
//! drives [`take_next`](MessageQueue::take_next) and
//! [`remove_first`](MessageQueue::remove_first) in lockstep. Before the head is
//! handed out, the queue runs the two [`QueueDiscipline`] hooks.
//!
//! When the processing condition rejects the head, `take_next` returns the
//! empty sentinel and marks the queue as stalled. A stalled queue does not
//! re-run the hooks until something changes: a new enqueue or an explicit
//! [`wake`](MessageQueue::wake).

use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
};

use dsim_common::Message;

/// Ordering and gating hooks applied by [`MessageQueue::take_next`].
pub trait QueueDiscipline {
    /// May reorder or rewrite the pending messages in place.
    fn arrange(&mut self, _queue: &mut VecDeque<Message>) {}

    /// Whether the head may be delivered now.
    fn processing_condition(&mut self, _head: &Message) -> bool {
        true
    }
}

/// Plain FIFO delivery.
#[derive(Debug, Default, Clone, Copy)]
pub struct Fifo;

impl QueueDiscipline for Fifo {}

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<Message>,
    /// Bumped on every enqueue and wake.
    version: u64,
    /// Version at which the processing condition last rejected the head.
    stalled_at: Option<u64>,
    /// Set at shutdown; `take_next` stops blocking.
    closed: bool,
}

impl QueueState {
    fn is_ready(&self) -> bool {
        self.closed || (!self.messages.is_empty() && self.stalled_at != Some(self.version))
    }

    fn renumber(&mut self) {
        for (i, msg) in self.messages.iter_mut().enumerate() {
            msg.position_in_queue = Some(i);
        }
    }
}

#[derive(Debug, Default)]
pub struct MessageQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl MessageQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends at the tail and wakes the process thread.
    pub fn enqueue(&self, mut message: Message) {
        let mut state = self.lock();
        message.position_in_queue = Some(state.messages.len());
        state.messages.push_back(message);
        state.version += 1;
        self.ready.notify_all();
    }

    /// Forces a stalled queue to re-evaluate its hooks.
    pub fn wake(&self) {
        let mut state = self.lock();
        state.version += 1;
        self.ready.notify_all();
    }

    /// Blocks until a message is available, then runs the discipline hooks.
    ///
    /// Returns a copy of the head, which stays queued until `remove_first`,
    /// or the empty sentinel when the processing condition holds it back.
    pub fn take_next<D: QueueDiscipline + ?Sized>(&self, discipline: &mut D) -> Message {
        let mut state = self.lock();
        while !state.is_ready() {
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        if state.closed {
            return Message::empty();
        }

        discipline.arrange(&mut state.messages);
        state.renumber();

        let admitted = match state.messages.front() {
            Some(head) => discipline.processing_condition(head),
            // `arrange` drained everything
            None => false,
        };
        if admitted {
            state.stalled_at = None;
            state.messages.front().cloned().unwrap_or_else(Message::empty)
        } else {
            state.stalled_at = Some(state.version);
            Message::empty()
        }
    }

    /// Removes and returns the head.
    pub fn remove_first(&self) -> Option<Message> {
        let mut state = self.lock();
        let head = state.messages.pop_front();
        state.renumber();
        head
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().messages.is_empty()
    }

    /// Copy of the pending messages in delivery order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.lock().messages.iter().cloned().collect()
    }

    /// Releases the process thread for good.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.ready.notify_all();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.messages.clear();
        state.stalled_at = None;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{mpsc, Arc},
        thread,
        time::Duration,
    };

    use dsim_common::MessageType;

    use super::*;

    fn numbered(n: i64) -> Message {
        Message::new(MessageType::Forwarded).with_field("n", n)
    }

    fn n(msg: &Message) -> i64 {
        msg.field("n").and_then(|v| v.as_int()).unwrap()
    }

    #[test]
    fn test_fifo_order() {
        let queue = MessageQueue::new();
        for i in 0..5 {
            queue.enqueue(numbered(i));
        }
        for i in 0..5 {
            let head = queue.take_next(&mut Fifo);
            assert_eq!(n(&head), i);
            assert_eq!(head.position_in_queue, Some(0));
            assert_eq!(n(&queue.remove_first().unwrap()), i);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_take_next_blocks_until_enqueue() {
        let queue = Arc::new(MessageQueue::new());
        let (tx, rx) = mpsc::channel();
        let taker = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let head = queue.take_next(&mut Fifo);
                tx.send(n(&head)).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        queue.enqueue(numbered(42));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        taker.join().unwrap();
    }

    struct Priority;

    impl QueueDiscipline for Priority {
        fn arrange(&mut self, queue: &mut VecDeque<Message>) {
            queue.make_contiguous().sort_by_key(|m| -n(m));
        }
    }

    #[test]
    fn test_arrange_reorders_before_delivery() {
        let queue = MessageQueue::new();
        queue.enqueue(numbered(1));
        queue.enqueue(numbered(7));
        queue.enqueue(numbered(3));

        let head = queue.take_next(&mut Priority);
        assert_eq!(n(&head), 7);
        assert_eq!(n(&queue.remove_first().unwrap()), 7);
        let positions: Vec<_> = queue
            .snapshot()
            .iter()
            .map(|m| m.position_in_queue)
            .collect();
        assert_eq!(positions, vec![Some(0), Some(1)]);
    }

    /// Holds back everything until at least `min` messages are queued.
    struct Batch {
        min: usize,
        seen: usize,
    }

    impl QueueDiscipline for Batch {
        fn arrange(&mut self, queue: &mut VecDeque<Message>) {
            self.seen = queue.len();
        }

        fn processing_condition(&mut self, _head: &Message) -> bool {
            self.seen >= self.min
        }
    }

    #[test]
    fn test_rejected_head_returns_sentinel_and_stalls() {
        let queue = Arc::new(MessageQueue::new());
        queue.enqueue(numbered(1));

        let mut batch = Batch { min: 2, seen: 0 };
        let sentinel = queue.take_next(&mut batch);
        assert!(sentinel.is_empty());
        assert_eq!(queue.len(), 1);

        // Stalled: the next take_next waits for a change instead of spinning
        let (tx, rx) = mpsc::channel();
        let taker = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let head = queue.take_next(&mut batch);
                tx.send(n(&head)).unwrap();
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        queue.enqueue(numbered(2));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        taker.join().unwrap();
    }

    #[test]
    fn test_wake_reevaluates_stalled_queue() {
        let queue = MessageQueue::new();
        queue.enqueue(numbered(5));
        let mut closed = Batch { min: 9, seen: 0 };
        assert!(queue.take_next(&mut closed).is_empty());

        queue.wake();
        let head = queue.take_next(&mut Fifo);
        assert_eq!(n(&head), 5);
    }

    #[test]
    fn test_close_unblocks_waiting_taker() {
        let queue = Arc::new(MessageQueue::new());
        let (tx, rx) = mpsc::channel();
        let taker = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                tx.send(queue.take_next(&mut Fifo).is_empty()).unwrap();
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        queue.close();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(queue.is_closed());
        taker.join().unwrap();
    }
}
