use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use super::timestamp::Timestamp;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one scheduled timer, monotonically assigned so `cancel` can
/// never accidentally target a timer created later at the same fd/slot.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct TimerId(u64);

pub type TimerCallback = Box<dyn FnMut() + Send>;

pub(crate) struct Timer {
    callback: TimerCallback,
    expiration: Timestamp,
    interval: f64,
    repeat: bool,
    id: TimerId,
}

impl Timer {
    fn new(callback: TimerCallback, when: Timestamp, interval: f64) -> Timer {
        let id = TimerId(NEXT_TIMER_ID.fetch_add(1, AtomicOrdering::Relaxed));
        Timer {
            callback,
            expiration: when,
            interval,
            repeat: interval > 0.0,
            id,
        }
    }

    pub(crate) fn run(&mut self) {
        (self.callback)();
    }

    fn restart(&mut self, now: Timestamp) {
        if self.repeat {
            self.expiration = now.after(self.interval);
        } else {
            self.expiration = Timestamp::invalid();
        }
    }
}

// BinaryHeap is a max-heap; reverse the ordering on expiration so the
// earliest-expiring timer sorts to the top.
impl Eq for Timer {}

impl PartialEq for Timer {
    fn eq(&self, other: &Timer) -> bool {
        self.expiration == other.expiration && self.id == other.id
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Timer) -> Ordering {
        other.expiration.cmp(&self.expiration).then_with(|| other.id.0.cmp(&self.id.0))
    }
}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Timer) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of pending timers plus a side table for O(1) cancellation.
#[derive(Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Timer>,
    active: HashMap<TimerId, Timestamp>,
}

impl TimerQueue {
    pub fn new() -> TimerQueue {
        TimerQueue { heap: BinaryHeap::new(), active: HashMap::new() }
    }

    pub fn add_timer(&mut self, callback: TimerCallback, when: Timestamp, interval: f64) -> TimerId {
        let timer = Timer::new(callback, when, interval);
        let id = timer.id;
        self.active.insert(id, timer.expiration);
        self.heap.push(timer);
        id
    }

    /// Cancellation is lazy: the timer stays in the heap (binary heaps don't
    /// support efficient arbitrary removal) but is dropped from `active`, so
    /// `handle_expired` skips it without running its callback when popped.
    pub fn cancel(&mut self, id: TimerId) {
        self.active.remove(&id);
    }

    pub fn is_active(&self, id: TimerId) -> bool {
        self.active.contains_key(&id)
    }

    /// Pops and runs every timer whose expiration has passed, re-arming
    /// repeating ones. Returns the number of callbacks actually invoked.
    pub fn handle_expired(&mut self, now: Timestamp) -> usize {
        let mut ran = 0;

        while let Some(top) = self.heap.peek() {
            if top.expiration > now {
                break;
            }

            let mut timer = self.heap.pop().unwrap();
            if !self.active.contains_key(&timer.id) {
                continue;
            }

            timer.run();
            ran += 1;

            if timer.repeat {
                timer.restart(Timestamp::now());
                self.active.insert(timer.id, timer.expiration);
                self.heap.push(timer);
            } else {
                self.active.remove(&timer.id);
            }
        }

        ran
    }

    /// Removes every expired timer from the heap without running its
    /// callback, for callers (like `EventLoop`) that must not hold this
    /// queue's lock while a callback runs: a callback that itself adds,
    /// cancels, or is scheduled by another timer would otherwise deadlock
    /// against a single non-reentrant lock.
    pub(crate) fn pop_expired(&mut self, now: Timestamp) -> Vec<Timer> {
        let mut expired = Vec::new();

        while let Some(top) = self.heap.peek() {
            if top.expiration > now {
                break;
            }

            let timer = self.heap.pop().unwrap();
            if !self.active.contains_key(&timer.id) {
                continue;
            }

            expired.push(timer);
        }

        expired
    }

    /// Re-arms `timer` if it repeats and wasn't cancelled while its
    /// callback was running; otherwise drops it from the active set.
    pub(crate) fn reinsert_if_repeating(&mut self, mut timer: Timer, now: Timestamp) {
        if timer.repeat && self.active.contains_key(&timer.id) {
            timer.restart(now);
            self.active.insert(timer.id, timer.expiration);
            self.heap.push(timer);
        } else {
            self.active.remove(&timer.id);
        }
    }

    /// Drops cancelled timers sitting at the heap head. Cancellation only
    /// removes a timer from `active`; without this, a cancelled timer that
    /// isn't expired yet would sit at the head indefinitely and
    /// `next_timeout_ms` would report a `0` timeout on every call until it
    /// naturally expired, spinning the loop instead of sleeping.
    fn discard_cancelled_heads(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.active.contains_key(&top.id) {
                break;
            }
            self.heap.pop();
        }
    }

    /// Milliseconds until the next timer fires, or `-1` if there is none
    /// (matching the "block forever" convention `EventLoop::loop` passes to
    /// `Poller::poll`'s timeout parameter).
    pub fn next_timeout_ms(&mut self) -> i64 {
        self.discard_cancelled_heads();

        match self.heap.peek() {
            Some(top) => {
                let diff = top.expiration.diff(Timestamp::now());
                if diff <= 0.0 {
                    0
                } else {
                    (diff * 1000.0).ceil() as i64
                }
            }
            None => -1,
        }
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn fires_in_expiration_order() {
        let mut q = TimerQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let now = Timestamp::now();
        for (i, delay) in [0.03, 0.01, 0.02].iter().enumerate() {
            let order = order.clone();
            q.add_timer(Box::new(move || order.lock().unwrap().push(i)), now.after(*delay), 0.0);
        }

        std::thread::sleep(std::time::Duration::from_millis(50));
        q.handle_expired(Timestamp::now());

        assert_eq!(*order.lock().unwrap(), vec![1, 2, 0]);
        assert!(q.is_empty());
    }

    #[test]
    fn repeating_timer_reinserts_itself() {
        let mut q = TimerQueue::new();
        let count = Arc::new(Mutex::new(0));
        let count2 = count.clone();

        let now = Timestamp::now();
        let id = q.add_timer(Box::new(move || *count2.lock().unwrap() += 1), now, 0.01);

        for _ in 0..3 {
            std::thread::sleep(std::time::Duration::from_millis(15));
            q.handle_expired(Timestamp::now());
        }

        assert!(*count.lock().unwrap() >= 2);
        assert!(q.is_active(id));
    }

    #[test]
    fn cancel_prevents_callback_from_running() {
        let mut q = TimerQueue::new();
        let ran = Arc::new(Mutex::new(false));
        let ran2 = ran.clone();

        let now = Timestamp::now();
        let id = q.add_timer(Box::new(move || *ran2.lock().unwrap() = true), now, 0.0);
        q.cancel(id);

        q.handle_expired(Timestamp::now());
        assert!(!*ran.lock().unwrap());
    }
}
