//! Blocking primitives for the cooperative host tasks
//!
//! The host tasks are state machines that are polled, so a "blocking"
//! wait is a check that either succeeds or returns [`Poll::Pending`].
//! The primitives here never spin.
//!
//! The interrupt handler posts to a [`Semaphore`] and pushes into an
//! [`EventQueue`]; the task waits on them.

use core::{
    sync::atomic::{AtomicBool, Ordering},
    task::Poll,
};

use crate::error::{Error, Result};

/// A source of milliseconds
///
/// Wraps at `u32::MAX`; the host only compares differences.
pub trait Clock {
    fn now_ms(&self) -> u32;
}

/// Binary semaphore
pub struct Semaphore(AtomicBool);

impl Semaphore {
    pub const fn new() -> Self {
        Semaphore(AtomicBool::new(false))
    }
    /// Signal the semaphore. Safe to call from an interrupt.
    pub fn post(&self) {
        self.0.store(true, Ordering::Release);
    }
    /// Take the semaphore if it's signaled
    pub fn try_wait(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Mutual exclusion flag
///
/// There's no ownership tracking; whoever acquires the mutex must release it.
pub struct Mutex(AtomicBool);

impl Mutex {
    pub const fn new() -> Self {
        Mutex(AtomicBool::new(false))
    }
    pub fn try_lock(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
    pub fn release(&self) {
        self.0.store(false, Ordering::Release);
    }
    pub fn is_locked(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
    pub fn reset(&self) {
        self.release();
    }
}

/// A timed wait, started on first use
///
/// The owner keeps the deadline alive across polls.
#[derive(Default)]
pub struct Deadline {
    start: Option<u32>,
}

impl Deadline {
    pub const fn new() -> Self {
        Deadline { start: None }
    }

    /// Forget any wait in progress
    pub fn clear(&mut self) {
        self.start = None;
    }

    /// Returns `true` once `ms` milliseconds have passed since the first call.
    pub fn elapsed(&mut self, clock: &dyn Clock, ms: u32) -> bool {
        let now = clock.now_ms();
        let start = *self.start.get_or_insert(now);
        now.wrapping_sub(start) >= ms
    }

    /// Delay for `ms` milliseconds
    pub fn delay(&mut self, clock: &dyn Clock, ms: u32) -> Poll<()> {
        if self.elapsed(clock, ms) {
            self.clear();
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }

    /// Wait for `ready` to return `true`, for at most `ms` milliseconds.
    pub fn wait(&mut self, clock: &dyn Clock, ms: u32, ready: impl FnOnce() -> bool) -> Poll<Result<()>> {
        if ready() {
            self.clear();
            Poll::Ready(Ok(()))
        } else if self.elapsed(clock, ms) {
            self.clear();
            Poll::Ready(Err(Error::Timeout))
        } else {
            Poll::Pending
        }
    }
}

/// FIFO message queue
///
/// Holds `N - 1` messages.
pub struct EventQueue<T, const N: usize> {
    queue: heapless::spsc::Queue<T, N>,
}

impl<T, const N: usize> EventQueue<T, N> {
    pub const fn new() -> Self {
        EventQueue {
            queue: heapless::spsc::Queue::new(),
        }
    }

    /// Enqueue a message, handing it back if the queue is full
    pub fn send(&mut self, msg: T) -> core::result::Result<(), T> {
        self.queue.enqueue(msg)
    }

    pub fn receive(&mut self) -> Option<T> {
        self.queue.dequeue()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::{Clock, Deadline, Error, EventQueue, Mutex, Semaphore};
    use core::{cell::Cell, task::Poll};

    /// A clock that only moves when told
    #[derive(Default)]
    pub struct ManualClock(Cell<u32>);

    impl ManualClock {
        pub fn advance(&self, ms: u32) {
            self.0.set(self.0.get().wrapping_add(ms));
        }
    }

    impl Clock for ManualClock {
        fn now_ms(&self) -> u32 {
            self.0.get()
        }
    }

    impl Clock for &'_ ManualClock {
        fn now_ms(&self) -> u32 {
            self.0.get()
        }
    }

    #[test]
    fn semaphore() {
        let sem = Semaphore::new();
        assert!(!sem.try_wait());
        sem.post();
        sem.post();
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
        sem.post();
        sem.reset();
        assert!(!sem.try_wait());
    }

    #[test]
    fn mutex() {
        let mutex = Mutex::new();
        assert!(mutex.try_lock());
        assert!(!mutex.try_lock());
        mutex.release();
        assert!(mutex.try_lock());
        mutex.reset();
        assert!(!mutex.is_locked());
    }

    #[test]
    fn delay() {
        let clock = ManualClock::default();
        let mut deadline = Deadline::new();
        assert_eq!(deadline.delay(&clock, 10), Poll::Pending);
        clock.advance(9);
        assert_eq!(deadline.delay(&clock, 10), Poll::Pending);
        clock.advance(1);
        assert_eq!(deadline.delay(&clock, 10), Poll::Ready(()));
        // Restarts after completing
        assert_eq!(deadline.delay(&clock, 10), Poll::Pending);
    }

    #[test]
    fn delay_across_wrap() {
        let clock = ManualClock::default();
        clock.advance(u32::MAX - 2);
        let mut deadline = Deadline::new();
        assert_eq!(deadline.delay(&clock, 5), Poll::Pending);
        clock.advance(5);
        assert_eq!(deadline.delay(&clock, 5), Poll::Ready(()));
    }

    #[test]
    fn wait_timeout() {
        let clock = ManualClock::default();
        let mut deadline = Deadline::new();
        assert_eq!(deadline.wait(&clock, 3, || false), Poll::Pending);
        clock.advance(3);
        assert_eq!(deadline.wait(&clock, 3, || false), Poll::Ready(Err(Error::Timeout)));
        assert_eq!(deadline.wait(&clock, 3, || true), Poll::Ready(Ok(())));
    }

    #[test]
    fn queue_fifo() {
        let mut queue: EventQueue<u8, 4> = EventQueue::new();
        assert!(queue.send(1).is_ok());
        assert!(queue.send(2).is_ok());
        assert!(queue.send(3).is_ok());
        assert_eq!(queue.send(4), Err(4));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.receive(), Some(1));
        assert_eq!(queue.receive(), Some(2));
        assert_eq!(queue.receive(), Some(3));
        assert!(queue.is_empty());
    }
}
