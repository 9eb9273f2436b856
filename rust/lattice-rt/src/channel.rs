//! Unbounded channels shared between VM threads.
//!
//! A [`Channel`] is a mutex-protected queue with a close flag and a list of
//! [`SelectWaiter`]s. `send` wakes blocked receivers and every registered
//! waiter; `close` does the same so that blocked selects can re-poll.

use crate::values::Value;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("send on closed channel")]
    Closed,
}

/// Error returned by [`Channel::try_recv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    /// Nothing queued, channel still open.
    Empty,
    /// Closed and drained.
    Disconnected,
}

// ---------------------------------------------------------------------------
// Waiters
// ---------------------------------------------------------------------------

/// Wake-up token a blocked `select` registers on every candidate channel.
#[derive(Debug, Default)]
pub struct SelectWaiter {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl SelectWaiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn notify(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cond.notify_all();
    }

    /// Block until notified or until `deadline` passes. Returns `true` when
    /// woken by a notification. The signal is consumed.
    pub fn wait(&self, deadline: Option<Instant>) -> bool {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            match deadline {
                Some(at) => {
                    if self.cond.wait_until(&mut signaled, at).timed_out() {
                        break;
                    }
                }
                None => self.cond.wait(&mut signaled),
            }
        }
        std::mem::replace(&mut *signaled, false)
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

#[derive(Default)]
struct State {
    queue: VecDeque<Value>,
    closed: bool,
    waiters: Vec<Arc<SelectWaiter>>,
}

#[derive(Default)]
pub struct Channel {
    state: Mutex<State>,
    ready: Condvar,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Channel")
            .field("queued", &state.queue.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl Channel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn send(&self, value: Value) -> Result<(), ChannelError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ChannelError::Closed);
        }
        state.queue.push_back(value);
        self.ready.notify_one();
        for waiter in &state.waiters {
            waiter.notify();
        }
        Ok(())
    }

    pub fn try_recv(&self) -> Result<Value, TryRecvError> {
        let mut state = self.state.lock();
        match state.queue.pop_front() {
            Some(v) => Ok(v),
            None if state.closed => Err(TryRecvError::Disconnected),
            None => Err(TryRecvError::Empty),
        }
    }

    /// Block until a value arrives. `None` once closed and drained.
    pub fn recv(&self) -> Option<Value> {
        let mut state = self.state.lock();
        loop {
            if let Some(v) = state.queue.pop_front() {
                return Some(v);
            }
            if state.closed {
                return None;
            }
            self.ready.wait(&mut state);
        }
    }

    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.ready.notify_all();
        for waiter in &state.waiters {
            waiter.notify();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add_waiter(&self, waiter: &Arc<SelectWaiter>) {
        self.state.lock().waiters.push(Arc::clone(waiter));
    }

    pub fn remove_waiter(&self, waiter: &Arc<SelectWaiter>) {
        self.state
            .lock()
            .waiters
            .retain(|w| !Arc::ptr_eq(w, waiter));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_order_and_close_semantics() {
        let ch = Channel::new();
        ch.send(Value::int(1)).unwrap();
        ch.send(Value::int(2)).unwrap();
        ch.close();
        assert_eq!(ch.send(Value::int(3)), Err(ChannelError::Closed));
        assert_eq!(ch.try_recv().unwrap(), Value::int(1));
        assert_eq!(ch.recv(), Some(Value::int(2)));
        assert_eq!(ch.try_recv().unwrap_err(), TryRecvError::Disconnected);
        assert_eq!(ch.recv(), None);
    }

    #[test]
    fn recv_blocks_until_send_from_other_thread() {
        let ch = Channel::new();
        let tx = Arc::clone(&ch);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            tx.send(Value::string("late")).unwrap();
        });
        assert_eq!(ch.recv(), Some(Value::string("late")));
        handle.join().unwrap();
    }

    #[test]
    fn waiter_is_notified_by_send() {
        let ch = Channel::new();
        let waiter = SelectWaiter::new();
        ch.add_waiter(&waiter);
        let tx = Arc::clone(&ch);
        let handle = thread::spawn(move || tx.send(Value::int(9)).unwrap());
        assert!(waiter.wait(Some(Instant::now() + Duration::from_secs(5))));
        handle.join().unwrap();
        ch.remove_waiter(&waiter);
        assert_eq!(ch.try_recv().unwrap(), Value::int(9));
    }

    #[test]
    fn waiter_times_out() {
        let waiter = SelectWaiter::new();
        let start = Instant::now();
        assert!(!waiter.wait(Some(start + Duration::from_millis(20))));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
