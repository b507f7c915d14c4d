//! Published-frame counter with a wakeup for blocked consumers.
//!
//! The count only moves in whole batches and only after every frame of the
//! batch is in the cache. Readers that see `published() > n` can therefore
//! take frame `n`.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

pub struct PublishedCount {
    state: Mutex<State>,
    advanced: Condvar,
}

#[derive(Default)]
struct State {
    published: u64,
    closed: bool,
}

impl PublishedCount {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            advanced: Condvar::new(),
        }
    }

    /// Number of frames published so far.
    pub fn published(&self) -> u64 {
        self.state.lock().published
    }

    /// Highest ready id, or 0 when nothing has been published.
    pub fn current_frame_number(&self) -> u64 {
        self.published().saturating_sub(1)
    }

    /// Publish a whole batch in one step and wake every waiter.
    pub fn advance(&self, count: u64) -> u64 {
        let published = {
            let mut state = self.state.lock();
            state.published += count;
            state.published
        };
        self.advanced.notify_all();
        published
    }

    /// Block until `id` is published. Returns false on timeout or close.
    pub fn wait_until_ready(&self, id: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.published <= id {
            if state.closed {
                return false;
            }
            if self.advanced.wait_until(&mut state, deadline).timed_out() {
                return state.published > id;
            }
        }
        true
    }

    /// Wake all waiters; later waits for unpublished ids return immediately.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.advanced.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl Default for PublishedCount {
    fn default() -> Self {
        Self::new()
    }
}
