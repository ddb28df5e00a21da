//! An ownership-tracking, re-entrant mutex with direct FIFO hand-off
//! to the next waiter at release time.

use core::cell::UnsafeCell;

use crate::kernel::{CriticalSection, Kernel};
use crate::wait::{Deadline, Ticks};

struct MutexState<K: Kernel> {
    owner: Option<K::TaskHandle>,
    count: u32,
    waiting_to_take: K::EventList,
}

/// A mutex the owning task may re-acquire any number of times; it is
/// only released to another task once every acquire has a matching
/// release (or `give(true)` is used to release all at once).
pub struct RecursiveMutex<K: Kernel> {
    kernel: K,
    state: UnsafeCell<MutexState<K>>,
}

// SAFETY: all access to `state` goes through the kernel's critical
// section.
unsafe impl<K: Kernel + Send> Sync for RecursiveMutex<K> {}

impl<K: Kernel> RecursiveMutex<K> {
    /// Creates an unowned mutex.
    pub fn create(kernel: K) -> Self {
        Self {
            kernel,
            state: UnsafeCell::new(MutexState {
                owner: None,
                count: 0,
                waiting_to_take: Default::default(),
            }),
        }
    }

    /// Acquires the mutex, blocking up to `ticks` if another task
    /// currently owns it. Re-entrant: the current owner always
    /// succeeds immediately and its depth count increases by one.
    pub fn take(&self, ticks: Ticks) -> bool {
        let deadline = Deadline::from_ticks(self.kernel.tick_count(), ticks);
        loop {
            let _cs = CriticalSection::enter(&self.kernel);
            // SAFETY: exclusive access is guaranteed by the critical section.
            let state = unsafe { &mut *self.state.get() };
            let current = self.kernel.current_task();

            if state.owner == Some(current) {
                state.count += 1;
                return true;
            }
            if state.owner.is_none() {
                state.owner = Some(current);
                state.count = 1;
                return true;
            }

            let deadline = match deadline {
                Some(d) => d,
                None => return false,
            };
            if deadline.has_elapsed(self.kernel.tick_count()) {
                return false;
            }

            self.kernel.wait_on_event_list(&state.waiting_to_take, deadline);
            // Hand-off (see `give`) sets `owner` directly, so the loop's
            // top re-check is all that's needed on wake: either we now
            // own it, or our deadline ran out and we'll observe that
            // next iteration.
        }
    }

    /// Releases one level of ownership (or all of them, if
    /// `release_all`). Returns `false` if the caller does not own the
    /// mutex. Hands off directly to the next waiter, if any, rather
    /// than leaving it free for contended re-acquisition.
    pub fn give(&self, release_all: bool) -> bool {
        let _cs = CriticalSection::enter(&self.kernel);
        // SAFETY: exclusive access is guaranteed by the critical section.
        let state = unsafe { &mut *self.state.get() };
        let current = self.kernel.current_task();

        if state.owner != Some(current) {
            return false;
        }

        if release_all {
            state.count = 0;
        } else {
            state.count -= 1;
            if state.count > 0 {
                return true;
            }
        }

        match self.kernel.list_head_owner(&state.waiting_to_take) {
            Some(next) => {
                state.owner = Some(next);
                state.count = 1;
                if self.kernel.remove_from_event_list(&state.waiting_to_take) {
                    self.kernel.yield_now();
                }
            }
            None => state.owner = None,
        }

        true
    }

    /// Whether the calling task currently owns the mutex.
    pub fn do_i_own(&self) -> bool {
        let _cs = CriticalSection::enter(&self.kernel);
        // SAFETY: exclusive access is guaranteed by the critical section.
        let state = unsafe { &*self.state.get() };
        state.owner == Some(self.kernel.current_task())
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::mock::StdKernel;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn recursive_take_increments_depth() {
        let m = RecursiveMutex::create(StdKernel::new());
        assert!(m.take(Ticks::NonBlocking));
        assert!(m.take(Ticks::NonBlocking));
        assert!(m.take(Ticks::NonBlocking));
        assert!(m.do_i_own());

        assert!(m.give(false));
        assert!(m.do_i_own());
        assert!(m.give(false));
        assert!(m.do_i_own());
        assert!(m.give(false));
        assert!(!m.do_i_own());
    }

    #[test]
    fn give_without_ownership_fails() {
        let m = Arc::new(RecursiveMutex::create(StdKernel::new()));
        assert!(m.take(Ticks::NonBlocking));

        let other = {
            let m = m.clone();
            thread::spawn(move || m.give(false))
        };
        assert!(!other.join().unwrap());
        assert!(m.do_i_own());
    }

    #[test]
    fn release_all_drops_full_depth_at_once() {
        let m = Arc::new(RecursiveMutex::create(StdKernel::new()));
        m.take(Ticks::NonBlocking);
        m.take(Ticks::NonBlocking);
        m.take(Ticks::NonBlocking);

        let waiter = {
            let m = m.clone();
            thread::spawn(move || m.take(Ticks::Forever))
        };
        thread::sleep(Duration::from_millis(20));

        assert!(m.give(true));
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn hand_off_is_fifo() {
        let m = Arc::new(RecursiveMutex::create(StdKernel::new()));
        assert!(m.take(Ticks::NonBlocking));

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for id in 0..3u8 {
            let m = m.clone();
            let order = order.clone();
            handles.push(thread::spawn(move || {
                m.take(Ticks::Forever);
                order.lock().unwrap().push(id);
                m.give(false);
            }));
            thread::sleep(Duration::from_millis(15));
        }

        m.give(false);
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }
}
