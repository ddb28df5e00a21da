//! A host-side [`Kernel`] built from real OS threads and `std`
//! synchronization primitives. Used by this crate's own test suite to
//! exercise [`crate::flexiqueue::FlexiQueue`] and
//! [`crate::mutex::RecursiveMutex`] without real hardware — the same
//! role the teacher's own `std_support` shims play for its
//! hardware-specific primitives, generalized here to the abstract
//! [`Kernel`] trait instead of one concrete syscall surface.

extern crate std;

use std::alloc::{self, Layout};
use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use crate::kernel::Kernel;
use crate::wait::Deadline;

/// FIFO list of threads parked on a [`FlexiQueue`](crate::flexiqueue::FlexiQueue)
/// or [`RecursiveMutex`](crate::mutex::RecursiveMutex).
#[derive(Default)]
pub struct EventList {
    waiters: Mutex<VecDeque<ThreadId>>,
}

struct ParkRecord {
    woken: Mutex<bool>,
    cv: Condvar,
}

impl ParkRecord {
    fn new() -> Self {
        Self { woken: Mutex::new(false), cv: Condvar::new() }
    }
}

/// A lock that, unlike `std::sync::Mutex`, may be re-entered by the
/// thread that already holds it — needed because `wait_on_event_list`
/// must release the calling task's *entire* critical-section nesting
/// depth for the duration of a wait, then restore it.
struct ReentrantLock {
    state: Mutex<LockState>,
    cv: Condvar,
}

#[derive(Default)]
struct LockState {
    owner: Option<ThreadId>,
    depth: u32,
}

impl ReentrantLock {
    fn new() -> Self {
        Self { state: Mutex::new(LockState::default()), cv: Condvar::new() }
    }

    fn enter(&self) {
        let me = std::thread::current().id();
        let mut state = self.state.lock().unwrap();
        loop {
            match state.owner {
                Some(owner) if owner == me => {
                    state.depth += 1;
                    return;
                }
                None => {
                    state.owner = Some(me);
                    state.depth = 1;
                    return;
                }
                Some(_) => {
                    state = self.cv.wait(state).unwrap();
                }
            }
        }
    }

    fn exit(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert_eq!(state.owner, Some(std::thread::current().id()));
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.cv.notify_all();
        }
    }

    fn depth(&self) -> u32 {
        self.state.lock().unwrap().depth
    }
}

struct Inner {
    lock: ReentrantLock,
    start: Instant,
    extra_params: Mutex<HashMap<ThreadId, usize>>,
    parks: Mutex<HashMap<ThreadId, Arc<ParkRecord>>>,
}

/// Host-side [`Kernel`] implementation. Cheap to clone: it's a handle
/// onto shared state, the same way a real RTOS binding would be a
/// handle onto the one true scheduler.
#[derive(Clone)]
pub struct StdKernel {
    inner: Arc<Inner>,
}

impl Default for StdKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl StdKernel {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                lock: ReentrantLock::new(),
                start: Instant::now(),
                extra_params: Mutex::new(HashMap::new()),
                parks: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn park_record(&self, task: ThreadId) -> Arc<ParkRecord> {
        self.inner
            .parks
            .lock()
            .unwrap()
            .entry(task)
            .or_insert_with(|| Arc::new(ParkRecord::new()))
            .clone()
    }
}

impl Kernel for StdKernel {
    type TaskHandle = ThreadId;
    type EventList = EventList;

    fn enter_critical(&self) {
        self.inner.lock.enter();
    }

    fn exit_critical(&self) {
        self.inner.lock.exit();
    }

    fn current_task(&self) -> ThreadId {
        std::thread::current().id()
    }

    fn tick_count(&self) -> u32 {
        self.inner.start.elapsed().as_millis() as u32
    }

    fn get_extra_param(&self, task: ThreadId) -> usize {
        *self.inner.extra_params.lock().unwrap().get(&task).unwrap_or(&0)
    }

    fn set_extra_param(&self, task: ThreadId, value: usize) {
        self.inner.extra_params.lock().unwrap().insert(task, value);
    }

    fn wait_on_event_list(&self, list: &EventList, deadline: Deadline) {
        let me = self.current_task();
        list.waiters.lock().unwrap().push_back(me);
        let rec = self.park_record(me);
        *rec.woken.lock().unwrap() = false;

        let depth = self.inner.lock.depth();
        for _ in 0..depth {
            self.inner.lock.exit();
        }

        let mut woken = rec.woken.lock().unwrap();
        while !*woken && !deadline.has_elapsed(self.tick_count()) {
            let (guard, _) = rec.cv.wait_timeout(woken, Duration::from_millis(2)).unwrap();
            woken = guard;
        }
        let was_woken = *woken;
        drop(woken);

        if !was_woken {
            let mut waiters = list.waiters.lock().unwrap();
            if let Some(pos) = waiters.iter().position(|&t| t == me) {
                waiters.remove(pos);
            }
        }

        for _ in 0..depth {
            self.inner.lock.enter();
        }
    }

    fn remove_from_event_list(&self, list: &EventList) -> bool {
        let head = list.waiters.lock().unwrap().pop_front();
        match head {
            Some(task) => {
                let rec = self.park_record(task);
                *rec.woken.lock().unwrap() = true;
                rec.cv.notify_all();
                true
            }
            None => false,
        }
    }

    fn list_head_owner(&self, list: &EventList) -> Option<ThreadId> {
        list.waiters.lock().unwrap().front().copied()
    }

    fn list_is_empty(&self, list: &EventList) -> bool {
        list.waiters.lock().unwrap().is_empty()
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }

    fn alloc(&self, len: usize) -> Option<NonNull<u8>> {
        if len == 0 {
            return Some(NonNull::dangling());
        }
        let layout = Layout::from_size_align(len, 1).ok()?;
        // SAFETY: `layout` has nonzero size.
        let ptr = unsafe { alloc::alloc(layout) };
        NonNull::new(ptr)
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, len: usize) {
        if len == 0 {
            return;
        }
        let layout = Layout::from_size_align(len, 1).unwrap();
        // SAFETY: `ptr` was returned by `alloc` with this same layout.
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_from_empty_list_is_a_no_op() {
        let kernel = StdKernel::new();
        let list = EventList::default();
        assert!(!kernel.remove_from_event_list(&list));
    }

    #[test]
    fn extra_param_round_trips() {
        let kernel = StdKernel::new();
        let me = kernel.current_task();
        kernel.set_extra_param(me, 42);
        assert_eq!(kernel.get_extra_param(me), 42);
    }

    #[test]
    fn critical_section_nests() {
        let kernel = StdKernel::new();
        kernel.enter_critical();
        kernel.enter_critical();
        assert_eq!(kernel.inner.lock.depth(), 2);
        kernel.exit_critical();
        assert_eq!(kernel.inner.lock.depth(), 1);
        kernel.exit_critical();
        assert_eq!(kernel.inner.lock.depth(), 0);
    }
}
