//! The abstract collaborator every primitive in this crate is generic
//! over: critical sections, task handles, event lists, and the tick
//! counter that the host RTOS actually owns.

use core::ptr::NonNull;

use crate::wait::Deadline;

/// Everything [`crate::flexiqueue::FlexiQueue`] and
/// [`crate::mutex::RecursiveMutex`] need from the host kernel.
///
/// An implementation is expected to be a cheap, cloneable handle onto
/// kernel-owned state (a zero-sized type calling into the RTOS's own
/// global scheduler, or — as in [`crate::mock::StdKernel`] — an `Arc`
/// around a small bundle of `std` synchronization primitives).
pub trait Kernel {
    /// Opaque identifier for a task, as handed back by `current_task`.
    type TaskHandle: Copy + Eq;

    /// A FIFO list of parked tasks. An empty list is exactly a
    /// default-constructed one, standing in for the source's
    /// `init_list` entry point.
    type EventList: Default;

    /// Disables interrupts on the calling core. Nestable: a kernel must
    /// track nesting depth itself and only actually unmask on the
    /// matching outermost `exit_critical`.
    fn enter_critical(&self);

    /// Reverses one level of `enter_critical` nesting.
    fn exit_critical(&self);

    /// The task currently executing on the calling core.
    fn current_task(&self) -> Self::TaskHandle;

    /// Monotonic tick counter. Wraps; callers compare deadlines with
    /// wrapping-aware arithmetic rather than assuming it never wraps.
    fn tick_count(&self) -> u32;

    /// Reads the per-task scratch slot used to pass a requested size
    /// (receive-buffer capacity for a reader, payload size for a
    /// writer) from a parked task to whoever grants it.
    fn get_extra_param(&self, task: Self::TaskHandle) -> usize;

    /// Writes the per-task scratch slot. Always called by the task
    /// itself, immediately before parking on `list`.
    fn set_extra_param(&self, task: Self::TaskHandle, value: usize);

    /// Registers the current task on `list` and blocks until another
    /// task removes it via `remove_from_event_list`, or until
    /// `deadline` elapses, whichever comes first. Must be called while
    /// holding a critical section; implementations release it for the
    /// duration of the wait and restore the original nesting depth
    /// before returning, so the caller observes no difference in lock
    /// state across the call.
    fn wait_on_event_list(&self, list: &Self::EventList, deadline: Deadline);

    /// Unblocks the head of `list`, if any. Returns whether the
    /// unblocked task should preempt the caller (higher priority).
    /// A no-op returning `false` if `list` is empty.
    fn remove_from_event_list(&self, list: &Self::EventList) -> bool;

    /// The task at the head of `list`, without removing it.
    fn list_head_owner(&self, list: &Self::EventList) -> Option<Self::TaskHandle>;

    /// Whether `list` currently has no parked tasks.
    fn list_is_empty(&self, list: &Self::EventList) -> bool;

    /// A pure scheduling hint: gives a just-unblocked, higher-priority
    /// task the chance to run before the caller's own critical section
    /// exits. Must never block the caller — this is not the blocking
    /// wait (that's `wait_on_event_list`).
    fn yield_now(&self);

    /// Allocates `len` bytes for a queue's ring buffer.
    fn alloc(&self, len: usize) -> Option<NonNull<u8>>;

    /// Releases a buffer returned by `alloc`.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by a prior call to `alloc` on the
    /// same kernel instance with the same `len`, and must not be used
    /// again afterwards.
    unsafe fn dealloc(&self, ptr: NonNull<u8>, len: usize);
}

/// RAII guard around [`Kernel::enter_critical`] /
/// [`Kernel::exit_critical`], released on every exit path including
/// early returns.
pub(crate) struct CriticalSection<'k, K: Kernel> {
    kernel: &'k K,
}

impl<'k, K: Kernel> CriticalSection<'k, K> {
    pub(crate) fn enter(kernel: &'k K) -> Self {
        kernel.enter_critical();
        Self { kernel }
    }
}

impl<K: Kernel> Drop for CriticalSection<'_, K> {
    fn drop(&mut self) {
        self.kernel.exit_critical();
    }
}
