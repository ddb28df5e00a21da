//! A byte-oriented, variable-length message queue with blocking,
//! timeout, and ISR-safe entry points, plus an optional strict
//! chronology mode that turns wakeups into binding grants rather than
//! retry hints.

use core::cell::UnsafeCell;
use core::fmt;
use core::ptr::NonNull;

use bitflags::bitflags;
use log::{trace, warn};

use crate::kernel::{CriticalSection, Kernel};
use crate::ring::ByteRing;
use crate::varint::{self, decode_header, effective_size, encode_header};
use crate::wait::{Deadline, Ticks};

bitflags! {
    /// Runtime behavior switches for a [`FlexiQueue`]. Chosen at
    /// `create` time; a single binary can host queues in both
    /// chronology modes.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Mode: u8 {
        /// Yield immediately when a wakeup unblocks a higher-priority
        /// task, rather than waiting for the critical section's caller
        /// to eventually yield on its own.
        const SWITCH_IMMEDIATE = 0b001;
        /// Fold the "a task was unblocked" fact into the return value
        /// of the `_from_isr` entry points, so the ISR dispatcher knows
        /// to request a reschedule on exit.
        const SWITCH_IN_ISR = 0b010;
        /// Waiters are served in strict FIFO order: the head of each
        /// wait list is granted a binding claim on the next available
        /// item or free span, rather than merely being woken to retry.
        const STRICT_CHRONOLOGY = 0b100;
    }
}

bitflags! {
    /// Which waiter categories a [`FlexiQueue::flush`] call should
    /// unblock.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FlushFlags: u8 {
        const READING_TASKS = 0b01;
        const WRITING_TASKS = 0b10;
    }
}

/// Why [`FlexiQueue::create`] failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateError {
    /// The kernel's allocator could not satisfy the requested capacity.
    AllocationFailure,
}

impl fmt::Display for CreateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreateError::AllocationFailure => f.write_str("allocation failure"),
        }
    }
}

/// Why a [`FlexiQueue::read`] or [`FlexiQueue::read_from_isr`] call did
/// not deliver a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadError {
    /// No message was available before the deadline (or at all, for
    /// the non-blocking/ISR entry points).
    WouldBlock,
    /// The next message is larger than the caller's destination
    /// buffer. The message was not consumed.
    BufferTooSmall,
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::WouldBlock => f.write_str("would block"),
            ReadError::BufferTooSmall => f.write_str("destination buffer too small"),
        }
    }
}

/// Why a [`FlexiQueue::write`] or [`FlexiQueue::write_from_isr`] call
/// did not store a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteError {
    /// No room was available before the deadline (or at all, for the
    /// non-blocking/ISR entry points).
    WouldBlock,
    /// The item can never fit, regardless of how empty the queue is.
    TooLarge,
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::WouldBlock => f.write_str("would block"),
            WriteError::TooLarge => f.write_str("item too large for this queue's capacity"),
        }
    }
}

/// Result of a successful [`FlexiQueue::read_from_isr`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadIsr {
    /// Bytes delivered.
    pub size: usize,
    /// Whether a blocked writer was unblocked by this read.
    pub wake: bool,
}

impl ReadIsr {
    /// Reproduces the original ABI's encoding: the size, with bit 30
    /// set when a writer was woken.
    pub fn to_raw(&self) -> i32 {
        let mut raw = self.size as i32;
        if self.wake {
            raw |= 1 << 30;
        }
        raw
    }
}

/// Result of a successful [`FlexiQueue::write_from_isr`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteIsr {
    /// Whether a blocked reader was unblocked by this write.
    pub wake: bool,
}

impl WriteIsr {
    /// Reproduces the original ABI's encoding: `2` if a reader was
    /// woken, `1` otherwise.
    pub fn to_raw(&self) -> i32 {
        if self.wake { 2 } else { 1 }
    }
}

/// Reproduces the original ABI's encoding for a failed read: `0` for
/// would-block, `-1` for buffer-too-small.
pub fn read_error_to_raw(err: ReadError) -> i32 {
    match err {
        ReadError::WouldBlock => 0,
        ReadError::BufferTooSmall => -1,
    }
}

/// Reproduces the original ABI's encoding for a failed write: `0` for
/// would-block, `-1` for too-large.
pub fn write_error_to_raw(err: WriteError) -> i32 {
    match err {
        WriteError::WouldBlock => 0,
        WriteError::TooLarge => -1,
    }
}

struct QueueState<K: Kernel> {
    bytes_free: usize,
    items_available: usize,
    insert_index: usize,
    remove_index: usize,
    waiting_to_read: K::EventList,
    waiting_to_write: K::EventList,
    reading_owner: Option<K::TaskHandle>,
    writing_owner: Option<K::TaskHandle>,
}

/// A byte-oriented, variable-length message queue. See the module
/// documentation for the contract.
pub struct FlexiQueue<K: Kernel> {
    kernel: K,
    capacity: usize,
    buf: NonNull<u8>,
    mode: Mode,
    state: UnsafeCell<QueueState<K>>,
}

// SAFETY: all access to `state` and `buf` goes through the kernel's
// critical section (or, for the `_from_isr` entry points, is already
// serialized by the caller being an ISR with interrupts masked).
unsafe impl<K: Kernel + Send> Sync for FlexiQueue<K> {}

impl<K: Kernel> FlexiQueue<K> {
    /// Allocates a queue with room for `capacity` bytes of framed
    /// messages (header included).
    pub fn create(kernel: K, capacity: u32, mode: Mode) -> Result<Self, CreateError> {
        let capacity = capacity as usize;
        let buf = kernel.alloc(capacity).ok_or(CreateError::AllocationFailure)?;
        Ok(Self {
            kernel,
            capacity,
            buf,
            mode,
            state: UnsafeCell::new(QueueState {
                bytes_free: capacity,
                items_available: 0,
                insert_index: 0,
                remove_index: 0,
                waiting_to_read: Default::default(),
                waiting_to_write: Default::default(),
                reading_owner: None,
                writing_owner: None,
            }),
        })
    }

    fn ring(&self) -> ByteRing {
        // SAFETY: `buf` was allocated for `capacity` bytes in `create`
        // and is not released until `self` drops.
        unsafe { ByteRing::new(self.buf, self.capacity) }
    }

    fn strict(&self) -> bool {
        self.mode.contains(Mode::STRICT_CHRONOLOGY)
    }

    /// Blocks, polls, or times out waiting for the next message,
    /// copying it into `dst`. Returns the message's size.
    pub fn read(&self, dst: &mut [u8], ticks: Ticks) -> Result<usize, ReadError> {
        let deadline = Deadline::from_ticks(self.kernel.tick_count(), ticks);
        loop {
            let _cs = CriticalSection::enter(&self.kernel);
            // SAFETY: exclusive access is guaranteed by the critical section.
            let state = unsafe { &mut *self.state.get() };
            let current = self.kernel.current_task();
            let strict = self.strict();

            let ready = if strict {
                (state.reading_owner == Some(current) && state.items_available > 0)
                    || (state.reading_owner.is_none()
                        && state.items_available > 0
                        && self.kernel.list_is_empty(&state.waiting_to_read))
            } else {
                state.items_available > 0
            };

            if ready {
                let (size, _) = self.complete_read(state, dst, strict, false)?;
                return Ok(size);
            }

            let deadline = match deadline {
                Some(d) => d,
                None => return Err(ReadError::WouldBlock),
            };
            if deadline.has_elapsed(self.kernel.tick_count()) {
                return Err(ReadError::WouldBlock);
            }

            self.kernel.set_extra_param(current, dst.len());
            self.kernel.wait_on_event_list(&state.waiting_to_read, deadline);
        }
    }

    /// Non-blocking variant for use from an interrupt service routine.
    /// Never parks; the caller is assumed to already have interrupts
    /// masked.
    pub fn read_from_isr(&self, dst: &mut [u8]) -> Result<ReadIsr, ReadError> {
        // SAFETY: ISR context is serialized by the caller's masking.
        let state = unsafe { &mut *self.state.get() };
        let current = self.kernel.current_task();
        let strict = self.strict();

        let ready = if strict {
            (state.reading_owner == Some(current) && state.items_available > 0)
                || (state.reading_owner.is_none()
                    && state.items_available > 0
                    && self.kernel.list_is_empty(&state.waiting_to_read))
        } else {
            state.items_available > 0
        };

        if !ready {
            return Err(ReadError::WouldBlock);
        }

        let (size, wake) = self.complete_read(state, dst, strict, true)?;
        Ok(ReadIsr { size, wake })
    }

    /// Decodes and consumes the head message into `dst`. `state.items_available > 0`
    /// is assumed to already hold. Returns the message size and whether
    /// a waiter on the opposite side was woken.
    fn complete_read(
        &self,
        state: &mut QueueState<K>,
        dst: &mut [u8],
        strict: bool,
        is_isr: bool,
    ) -> Result<(usize, bool), ReadError> {
        let ring = self.ring();
        let first = ring.byte_at(state.remove_index);
        let second = if first & 0x80 != 0 {
            ring.byte_at(ring.advance(state.remove_index, 1))
        } else {
            0
        };
        let (message_size, header_len) = decode_header(first, second);

        if dst.len() < message_size {
            return Err(ReadError::BufferTooSmall);
        }

        let payload_start = ring.advance(state.remove_index, header_len);
        state.remove_index = ring.read(payload_start, &mut dst[..message_size]);
        state.items_available -= 1;
        state.bytes_free += effective_size(message_size);

        let woke = if strict {
            state.reading_owner = None;
            strict_grant_reader(&self.kernel, state, self.mode, is_isr);
            strict_grant_writer(&self.kernel, state, self.mode, is_isr)
        } else {
            wake_one(&self.kernel, &state.waiting_to_write, self.mode, is_isr)
        };

        Ok((message_size, woke))
    }

    /// Blocks, polls, or times out waiting for room, then stores
    /// `src` as one message.
    pub fn write(&self, src: &[u8], ticks: Ticks) -> Result<(), WriteError> {
        let item_size = src.len();
        if item_size == 0 || item_size > varint::MAX_PAYLOAD || effective_size(item_size) > self.capacity {
            warn!("flexiqueue: rejecting {item_size}-byte item, capacity is {}", self.capacity);
            return Err(WriteError::TooLarge);
        }

        let deadline = Deadline::from_ticks(self.kernel.tick_count(), ticks);
        loop {
            let _cs = CriticalSection::enter(&self.kernel);
            // SAFETY: exclusive access is guaranteed by the critical section.
            let state = unsafe { &mut *self.state.get() };
            let current = self.kernel.current_task();
            let strict = self.strict();
            let needed = effective_size(item_size);

            let ready = if strict {
                (state.writing_owner == Some(current) && needed <= state.bytes_free)
                    || (state.writing_owner.is_none()
                        && needed <= state.bytes_free
                        && self.kernel.list_is_empty(&state.waiting_to_write))
            } else {
                needed <= state.bytes_free
            };

            if ready {
                self.complete_write(state, src, strict, false);
                return Ok(());
            }

            let deadline = match deadline {
                Some(d) => d,
                None => return Err(WriteError::WouldBlock),
            };
            if deadline.has_elapsed(self.kernel.tick_count()) {
                return Err(WriteError::WouldBlock);
            }

            self.kernel.set_extra_param(current, item_size);
            self.kernel.wait_on_event_list(&state.waiting_to_write, deadline);
        }
    }

    /// Non-blocking variant for use from an interrupt service routine.
    pub fn write_from_isr(&self, src: &[u8]) -> Result<WriteIsr, WriteError> {
        let item_size = src.len();
        if item_size == 0 || item_size > varint::MAX_PAYLOAD || effective_size(item_size) > self.capacity {
            return Err(WriteError::TooLarge);
        }

        // SAFETY: ISR context is serialized by the caller's masking.
        let state = unsafe { &mut *self.state.get() };
        let current = self.kernel.current_task();
        let strict = self.strict();
        let needed = effective_size(item_size);

        let ready = if strict {
            (state.writing_owner == Some(current) && needed <= state.bytes_free)
                || (state.writing_owner.is_none()
                    && needed <= state.bytes_free
                    && self.kernel.list_is_empty(&state.waiting_to_write))
        } else {
            needed <= state.bytes_free
        };

        if !ready {
            return Err(WriteError::WouldBlock);
        }

        let woke = self.complete_write(state, src, strict, true);
        // The hand-off itself always happens; whether it's *reported*
        // back to the ISR dispatcher as a reschedule hint is gated on
        // `SWITCH_IN_ISR` (see the original's `xFlexiQueueWriteFromISR`).
        let wake = woke && self.mode.contains(Mode::SWITCH_IN_ISR);
        Ok(WriteIsr { wake })
    }

    fn complete_write(&self, state: &mut QueueState<K>, src: &[u8], strict: bool, is_isr: bool) -> bool {
        let ring = self.ring();
        let (header, header_len) = encode_header(src.len());
        let payload_start = ring.write(state.insert_index, &header[..header_len]);
        state.insert_index = ring.write(payload_start, src);
        state.items_available += 1;
        state.bytes_free -= effective_size(src.len());

        if strict {
            state.writing_owner = None;
            strict_grant_writer(&self.kernel, state, self.mode, is_isr);
            strict_grant_reader(&self.kernel, state, self.mode, is_isr)
        } else {
            // A successful write can only ever unblock a *reader* —
            // waking the write-wait list here would wake the wrong
            // side, since nothing was freed for writers.
            wake_one(&self.kernel, &state.waiting_to_read, self.mode, is_isr)
        }
    }

    /// Discards all stored messages and, per `flags`, unblocks waiters
    /// on the selected side(s). Returns which categories were actually
    /// affected (a category with no waiters contributes nothing even
    /// if requested).
    pub fn flush(&self, flags: FlushFlags) -> FlushFlags {
        let _cs = CriticalSection::enter(&self.kernel);
        // SAFETY: exclusive access is guaranteed by the critical section.
        let state = unsafe { &mut *self.state.get() };

        state.items_available = 0;
        state.insert_index = 0;
        state.remove_index = 0;
        state.bytes_free = self.capacity;
        state.reading_owner = None;
        state.writing_owner = None;

        let mut affected = FlushFlags::empty();
        let mut preempt = false;

        if flags.contains(FlushFlags::READING_TASKS) {
            while !self.kernel.list_is_empty(&state.waiting_to_read) {
                preempt |= self.kernel.remove_from_event_list(&state.waiting_to_read);
                affected |= FlushFlags::READING_TASKS;
            }
        }

        if flags.contains(FlushFlags::WRITING_TASKS) {
            while !self.kernel.list_is_empty(&state.waiting_to_write) {
                preempt |= self.kernel.remove_from_event_list(&state.waiting_to_write);
                affected |= FlushFlags::WRITING_TASKS;
            }
        } else if self.strict() {
            trace!("flexiqueue: flush left writers queued, re-evaluating head grant");
            // The queue is now fully empty; a queued writer whose
            // request fits can be granted immediately.
            strict_grant_writer(&self.kernel, state, self.mode, false);
        }

        if !affected.is_empty() {
            trace!("flexiqueue: flush discarded waiters in {affected:?}");
        }

        if preempt && self.mode.contains(Mode::SWITCH_IMMEDIATE) {
            self.kernel.yield_now();
        }

        affected
    }
}

impl<K: Kernel> Drop for FlexiQueue<K> {
    fn drop(&mut self) {
        // SAFETY: `self.buf` was allocated for `self.capacity` bytes in
        // `create` and is never exposed past this point.
        unsafe { self.kernel.dealloc(self.buf, self.capacity) };
    }
}

/// In strict chronology mode, grants the head reader a binding claim
/// on the head message, if one is queued and none is already granted.
fn strict_grant_reader<K: Kernel>(kernel: &K, state: &mut QueueState<K>, mode: Mode, is_isr: bool) -> bool {
    if state.reading_owner.is_some() || state.items_available == 0 {
        return false;
    }
    let Some(head) = kernel.list_head_owner(&state.waiting_to_read) else {
        return false;
    };
    state.reading_owner = Some(head);
    let preempt = kernel.remove_from_event_list(&state.waiting_to_read);
    trace!("flexiqueue: granted head reader, preempt={preempt}");
    if !is_isr && preempt && mode.contains(Mode::SWITCH_IMMEDIATE) {
        kernel.yield_now();
    }
    preempt
}

/// In strict chronology mode, grants the head writer a binding claim
/// on enough free space for its request, if one is queued, none is
/// already granted, and the space is actually available.
fn strict_grant_writer<K: Kernel>(kernel: &K, state: &mut QueueState<K>, mode: Mode, is_isr: bool) -> bool {
    if state.writing_owner.is_some() {
        return false;
    }
    let Some(head) = kernel.list_head_owner(&state.waiting_to_write) else {
        return false;
    };
    let needed = effective_size(kernel.get_extra_param(head));
    if needed > state.bytes_free {
        return false;
    }
    state.writing_owner = Some(head);
    let preempt = kernel.remove_from_event_list(&state.waiting_to_write);
    if !is_isr && preempt && mode.contains(Mode::SWITCH_IMMEDIATE) {
        kernel.yield_now();
    }
    preempt
}

/// Loose-mode wake: unblocks the head of `list` with no binding grant.
/// The woken task re-validates the precondition itself.
fn wake_one<K: Kernel>(kernel: &K, list: &K::EventList, mode: Mode, is_isr: bool) -> bool {
    if kernel.list_is_empty(list) {
        return false;
    }
    let preempt = kernel.remove_from_event_list(list);
    if !is_isr && preempt && mode.contains(Mode::SWITCH_IMMEDIATE) {
        kernel.yield_now();
    }
    preempt
}
