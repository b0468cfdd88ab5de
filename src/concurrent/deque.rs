// Copyright (c) 2025 RustySched Contributors
//
// Chase-Lev work-stealing deque
//
// The owning worker pushes and pops at the bottom end; any other worker may
// steal from the top end with a compare-and-swap. The owner therefore sees
// LIFO order while thieves drain roughly FIFO from the top - ordering is
// intentionally not FIFO across both ends.
//
// Reference: "Dynamic Circular Work-Stealing Deque" by Chase and Lev (2005)

use super::CACHE_LINE_SIZE;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::mem::{self, MaybeUninit};
use std::ptr;
use std::sync::atomic::{fence, AtomicIsize, AtomicPtr, AtomicU64, Ordering};

/// Minimum buffer size
const MIN_BUFFER_SIZE: usize = 32;

/// Hard ceiling on buffer size
const MAX_BUFFER_SIZE: usize = 1 << 30;

/// A growable circular buffer for the deque
struct Buffer<T> {
    /// The actual storage
    storage: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// Capacity (always power of 2)
    capacity: usize,
}

impl<T> Buffer<T> {
    fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two());
        let mut storage = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            storage.push(UnsafeCell::new(MaybeUninit::uninit()));
        }

        Self {
            storage: storage.into_boxed_slice(),
            capacity,
        }
    }

    /// Get element at index
    ///
    /// # Safety
    ///
    /// The caller must ensure proper synchronization and that the element
    /// at this index has been initialized.
    unsafe fn get(&self, index: isize) -> &T {
        let idx = (index as usize) & (self.capacity - 1);
        (*self.storage[idx].get()).assume_init_ref()
    }

    /// Write element at index
    ///
    /// # Safety
    ///
    /// The caller must ensure proper synchronization.
    unsafe fn put(&self, index: isize, value: T) {
        let idx = (index as usize) & (self.capacity - 1);
        (*self.storage[idx].get()).write(value);
    }

    /// Take element at index
    ///
    /// # Safety
    ///
    /// The caller must ensure proper synchronization and that the element
    /// at this index has been initialized.
    unsafe fn take(&self, index: isize) -> T {
        let idx = (index as usize) & (self.capacity - 1);
        (*self.storage[idx].get()).assume_init_read()
    }

    /// Produce a buffer of twice the capacity holding the live range
    fn grow(&self, old_bottom: isize, old_top: isize) -> Buffer<T> {
        assert!(
            self.capacity < MAX_BUFFER_SIZE,
            "work-stealing deque exceeded maximum capacity"
        );
        let new_buffer = Buffer::new(self.capacity * 2);

        for i in old_top..old_bottom {
            // Safety: the range [top, bottom) is initialized, and only the
            // owner grows; the bitwise copies stay live in exactly one buffer
            // because Buffer never drops elements.
            unsafe {
                let value = self.get(i);
                new_buffer.put(i, ptr::read(value as *const T));
            }
        }

        new_buffer
    }
}

impl<T> Drop for Buffer<T> {
    fn drop(&mut self) {
        // Elements are dropped by the deque, not the buffer
    }
}

// Safety: Buffer is only accessed through proper synchronization
unsafe impl<T: Send> Send for Buffer<T> {}
unsafe impl<T: Send> Sync for Buffer<T> {}

/// Result of a steal operation
#[derive(Debug)]
pub enum Steal<T> {
    /// Successfully stole a value
    Success(T),
    /// Deque was empty
    Empty,
    /// Lost the race against the owner's pop or another thief; retry or back off
    Abort,
}

impl<T> Steal<T> {
    /// Check if the steal obtained a value
    pub fn is_success(&self) -> bool {
        matches!(self, Steal::Success(_))
    }

    /// Convert to Option, discarding the Empty/Abort distinction
    pub fn into_option(self) -> Option<T> {
        match self {
            Steal::Success(v) => Some(v),
            _ => None,
        }
    }
}

/// Chase-Lev work-stealing deque
///
/// Designed for a single owner thread that pushes and pops from the bottom,
/// while any number of thief threads steal from the top.
///
/// # Lock-free guarantees
///
/// - Owner operations are wait-free when no stealing occurs
/// - Steals are lock-free; a lost race surfaces as [`Steal::Abort`]
/// - A value pushed once is handed to exactly one caller
#[repr(C, align(64))]
pub struct WorkDeque<T> {
    /// Bottom index (owner only)
    bottom: AtomicIsize,
    /// Padding to keep bottom and top on different cache lines
    _pad1: [u8; CACHE_LINE_SIZE - size_of::<AtomicIsize>()],
    /// Top index (shared between owner and thieves)
    top: AtomicIsize,
    /// Padding
    _pad2: [u8; CACHE_LINE_SIZE - size_of::<AtomicIsize>()],
    /// Current buffer
    buffer: AtomicPtr<Buffer<T>>,
    /// Grown-out buffers, parked until drop: a thief may still be reading
    /// a stale buffer pointer, so freeing eagerly is unsound
    retired: Mutex<Vec<Box<Buffer<T>>>>,
    /// Operation counters
    push_count: AtomicU64,
    pop_count: AtomicU64,
    steal_count: AtomicU64,
    steal_attempt_count: AtomicU64,
    grow_count: AtomicU64,
}

impl<T> WorkDeque<T> {
    /// Create a new deque with the default initial capacity
    pub fn new() -> Self {
        Self::with_capacity(MIN_BUFFER_SIZE)
    }

    /// Create a new deque; `capacity` is rounded up to a power of two
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_BUFFER_SIZE).next_power_of_two();
        let buffer = Box::into_raw(Box::new(Buffer::new(capacity)));

        Self {
            bottom: AtomicIsize::new(0),
            _pad1: [0; CACHE_LINE_SIZE - size_of::<AtomicIsize>()],
            top: AtomicIsize::new(0),
            _pad2: [0; CACHE_LINE_SIZE - size_of::<AtomicIsize>()],
            buffer: AtomicPtr::new(buffer),
            retired: Mutex::new(Vec::new()),
            push_count: AtomicU64::new(0),
            pop_count: AtomicU64::new(0),
            steal_count: AtomicU64::new(0),
            steal_attempt_count: AtomicU64::new(0),
            grow_count: AtomicU64::new(0),
        }
    }

    /// Push a value onto the bottom of the deque (owner only)
    ///
    /// Grows the storage when full; logically infallible.
    ///
    /// # Safety
    ///
    /// Only the owner thread may call this method.
    pub fn push_bottom(&self, value: T) {
        let bottom = self.bottom.load(Ordering::Relaxed);
        let top = self.top.load(Ordering::Acquire);
        let buffer = unsafe { &*self.buffer.load(Ordering::Relaxed) };

        let size = bottom - top;
        if size >= buffer.capacity as isize {
            let grown = Box::into_raw(Box::new(buffer.grow(bottom, top)));
            let old = self.buffer.swap(grown, Ordering::Release);
            // Safety: `old` came from Box::into_raw and is unreachable for
            // new readers after the swap; parked until the deque drops.
            self.retired.lock().push(unsafe { Box::from_raw(old) });
            self.grow_count.fetch_add(1, Ordering::Relaxed);
        }

        let buffer = unsafe { &*self.buffer.load(Ordering::Relaxed) };

        // Safety: we are the owner and have exclusive access to bottom
        unsafe {
            buffer.put(bottom, value);
        }

        fence(Ordering::Release);
        self.bottom.store(bottom + 1, Ordering::Relaxed);
        self.push_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Pop the most recently pushed value (owner only)
    ///
    /// Returns `None` if the deque is empty. A concurrent steal contending
    /// for the last element is resolved so that exactly one side obtains it.
    ///
    /// # Safety
    ///
    /// Only the owner thread may call this method.
    pub fn pop_bottom(&self) -> Option<T> {
        let bottom = self.bottom.load(Ordering::Relaxed);
        let buffer = unsafe { &*self.buffer.load(Ordering::Relaxed) };

        let new_bottom = bottom - 1;
        self.bottom.store(new_bottom, Ordering::Relaxed);
        fence(Ordering::SeqCst);

        let top = self.top.load(Ordering::Relaxed);

        if top <= new_bottom {
            // Non-empty deque
            let value = unsafe { buffer.take(new_bottom) };

            if top == new_bottom {
                // Last element, race with thieves
                if self
                    .top
                    .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_err()
                {
                    // Lost the race, a thief got it; the bitwise copy we took
                    // must not be dropped here
                    mem::forget(value);
                    self.bottom.store(bottom, Ordering::Relaxed);
                    return None;
                }

                self.bottom.store(bottom, Ordering::Relaxed);
                self.pop_count.fetch_add(1, Ordering::Relaxed);
                return Some(value);
            }

            self.pop_count.fetch_add(1, Ordering::Relaxed);
            Some(value)
        } else {
            // Empty deque
            self.bottom.store(bottom, Ordering::Relaxed);
            None
        }
    }

    /// Steal the oldest value from the top of the deque (thieves)
    ///
    /// Returns [`Steal::Empty`] when there is nothing to take and
    /// [`Steal::Abort`] when a concurrent owner pop or another thief won
    /// the race.
    pub fn steal_top(&self) -> Steal<T> {
        self.steal_attempt_count.fetch_add(1, Ordering::Relaxed);

        let top = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let bottom = self.bottom.load(Ordering::Acquire);

        if top >= bottom {
            return Steal::Empty;
        }

        let buffer = unsafe { &*self.buffer.load(Ordering::Acquire) };

        // Safety: validated by the CAS below; on CAS failure the read copy
        // is discarded without being dropped
        let value = unsafe { buffer.get(top) };
        let value_ptr = value as *const T;

        if self
            .top
            .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            self.steal_count.fetch_add(1, Ordering::Relaxed);
            // Safety: we won the CAS, so we own this value
            Steal::Success(unsafe { ptr::read(value_ptr) })
        } else {
            Steal::Abort
        }
    }

    /// Check if the deque is empty
    pub fn is_empty(&self) -> bool {
        let bottom = self.bottom.load(Ordering::Relaxed);
        let top = self.top.load(Ordering::Relaxed);
        bottom <= top
    }

    /// Get approximate size
    pub fn len(&self) -> usize {
        let bottom = self.bottom.load(Ordering::Relaxed);
        let top = self.top.load(Ordering::Relaxed);
        (bottom - top).max(0) as usize
    }

    /// Get operation counters
    pub fn stats(&self) -> DequeStats {
        DequeStats {
            push_count: self.push_count.load(Ordering::Relaxed),
            pop_count: self.pop_count.load(Ordering::Relaxed),
            steal_count: self.steal_count.load(Ordering::Relaxed),
            steal_attempt_count: self.steal_attempt_count.load(Ordering::Relaxed),
            grow_count: self.grow_count.load(Ordering::Relaxed),
            current_size: self.len(),
        }
    }
}

impl<T> Default for WorkDeque<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for WorkDeque<T> {
    fn drop(&mut self) {
        // Pop all remaining items to drop them
        while self.pop_bottom().is_some() {}

        // Drop the live buffer; retired buffers drop with the Vec
        let buffer = self.buffer.load(Ordering::Relaxed);
        unsafe {
            drop(Box::from_raw(buffer));
        }
    }
}

// Safety: the deque is thread-safe with proper usage (owner vs thief)
unsafe impl<T: Send> Send for WorkDeque<T> {}
unsafe impl<T: Send> Sync for WorkDeque<T> {}

/// Operation counters for a deque
#[derive(Debug, Clone, Copy)]
pub struct DequeStats {
    pub push_count: u64,
    pub pop_count: u64,
    pub steal_count: u64,
    pub steal_attempt_count: u64,
    pub grow_count: u64,
    pub current_size: usize,
}
