//! Single-producer/single-consumer lock-free ring buffer.
//!
//! One slot is always left empty so that a full buffer (`write_space() == 0`)
//! can be told apart from an empty one (`read_space() == 0`) using only the
//! two indices. The producer owns the write index, the consumer owns the read
//! index; each publishes its index with `Release` after touching the slots and
//! observes the other side's index with `Acquire`.

use std::cell::UnsafeCell;
use std::slice;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
#[repr(align(64))]
struct PaddedIndex(AtomicUsize);

struct Shared<T> {
    slots: Box<[UnsafeCell<T>]>,
    write: PaddedIndex,
    read: PaddedIndex,
}

unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Shared<T> {
    fn size(&self) -> usize {
        self.slots.len()
    }

    fn used(&self, write: usize, read: usize) -> usize {
        if write >= read {
            write - read
        } else {
            write + self.size() - read
        }
    }

    fn base(&self) -> *mut T {
        self.slots.as_ptr() as *mut T
    }
}

/// Creates a ring buffer holding up to `capacity` elements.
///
/// `capacity + 1` slots are allocated.
pub fn ring_buffer<T: Copy + Default>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    let slots: Box<[UnsafeCell<T>]> = (0..capacity + 1)
        .map(|_| UnsafeCell::new(T::default()))
        .collect();
    let shared = Arc::new(Shared {
        slots,
        write: PaddedIndex(AtomicUsize::new(0)),
        read: PaddedIndex(AtomicUsize::new(0)),
    });
    (
        Producer {
            shared: shared.clone(),
        },
        Consumer { shared },
    )
}

/// Writing half. Exactly one thread may own it.
pub struct Producer<T> {
    shared: Arc<Shared<T>>,
}

/// Reading half. Exactly one thread may own it.
pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> std::fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("capacity", &(self.shared.size() - 1))
            .field("write", &self.shared.write.0.load(Ordering::Relaxed))
            .field("read", &self.shared.read.0.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T> std::fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("capacity", &(self.shared.size() - 1))
            .field("write", &self.shared.write.0.load(Ordering::Relaxed))
            .field("read", &self.shared.read.0.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T: Copy> Producer<T> {
    pub fn capacity(&self) -> usize {
        self.shared.size() - 1
    }

    pub fn read_space(&self) -> usize {
        let w = self.shared.write.0.load(Ordering::Relaxed);
        let r = self.shared.read.0.load(Ordering::Acquire);
        self.shared.used(w, r)
    }

    pub fn write_space(&self) -> usize {
        self.capacity() - self.read_space()
    }

    /// Copies as many elements of `data` as fit and returns that count.
    ///
    /// A short count means overflow; the caller decides whether to drop,
    /// retry or report it.
    pub fn write(&mut self, data: &[T]) -> usize {
        let n = data.len().min(self.write_space());
        if n == 0 {
            return 0;
        }
        let (first, second) = self.write_vector();
        let head = n.min(first.len());
        first[..head].copy_from_slice(&data[..head]);
        if n > head {
            second[..n - head].copy_from_slice(&data[head..n]);
        }
        self.advance_write(n);
        n
    }

    /// Writes `count` copies of `value`, returning how many fit.
    pub fn fill(&mut self, value: T, count: usize) -> usize {
        let n = count.min(self.write_space());
        let (first, second) = self.write_vector();
        let head = n.min(first.len());
        first[..head].fill(value);
        second[..n - head].fill(value);
        self.advance_write(n);
        n
    }

    /// The free region as up to two contiguous spans, in write order.
    ///
    /// Fill the spans directly, then publish with [`Producer::advance_write`].
    pub fn write_vector(&mut self) -> (&mut [T], &mut [T]) {
        let size = self.shared.size();
        let w = self.shared.write.0.load(Ordering::Relaxed);
        let r = self.shared.read.0.load(Ordering::Acquire);
        let free = size - 1 - self.shared.used(w, r);
        let first_len = free.min(size - w);
        let second_len = free - first_len;
        let base = self.shared.base();
        // The free region [w, w + free) never overlaps the readable region and
        // only this producer writes into it until `advance_write` publishes.
        unsafe {
            (
                slice::from_raw_parts_mut(base.add(w), first_len),
                slice::from_raw_parts_mut(base, second_len),
            )
        }
    }

    pub fn advance_write(&mut self, count: usize) {
        let n = count.min(self.write_space());
        let w = self.shared.write.0.load(Ordering::Relaxed);
        self.shared
            .write
            .0
            .store((w + n) % self.shared.size(), Ordering::Release);
    }
}

impl<T: Copy> Consumer<T> {
    pub fn capacity(&self) -> usize {
        self.shared.size() - 1
    }

    pub fn read_space(&self) -> usize {
        let w = self.shared.write.0.load(Ordering::Acquire);
        let r = self.shared.read.0.load(Ordering::Relaxed);
        self.shared.used(w, r)
    }

    pub fn write_space(&self) -> usize {
        self.capacity() - self.read_space()
    }

    /// Moves up to `dest.len()` elements out of the buffer.
    pub fn read(&mut self, dest: &mut [T]) -> usize {
        let n = self.peek(dest);
        self.advance_read(n);
        n
    }

    /// Copies up to `dest.len()` elements without consuming them.
    pub fn peek(&self, dest: &mut [T]) -> usize {
        let (first, second) = self.read_vector();
        let n = dest.len().min(first.len() + second.len());
        let head = n.min(first.len());
        dest[..head].copy_from_slice(&first[..head]);
        if n > head {
            dest[head..n].copy_from_slice(&second[..n - head]);
        }
        n
    }

    /// The readable region as up to two contiguous spans, oldest first.
    pub fn read_vector(&self) -> (&[T], &[T]) {
        let size = self.shared.size();
        let w = self.shared.write.0.load(Ordering::Acquire);
        let r = self.shared.read.0.load(Ordering::Relaxed);
        let avail = self.shared.used(w, r);
        let first_len = avail.min(size - r);
        let second_len = avail - first_len;
        let base = self.shared.base();
        // The producer does not touch [r, r + avail) until the consumer
        // releases it through `advance_read`.
        unsafe {
            (
                slice::from_raw_parts(base.add(r), first_len),
                slice::from_raw_parts(base, second_len),
            )
        }
    }

    pub fn advance_read(&mut self, count: usize) {
        let n = count.min(self.read_space());
        let r = self.shared.read.0.load(Ordering::Relaxed);
        self.shared
            .read
            .0
            .store((r + n) % self.shared.size(), Ordering::Release);
    }

    /// Drops everything currently readable and returns how much was dropped.
    pub fn discard(&mut self) -> usize {
        let n = self.read_space();
        self.advance_read(n);
        n
    }

    /// The producer has been dropped; nothing more will arrive.
    pub fn is_abandoned(&self) -> bool {
        Arc::strong_count(&self.shared) == 1
    }
}
