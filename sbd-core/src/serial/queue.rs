//! Bounded queue primitives shared by the serial layer and the deferred
//! event plumbing.

use core::cell::RefCell;

use critical_section::Mutex;
use heapless::Deque;

/// Fixed-capacity byte ring with drop-oldest overflow.
///
/// One side is filled by the UART interrupt, the other drained by the main
/// loop; the platform contract masks interrupts around main-context index
/// updates, so the ring itself carries no synchronisation. Overflow never
/// loses more than the oldest byte and is reported through a latched flag
/// instead of an error return, because the interrupt side has nowhere to
/// propagate one.
#[derive(Debug)]
pub struct ByteQueue<const N: usize> {
    bytes: Deque<u8, N>,
    overflowed: bool,
}

impl<const N: usize> ByteQueue<N> {
    /// Creates an empty queue.
    pub const fn new() -> Self {
        Self {
            bytes: Deque::new(),
            overflowed: false,
        }
    }

    /// Appends one byte, dropping the oldest byte when full.
    pub fn push(&mut self, byte: u8) {
        if self.bytes.push_back(byte).is_err() {
            self.bytes.pop_front();
            self.overflowed = true;
            // Cannot fail twice in a row; a slot was just freed.
            let _ = self.bytes.push_back(byte);
        }
    }

    /// Appends a whole buffer in order.
    pub fn extend(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.push(byte);
        }
    }

    /// Removes and returns the oldest byte.
    pub fn pop(&mut self) -> Option<u8> {
        self.bytes.pop_front()
    }

    /// Number of bytes waiting.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Discards all queued bytes, leaving the overflow flag untouched.
    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    /// Reads and clears the latched overflow flag.
    pub fn take_overflow(&mut self) -> bool {
        core::mem::replace(&mut self.overflowed, false)
    }

    /// Total capacity of the ring.
    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> Default for ByteQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Set-like bounded ring: enqueueing a value already present is a no-op.
///
/// Used for the deferred CIS operations and the deferred log events, where
/// a repeated request must not pile up behind itself.
#[derive(Debug)]
pub struct DedupRing<T: Copy + Eq, const N: usize> {
    items: Deque<T, N>,
}

impl<T: Copy + Eq, const N: usize> DedupRing<T, N> {
    /// Creates an empty ring.
    pub const fn new() -> Self {
        Self {
            items: Deque::new(),
        }
    }

    /// Enqueues `item` unless it is already queued or the ring is full.
    ///
    /// Returns `true` when the item is queued after the call (including the
    /// duplicate no-op case).
    pub fn push(&mut self, item: T) -> bool {
        if self.contains(item) {
            return true;
        }
        self.items.push_back(item).is_ok()
    }

    /// Removes and returns the oldest queued item.
    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Returns `true` when `item` is currently queued.
    pub fn contains(&self, item: T) -> bool {
        self.items.iter().any(|queued| *queued == item)
    }

    /// Returns `true` when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Discards everything queued.
    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: Copy + Eq, const N: usize> Default for DedupRing<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Interrupt-safe wrapper around [`DedupRing`] for static placement.
///
/// Interrupt handlers publish through [`SharedRing::push`]; the main loop
/// drains with [`SharedRing::pop`]. Every access runs inside a critical
/// section, so the handler and the main loop never observe a torn ring.
pub struct SharedRing<T: Copy + Eq, const N: usize> {
    inner: Mutex<RefCell<DedupRing<T, N>>>,
}

impl<T: Copy + Eq, const N: usize> SharedRing<T, N> {
    /// Creates an empty shared ring.
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(DedupRing::new())),
        }
    }

    /// Enqueues `item` unless already present; safe from interrupt context.
    pub fn push(&self, item: T) -> bool {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).push(item))
    }

    /// Removes and returns the oldest queued item.
    pub fn pop(&self) -> Option<T> {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).pop())
    }

    /// Returns `true` when nothing is queued.
    pub fn is_empty(&self) -> bool {
        critical_section::with(|cs| self.inner.borrow_ref(cs).is_empty())
    }
}

impl<T: Copy + Eq, const N: usize> Default for SharedRing<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_come_out_in_order() {
        let mut queue: ByteQueue<8> = ByteQueue::new();
        queue.extend(b"abc");

        assert_eq!(queue.pop(), Some(b'a'));
        assert_eq!(queue.pop(), Some(b'b'));
        assert_eq!(queue.pop(), Some(b'c'));
        assert_eq!(queue.pop(), None);
        assert!(!queue.take_overflow());
    }

    #[test]
    fn overflow_drops_oldest_and_latches_flag() {
        let mut queue: ByteQueue<4> = ByteQueue::new();
        queue.extend(b"abcdef");

        assert!(queue.take_overflow());
        assert!(!queue.take_overflow());
        assert_eq!(queue.pop(), Some(b'c'));
        assert_eq!(queue.pop(), Some(b'd'));
        assert_eq!(queue.pop(), Some(b'e'));
        assert_eq!(queue.pop(), Some(b'f'));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn interleaved_push_pop_never_reorders() {
        let mut queue: ByteQueue<4> = ByteQueue::new();
        let mut expected = 0u8;

        for byte in 0..100u8 {
            queue.push(byte);
            if byte % 3 == 0 {
                while let Some(out) = queue.pop() {
                    assert!(out >= expected);
                    expected = out;
                }
            }
        }
    }

    #[test]
    fn dedup_ring_skips_duplicates() {
        let mut ring: DedupRing<u8, 4> = DedupRing::new();

        assert!(ring.push(7));
        assert!(ring.push(7));
        assert!(ring.push(9));
        assert_eq!(ring.pop(), Some(7));
        assert_eq!(ring.pop(), Some(9));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn dedup_ring_rejects_overflow_of_new_kinds() {
        let mut ring: DedupRing<u8, 2> = DedupRing::new();

        assert!(ring.push(1));
        assert!(ring.push(2));
        assert!(!ring.push(3));
        assert!(ring.push(1)); // still queued, so a duplicate is fine
    }

    #[test]
    fn shared_ring_round_trips() {
        let ring: SharedRing<u16, 4> = SharedRing::new();

        assert!(ring.push(0x0101));
        assert!(ring.push(0x0101));
        assert!(!ring.is_empty());
        assert_eq!(ring.pop(), Some(0x0101));
        assert_eq!(ring.pop(), None);
    }
}
