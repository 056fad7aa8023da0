/// Smallest capacity the queue grows to.
pub const MIN_CAPACITY: usize = 10;

/// A FIFO queue of coroutines backed by a growable ring buffer.
///
/// One slot is always left empty so that `start == end` means the queue is empty. When a push
/// would fill the buffer, the capacity doubles (to at least [`MIN_CAPACITY`]) and elements that
/// had wrapped around to the front move right after the old capacity, which keeps the FIFO order.
/// The storage is kept when the queue drains, and reused by the next dispatch.
#[derive(Debug)]
pub struct Coroutines<T> {
    slots: Vec<Option<T>>,
    start: usize,
    end: usize,
}

impl<T> Default for Coroutines<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Coroutines<T> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            start: 0,
            end: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        match self.end >= self.start {
            true => self.end - self.start,
            false => self.capacity() - self.start + self.end,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn push(&mut self, item: T) {
        let mut next = self.end + 1;
        if next >= self.capacity() {
            next = 0;
        }
        if next == self.start {
            self.grow();
            next = (self.end + 1) % self.capacity();
        }
        self.slots[self.end] = Some(item);
        self.end = next;
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let item = self.slots[self.start].take();
        self.start = (self.start + 1) % self.capacity();
        item
    }

    /// Iterates the queued items from front to back.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        let cap = self.capacity().max(1);
        (0..self.len()).filter_map(move |i| self.slots[(self.start + i) % cap].as_ref())
    }

    /// Drops every queued item and releases the storage.
    pub fn free(&mut self) {
        *self = Self::new();
    }

    fn grow(&mut self) {
        let cap = self.capacity();
        let new_cap = (cap * 2).max(MIN_CAPACITY);
        self.slots.resize_with(new_cap, || None);

        // move elements wrapped around the old capacity to the new space
        if self.end < self.start {
            debug_assert!(self.end <= new_cap - cap);
            for index in 0..self.end {
                self.slots[cap + index] = self.slots[index].take();
            }
            self.end += cap;
        }
        log::debug!("coroutine queue grown from {cap} to {new_cap}");
    }
}
