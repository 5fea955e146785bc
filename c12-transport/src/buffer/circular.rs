//! Growable ring buffer for inbound bytes

const DEFAULT_CAPACITY: usize = 256;

/// Ring buffer that accumulates inbound bytes across reads
///
/// Bytes can be inspected without consuming them ([`peek`](Self::peek)),
/// dropped one by one while resynchronizing ([`discard_until`](Self::discard_until))
/// and pushed back to the front ([`unget`](Self::unget)).
/// The buffer grows when a put does not fit: to twice its capacity, or by
/// the size of the put when that is larger.
#[derive(Debug, Clone)]
pub struct CircularBuffer {
    storage: Vec<u8>,
    head: usize,
    len: usize,
}

impl CircularBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: vec![0u8; capacity.max(2)],
            head: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    fn index(&self, position: usize) -> usize {
        (self.head + position) % self.storage.len()
    }

    fn reserve(&mut self, additional: usize) {
        let free = self.storage.len() - self.len;
        if free >= additional {
            return;
        }
        let capacity = self.storage.len();
        let new_capacity = if capacity < additional {
            capacity + additional
        } else {
            capacity * 2
        }
        .max(self.len + additional);
        let mut storage = vec![0u8; new_capacity];
        let (first, second) = self.as_slices();
        storage[..first.len()].copy_from_slice(first);
        storage[first.len()..first.len() + second.len()].copy_from_slice(second);
        self.storage = storage;
        self.head = 0;
    }

    /// Content as at most two contiguous slices, oldest first
    pub fn as_slices(&self) -> (&[u8], &[u8]) {
        let capacity = self.storage.len();
        if self.head + self.len <= capacity {
            (&self.storage[self.head..self.head + self.len], &[])
        } else {
            let tail = capacity - self.head;
            (&self.storage[self.head..], &self.storage[..self.len - tail])
        }
    }

    /// Append bytes at the back
    pub fn put(&mut self, data: &[u8]) {
        self.reserve(data.len());
        let capacity = self.storage.len();
        let start = self.index(self.len);
        let first = data.len().min(capacity - start);
        self.storage[start..start + first].copy_from_slice(&data[..first]);
        self.storage[..data.len() - first].copy_from_slice(&data[first..]);
        self.len += data.len();
    }

    /// Push bytes back to the front, they will be read before anything else
    pub fn unget(&mut self, data: &[u8]) {
        self.reserve(data.len());
        let capacity = self.storage.len();
        self.head = (self.head + capacity - data.len() % capacity) % capacity;
        for (i, byte) in data.iter().enumerate() {
            let index = self.index(i);
            self.storage[index] = *byte;
        }
        self.len += data.len();
    }

    /// Take up to `buf.len()` bytes from the front
    pub fn get(&mut self, buf: &mut [u8]) -> usize {
        let n = self.peek_into(buf);
        self.discard(n);
        n
    }

    /// Copy up to `buf.len()` bytes from the front without consuming them
    pub fn peek_into(&self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.len);
        let (first, second) = self.as_slices();
        let from_first = n.min(first.len());
        buf[..from_first].copy_from_slice(&first[..from_first]);
        buf[from_first..n].copy_from_slice(&second[..n - from_first]);
        n
    }

    /// Up to `count` bytes from the front without consuming them
    pub fn peek(&self, count: usize) -> Vec<u8> {
        let mut result = vec![0u8; count.min(self.len)];
        self.peek_into(&mut result);
        result
    }

    pub fn peek_byte(&self, position: usize) -> Option<u8> {
        if position < self.len {
            Some(self.storage[self.index(position)])
        } else {
            None
        }
    }

    /// Drop up to `count` bytes from the front
    pub fn discard(&mut self, count: usize) -> usize {
        let n = count.min(self.len);
        self.head = self.index(n);
        self.len -= n;
        if self.len == 0 {
            self.head = 0;
        }
        n
    }

    /// Drop bytes from the front until one of `wanted` is first
    ///
    /// # Returns
    ///
    /// The number of bytes dropped and whether a wanted byte was found
    pub fn discard_until(&mut self, wanted: &[u8]) -> (usize, bool) {
        let mut dropped = 0;
        while let Some(byte) = self.peek_byte(0) {
            if wanted.contains(&byte) {
                return (dropped, true);
            }
            self.discard(1);
            dropped += 1;
        }
        (dropped, false)
    }
}

impl Default for CircularBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_wraps() {
        let mut buffer = CircularBuffer::with_capacity(8);
        buffer.put(&[1, 2, 3, 4, 5, 6]);
        let mut out = [0u8; 4];
        assert_eq!(buffer.get(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);
        buffer.put(&[7, 8, 9, 10, 11]);
        assert_eq!(buffer.capacity(), 8);
        assert_eq!(buffer.len(), 7);
        let (first, second) = buffer.as_slices();
        assert!(!second.is_empty());
        assert_eq!([first, second].concat(), vec![5, 6, 7, 8, 9, 10, 11]);
    }

    #[test]
    fn test_grows_to_double_or_by_size() {
        let mut buffer = CircularBuffer::with_capacity(4);
        buffer.put(&[1, 2, 3]);
        buffer.put(&[4, 5]);
        assert_eq!(buffer.capacity(), 8);
        buffer.put(&[0u8; 20]);
        assert_eq!(buffer.capacity(), 28);
        assert_eq!(buffer.peek(5), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut buffer = CircularBuffer::new();
        buffer.put(&[0xEE, 0x00, 0x20]);
        assert_eq!(buffer.peek(2), vec![0xEE, 0x00]);
        assert_eq!(buffer.peek_byte(2), Some(0x20));
        assert_eq!(buffer.peek_byte(3), None);
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_discard_until_resynchronizes() {
        let mut buffer = CircularBuffer::new();
        buffer.put(&[0x00, 0x15, 0x33, 0xEE, 0x00]);
        assert_eq!(buffer.discard_until(&[0xEE]), (3, true));
        assert_eq!(buffer.peek_byte(0), Some(0xEE));

        buffer.clear();
        buffer.put(&[1, 2]);
        assert_eq!(buffer.discard_until(&[0xEE]), (2, false));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_unget_goes_first() {
        let mut buffer = CircularBuffer::with_capacity(4);
        buffer.put(&[3, 4]);
        let mut out = [0u8; 1];
        buffer.get(&mut out);
        buffer.unget(&[1, 2, 3]);
        assert_eq!(buffer.peek(10), vec![1, 2, 3, 4]);
    }
}
