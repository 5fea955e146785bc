//! Outbound frame assembly buffer

/// Buffer that grows in both directions
///
/// Frames are built body first. Headers whose content depends on the body
/// length (an APDU tag and length, a BER element header) are prepended
/// afterwards into the reserved front area, without moving the body.
#[derive(Debug, Clone)]
pub struct BidirectionalBuffer {
    storage: Vec<u8>,
    start: usize,
    body_start: usize,
}

impl BidirectionalBuffer {
    /// Create a buffer with `header_reserve` bytes of free front space
    pub fn new(header_reserve: usize) -> Self {
        Self {
            storage: vec![0u8; header_reserve],
            start: header_reserve,
            body_start: header_reserve,
        }
    }

    pub fn len(&self) -> usize {
        self.storage.len() - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of bytes prepended so far
    pub fn header_size(&self) -> usize {
        self.body_start - self.start
    }

    pub fn header(&self) -> &[u8] {
        &self.storage[self.start..self.body_start]
    }

    pub fn body(&self) -> &[u8] {
        &self.storage[self.body_start..]
    }

    /// Body for in-place transformations such as encryption
    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.body_start..]
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.start..]
    }

    pub fn append(&mut self, data: &[u8]) {
        self.storage.extend_from_slice(data);
    }

    pub fn append_byte(&mut self, byte: u8) {
        self.storage.push(byte);
    }

    pub fn prepend(&mut self, data: &[u8]) {
        if data.len() > self.start {
            let grow = data.len() - self.start + self.storage.len().max(16);
            let mut storage = vec![0u8; grow];
            storage.extend_from_slice(&self.storage);
            self.storage = storage;
            self.start += grow;
            self.body_start += grow;
        }
        self.start -= data.len();
        self.storage[self.start..self.start + data.len()].copy_from_slice(data);
    }

    pub fn prepend_byte(&mut self, byte: u8) {
        self.prepend(&[byte]);
    }

    /// Prepend an ISO 8825 length, short form below 0x80
    pub fn prepend_iso_length(&mut self, length: usize) {
        let bytes = (length as u32).to_be_bytes();
        match length {
            0..=0x7F => self.prepend_byte(length as u8),
            0x80..=0xFF => self.prepend(&[0x81, bytes[3]]),
            0x100..=0xFFFF => self.prepend(&[0x82, bytes[2], bytes[3]]),
            0x1_0000..=0xFF_FFFF => self.prepend(&[0x83, bytes[1], bytes[2], bytes[3]]),
            _ => self.prepend(&[0x84, bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }

    /// Drop everything, keeping the front reserve
    pub fn clear(&mut self) {
        self.storage.truncate(self.body_start);
        self.start = self.body_start;
    }

    pub fn into_vec(mut self) -> Vec<u8> {
        self.storage.drain(..self.start);
        self.storage
    }
}

impl Default for BidirectionalBuffer {
    fn default() -> Self {
        Self::new(32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_then_header() {
        let mut buffer = BidirectionalBuffer::new(4);
        buffer.append(&[0x30, 0x00, 0x01]);
        buffer.prepend_byte(0x04);
        buffer.prepend(&[0xBE, 0x05]);
        assert_eq!(buffer.header(), &[0xBE, 0x05, 0x04]);
        assert_eq!(buffer.body(), &[0x30, 0x00, 0x01]);
        assert_eq!(buffer.header_size(), 3);
        assert_eq!(buffer.into_vec(), vec![0xBE, 0x05, 0x04, 0x30, 0x00, 0x01]);
    }

    #[test]
    fn test_prepend_beyond_reserve_grows() {
        let mut buffer = BidirectionalBuffer::new(1);
        buffer.append_byte(0xFF);
        buffer.prepend(&[1, 2, 3, 4, 5]);
        buffer.prepend(&[0]);
        assert_eq!(buffer.as_slice(), &[0, 1, 2, 3, 4, 5, 0xFF]);
        assert_eq!(buffer.body(), &[0xFF]);
    }

    #[test]
    fn test_iso_length_prefix() {
        let mut buffer = BidirectionalBuffer::new(8);
        buffer.append(&[0u8; 0x90]);
        buffer.prepend_iso_length(buffer.len());
        buffer.prepend_byte(0x60);
        assert_eq!(buffer.header(), &[0x60, 0x81, 0x90]);
        buffer.body_mut()[0] = 0x55;
        assert_eq!(buffer.as_slice()[3], 0x55);
    }

    #[test]
    fn test_clear_keeps_reserve() {
        let mut buffer = BidirectionalBuffer::new(2);
        buffer.append(&[1, 2]);
        buffer.prepend(&[9]);
        buffer.clear();
        assert!(buffer.is_empty());
        buffer.append(&[7]);
        buffer.prepend(&[6]);
        assert_eq!(buffer.as_slice(), &[6, 7]);
    }
}
