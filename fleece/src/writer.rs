// An append-only byte sink. `Vec<u8>` already grows geometrically on
// reallocation, so we lean on that for the "growth policy: double on
// overflow" requirement rather than hand-rolling it, the way the teacher's
// `ioutil::MemWriter` leans on `std::io::Cursor<Vec<u8>>`.

use fleece_base::{err, ErrorKind, Result};

#[derive(Debug, Default, Clone)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Writer { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Writer {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_byte(&mut self, b: u8) {
        self.buf.push(b);
    }

    pub fn write_padding(&mut self, n: usize) {
        self.buf.resize(self.buf.len() + n, 0);
    }

    /// Pads with a single zero byte if the current length is odd, keeping
    /// every cell boundary 2-byte aligned per the Fleece format.
    pub fn pad_to_even(&mut self) {
        if self.buf.len() % 2 != 0 {
            self.write_padding(1);
        }
    }

    /// Backfills `bytes` at `offset`, which must lie entirely within what
    /// has already been written. Used to patch container headers and
    /// forward counts after the fact.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(bytes.len())
            .ok_or_else(|| err(ErrorKind::OutOfRange, "write_at overflow"))?;
        if end > self.buf.len() {
            return Err(err(ErrorKind::OutOfRange, "write_at past end of buffer"));
        }
        self.buf[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    pub fn length(&self) -> usize {
        self.buf.len()
    }

    /// Alias for `length()`, used at call sites that read as "current
    /// write position" (mirrors the teacher's `wr.pos()`).
    pub fn pos(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn extract_output(self) -> Vec<u8> {
        self.buf
    }

    /// Appends the base64 text encoding of `data` (used by JSONEncoder
    /// when emitting a blob as a JSON string).
    pub fn write_base64(&mut self, data: &[u8]) {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
        self.buf.extend_from_slice(encoded.as_bytes());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    #[test]
    fn test_write_and_backfill() {
        let mut w = Writer::new();
        w.write(b"hello");
        assert_eq!(w.length(), 5);
        w.write_at(0, b"H").unwrap();
        assert_eq!(w.as_bytes(), b"Hello");
    }

    #[test]
    fn test_write_at_out_of_range() {
        let mut w = Writer::new();
        w.write(b"ab");
        assert!(w.write_at(1, b"xy").is_err());
    }

    #[test]
    fn test_pad_to_even() {
        let mut w = Writer::new();
        w.write(b"a");
        w.pad_to_even();
        assert_eq!(w.length(), 2);
        w.pad_to_even();
        assert_eq!(w.length(), 2);
    }

    #[test]
    fn test_base64() {
        let mut w = Writer::new();
        w.write_base64(b"hi");
        assert_eq!(w.as_bytes(), b"aGk=");
    }
}
