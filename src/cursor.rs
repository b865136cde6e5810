//! Little-endian byte cursor and write buffer.

use crate::decoder::DecodeError;
use crate::CharWidth;

/// Bounds-checked reader over a byte slice.
///
/// Reads never go past `end`, which may be smaller than the slice length to confine decoding to
/// a range.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    data: &'a [u8],
    position: usize,
    end: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            position: 0,
            end: data.len(),
        }
    }

    /// Cursor positioned at `start` that can't read past `end`.
    pub fn bounded(data: &'a [u8], start: usize, end: usize) -> Self {
        let end = end.min(data.len());
        Self {
            data,
            position: start.min(end),
            end,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn seek(&mut self, position: usize) {
        self.position = position.min(self.end);
    }

    pub fn bytes_left(&self) -> usize {
        self.end - self.position
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.end
    }

    /// Takes the next `len` bytes.
    pub fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if len > self.bytes_left() {
            return Err(DecodeError::Truncated {
                offset: self.position,
                needed: len,
                available: self.bytes_left(),
            });
        }

        let slice = &self.data[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn i32(&mut self) -> Result<i32, DecodeError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn f32(&mut self) -> Result<f32, DecodeError> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u8_array(&mut self, count: usize) -> Result<Vec<u8>, DecodeError> {
        Ok(self.take(count)?.to_vec())
    }

    pub fn u16_array(&mut self, count: usize) -> Result<Vec<u16>, DecodeError> {
        let bytes = self.take(2 * count)?;
        Ok(bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect())
    }

    /// Reads a null-terminated string of at most `max_bytes` bytes.
    ///
    /// With `drop_remaining` the cursor always advances by `max_bytes`; otherwise it stops right
    /// after the terminator.
    pub fn string(
        &mut self,
        width: CharWidth,
        max_bytes: usize,
        drop_remaining: bool,
    ) -> Result<String, DecodeError> {
        let start = self.position;
        let max_bytes = max_bytes.min(self.bytes_left());
        let unit = width.unit_size();
        let max_units = max_bytes / unit;

        let mut units: Vec<u16> = Vec::new();
        let mut consumed = 0;

        for _ in 0..max_units {
            let value = match width {
                CharWidth::Narrow => self.u8()? as u16,
                CharWidth::Wide => self.u16()?,
            };
            consumed += unit;

            if value == 0 {
                break;
            }
            units.push(value);
        }

        if drop_remaining {
            self.position = start + max_bytes;
        } else {
            self.position = start + consumed;
        }

        match width {
            // Latin-1, every byte maps to the code point of the same value
            CharWidth::Narrow => Ok(units.iter().map(|&u| char::from(u as u8)).collect()),
            // Lossy decoding wouldn't encode back to the same bytes
            CharWidth::Wide => {
                String::from_utf16(&units).map_err(|_| DecodeError::InvalidUtf16 { offset: start })
            }
        }
    }
}

/// Growable little-endian output buffer.
#[derive(Debug, Clone, Default)]
pub struct WriteBuffer {
    data: Vec<u8>,
}

impl WriteBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn position(&self) -> usize {
        self.data.len()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_f32(&mut self, value: f32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Writes `value` into exactly `byte_len` bytes, truncating or zero-padding as needed.
    pub fn write_string(&mut self, value: &str, width: CharWidth, byte_len: usize) {
        let start = self.data.len();

        match width {
            CharWidth::Narrow => {
                for c in value.chars().take(byte_len) {
                    // Characters outside Latin-1 have no narrow encoding
                    let b = u8::try_from(u32::from(c)).unwrap_or(b'?');
                    self.data.push(b);
                }
            }
            CharWidth::Wide => {
                for unit in value.encode_utf16().take(byte_len / 2) {
                    self.data.extend_from_slice(&unit.to_le_bytes());
                }
            }
        }

        self.data.resize(start + byte_len, 0);
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_reads() {
        let data = [0x01, 0x34, 0x12, 0xff, 0xff, 0xff, 0xff, 0x00, 0x00, 0x80, 0x3f];
        let mut cursor = Cursor::new(&data);

        assert_eq!(cursor.u8().unwrap(), 1);
        assert_eq!(cursor.u16().unwrap(), 0x1234);
        assert_eq!(cursor.i32().unwrap(), -1);
        assert_eq!(cursor.f32().unwrap(), 1.0);
        assert!(!cursor.has_remaining());
        assert!(matches!(cursor.u8(), Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn test_bounded_cursor_stops_at_end() {
        let data = [1, 2, 3, 4, 5, 6];
        let mut cursor = Cursor::bounded(&data, 2, 4);

        assert_eq!(cursor.position(), 2);
        assert_eq!(cursor.bytes_left(), 2);
        assert_eq!(cursor.u16().unwrap(), 0x0403);
        assert!(cursor.u8().is_err());
    }

    #[test]
    fn test_narrow_string_stops_after_terminator() {
        let data = b"hi\0rest";
        let mut cursor = Cursor::new(data);

        let s = cursor.string(CharWidth::Narrow, data.len(), false).unwrap();
        assert_eq!(s, "hi");
        assert_eq!(cursor.position(), 3);
    }

    #[test]
    fn test_wide_string_drop_remaining() {
        let data = [b'o', 0, b'k', 0, 0, 0, 0, 0];
        let mut cursor = Cursor::new(&data);

        let s = cursor.string(CharWidth::Wide, 8, true).unwrap();
        assert_eq!(s, "ok");
        assert_eq!(cursor.position(), 8);
    }

    #[test]
    fn test_unterminated_string_reads_max() {
        let data = b"abcdef";
        let mut cursor = Cursor::new(data);

        let s = cursor.string(CharWidth::Narrow, 4, false).unwrap();
        assert_eq!(s, "abcd");
        assert_eq!(cursor.position(), 4);
    }

    #[test]
    fn test_wide_string_rejects_lone_surrogate() {
        // 'a', unpaired high surrogate, terminator
        let data = [0x61, 0x00, 0x00, 0xd8, 0x00, 0x00];
        let mut cursor = Cursor::new(&data);
        assert_eq!(
            cursor.string(CharWidth::Wide, data.len(), false),
            Err(DecodeError::InvalidUtf16 { offset: 0 })
        );

        // A proper pair is fine
        let data = [0x3d, 0xd8, 0x00, 0xde, 0x00, 0x00];
        let mut cursor = Cursor::new(&data);
        assert_eq!(cursor.string(CharWidth::Wide, data.len(), false).unwrap(), "\u{1f600}");
    }

    #[test]
    fn test_write_string_pads_and_truncates() {
        let mut buf = WriteBuffer::default();
        buf.write_string("ab", CharWidth::Narrow, 4);
        buf.write_string("xyz", CharWidth::Wide, 4);
        assert_eq!(buf.into_inner(), vec![b'a', b'b', 0, 0, b'x', 0, b'y', 0]);
    }

    #[test]
    fn test_write_primitives() {
        let mut buf = WriteBuffer::with_capacity(8);
        buf.write_u8(7);
        buf.write_u16(0x0102);
        buf.write_i32(-2);
        assert_eq!(buf.position(), 7);
        assert_eq!(buf.into_inner(), vec![7, 2, 1, 0xfe, 0xff, 0xff, 0xff]);
    }
}
