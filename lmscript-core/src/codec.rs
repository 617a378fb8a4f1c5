use encoding_rs::SHIFT_JIS;

use crate::{LsbError, Result};

/// Bounds-checked little-endian cursor over a byte buffer.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(LsbError::Truncated {
                offset: self.pos,
                needed: n,
                remaining: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn flag(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Element count prefix. Every element occupies at least one byte, so a
    /// count larger than the remaining buffer is rejected before allocating.
    pub(crate) fn count(&mut self) -> Result<usize> {
        let offset = self.pos;
        let count = self.u32()? as usize;
        if count > self.remaining() {
            return Err(LsbError::Truncated {
                offset,
                needed: count,
                remaining: self.remaining(),
            });
        }
        Ok(count)
    }

    /// u32 length followed by CP932 bytes.
    pub(crate) fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let offset = self.pos;
        let bytes = self.take(len)?;
        decode_cp932(bytes).ok_or(LsbError::InvalidString { offset })
    }

    /// u32 count followed by `count` elements.
    pub(crate) fn array<T>(&mut self, mut f: impl FnMut(&mut Self) -> Result<T>) -> Result<Vec<T>> {
        let count = self.count()?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(f(self)?);
        }
        Ok(out)
    }

    /// Read a field only when the format version carries it.
    pub(crate) fn read_if<T>(
        &mut self,
        present: bool,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<Option<T>> {
        if present {
            f(self).map(Some)
        } else {
            Ok(None)
        }
    }
}

#[derive(Default)]
pub(crate) struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub(crate) fn new() -> Self {
        Writer::default()
    }

    pub(crate) fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub(crate) fn bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    pub(crate) fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub(crate) fn flag(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    pub(crate) fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn count(&mut self, n: usize) {
        self.u32(n as u32);
    }

    pub(crate) fn string(&mut self, s: &str) -> Result<()> {
        let bytes = encode_cp932(s)?;
        self.u32(bytes.len() as u32);
        self.bytes(&bytes);
        Ok(())
    }

    pub(crate) fn array<T>(
        &mut self,
        items: &[T],
        mut f: impl FnMut(&mut Self, &T) -> Result<()>,
    ) -> Result<()> {
        self.count(items.len());
        for item in items {
            f(self, item)?;
        }
        Ok(())
    }

    /// Write a field only when the format version carries it. A missing
    /// value for a carried field is written as its default.
    pub(crate) fn write_if<T: Default>(
        &mut self,
        present: bool,
        value: &Option<T>,
        f: impl FnOnce(&mut Self, &T) -> Result<()>,
    ) -> Result<()> {
        if !present {
            return Ok(());
        }
        match value {
            Some(v) => f(self, v),
            None => f(self, &T::default()),
        }
    }
}

/// Decode CP932 bytes, failing on any invalid sequence.
pub fn decode_cp932(bytes: &[u8]) -> Option<String> {
    SHIFT_JIS
        .decode_without_bom_handling_and_without_replacement(bytes)
        .map(|s| s.into_owned())
}

/// Encode text as CP932, naming the first character that has no mapping.
pub fn encode_cp932(s: &str) -> Result<Vec<u8>> {
    let (bytes, _, had_errors) = SHIFT_JIS.encode(s);
    if !had_errors {
        return Ok(bytes.into_owned());
    }
    let mut tmp = [0u8; 4];
    for ch in s.chars() {
        let (_, _, bad) = SHIFT_JIS.encode(ch.encode_utf8(&mut tmp));
        if bad {
            return Err(LsbError::Encoding { ch });
        }
    }
    Err(LsbError::Unsupported(format!("CP932 encoding of {:?}", s)))
}

/// Encode a single character, returning its one or two CP932 bytes.
pub(crate) fn encode_char(ch: char) -> Result<Vec<u8>> {
    let mut tmp = [0u8; 4];
    let (bytes, _, bad) = SHIFT_JIS.encode(ch.encode_utf8(&mut tmp));
    if bad || bytes.is_empty() || bytes.len() > 2 {
        return Err(LsbError::Encoding { ch });
    }
    Ok(bytes.into_owned())
}

/// Unpack the first `n` LSB-first flags. `bytes` should hold
/// `ceil(n / 8)` bytes; flags past its end are not produced.
pub fn unpack_flags(bytes: &[u8], n: usize) -> Vec<bool> {
    bytes
        .iter()
        .flat_map(|b| (0..8).map(move |bit| b & (1 << bit) != 0))
        .take(n)
        .collect()
}

/// Pack booleans LSB-first; a partial trailing byte is zero padded.
pub fn pack_flags(flags: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; flags.len().div_ceil(8)];
    for (i, set) in flags.iter().enumerate() {
        if *set {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{decode_cp932, encode_char, encode_cp932, pack_flags, unpack_flags, Reader, Writer};
    use crate::LsbError;

    #[test]
    fn flags_are_lsb_first() {
        let flags = [true, false, false, false, false, false, false, false, false, true];
        let packed = pack_flags(&flags);
        assert_eq!(packed, vec![0x01, 0x02]);
        assert_eq!(unpack_flags(&packed, 10), flags);
        let padded = unpack_flags(&packed, 16);
        assert_eq!(&padded[..10], &flags);
        assert!(padded[10..].iter().all(|f| !f));
    }

    #[test]
    fn flags_round_trip_whole_bytes() {
        for n in [0usize, 8, 16, 64] {
            let flags: Vec<bool> = (0..n).map(|i| i % 3 == 0).collect();
            assert_eq!(pack_flags(&flags).len(), n / 8);
            assert_eq!(unpack_flags(&pack_flags(&flags), n), flags);
        }
    }

    #[test]
    fn flags_round_trip_partial_bytes() {
        for n in [1usize, 3, 10, 17] {
            let flags: Vec<bool> = (0..n).map(|i| i % 2 == 1 || i + 1 == n).collect();
            let packed = pack_flags(&flags);
            assert_eq!(packed.len(), n.div_ceil(8));
            assert_eq!(unpack_flags(&packed, n), flags);
        }
    }

    #[test]
    fn string_round_trip_in_cp932() {
        let mut w = Writer::new();
        w.string("選択肢A").unwrap();
        let bytes = w.into_inner();
        assert_eq!(&bytes[..4], &[7, 0, 0, 0]);
        assert_eq!(bytes.len(), 11);
        let mut r = Reader::new(&bytes);
        assert_eq!(r.string().unwrap(), "選択肢A");
        assert!(r.is_empty());
    }

    #[test]
    fn rejects_invalid_cp932() {
        assert!(decode_cp932(&[0x82]).is_none());
        let bytes = [1, 0, 0, 0, 0x82];
        let mut r = Reader::new(&bytes);
        assert!(matches!(r.string(), Err(LsbError::InvalidString { offset: 4 })));
    }

    #[test]
    fn encoding_error_names_first_bad_char() {
        match encode_cp932("ok€x") {
            Err(LsbError::Encoding { ch }) => assert_eq!(ch, '€'),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(encode_char('한'), Err(LsbError::Encoding { ch: '한' })));
        assert_eq!(encode_char('あ').unwrap(), vec![0x82, 0xA0]);
        assert_eq!(encode_char('A').unwrap(), vec![0x41]);
    }

    #[test]
    fn oversized_count_is_rejected_before_allocating() {
        let bytes = [0xFF, 0xFF, 0xFF, 0x7F, 0x00];
        let mut r = Reader::new(&bytes);
        let res = r.array(|r| r.u8());
        assert!(matches!(res, Err(LsbError::Truncated { .. })));
    }

    #[test]
    fn truncated_read_reports_offset() {
        let bytes = [1, 2];
        let mut r = Reader::new(&bytes);
        r.u8().unwrap();
        match r.u32() {
            Err(LsbError::Truncated { offset, needed, remaining }) => {
                assert_eq!((offset, needed, remaining), (1, 4, 1));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
