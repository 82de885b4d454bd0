//! Chunk-boundary safe UTF-8 decoding for backend output.

/// Turns arbitrary byte chunks into text, holding back a multi-byte
/// character that was split across two reads until its tail arrives.
#[derive(Debug, Default)]
pub struct Utf8ChunkDecoder {
    pending: Vec<u8>,
}

impl Utf8ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `chunk`, returning all text that is complete so far.
    /// Invalid sequences become U+FFFD.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let split = self.pending.len() - incomplete_tail_len(&self.pending);
        let text = String::from_utf8_lossy(&self.pending[..split]).into_owned();
        self.pending.drain(..split);
        text
    }

    /// Flush whatever is held back (end of stream).
    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Length of a trailing, not yet complete UTF-8 sequence.
fn incomplete_tail_len(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = match byte {
            b if b & 0xE0 == 0xC0 => 2,
            b if b & 0xF0 == 0xE0 => 3,
            b if b & 0xF8 == 0xF0 => 4,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holds_back_split_two_byte_character() {
        let bytes = "café".as_bytes();
        let mut decoder = Utf8ChunkDecoder::new();
        assert_eq!(decoder.decode(&bytes[..4]), "caf");
        assert_eq!(decoder.decode(&bytes[4..]), "é");
    }

    #[test]
    fn reassembles_four_byte_character_across_three_reads() {
        let bytes = "ok 🎵".as_bytes();
        let mut decoder = Utf8ChunkDecoder::new();
        let mut out = String::new();
        out.push_str(&decoder.decode(&bytes[..4]));
        out.push_str(&decoder.decode(&bytes[4..5]));
        out.push_str(&decoder.decode(&bytes[5..]));
        assert_eq!(out, "ok 🎵");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn replaces_invalid_bytes_instead_of_stalling() {
        let mut decoder = Utf8ChunkDecoder::new();
        assert_eq!(decoder.decode(b"a\xFFb"), "a\u{FFFD}b");
    }

    #[test]
    fn finish_flushes_truncated_sequence() {
        let mut decoder = Utf8ChunkDecoder::new();
        assert_eq!(decoder.decode(&[b'x', 0xE2, 0x82]), "x");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }
}
