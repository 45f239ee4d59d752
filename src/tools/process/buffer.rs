//! Capped output capture
//!
//! Each stream keeps the most recent `cap` characters, a separate tail of
//! the most recent `tail` characters, and the cumulative count of every
//! character ever produced. Sizes are in characters, not bytes.

/// Ring buffer over decoded process output
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    cap: usize,
    tail_size: usize,
    content: String,
    content_chars: usize,
    tail: String,
    tail_chars: usize,
    total_chars: u64,
    decoder: Utf8Decoder,
}

impl OutputBuffer {
    pub fn new(cap: usize, tail_size: usize) -> Self {
        Self {
            cap,
            tail_size,
            content: String::new(),
            content_chars: 0,
            tail: String::new(),
            tail_chars: 0,
            total_chars: 0,
            decoder: Utf8Decoder::default(),
        }
    }

    /// Append raw bytes; incomplete UTF-8 sequences wait for the next chunk
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        let text = self.decoder.decode(bytes);
        self.push_str(&text);
    }

    /// Flush any dangling partial sequence at end of stream
    pub fn finish(&mut self) {
        let text = self.decoder.flush();
        self.push_str(&text);
    }

    pub fn push_str(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let n = text.chars().count();
        self.total_chars += n as u64;

        append_bounded(&mut self.content, &mut self.content_chars, text, n, self.cap);
        append_bounded(&mut self.tail, &mut self.tail_chars, text, n, self.tail_size);
    }

    /// Retained output (at most `cap` characters)
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Most recent `tail` characters
    pub fn tail(&self) -> &str {
        &self.tail
    }

    /// Characters produced over the stream's lifetime
    pub fn total_chars(&self) -> u64 {
        self.total_chars
    }

    /// Whether earlier output has been evicted
    pub fn truncated(&self) -> bool {
        self.total_chars > self.cap as u64
    }

    pub fn cap(&self) -> usize {
        self.cap
    }
}

/// Append `text` (with `n` chars) to `buf`, evicting from the front so at
/// most `limit` chars remain
fn append_bounded(buf: &mut String, buf_chars: &mut usize, text: &str, n: usize, limit: usize) {
    if limit == 0 {
        buf.clear();
        *buf_chars = 0;
        return;
    }

    if n >= limit {
        buf.clear();
        buf.push_str(skip_chars(text, n - limit));
        *buf_chars = limit;
        return;
    }

    buf.push_str(text);
    *buf_chars += n;

    if *buf_chars > limit {
        let excess = *buf_chars - limit;
        let cut = byte_offset(buf, excess);
        buf.drain(..cut);
        *buf_chars = limit;
    }
}

fn skip_chars(text: &str, count: usize) -> &str {
    &text[byte_offset(text, count)..]
}

fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices()
        .nth(chars)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len())
}

/// Streaming UTF-8 decoder tolerant of sequences split across reads
#[derive(Debug, Clone, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    fn flush(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn test_under_cap_keeps_everything() {
        let mut buf = OutputBuffer::new(100, 10);
        buf.push_str("hello ");
        buf.push_str("world");

        assert_eq!(buf.content(), "hello world");
        assert_eq!(buf.tail(), "ello world");
        assert_eq!(buf.total_chars(), 11);
        assert!(!buf.truncated());
    }

    #[test]
    fn test_over_cap_keeps_most_recent() {
        let mut buf = OutputBuffer::new(5, 3);
        buf.push_str("abc");
        buf.push_str("defgh");

        assert_eq!(buf.content(), "defgh");
        assert_eq!(buf.tail(), "fgh");
        assert_eq!(buf.total_chars(), 8);
        assert!(buf.truncated());
    }

    #[test]
    fn test_tail_larger_than_cap() {
        let mut buf = OutputBuffer::new(3, 6);
        buf.push_str("123456789");

        assert_eq!(buf.content(), "789");
        assert_eq!(buf.tail(), "456789");
    }

    #[test]
    fn test_multibyte_split_across_chunks() {
        let mut buf = OutputBuffer::new(100, 100);
        let bytes = "héllo ✓".as_bytes();
        // split inside the two-byte 'é' and inside the three-byte check mark
        buf.push_bytes(&bytes[..2]);
        buf.push_bytes(&bytes[2..8]);
        buf.push_bytes(&bytes[8..]);
        buf.finish();

        assert_eq!(buf.content(), "héllo ✓");
        assert_eq!(buf.total_chars(), 7);
    }

    #[test]
    fn test_invalid_bytes_replaced() {
        let mut buf = OutputBuffer::new(100, 100);
        buf.push_bytes(&[b'a', 0xff, b'b']);
        assert_eq!(buf.content(), "a\u{FFFD}b");
    }

    #[test]
    fn test_dangling_sequence_flushed() {
        let mut buf = OutputBuffer::new(100, 100);
        buf.push_bytes(&[b'a', 0xe2, 0x9c]);
        assert_eq!(buf.content(), "a");
        buf.finish();
        assert_eq!(buf.total_chars(), 2);
    }

    #[quickcheck]
    fn prop_content_never_exceeds_cap(chunks: Vec<String>, cap: u8, tail: u8) -> bool {
        let cap = cap as usize + 1;
        let tail = tail as usize + 1;
        let mut buf = OutputBuffer::new(cap, tail);
        for chunk in &chunks {
            buf.push_str(chunk);
        }
        buf.content().chars().count() <= cap && buf.tail().chars().count() <= tail
    }

    #[quickcheck]
    fn prop_tail_is_exact_suffix(chunks: Vec<String>, cap: u8, tail: u8) -> bool {
        let cap = cap as usize + 1;
        let tail = tail as usize + 1;
        let mut buf = OutputBuffer::new(cap, tail);
        let mut all = String::new();
        for chunk in &chunks {
            buf.push_str(chunk);
            all.push_str(chunk);
        }
        let total = all.chars().count();
        let expected_tail: String = all.chars().skip(total.saturating_sub(tail)).collect();
        let expected_content: String = all.chars().skip(total.saturating_sub(cap)).collect();
        buf.tail() == expected_tail && buf.content() == expected_content
    }

    #[quickcheck]
    fn prop_truncated_iff_total_exceeds_cap(chunks: Vec<String>, cap: u8) -> bool {
        let cap = cap as usize + 1;
        let mut buf = OutputBuffer::new(cap, 4);
        for chunk in &chunks {
            buf.push_str(chunk);
        }
        buf.truncated() == (buf.total_chars() > cap as u64)
            && buf.total_chars() == chunks.iter().map(|c| c.chars().count() as u64).sum::<u64>()
    }
}
