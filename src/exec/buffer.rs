/// Append-only byte log with a monotonic read cursor.
///
/// `drain` hands out everything appended since the previous drain. Bytes are
/// decoded as UTF-8; a trailing multi-byte sequence that has not fully
/// arrived is held back until the next append or until the caller signals
/// end-of-stream.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    data: Vec<u8>,
    cursor: usize,
    sealed: bool,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk. Returns false once the buffer has been sealed.
    pub fn append(&mut self, chunk: &[u8]) -> bool {
        if self.sealed {
            return false;
        }
        self.data.extend_from_slice(chunk);
        true
    }

    /// Stops accepting further output. Already buffered bytes stay readable.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[cfg(test)]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_drained(&self) -> bool {
        self.cursor == self.data.len()
    }

    pub fn drain(&mut self, end_of_stream: bool) -> String {
        let pending = &self.data[self.cursor..];
        let take = if end_of_stream {
            pending.len()
        } else {
            complete_utf8_prefix(pending)
        };
        let text = String::from_utf8_lossy(&pending[..take]).into_owned();
        self.cursor += take;
        text
    }
}

/// Length of the longest prefix that can be decoded without splitting a
/// character. Invalid bytes are stepped over; only an incomplete trailing
/// sequence is excluded.
fn complete_utf8_prefix(bytes: &[u8]) -> usize {
    let mut offset = 0;
    loop {
        match std::str::from_utf8(&bytes[offset..]) {
            Ok(_) => return bytes.len(),
            Err(err) => match err.error_len() {
                Some(invalid) => offset += err.valid_up_to() + invalid,
                // input ended mid-sequence
                None => return offset + err.valid_up_to(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::OutputBuffer;

    #[test]
    fn drain_delivers_each_byte_once_in_order() {
        let mut buffer = OutputBuffer::new();
        buffer.append(b"A");
        assert_eq!(buffer.drain(false), "A");
        assert_eq!(buffer.drain(false), "");
        buffer.append(b"B");
        buffer.append(b"C");
        assert_eq!(buffer.drain(false), "BC");
        assert!(buffer.is_drained());
        assert_eq!(buffer.cursor(), buffer.len());
    }

    #[test]
    fn split_utf8_sequence_is_held_until_complete() {
        let snowman = "\u{2603}".as_bytes();
        let mut buffer = OutputBuffer::new();
        buffer.append(b"x");
        buffer.append(&snowman[..1]);
        assert_eq!(buffer.drain(false), "x");
        assert!(!buffer.is_drained());
        buffer.append(&snowman[1..]);
        assert_eq!(buffer.drain(false), "\u{2603}");
        assert!(buffer.is_drained());
    }

    #[test]
    fn end_of_stream_flushes_incomplete_tail_lossily() {
        let mut buffer = OutputBuffer::new();
        buffer.append(&[0xE2, 0x98]);
        assert_eq!(buffer.drain(false), "");
        assert_eq!(buffer.drain(true), "\u{FFFD}");
        assert!(buffer.is_drained());
    }

    #[test]
    fn invalid_byte_before_split_sequence_does_not_mangle_it() {
        let mut buffer = OutputBuffer::new();
        buffer.append(&[0xFF]);
        buffer.append(&[0xE2]);
        let first = buffer.drain(false);
        assert_eq!(first, "\u{FFFD}");
        assert!(!buffer.is_drained());
        buffer.append(&[0x98, 0x83]);
        let second = buffer.drain(false);
        assert_eq!(format!("{first}{second}"), "\u{FFFD}\u{2603}");
        assert_eq!(
            format!("{first}{second}"),
            String::from_utf8_lossy(&[0xFF, 0xE2, 0x98, 0x83])
        );
        assert!(buffer.is_drained());
    }

    #[test]
    fn sealed_buffer_rejects_appends_but_keeps_content() {
        let mut buffer = OutputBuffer::new();
        buffer.append(b"before");
        buffer.seal();
        assert!(!buffer.append(b"after"));
        assert_eq!(buffer.len(), 6);
        assert_eq!(buffer.drain(true), "before");
    }
}
