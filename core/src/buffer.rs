//! Chunk buffering for streamed text.
//!
//! Model providers emit text in arbitrarily small deltas. Flushing every
//! delta to the UI is wasteful, so [`ChunkBuffer`] accumulates fragments and
//! delivers them in larger, order-preserving flushes once a size threshold is
//! crossed or a break marker (e.g. a paragraph break) appears.

/// Accumulates streamed text fragments and flushes them to a callback.
///
/// Two guarantees hold for the lifetime of one response:
///
/// - Flushes fire in the same order fragments were added, and the
///   concatenation of all flushed chunks equals the concatenation of all
///   fragments exactly - nothing dropped, duplicated, or reordered.
/// - The full accumulated text only grows; flushing clears the pending
///   portion, never the accumulated text.
///
/// When a break marker is present in the pending buffer, the flush cuts at
/// the *last* occurrence of any marker (inclusive) and retains the remainder
/// as the new pending buffer, so sentences are not split mid-stream. A
/// threshold-only flush (no marker present) delivers the whole pending
/// buffer.
pub struct ChunkBuffer {
    pending: String,
    full_text: String,
    threshold: usize,
    break_markers: Vec<String>,
    on_flush: Box<dyn FnMut(&str, &str) + Send>,
    closed: bool,
}

impl std::fmt::Debug for ChunkBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkBuffer")
            .field("pending_len", &self.pending.len())
            .field("full_len", &self.full_text.len())
            .field("threshold", &self.threshold)
            .field("break_markers", &self.break_markers)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl ChunkBuffer {
    /// Create a buffer that flushes once `threshold` pending characters
    /// accumulate or any of `break_markers` appears in the pending buffer.
    ///
    /// `on_flush` receives `(flushed_chunk, full_accumulated_text)`.
    pub fn new(
        threshold: usize,
        break_markers: Vec<String>,
        on_flush: impl FnMut(&str, &str) + Send + 'static,
    ) -> Self {
        Self {
            pending: String::new(),
            full_text: String::new(),
            threshold,
            break_markers,
            on_flush: Box::new(on_flush),
            closed: false,
        }
    }

    /// Append a fragment, flushing if the threshold or a break marker is hit.
    ///
    /// Adding to a closed buffer is a no-op: the streaming loop that feeds
    /// this buffer must never observe a panic from a late delta.
    pub fn add(&mut self, fragment: &str) {
        if self.closed {
            tracing::debug!(len = fragment.len(), "fragment dropped on closed buffer");
            return;
        }
        if fragment.is_empty() {
            return;
        }

        self.full_text.push_str(fragment);
        self.pending.push_str(fragment);

        // A single add can leave the remainder itself over threshold, so
        // flush until no condition holds.
        loop {
            if let Some(cut) = self.last_marker_end() {
                self.flush_prefix(cut);
            } else if self.threshold > 0 && self.pending.len() >= self.threshold {
                self.flush_all();
            } else {
                break;
            }
        }
    }

    /// Force a final flush of any remaining pending text and close the
    /// buffer. Idempotent.
    pub fn end(&mut self) {
        if self.closed {
            return;
        }
        self.flush_all();
        self.closed = true;
    }

    /// The full accumulated text so far (flushed and pending).
    #[must_use]
    pub fn full_text(&self) -> &str {
        &self.full_text
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Byte offset just past the last occurrence of any break marker in the
    /// pending buffer, or `None` if no marker is present.
    fn last_marker_end(&self) -> Option<usize> {
        self.break_markers
            .iter()
            .filter(|m| !m.is_empty())
            .filter_map(|m| self.pending.rfind(m.as_str()).map(|idx| idx + m.len()))
            .max()
    }

    fn flush_prefix(&mut self, cut: usize) {
        debug_assert!(self.pending.is_char_boundary(cut));
        let remainder = self.pending.split_off(cut);
        if !self.pending.is_empty() {
            (self.on_flush)(&self.pending, &self.full_text);
        }
        self.pending = remainder;
    }

    fn flush_all(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        (self.on_flush)(&self.pending, &self.full_text);
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::ChunkBuffer;

    fn recording_buffer(
        threshold: usize,
        markers: &[&str],
    ) -> (ChunkBuffer, Arc<Mutex<Vec<String>>>) {
        let flushes = Arc::new(Mutex::new(Vec::new()));
        let sink = flushes.clone();
        let buffer = ChunkBuffer::new(
            threshold,
            markers.iter().map(|m| (*m).to_string()).collect(),
            move |chunk, _full| sink.lock().unwrap().push(chunk.to_string()),
        );
        (buffer, flushes)
    }

    #[test]
    fn threshold_and_marker_scenario() {
        let (mut buffer, flushes) = recording_buffer(10, &["\n\n"]);

        buffer.add("hello ");
        assert!(flushes.lock().unwrap().is_empty());

        buffer.add("world\n\n");
        assert_eq!(flushes.lock().unwrap().as_slice(), ["hello world\n\n"]);

        buffer.add("more text");
        assert_eq!(flushes.lock().unwrap().len(), 1);

        buffer.end();
        assert_eq!(
            flushes.lock().unwrap().as_slice(),
            ["hello world\n\n", "more text"]
        );
    }

    #[test]
    fn flushed_chunks_reassemble_exactly() {
        let fragments = ["a", "bc", "", "def\n\ngh", "i", "jk\n", "\nrest", "tail"];
        let (mut buffer, flushes) = recording_buffer(4, &["\n\n"]);

        for fragment in fragments {
            buffer.add(fragment);
        }
        buffer.end();

        let reassembled: String = flushes.lock().unwrap().concat();
        let expected: String = fragments.concat();
        assert_eq!(reassembled, expected);
        assert_eq!(buffer.full_text(), expected);
    }

    #[test]
    fn marker_flush_retains_remainder() {
        let (mut buffer, flushes) = recording_buffer(100, &["\n\n"]);

        buffer.add("first\n\nsecond\n\ntrailing");
        // Cut at the *last* marker; "trailing" stays pending.
        assert_eq!(
            flushes.lock().unwrap().as_slice(),
            ["first\n\nsecond\n\n"]
        );

        buffer.end();
        assert_eq!(flushes.lock().unwrap().last().unwrap(), "trailing");
    }

    #[test]
    fn oversized_remainder_flushes_again() {
        let (mut buffer, flushes) = recording_buffer(5, &["\n\n"]);

        buffer.add("ab\n\nlong remainder text");
        let flushed = flushes.lock().unwrap().clone();
        assert_eq!(flushed, ["ab\n\n", "long remainder text"]);
    }

    #[test]
    fn full_text_callback_argument_is_cumulative() {
        let fulls = Arc::new(Mutex::new(Vec::new()));
        let sink = fulls.clone();
        let mut buffer = ChunkBuffer::new(1, Vec::new(), move |_chunk, full| {
            sink.lock().unwrap().push(full.to_string());
        });

        buffer.add("a");
        buffer.add("b");
        buffer.add("c");
        buffer.end();

        assert_eq!(fulls.lock().unwrap().as_slice(), ["a", "ab", "abc"]);
    }

    #[test]
    fn add_after_end_is_a_noop() {
        let (mut buffer, flushes) = recording_buffer(10, &[]);

        buffer.add("kept");
        buffer.end();
        buffer.add("dropped");
        buffer.end();

        assert_eq!(flushes.lock().unwrap().as_slice(), ["kept"]);
        assert_eq!(buffer.full_text(), "kept");
        assert!(buffer.is_closed());
    }

    #[test]
    fn end_without_pending_emits_nothing() {
        let (mut buffer, flushes) = recording_buffer(2, &[]);

        buffer.add("xy");
        buffer.end();

        assert_eq!(flushes.lock().unwrap().as_slice(), ["xy"]);
    }
}
