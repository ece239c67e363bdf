//! [`AckMatcher`] – case-insensitive search for the controller's
//! acknowledgment token in raw serial chunks.
//!
//! With `across_reads` enabled the matcher remembers the last
//! `token.len() - 1` bytes of the previous chunk, so a token split over two
//! reads (`"do"` then `"ne\r\n"`) is still recognised.  Without it every chunk
//! is searched on its own.

/// Incremental token matcher.  Owned by the reader loop; never shared.
#[derive(Debug, Clone)]
pub struct AckMatcher {
    token: Vec<u8>,
    across_reads: bool,
    tail: Vec<u8>,
}

impl AckMatcher {
    pub fn new(token: &str, across_reads: bool) -> Self {
        Self {
            token: token.as_bytes().to_ascii_lowercase(),
            across_reads,
            tail: Vec::new(),
        }
    }

    /// Scan `chunk`.  Returns `true` when the token is present, after which
    /// the carried-over bytes are discarded.
    pub fn feed(&mut self, chunk: &[u8]) -> bool {
        if self.token.is_empty() {
            return false;
        }

        let mut window = std::mem::take(&mut self.tail);
        window.extend(chunk.iter().map(u8::to_ascii_lowercase));

        if window.windows(self.token.len()).any(|w| w == self.token.as_slice()) {
            return true;
        }

        if self.across_reads {
            let keep = (self.token.len() - 1).min(window.len());
            window.drain(..window.len() - keep);
            self.tail = window;
        }
        false
    }

    /// Forget any partial token carried over from earlier chunks.
    pub fn reset(&mut self) {
        self.tail.clear();
    }
}
