//! Quit string detection
//!
//! In data mode every byte is payload except the quit string, which ends the session.
//! The matcher runs across arbitrary chunk boundaries: bytes that could still be the
//! start of the quit string are held back, and released as payload as soon as the
//! stream proves they are not.
//!
//! Re-synchronization after a broken match uses the KMP failure function, so patterns
//! with recurring prefixes (`"aaab"`, `"abab"`) keep the longest possible partial match
//! instead of restarting from zero.

/// Quit string used when none is configured
pub const DEFAULT_QUIT_STRING: &[u8] = b"+++";

/// Outcome of feeding one byte to the matcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuitStep {
    /// The byte extended the partial match and is held back
    Pending,
    /// Held-back bytes turned out to be payload
    ///
    /// The payload is `pattern[..prefix]`, followed by the fed byte when `byte` is set.
    Release { prefix: usize, byte: bool },
    /// The byte completed the quit string
    Complete,
}

/// Streaming quit string matcher
#[derive(Debug, Clone)]
pub struct QuitMatcher {
    pattern: Vec<u8>,
    failure: Vec<usize>,
    matched: usize,
}

impl QuitMatcher {
    /// Create a matcher for `pattern`
    ///
    /// An empty pattern never matches; every byte is released as payload.
    pub fn new(pattern: &[u8]) -> Self {
        Self {
            pattern: pattern.to_vec(),
            failure: failure_table(pattern),
            matched: 0,
        }
    }

    /// The quit string
    pub fn pattern(&self) -> &[u8] {
        &self.pattern
    }

    /// Number of held-back bytes, all of which equal `pattern()[..matched()]`
    pub fn matched(&self) -> usize {
        self.matched
    }

    /// Forget any partial match
    pub fn reset(&mut self) {
        self.matched = 0;
    }

    /// Give up the partial match, returning the held-back bytes as payload
    pub fn take_pending(&mut self) -> &[u8] {
        let held = self.matched;
        self.matched = 0;
        &self.pattern[..held]
    }

    /// Feed one byte
    pub fn feed(&mut self, byte: u8) -> QuitStep {
        if self.pattern.is_empty() {
            return QuitStep::Release {
                prefix: 0,
                byte: true,
            };
        }

        let before = self.matched;
        let mut j = before;
        while j > 0 && self.pattern[j] != byte {
            j = self.failure[j - 1];
        }
        if self.pattern[j] == byte {
            j += 1;
        }

        if j == self.pattern.len() {
            self.matched = 0;
            return QuitStep::Complete;
        }

        self.matched = j;
        // The window was pattern[..before] + byte; its leading bytes that are no
        // longer part of a candidate match become payload.
        let released = before + 1 - j;
        if released == 0 {
            QuitStep::Pending
        } else if released <= before {
            QuitStep::Release {
                prefix: released,
                byte: false,
            }
        } else {
            QuitStep::Release {
                prefix: before,
                byte: true,
            }
        }
    }
}

impl Default for QuitMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_QUIT_STRING)
    }
}

/// KMP failure function: `table[i]` is the length of the longest proper prefix of
/// `pattern[..=i]` that is also a suffix of it
fn failure_table(pattern: &[u8]) -> Vec<usize> {
    let mut table = vec![0; pattern.len()];
    let mut k = 0;
    for i in 1..pattern.len() {
        while k > 0 && pattern[i] != pattern[k] {
            k = table[k - 1];
        }
        if pattern[i] == pattern[k] {
            k += 1;
        }
        table[i] = k;
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Feed `input`, collecting released payload. Returns the payload and the
    /// index of the byte that completed the quit string, if any.
    fn run(matcher: &mut QuitMatcher, input: &[u8]) -> (Vec<u8>, Option<usize>) {
        let mut payload = Vec::new();
        for (i, &b) in input.iter().enumerate() {
            match matcher.feed(b) {
                QuitStep::Pending => {}
                QuitStep::Release { prefix, byte } => {
                    payload.extend_from_slice(&matcher.pattern()[..prefix]);
                    if byte {
                        payload.push(b);
                    }
                }
                QuitStep::Complete => return (payload, Some(i)),
            }
        }
        (payload, None)
    }

    #[test]
    fn test_failure_table() {
        assert_eq!(failure_table(b"+++"), vec![0, 1, 2]);
        assert_eq!(failure_table(b"aaab"), vec![0, 1, 2, 0]);
        assert_eq!(failure_table(b"abab"), vec![0, 0, 1, 2]);
    }

    #[test]
    fn test_plain_quit() {
        let mut m = QuitMatcher::default();
        let (payload, done) = run(&mut m, b"AB+++");
        assert_eq!(payload, b"AB");
        assert_eq!(done, Some(4));
    }

    #[test]
    fn test_partial_match_across_chunks() {
        let mut m = QuitMatcher::default();
        let (payload, done) = run(&mut m, b"AB++");
        assert_eq!(payload, b"AB");
        assert_eq!(done, None);
        assert_eq!(m.matched(), 2);

        let (payload, done) = run(&mut m, b"+CD");
        assert!(payload.is_empty());
        assert_eq!(done, Some(0));
    }

    #[test]
    fn test_broken_match_is_payload() {
        let mut m = QuitMatcher::default();
        let (payload, done) = run(&mut m, b"AB++");
        assert_eq!(payload, b"AB");
        assert_eq!(done, None);
        let (payload, done) = run(&mut m, b"CD");
        assert_eq!(payload, b"++CD");
        assert_eq!(done, None);
    }

    #[test]
    fn test_extra_leading_byte_of_repeated_prefix() {
        // "aaaab": the first 'a' falls out, the remaining "aaab" completes
        let mut m = QuitMatcher::new(b"aaab");
        let (payload, done) = run(&mut m, b"aaaab");
        assert_eq!(payload, b"a");
        assert_eq!(done, Some(4));
    }

    #[test]
    fn test_overlapping_pattern() {
        let mut m = QuitMatcher::new(b"abab");
        let (payload, done) = run(&mut m, b"abaabab");
        assert_eq!(payload, b"aba");
        assert_eq!(done, Some(6));
    }

    #[test]
    fn test_take_pending_releases_held_bytes() {
        let mut m = QuitMatcher::default();
        let _ = run(&mut m, b"x++");
        assert_eq!(m.take_pending(), b"++");
        assert_eq!(m.matched(), 0);
    }

    #[test]
    fn test_empty_pattern_never_matches() {
        let mut m = QuitMatcher::new(b"");
        let (payload, done) = run(&mut m, b"+++");
        assert_eq!(payload, b"+++");
        assert_eq!(done, None);
    }

    proptest! {
        /// Released payload plus held bytes always equals the input up to the first
        /// occurrence of the pattern, and completion happens exactly at its last byte.
        #[test]
        fn matcher_agrees_with_naive_search(
            pattern in prop::sample::select(vec![&b"+++"[..], &b"aaab"[..], &b"abab"[..], &b"aab"[..]]),
            input in prop::collection::vec(prop::sample::select(vec![b'a', b'b', b'+', b'x']), 0..64),
        ) {
            let mut m = QuitMatcher::new(pattern);
            let (payload, done) = run(&mut m, &input);

            let first = input.windows(pattern.len()).position(|w| w == pattern);
            match first {
                Some(pos) => {
                    prop_assert_eq!(done, Some(pos + pattern.len() - 1));
                    prop_assert_eq!(&payload[..], &input[..pos]);
                }
                None => {
                    prop_assert_eq!(done, None);
                    let mut all = payload.clone();
                    all.extend_from_slice(m.take_pending());
                    prop_assert_eq!(all, input);
                }
            }
        }
    }
}
