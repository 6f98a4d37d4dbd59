//! Filtering of assistant text before it reaches listeners
//!
//! The model may think out loud inside `<rofy-hypothesis>` blocks and emits
//! internal routing sentinels (`SEARCH_UI`, `SEARCH_CLIENT`, `SEARCH_API`).
//! Neither must reach the user. The filter works on characters and holds back
//! any trailing text that could still grow into a marker, so the relayed
//! output does not depend on how the text was chunked.

const HYPOTHESIS_OPEN: &str = "<rofy-hypothesis>";
const HYPOTHESIS_CLOSE: &str = "</rofy-hypothesis>";
const SENTINELS: [&str; 3] = ["SEARCH_UI", "SEARCH_CLIENT", "SEARCH_API"];

/// Characters of recent history kept for close-tag detection
const TAIL_WINDOW: usize = 40;

/// Streaming text filter; one per model pass
#[derive(Debug, Default)]
pub struct TextFilter {
    tail: String,
    held: String,
    in_hypothesis: bool,
}

impl TextFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a hypothesis block is open
    pub fn in_hypothesis(&self) -> bool {
        self.in_hypothesis
    }

    /// Feed a chunk, returning the text safe to relay now.
    pub fn push(&mut self, chunk: &str) -> String {
        let mut out = String::new();
        for ch in chunk.chars() {
            self.remember(ch);

            if self.in_hypothesis {
                if self.tail.ends_with(HYPOTHESIS_CLOSE) {
                    self.in_hypothesis = false;
                    self.tail.clear();
                }
                continue;
            }

            self.held.push(ch);
            if self.held.ends_with(HYPOTHESIS_OPEN) {
                let keep = self.held.len() - HYPOTHESIS_OPEN.len();
                out.push_str(&self.held[..keep]);
                self.held.clear();
                self.in_hypothesis = true;
                self.tail.clear();
                continue;
            }
            if let Some(sentinel) = SENTINELS.iter().find(|s| self.held.ends_with(*s)) {
                let keep = self.held.len() - sentinel.len();
                self.held.truncate(keep);
            }

            let safe = self.safe_len();
            out.push_str(&self.held[..safe]);
            self.held.drain(..safe);
        }
        out
    }

    /// Flush held text at the end of a text block.
    ///
    /// A partial marker at the end is ordinary text; an unterminated
    /// hypothesis is dropped.
    pub fn finish(&mut self) -> String {
        self.tail.clear();
        self.in_hypothesis = false;
        std::mem::take(&mut self.held)
    }

    fn remember(&mut self, ch: char) {
        self.tail.push(ch);
        let excess = self.tail.chars().count().saturating_sub(TAIL_WINDOW);
        if excess > 0 {
            let cut = self
                .tail
                .char_indices()
                .nth(excess)
                .map(|(i, _)| i)
                .unwrap_or(self.tail.len());
            self.tail.drain(..cut);
        }
    }

    /// Length of the held prefix that can no longer start a marker
    fn safe_len(&self) -> usize {
        for (i, _) in self.held.char_indices() {
            let rest = &self.held[i..];
            if could_become_marker(rest) {
                return i;
            }
        }
        self.held.len()
    }
}

fn could_become_marker(text: &str) -> bool {
    HYPOTHESIS_OPEN.starts_with(text) || SENTINELS.iter().any(|s| s.starts_with(text))
}
