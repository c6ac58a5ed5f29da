//! Utterance normalization shared by wake-phrase matching, the command
//! registry, and the settings helpers.
//! Recognizers emit casing and punctuation that phrase tables never store,
//! so both sides are reduced to the same canonical form before comparison.

use regex::Regex;

/// Reduces text to a canonical form: lowercased, punctuation stripped,
/// whitespace collapsed, trimmed. `"I'm"` becomes `"im"`, which is what
/// makes the contraction aliases line up with recognizer output.
pub struct Normalizer {
    strip: Regex,
    spaces: Regex,
}

impl Normalizer {
    pub fn new() -> Self {
        Self {
            // Anything that is neither a letter, a digit, nor whitespace.
            strip: Regex::new(r"[^\p{L}\p{N}\s]+").unwrap(),
            spaces: Regex::new(r"\s+").unwrap(),
        }
    }

    pub fn apply(&self, text: &str) -> String {
        let lower = text.to_lowercase();
        let stripped = self.strip.replace_all(&lower, "");
        let collapsed = self.spaces.replace_all(&stripped, " ");
        collapsed.trim().to_string()
    }
}
