//! Transcript accumulation
//!
//! Partial transcript fragments arrive per speaker turn; consecutive fragments
//! from the same speaker merge into one message, and a fragment from the other
//! speaker always starts a new one. The log is append/mutate-last-only.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Agent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub speaker: Speaker,
    pub text: String,
}

#[derive(Debug, Default)]
pub struct TranscriptLog {
    messages: Vec<TranscriptMessage>,
}

impl TranscriptLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a fragment into the last message when the speaker matches,
    /// otherwise open a new turn.
    pub fn append(&mut self, speaker: Speaker, fragment: &str) {
        match self.messages.last_mut() {
            Some(last) if last.speaker == speaker => last.text.push_str(fragment),
            _ => self.messages.push(TranscriptMessage {
                speaker,
                text: fragment.to_string(),
            }),
        }
    }

    /// Clear the log at the start of a new call.
    pub fn reset(&mut self) {
        self.messages.clear();
    }

    pub fn messages(&self) -> &[TranscriptMessage] {
        &self.messages
    }

    pub fn snapshot(&self) -> Vec<TranscriptMessage> {
        self.messages.clone()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_speaker_fragments_concatenate() {
        let mut log = TranscriptLog::new();
        log.append(Speaker::User, "hel");
        log.append(Speaker::User, "lo");
        assert_eq!(log.len(), 1);
        assert_eq!(log.messages()[0].text, "hello");
    }

    #[test]
    fn speaker_change_opens_new_turn() {
        let mut log = TranscriptLog::new();
        log.append(Speaker::User, "a");
        log.append(Speaker::Agent, "x");
        log.append(Speaker::Agent, "y");
        log.append(Speaker::User, "b");
        let texts: Vec<_> = log
            .messages()
            .iter()
            .map(|m| (m.speaker, m.text.as_str()))
            .collect();
        assert_eq!(
            texts,
            vec![
                (Speaker::User, "a"),
                (Speaker::Agent, "xy"),
                (Speaker::User, "b")
            ]
        );
    }

    #[test]
    fn reset_clears_log() {
        let mut log = TranscriptLog::new();
        log.append(Speaker::Agent, "hi");
        log.reset();
        assert!(log.is_empty());
        log.append(Speaker::Agent, "again");
        assert_eq!(log.messages()[0].text, "again");
    }
}
