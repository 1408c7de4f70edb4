use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tracing::debug;
use tutor_common::llm::Message;

/// Keep only history entries that are objects with string `role` and `content`, in order.
pub fn validate_history(raw: &[Value]) -> Vec<Message> {
    let history: Vec<Message> = raw
        .iter()
        .filter_map(|entry| {
            let role = entry.get("role")?.as_str()?;
            let content = entry.get("content")?.as_str()?;
            Some(Message {
                role: role.to_string(),
                content: content.to_string(),
            })
        })
        .collect();
    if history.len() != raw.len() {
        debug!(
            dropped = raw.len() - history.len(),
            kept = history.len(),
            "dropped malformed history entries"
        );
    }
    history
}

/// Turns exchanged with one subject's retriever during the process lifetime.
///
/// Bounded: once `max_turns` is reached the oldest turn is dropped.
pub struct ConversationMemory {
    max_turns: usize,
    turns: Mutex<VecDeque<Message>>,
}

impl ConversationMemory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            max_turns,
            turns: Mutex::new(VecDeque::new()),
        }
    }

    /// Record a question and its answer as adjacent turns.
    pub fn record_exchange(&self, question: String, answer: String) {
        if self.max_turns == 0 {
            return;
        }
        let mut turns = self.lock();
        for message in [Message::user(question), Message::assistant(answer)] {
            if turns.len() == self.max_turns {
                turns.pop_front();
            }
            turns.push_back(message);
        }
    }

    /// Snapshot of the recorded turns, oldest first.
    #[cfg(test)]
    pub fn turns(&self) -> Vec<Message> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    // Held only for a push or a copy, so a poisoned lock still has consistent contents.
    fn lock(&self) -> MutexGuard<'_, VecDeque<Message>> {
        self.turns.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
