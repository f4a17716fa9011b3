//! The per-game context log (spec.md §4.3).
//!
//! Wraps a [`Generator`] with message-level bookkeeping: which messages are
//! `persistent` (survive trimming regardless of age), and the token ceiling
//! that triggers eviction. Two eviction strategies exist, mirroring
//! `original_source/src/gary/llm/llarry.py`:
//!
//! - **Partial trim**: for generators with an addressable KV cache
//!   (`Generator::supports_partial_trim() == true`), discard the oldest
//!   contiguous run of non-persistent, non-system messages and shift
//!   everything after it down, preserving the remainder byte-for-byte.
//! - **Full reset**: for opaque generators (or when nothing is discardable),
//!   clear everything. The caller is responsible for re-establishing the
//!   system prompt afterward - this module only clears structural state.

use std::collections::BTreeSet;

use crate::generator::{Checkpoint, Generator, Role, TrimOutcome};

/// A single entry in the context log, mirroring what was sent to the
/// generator (not necessarily the raw wire text - e.g. `context` commands
/// are prefixed with the game name before being appended).
#[derive(Debug, Clone)]
pub struct ContextMessage {
    pub role: Role,
    pub text: String,
    pub persistent: bool,
}

/// The context log for a single game. Owns the [`Generator`] and the
/// message-level metadata the generator itself doesn't track.
pub struct ContextLog {
    generator: Box<dyn Generator>,
    messages: Vec<ContextMessage>,
    token_limit: usize,
}

impl ContextLog {
    pub fn new(generator: Box<dyn Generator>, token_limit: usize) -> Self {
        Self {
            generator,
            messages: Vec::new(),
            token_limit,
        }
    }

    pub fn token_count(&self) -> usize {
        self.generator.token_count()
    }

    pub fn token_limit(&self) -> usize {
        self.token_limit
    }

    pub fn messages(&self) -> &[ContextMessage] {
        &self.messages
    }

    /// Appends a message under `role`. `persistent` messages, and all
    /// system-role messages, are exempt from partial trim.
    pub fn append(&mut self, role: Role, text: &str, persistent: bool) -> usize {
        let tokens = self.generator.append_role(role, text);
        self.messages.push(ContextMessage {
            role,
            text: text.to_string(),
            persistent,
        });
        tokens
    }

    /// Captures a restore point, for the caller to roll back an ephemeral
    /// append (spec.md §4.5 `ephemeral_context`).
    pub fn checkpoint(&self) -> (Checkpoint, usize) {
        (self.generator.checkpoint(), self.messages.len())
    }

    /// Rolls the log back to a previously captured checkpoint, discarding
    /// any messages appended since.
    pub fn restore(&mut self, (checkpoint, message_count): (Checkpoint, usize)) {
        self.generator.restore(checkpoint);
        self.messages.truncate(message_count);
    }

    /// The set of message indices that partial trim must never discard:
    /// every system-role message, plus every message explicitly marked
    /// `persistent`.
    fn protected_indices(&self) -> BTreeSet<usize> {
        self.messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role == Role::System || m.persistent)
            .map(|(i, _)| i)
            .collect()
    }

    /// Ensures there is room for `need_tokens` more tokens, trimming or
    /// resetting as necessary. Returns `true` if a reset occurred (the
    /// caller must re-append the system prompt and any other
    /// always-present setup).
    pub fn ensure_room(&mut self, need_tokens: usize) -> bool {
        if self.generator.token_count() + need_tokens <= self.token_limit {
            return false;
        }
        if !self.generator.supports_partial_trim() {
            self.full_reset();
            return true;
        }
        let protected = self.protected_indices();
        match self.generator.partial_trim(self.token_limit, &protected) {
            TrimOutcome::Trimmed {
                discard_start,
                discard_end,
                ..
            } => {
                self.messages.drain(discard_start..discard_end);
                if self.generator.token_count() + need_tokens > self.token_limit {
                    self.full_reset();
                    true
                } else {
                    false
                }
            }
            TrimOutcome::NothingDiscardable | TrimOutcome::Unsupported => {
                self.full_reset();
                true
            }
        }
    }

    /// Clears the generator and all message bookkeeping. The caller must
    /// re-establish the system prompt and any other setup afterward.
    pub fn full_reset(&mut self) {
        self.generator.reset();
        self.messages.clear();
    }

    pub fn generator_mut(&mut self) -> &mut dyn Generator {
        self.generator.as_mut()
    }

    pub fn generator(&self) -> &dyn Generator {
        self.generator.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::MockGenerator;

    fn log_with_limit(limit: usize) -> ContextLog {
        ContextLog::new(Box::new(MockGenerator::new()), limit)
    }

    #[test]
    fn persistent_and_system_messages_survive_partial_trim() {
        let mut log = log_with_limit(6);
        log.append(Role::System, "sys prompt words", true);
        log.append(Role::User, "keep me around please", true);
        log.append(Role::User, "one two three four five", false);
        log.append(Role::Assistant, "six seven eight nine ten", false);
        log.append(Role::User, "recent tail message here", false);

        log.ensure_room(3);

        assert!(log.messages().iter().any(|m| m.text == "sys prompt words"));
        assert!(log
            .messages()
            .iter()
            .any(|m| m.text == "keep me around please"));
    }

    #[test]
    fn full_reset_clears_everything() {
        let mut log = log_with_limit(100);
        log.append(Role::System, "sys", true);
        log.append(Role::User, "hello there", false);
        log.full_reset();
        assert!(log.messages().is_empty());
        assert_eq!(log.token_count(), 0);
    }

    #[test]
    fn ensure_room_is_noop_when_under_limit() {
        let mut log = log_with_limit(100);
        log.append(Role::System, "sys", true);
        let before = log.messages().len();
        let did_reset = log.ensure_room(5);
        assert!(!did_reset);
        assert_eq!(log.messages().len(), before);
    }

    #[test]
    fn checkpoint_restore_discards_ephemeral_messages() {
        let mut log = log_with_limit(100);
        log.append(Role::System, "sys", true);
        let cp = log.checkpoint();
        log.append(Role::User, "ephemeral query text", false);
        assert_eq!(log.messages().len(), 2);
        log.restore(cp);
        assert_eq!(log.messages().len(), 1);
    }
}
