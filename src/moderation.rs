//! # Moderation Seam
//!
//! Optional content screening for thoughts before they reach a world. The
//! relay treats moderation as an injectable capability: a [`ModerationGuard`]
//! classifies text, and a [`ModerationPolicy`] decides what happens when the
//! guard itself fails.
//!
//! Moderation is disabled by default. When enabled, classification is the
//! only asynchronous suspension point in the message path, so the relay runs
//! it off the event loop and re-validates that the sender is still connected
//! before acting on the verdict (see the session module).
//!
//! ## Failure Policy
//!
//! A guard error is treated as "moderation unavailable", resolved by the
//! configured policy:
//!
//! - [`ModerationPolicy::FailOpen`] (default): the thought is admitted and
//!   continues to the rate limiter. Matches the reference deployment, which
//!   runs with the guard disabled.
//! - [`ModerationPolicy::FailClosed`]: the thought is rejected with the
//!   moderation notice.
//!
//! Whichever policy is configured applies consistently; there is no silent
//! mixed mode.

use async_trait::async_trait;

/// How a guard failure (not a toxic verdict) resolves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ModerationPolicy {
    /// Admit the message when the guard is unavailable.
    #[default]
    FailOpen,
    /// Reject the message when the guard is unavailable.
    FailClosed,
}

impl ModerationPolicy {
    /// Whether a message should be admitted after a guard error.
    pub fn admit_on_error(&self) -> bool {
        matches!(self, Self::FailOpen)
    }
}

/// Content classifier consulted before a thought is forwarded.
///
/// Implementations may suspend (remote classifiers, model inference). The
/// relay guarantees a suspended check never blocks other connections'
/// events, and that a verdict arriving after the sender disconnected is
/// discarded.
#[async_trait]
pub trait ModerationGuard: Send + Sync + 'static {
    /// Returns true if the text should be blocked.
    async fn is_toxic(&self, text: &str) -> anyhow::Result<bool>;
}

/// Word-list guard: blocks text containing any configured term,
/// case-insensitively. Cheap, deterministic, and used by tests; a model-based
/// classifier would implement the same trait.
pub struct BlocklistGuard {
    terms: Vec<String>,
}

impl BlocklistGuard {
    pub fn new<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            terms: terms
                .into_iter()
                .map(|t| t.into().to_lowercase())
                .collect(),
        }
    }
}

#[async_trait]
impl ModerationGuard for BlocklistGuard {
    async fn is_toxic(&self, text: &str) -> anyhow::Result<bool> {
        let lowered = text.to_lowercase();
        Ok(self.terms.iter().any(|term| lowered.contains(term)))
    }
}
