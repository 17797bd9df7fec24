//! Optimistic transition with reconciliation.
//!
//! A local action proposes the next state, which is shown immediately. The
//! server later confirms it, rejects it (rolling back to the confirmed state),
//! or settles on a state of its own.

use std::fmt::Debug;

use taskmatch_core::CoreError;

/// A confirmed state plus at most one pending local proposal.
#[derive(Debug, Clone, PartialEq)]
pub struct Optimistic<S> {
    confirmed: S,
    pending: Option<S>,
}

impl<S: Copy + PartialEq + Debug> Optimistic<S> {
    pub fn new(initial: S) -> Self {
        Self {
            confirmed: initial,
            pending: None,
        }
    }

    /// State as displayed: the pending proposal if any.
    pub fn current(&self) -> S {
        self.pending.unwrap_or(self.confirmed)
    }

    pub fn confirmed(&self) -> S {
        self.confirmed
    }

    pub fn pending(&self) -> Option<S> {
        self.pending
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Apply `next` locally. Only one proposal may be outstanding.
    pub fn propose(&mut self, next: S) -> Result<(), CoreError> {
        if let Some(pending) = self.pending {
            return Err(CoreError::ActionPending(format!("{:?}", pending)));
        }
        self.pending = Some(next);
        Ok(())
    }

    /// Commit the pending proposal. Returns the committed state.
    pub fn confirm(&mut self) -> Option<S> {
        let next = self.pending.take()?;
        self.confirmed = next;
        Some(next)
    }

    /// Drop the pending proposal and fall back to the confirmed state.
    /// Returns the rolled-back proposal.
    pub fn reject(&mut self) -> Option<S> {
        self.pending.take()
    }

    /// Take an authoritative state from the server, discarding any proposal.
    pub fn settle(&mut self, authoritative: S) {
        self.confirmed = authoritative;
        self.pending = None;
    }

    /// Move the confirmed state while keeping an outstanding proposal.
    pub fn advance(&mut self, confirmed: S) {
        self.confirmed = confirmed;
    }
}
