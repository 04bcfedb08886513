//! Transaction handle state machine.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::{Result, StoreError};

static NEXT_TX_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a transaction handle, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(u64);

impl TxId {
    pub(crate) fn next() -> Self {
        Self(NEXT_TX_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// The state of a transaction handle.
///
/// ```text
/// Idle ──► Active ──┬──► Committed
///                   └──► Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TxState {
    #[default]
    Idle,
    Active,
    Committed,
    Aborted,
}

impl TxState {
    /// Returns true if store operations may run against the handle.
    pub fn is_active(&self) -> bool {
        matches!(self, TxState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TxState::Committed | TxState::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxState::Idle => "Idle",
            TxState::Active => "Active",
            TxState::Committed => "Committed",
            TxState::Aborted => "Aborted",
        }
    }
}

impl std::fmt::Display for TxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity and lifecycle of one transaction handle. Each backend embeds
/// one in its handle type.
#[derive(Debug)]
pub struct TxStatus {
    id: TxId,
    state: TxState,
}

impl TxStatus {
    pub(crate) fn new() -> Self {
        Self {
            id: TxId::next(),
            state: TxState::Idle,
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub(crate) fn activate(&mut self) -> Result<()> {
        self.transition(TxState::Idle, TxState::Active)
    }

    pub(crate) fn mark_committed(&mut self) -> Result<()> {
        self.transition(TxState::Active, TxState::Committed)
    }

    /// Aborting is allowed from `Idle` too, so a handle whose `BEGIN`
    /// failed can still be discarded cleanly.
    pub(crate) fn mark_aborted(&mut self) -> Result<()> {
        if self.state.is_terminal() {
            return Err(self.not_active());
        }
        self.state = TxState::Aborted;
        Ok(())
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        if self.state.is_active() {
            Ok(())
        } else {
            Err(self.not_active())
        }
    }

    fn transition(&mut self, from: TxState, to: TxState) -> Result<()> {
        if self.state != from {
            return Err(self.not_active());
        }
        self.state = to;
        Ok(())
    }

    fn not_active(&self) -> StoreError {
        StoreError::TransactionNotActive {
            id: self.id,
            state: self.state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_commit() {
        let mut status = TxStatus::new();
        assert_eq!(status.state(), TxState::Idle);
        assert!(status.ensure_active().is_err());

        status.activate().unwrap();
        status.ensure_active().unwrap();

        status.mark_committed().unwrap();
        assert_eq!(status.state(), TxState::Committed);
        assert!(matches!(
            status.ensure_active(),
            Err(StoreError::TransactionNotActive {
                state: TxState::Committed,
                ..
            })
        ));
    }

    #[test]
    fn terminal_states_cannot_transition() {
        let mut status = TxStatus::new();
        status.activate().unwrap();
        status.mark_aborted().unwrap();

        assert!(status.mark_committed().is_err());
        assert!(status.mark_aborted().is_err());
        assert!(status.activate().is_err());
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(TxStatus::new().id(), TxStatus::new().id());
    }

    #[test]
    fn display() {
        assert_eq!(TxState::Active.to_string(), "Active");
        assert!(TxId(7).to_string().ends_with('7'));
    }
}
