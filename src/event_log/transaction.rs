use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::log::EventLog;
use crate::error::{Error, Result};
use crate::event::Event;

static NEXT_TX_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a transaction. Moves out of `Open` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Open,
    Committed,
    RolledBack,
}

#[derive(Clone)]
pub(crate) enum TxParent {
    Log(EventLog),
    Tx(Transaction),
}

struct TxState {
    status: TxStatus,
    staged: Vec<Event>,
}

struct TxInner {
    id: u64,
    parent: TxParent,
    state: Mutex<TxState>,
}

/// A staging buffer of events whose parent is the log or an enclosing transaction.
///
/// Staged events are invisible outside the transaction. Commit replays them
/// into the parent in staged order; rollback discards them.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TxInner>,
}

impl Transaction {
    pub(crate) fn new(parent: TxParent) -> Self {
        Self {
            inner: Arc::new(TxInner {
                id: NEXT_TX_ID.fetch_add(1, Ordering::Relaxed),
                parent,
                state: Mutex::new(TxState {
                    status: TxStatus::Open,
                    staged: Vec::new(),
                }),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn status(&self) -> TxStatus {
        self.inner
            .state
            .lock()
            .map(|state| state.status)
            .unwrap_or(TxStatus::RolledBack)
    }

    pub fn is_open(&self) -> bool {
        self.status() == TxStatus::Open
    }

    /// Nesting depth; a transaction directly on the log has depth 1.
    pub fn depth(&self) -> usize {
        match &self.inner.parent {
            TxParent::Log(_) => 1,
            TxParent::Tx(parent) => parent.depth() + 1,
        }
    }

    pub(crate) fn parent(&self) -> &TxParent {
        &self.inner.parent
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, TxState>> {
        self.inner
            .state
            .lock()
            .map_err(|_| Error::LockPoisoned("transaction"))
    }

    pub(crate) fn stage(&self, events: Vec<Event>) -> Result<()> {
        let mut state = self.state()?;
        if state.status != TxStatus::Open {
            return Err(Error::TxDone);
        }
        state.staged.extend(events);
        Ok(())
    }

    /// Parent events followed by this transaction's staged events.
    pub(crate) fn events(&self) -> Result<Vec<Event>> {
        let staged = {
            let state = self.state()?;
            if state.status != TxStatus::Open {
                return Err(Error::TxDone);
            }
            state.staged.clone()
        };

        let mut events = match &self.inner.parent {
            TxParent::Log(log) => log.events()?,
            TxParent::Tx(parent) => parent.events()?,
        };
        events.extend(staged);
        Ok(events)
    }

    pub(crate) fn commit(&self) -> Result<()> {
        let staged = {
            let mut state = self.state()?;
            if state.status != TxStatus::Open {
                return Err(Error::TxDone);
            }
            state.status = TxStatus::Committed;
            std::mem::take(&mut state.staged)
        };

        match &self.inner.parent {
            TxParent::Log(log) => log.append_committed(staged),
            TxParent::Tx(parent) => parent.stage(staged),
        }
    }

    pub(crate) fn rollback(&self) -> Result<()> {
        let mut state = self.state()?;
        if state.status != TxStatus::Open {
            return Err(Error::TxDone);
        }
        state.status = TxStatus::RolledBack;
        state.staged.clear();
        Ok(())
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .field("depth", &self.depth())
            .finish()
    }
}
