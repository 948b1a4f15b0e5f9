use crate::locks::LockCategory;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Portfolio state error: {0}")]
    Ledger(#[from] portfolio::LedgerError),

    #[error("Order state error: {0}")]
    Order(#[from] core_types::CoreError),

    #[error("Ledger mutation needs the {expected} lock, caller holds {held}")]
    WrongLock {
        expected: LockCategory,
        held: LockCategory,
    },

    #[error("Worker pool has been stopped")]
    PoolStopped,
}
