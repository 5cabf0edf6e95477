use thiserror::Error;

/// Failures that end a reconciliation run (or one code's slice of a batch).
///
/// `AmbiguousLayer` is deliberately absent: an undeterminable path layout
/// skips the single operation and is reported, it never fails the run.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The registry store cannot be reached or rejected the connection.
    #[error("registry store unavailable: {0}")]
    StoreUnavailable(String),

    /// The named user role does not exist, so permission checks for it
    /// cannot run. Other discrepancy kinds still proceed.
    #[error("user role '{0}' not found")]
    RoleNotFound(String),

    /// A precondition snapshot no longer matched at apply time. The whole
    /// transaction for the code is rolled back.
    #[error(
        "operation {index} precondition changed between planning and apply: expected {expected}, found {found}"
    )]
    ConcurrentModification {
        index: usize,
        expected: String,
        found: String,
    },

    /// The store rejected a write mid-transaction. Rolled back, never
    /// partially committed, and never retried here.
    #[error("operation {index} ({operation}) failed: {cause}")]
    ApplyFailed {
        index: usize,
        operation: String,
        cause: String,
    },
}
