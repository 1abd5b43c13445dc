pub mod text;

use thiserror::Error;

use crate::models::Step;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("step cannot be applied: {0}")]
    InvalidStep(String),
    #[error("malformed step payload: {0}")]
    MalformedStep(#[from] serde_json::Error),
}

/// Outcome of rebasing locally pending steps over foreign steps.
pub struct Rebased {
    /// Document with the incoming steps applied.
    pub document: serde_json::Value,
    /// Pending steps remapped so they stay valid after the incoming ones.
    pub pending: Vec<Step>,
}

/// Capability supplied by the document-transform library.
///
/// The sync engine treats documents and steps as opaque JSON and routes every
/// apply and rebase through this trait; it never inspects step internals.
pub trait Transform: Send + Sync + 'static {
    /// Apply a single step to a document, producing the new document.
    fn apply(&self, document: &serde_json::Value, step: &Step)
        -> Result<serde_json::Value, TransformError>;

    /// Client-side receive: apply `incoming` to `document`, then remap
    /// `pending` (sequential, unconfirmed local steps) over them.
    fn rebase(
        &self,
        document: &serde_json::Value,
        incoming: &[Step],
        pending: &[Step],
    ) -> Result<Rebased, TransformError>;
}
