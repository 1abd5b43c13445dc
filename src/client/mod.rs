pub mod reconciler;
pub mod socket;

pub use reconciler::{ClientError, Reconciler, ServerApplied};
pub use socket::{run_client, LocalEdit};
