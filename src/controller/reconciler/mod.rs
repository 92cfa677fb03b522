//! # Reconciler
//!
//! Reconciliation of `GitRepo` resources.
//!
//! ## Reconciliation Flow
//!
//! 1. Re-read the GitRepo; forget its polling task once it is gone
//! 2. Release it when it is being deleted
//! 3. Authorize it against the restrictions of its namespace
//! 4. Register (or drop, with `disablePolling`) its polling task
//! 5. Resolve the next commit and manage the apply job for it
//! 6. Roll the bundle deployments up into the status
//! 7. Write the reconcile-owned part of the status back

pub mod reconcile;
pub mod types;

pub use reconcile::{apply_reconciled_fields, reconcile};
pub use types::{BackoffState, Reconciler, ReconcilerError, TriggerSource};
