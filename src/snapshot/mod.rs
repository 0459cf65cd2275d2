// Snapshot model, deltas and the reconciliation rules that merge them.

pub mod delta;
pub mod model;
pub mod reconcile;

pub use delta::{Collection, Delta, StatusRemoval};
pub use model::Snapshot;
pub use reconcile::{reconcile, Reconciled, ReconcileError, ReconcileWarning, Update};
