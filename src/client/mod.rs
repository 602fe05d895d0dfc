//! Client side of the sync engine: input, prediction, reconciliation and
//! interpolation of remote entities

pub mod input;
pub mod interpolation;
pub mod predictor;
pub mod reconcile;
pub mod session;

pub use input::{InputAction, InputBinding, InputSequencer, InputState};
pub use interpolation::{InterpolatedState, SnapshotBuffer};
pub use predictor::{Predictor, PredictorState};
pub use reconcile::{ReconcileReport, ReconcileStats, Reconciler};
pub use session::{DesyncReason, Inbound, RenderView, SessionEvent, SessionHandle, SessionLink, SyncSession};

/// Errors raised by the prediction pipeline
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("Pending command queue full ({pending} of {cap})")]
    PendingOverflow { pending: usize, cap: usize },

    #[error("Command {sequence} is not newer than {last}")]
    OutOfOrder { sequence: u64, last: u64 },
}
