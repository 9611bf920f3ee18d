pub mod error;
pub mod reconcile;
pub mod report;

pub use error::ReconcileError;
pub use reconcile::{reconcile, spawn, ReconcilerConfig, DEFAULT_SWEEP_INTERVAL};
pub use report::{ReconcileReport, ReconcileRequest};
