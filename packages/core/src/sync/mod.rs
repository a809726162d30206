//! Synchronization of the local store with the remote source.

pub mod error;
pub mod events;
pub mod ingest;
pub mod orchestrator;
pub mod reconcile;
pub mod state;
pub mod throttle;

pub use error::{ErrorKind, SyncError};
pub use events::{ChangeEvent, EventBus};
pub use ingest::{BatchSender, IngestPipeline, IngestReport};
pub use orchestrator::{PassReport, Step, StepFailure, SyncOrchestrator, SyncSettings, Trigger};
pub use reconcile::{
    make_diff, AnnotationCollection, Diff, LocalCollection, MetricCollection,
    NotificationCollection, ReconcileReport, Reconciler, SyncEntity,
};
pub use state::{SyncState, SyncStatus};
pub use throttle::Throttle;
