pub mod conflict;
pub mod deletion;
pub mod detector;
pub mod engine;
pub mod file_state;
pub mod history;
pub mod local_io;
pub mod reconciler;
pub mod report;
pub mod sanitizer;
pub mod scanner;
pub mod snapshot;
pub mod transfer;
pub mod watch;

pub use conflict::{
    artifact_stamp, generate_conflict_name, unique_tag, ConflictResolution, ConflictSide,
};
pub use deletion::DeletionTracker;
pub use detector::{ChangeDetector, SyncDiff};
pub use engine::SyncEngine;
pub use file_state::{calculate_hash, key_in_scope, PendingTransition, SeedEntry, StateStore};
pub use history::SyncHistory;
pub use reconciler::{Direction, ReconcilePolicy, Reconciler};
pub use report::{ItemAction, Operation, SyncReport};
pub use sanitizer::{sanitize, PathSanitizer, Sanitized, SkipReason};
pub use scanner::FileScanner;
pub use snapshot::SnapshotBuilder;
pub use transfer::{RemoteTransfer, TransferConfig};
pub use watch::{start_watcher, DebouncedQueue, PathSync, WatchBridge, WatchEvent, WatchEventKind};
