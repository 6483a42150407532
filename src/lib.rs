// src/lib.rs
pub mod batcher;
pub mod changes;
pub mod constants;
pub mod options;
pub mod puller;
pub mod replica_client;
pub mod revision;
pub mod runtime;
pub mod sequence_map;
pub mod store;

// Re-export main types
pub use batcher::Batcher;
pub use changes::{ChangeEntry, ChangeFeedMode, ChangeLeaf, ChangesPage, revisions_from_entry};
pub use options::{Authorizer, PullOptions, PullOptionsBuilder};
pub use puller::{LogPullLogger, PullEvent, PullLogger, PullStats, PullStatus, Puller};
pub use replica_client::{BulkRow, ReplicaClient, is_offline_error};
pub use revision::{PulledRevision, RemoteSequence, expand_revision_history, generation_of};
pub use runtime::{PullRuntime, TaskCounter};
pub use sequence_map::SequenceMap;
pub use store::{InsertOutcome, ReplicaStore, TransactionResult};
