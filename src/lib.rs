pub mod calendar;
pub mod storage;
pub mod sync;

pub use calendar::{Event, EventBook, LocalId, RemoteId};
pub use storage::asset_cache::{AssetCache, AssetManifest};
pub use storage::mutation_store::{Mutation, MutationStore, PendingMutation};
pub use sync::gateway::{Delivery, EventCommand, EventDraft, MutationGateway};
pub use sync::network::{NetworkMonitor, NetworkSignal};
pub use sync::sync_engine::{DrainOutcome, DrainReport, SyncEngine, SyncState};
