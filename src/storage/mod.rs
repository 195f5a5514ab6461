pub mod snapshot;
pub mod wal;

pub use snapshot::{ImageCollection, SnapshotStore, StoreImage};
pub use wal::{KvOp, WalReplayResult, WalStore};
