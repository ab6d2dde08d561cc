mod manager;

pub use manager::{ConnectionManager, SyncEvent};
