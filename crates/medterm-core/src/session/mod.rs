//! Interactive session state: typed data items, per-session context, and
//! the persisting store.

mod model;
mod store;

pub use model::{DataItem, InteractiveContext, ModificationAction, ModificationRecord};
pub use store::{CleanupStats, SessionStats, SessionStore, SessionUsage, SessionUsageEntry};
