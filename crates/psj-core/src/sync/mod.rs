//! Client `/sync` helpers: filters and response checks.

mod checks;
mod filter;

pub use checks::{sync_joined_to, sync_timeline_has_event_id, SyncCheck};
pub use filter::{is_lazy_loading, lazy_loading_filter, timeline_limit};
