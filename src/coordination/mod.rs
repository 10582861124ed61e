pub mod coalescer;
pub mod debounce;
pub mod version_guard;

pub use coalescer::RequestCoalescer;
pub use debounce::{FlushHandler, NotificationDebouncer};
pub use version_guard::{RequestVersionToken, VersionedResultGuard};
