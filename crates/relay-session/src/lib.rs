//! Session orchestration for the session relay.
//!
//! Provides:
//! - `SessionManager` - Drive protocol connections and device pairing
//! - `SessionCache` - TTL index of session state
//! - `LifecycleBus` - Ordered fan-out of session transitions
//! - Storage implementations (memory, SQLite)

pub mod cache;
pub mod lifecycle;
pub mod manager;
pub mod storage;

pub use cache::{CacheStats, SessionCache};
pub use lifecycle::{BusStats, HandlerError, LifecycleBus, LifecycleHandler, SessionActivity};
pub use manager::{ConnectOutcome, ManagerError, SessionManager};
