pub mod clients;
pub mod config;
pub mod lock;
pub mod mapping;
pub mod media;
pub mod models;
pub mod storage;
pub mod sync;
pub mod warehouse;

// Convenient re-exports for tests and external callers
pub use clients::*;
pub use config::*;
pub use lock::*;
pub use models::*;
pub use storage::*;
pub use sync::*;
