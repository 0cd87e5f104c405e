pub mod core;
pub mod error;
pub mod gateway;
pub mod models;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod speed_limiter;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{DownloadError, FetchError, StoreError};
pub use gateway::{FetchGateway, HttpGateway};
pub use scheduler::TaskScheduler;
pub use store::TaskStore;
