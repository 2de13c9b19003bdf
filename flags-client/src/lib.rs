pub mod admin;
pub mod bus;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod overrides;
pub mod resolver;
pub mod session;
pub mod storage;

pub use config::ClientConfig;
pub use error::ClientError;
pub use resolver::merge;
pub use session::Session;
pub use storage::StorageArea;
