pub mod endpoint;
pub mod errors;

pub use errors::FlagError;
