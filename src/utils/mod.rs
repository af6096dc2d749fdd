pub mod compress;
pub mod config;
pub mod logging;
pub mod retry;
pub mod temp_file;

pub use retry::RetryPolicy;
