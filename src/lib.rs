pub mod config;
pub mod driver;
pub mod error;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
pub mod worker;
