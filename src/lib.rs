pub mod cluster;
pub mod codec;
pub mod config;
pub mod discover;
pub mod dispatch;
pub mod notifier;
pub mod operator;
pub mod rebalance;
pub mod shutdown;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
pub type Result<T> = std::result::Result<T, Error>;
