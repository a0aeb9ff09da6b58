use std::error::Error;

use async_trait::async_trait;

pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

pub mod aggregator;
pub mod config;
pub mod dispatcher;
pub mod events;
pub mod metrics;
pub mod relay;
pub mod relayer;
pub mod settlement;

#[cfg(test)]
mod test_utils;

/// Provides the current chain tip, used to stamp the block height into failure messages.
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn current_height(&self) -> u32;
}
