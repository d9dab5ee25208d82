//! Router seam between chain runtimes
//!
//! The router itself (cross-chain fan-out) lives in the host process. A chain
//! runtime registers its writer as the [`MessageHandler`] for its chain id and
//! hands every message its listener observes to [`Router::send`].

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::types::{ChainId, Message};

/// Inbound side: receives messages addressed to one chain
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn resolve_message(&self, message: Message) -> Result<()>;
}

#[async_trait]
pub trait Router: Send + Sync {
    /// Route an outbound message to its destination's handler.
    ///
    /// Fails only if the router cannot accept the message.
    async fn send(&self, message: Message) -> Result<()>;

    /// Register the handler for messages addressed to `chain`
    fn listen(&self, chain: ChainId, handler: Arc<dyn MessageHandler>);
}
