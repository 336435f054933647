//! Forwards upstream descriptions to local viewers

use std::sync::Arc;

use tracing::debug;

use crate::protocol::{DescriptionResult, Envelope};
use crate::viewer::ViewerRegistry;

/// Stateless bridge from the upstream link to the viewer registry.
#[derive(Clone)]
pub struct ResultRouter {
    registry: Arc<ViewerRegistry>,
}

impl ResultRouter {
    pub fn new(registry: Arc<ViewerRegistry>) -> Self {
        Self { registry }
    }

    /// Broadcast a description to every viewer; returns how many accepted it.
    pub async fn route(&self, result: DescriptionResult) -> usize {
        let chars = result.content.chars().count();
        let delivered = self.registry.broadcast(&Envelope::description(result)).await;
        debug!(delivered, chars, "Description routed");
        delivered
    }
}
