#[cfg(test)] use mockall::automock;
use tracing::{error, info};

use crate::link::link_error::Direction;

/// This trait decouples what happens to inbound telemetry and link errors from the link itself.
///
/// Both callbacks are invoked from the link's tokio tasks, so implementations should return
///  quickly and must not block.
#[cfg_attr(test, automock)]
pub trait LinkObserver: Send + Sync + 'static {
    fn on_message(&self, text: &str);

    fn on_error(&self, direction: Direction, message: &str);
}

/// Surfaces everything through `tracing`
pub struct TracingObserver;

impl LinkObserver for TracingObserver {
    fn on_message(&self, text: &str) {
        info!("received: {}", text);
    }

    fn on_error(&self, direction: Direction, message: &str) {
        error!(%direction, "link error: {}", message);
    }
}
