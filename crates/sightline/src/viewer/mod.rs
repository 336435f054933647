//! Local viewers: session registry and the frame broadcaster

pub mod broadcaster;
pub mod registry;

pub use broadcaster::LocalBroadcaster;
pub use registry::{ChannelSink, RegistryStats, ViewerId, ViewerRegistry, ViewerSink};
