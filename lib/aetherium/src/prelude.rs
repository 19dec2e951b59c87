//! Convenience re-exports for application crates wiring the substrate together.
pub use crate::concurrency::{Strand, ThreadPool};
pub use crate::config::Config;
pub use crate::db::Database;
pub use crate::dispatcher::{Dispatcher, DispatcherConfig, NetworkHandler, PacketView, Quiescent};
pub use crate::memory::{
    MessageTag, PacketMessage, PacketPool, PacketPoolConfig, SessionPool, SessionPoolConfig,
};
pub use crate::metrics::Metrics;
pub use crate::net::frame::{FrameHeader, Packet, HEADER_SIZE, MAX_PACKET_SIZE};
pub use crate::spatial::SpatialGrid;
pub use crate::timer::{TimerListener, TimerService, TimingWheel};

pub use flux::error::{CoreError, CoreResult};
pub use flux::logging::Logger;
pub use flux::SessionId;
