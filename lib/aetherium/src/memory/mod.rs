pub mod packet_pool;
pub mod session_pool;

pub use packet_pool::{IoRefHandle, MessageTag, PacketMessage, PacketPool, PacketPoolConfig};
pub use session_pool::{Recyclable, SessionPool, SessionPoolConfig};
