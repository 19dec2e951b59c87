//! TCP/UDP I/O layer: wire framing, the recv/send buffer, the per-socket `Session`, the
//! `mio`-driven accept loop, and the UDP session/receiver pair (§4.3, §4.4).
pub mod acceptor;
pub mod buffer;
pub mod frame;
pub mod session;
pub mod udp;

pub use acceptor::Acceptor;
pub use frame::{FrameHeader, Packet, HEADER_SIZE, MAX_PACKET_SIZE};
pub use session::Session;
pub use udp::{UdpReceiver, UdpSession};
