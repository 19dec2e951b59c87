//! The TCP/UDP wire header: `{u16 size (including header, LE), u16 id, payload[size-4]}`.
//! Grounded on the original `t51core`/`neutronium` frame encoding, simplified down to the single
//! header shape the core contract requires — the handshake/control-frame machinery the teacher
//! used for its own session bootstrap is out of scope here (see DESIGN.md).
use byteorder::{ByteOrder, LittleEndian};

/// Size of the wire header in bytes: `size` (u16) + `id` (u16).
pub const HEADER_SIZE: usize = 4;

/// Maximum total frame size (header + payload) accepted on a TCP connection.
pub const MAX_PACKET_SIZE: usize = 10 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total size of the frame, including this header.
    pub size: u16,
    pub id: u16,
}

impl FrameHeader {
    #[inline]
    pub fn body_len(&self) -> usize {
        self.size as usize - HEADER_SIZE
    }

    /// Parses a header out of the first `HEADER_SIZE` bytes of `buf`. The caller is responsible
    /// for making sure at least that many bytes are available.
    #[inline]
    pub fn parse(buf: &[u8]) -> FrameHeader {
        debug_assert!(buf.len() >= HEADER_SIZE);
        FrameHeader {
            size: LittleEndian::read_u16(&buf[0..2]),
            id: LittleEndian::read_u16(&buf[2..4]),
        }
    }

    #[inline]
    pub fn write(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        LittleEndian::write_u16(&mut buf[0..2], self.size);
        LittleEndian::write_u16(&mut buf[2..4], self.id);
    }

    /// `size` must be non-zero and must not describe a frame larger than `MAX_PACKET_SIZE`; a
    /// violation of either is a `ProtocolViolation` per §7, not a `Wait`.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.size as usize >= HEADER_SIZE && self.size as usize <= MAX_PACKET_SIZE
    }
}

/// Application-level packet contract consumed from the application: the core never interprets
/// the payload schema, only asks for its id, total wire size and a way to serialize into a buffer.
pub trait Packet {
    fn packet_id(&self) -> u16;
    /// Total wire size including the header.
    fn total_size(&self) -> usize;
    /// Serializes the body (not the header) into `buf`, which is guaranteed to be at least
    /// `total_size() - HEADER_SIZE` bytes long.
    fn serialize_to(&self, buf: &mut [u8]);
}

/// Encodes `packet` into a freshly-sized buffer with the header already filled in.
pub fn encode(packet: &dyn Packet) -> Vec<u8> {
    let total = packet.total_size();
    let mut buf = vec![0u8; total];
    FrameHeader {
        size: total as u16,
        id: packet.packet_id(),
    }
    .write(&mut buf);
    packet.serialize_to(&mut buf[HEADER_SIZE..]);
    buf
}
