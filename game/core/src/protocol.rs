//! Outbound wire packets the room broadcasts. The core only requires `IPacket`/`Packet` (§1); this
//! is this crate's own concrete schema, hand-encoded with `byteorder` the same way the transport
//! header itself is (§6).
use aetherium::prelude::{Packet, HEADER_SIZE};
use byteorder::{ByteOrder, LittleEndian};

use crate::entity::EntityState;

pub const PACKET_SPAWN: u16 = 1;
pub const PACKET_DESPAWN: u16 = 2;
pub const PACKET_HP_CHANGE: u16 = 3;
pub const PACKET_POSITION_SYNC: u16 = 4;
pub const PACKET_POSITION_ACK: u16 = 5;
pub const PACKET_STATE_CHANGE: u16 = 6;
pub const PACKET_GAME_OVER: u16 = 7;

/// Sent by a client once it has finished loading and is ready to play; RUNNING is reached once
/// every joined session has sent one (§4.10 state machine).
pub const PACKET_GAME_READY: u16 = 100;
/// Carries a client's desired movement input for one tick, applied directly by the room since
/// players have no AI movement strategy of their own.
pub const PACKET_CLIENT_INPUT: u16 = 101;

/// Decoded form of an inbound [`PACKET_CLIENT_INPUT`] payload: `{input_tick:u64, vx:f32, vy:f32}`.
pub struct ClientInput {
    pub input_tick: u64,
    pub vx: f32,
    pub vy: f32,
}

impl ClientInput {
    pub fn decode(payload: &[u8]) -> Option<ClientInput> {
        if payload.len() < 16 {
            return None;
        }
        Some(ClientInput {
            input_tick: LittleEndian::read_u64(&payload[0..8]),
            vx: LittleEndian::read_f32(&payload[8..12]),
            vy: LittleEndian::read_f32(&payload[12..16]),
        })
    }
}

pub struct SpawnNotice {
    pub id: u64,
    pub x: f32,
    pub y: f32,
}

impl Packet for SpawnNotice {
    fn packet_id(&self) -> u16 {
        PACKET_SPAWN
    }
    fn total_size(&self) -> usize {
        HEADER_SIZE + 16
    }
    fn serialize_to(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.id);
        LittleEndian::write_f32(&mut buf[8..12], self.x);
        LittleEndian::write_f32(&mut buf[12..16], self.y);
    }
}

pub struct DespawnNotice {
    pub ids: Vec<u64>,
}

impl Packet for DespawnNotice {
    fn packet_id(&self) -> u16 {
        PACKET_DESPAWN
    }
    fn total_size(&self) -> usize {
        HEADER_SIZE + 4 + self.ids.len() * 8
    }
    fn serialize_to(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.ids.len() as u32);
        for (i, id) in self.ids.iter().enumerate() {
            let off = 4 + i * 8;
            LittleEndian::write_u64(&mut buf[off..off + 8], *id);
        }
    }
}

pub struct HpChangeNotice {
    pub id: u64,
    pub hp: i32,
}

impl Packet for HpChangeNotice {
    fn packet_id(&self) -> u16 {
        PACKET_HP_CHANGE
    }
    fn total_size(&self) -> usize {
        HEADER_SIZE + 12
    }
    fn serialize_to(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.id);
        LittleEndian::write_i32(&mut buf[8..12], self.hp);
    }
}

/// One row of a [`PositionSyncBatch`]; `state` is the wire encoding of [`EntityState`].
pub struct PositionEntry {
    pub id: u64,
    pub x: f32,
    pub y: f32,
    pub vx: f32,
    pub vy: f32,
    pub state: EntityState,
    pub facing: f32,
}

const POSITION_ENTRY_SIZE: usize = 8 + 4 + 4 + 4 + 4 + 1 + 4;

fn encode_state(state: EntityState) -> u8 {
    match state {
        EntityState::Alive => 0,
        EntityState::Dead => 1,
        EntityState::Expired => 2,
    }
}

/// Batched position update for every live entity in one tick (§4.10 step 9). Entries with a
/// NaN/Inf position are filtered out by the room before this is constructed.
pub struct PositionSyncBatch {
    pub entries: Vec<PositionEntry>,
}

impl Packet for PositionSyncBatch {
    fn packet_id(&self) -> u16 {
        PACKET_POSITION_SYNC
    }
    fn total_size(&self) -> usize {
        HEADER_SIZE + 4 + self.entries.len() * POSITION_ENTRY_SIZE
    }
    fn serialize_to(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.entries.len() as u32);
        let mut off = 4;
        for entry in &self.entries {
            LittleEndian::write_u64(&mut buf[off..off + 8], entry.id);
            LittleEndian::write_f32(&mut buf[off + 8..off + 12], entry.x);
            LittleEndian::write_f32(&mut buf[off + 12..off + 16], entry.y);
            LittleEndian::write_f32(&mut buf[off + 16..off + 20], entry.vx);
            LittleEndian::write_f32(&mut buf[off + 20..off + 24], entry.vy);
            buf[off + 24] = encode_state(entry.state);
            LittleEndian::write_f32(&mut buf[off + 25..off + 29], entry.facing);
            off += POSITION_ENTRY_SIZE;
        }
    }
}

/// Echoes the last input tick this player's client had processed, for client-side prediction
/// reconciliation (§4.10 step 9).
pub struct PositionAck {
    pub player_id: u64,
    pub last_input_tick: u64,
}

impl Packet for PositionAck {
    fn packet_id(&self) -> u16 {
        PACKET_POSITION_ACK
    }
    fn total_size(&self) -> usize {
        HEADER_SIZE + 16
    }
    fn serialize_to(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.player_id);
        LittleEndian::write_u64(&mut buf[8..16], self.last_input_tick);
    }
}

pub struct GameOverNotice {
    pub victory: bool,
}

impl Packet for GameOverNotice {
    fn packet_id(&self) -> u16 {
        PACKET_GAME_OVER
    }
    fn total_size(&self) -> usize {
        HEADER_SIZE + 1
    }
    fn serialize_to(&self, buf: &mut [u8]) {
        buf[0] = self.victory as u8;
    }
}

/// Mirrors a room's `RoomPhase` (Lobby=0, Ready=1, Running=2, Ended=3) for clients tracking the
/// match state machine.
pub struct StateChangeNotice {
    pub state: u8,
}

impl Packet for StateChangeNotice {
    fn packet_id(&self) -> u16 {
        PACKET_STATE_CHANGE
    }
    fn total_size(&self) -> usize {
        HEADER_SIZE + 1
    }
    fn serialize_to(&self, buf: &mut [u8]) {
        buf[0] = self.state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aetherium::prelude::FrameHeader;

    #[test]
    fn spawn_notice_encodes_id_and_position() {
        let packet = SpawnNotice { id: 42, x: 1.5, y: -2.5 };
        let buf = aetherium::net::frame::encode(&packet);
        let header = FrameHeader::parse(&buf[..HEADER_SIZE]);
        assert_eq!(header.id, PACKET_SPAWN);
        assert_eq!(LittleEndian::read_u64(&buf[HEADER_SIZE..HEADER_SIZE + 8]), 42);
        assert_eq!(LittleEndian::read_f32(&buf[HEADER_SIZE + 8..HEADER_SIZE + 12]), 1.5);
    }

    #[test]
    fn client_input_rejects_a_truncated_payload() {
        assert!(ClientInput::decode(&[0u8; 8]).is_none());
    }

    #[test]
    fn client_input_decodes_tick_and_velocity() {
        let mut payload = [0u8; 16];
        LittleEndian::write_u64(&mut payload[0..8], 7);
        LittleEndian::write_f32(&mut payload[8..12], 1.5);
        LittleEndian::write_f32(&mut payload[12..16], -2.0);
        let input = ClientInput::decode(&payload).unwrap();
        assert_eq!(input.input_tick, 7);
        assert_eq!(input.vx, 1.5);
        assert_eq!(input.vy, -2.0);
    }

    #[test]
    fn position_sync_batch_round_trips_entry_count() {
        let packet = PositionSyncBatch {
            entries: vec![
                PositionEntry { id: 1, x: 0.0, y: 0.0, vx: 1.0, vy: 0.0, state: EntityState::Alive, facing: 0.0 },
                PositionEntry { id: 2, x: 5.0, y: 5.0, vx: 0.0, vy: 1.0, state: EntityState::Dead, facing: 1.2 },
            ],
        };
        let buf = aetherium::net::frame::encode(&packet);
        assert_eq!(buf.len(), HEADER_SIZE + 4 + 2 * POSITION_ENTRY_SIZE);
        assert_eq!(LittleEndian::read_u32(&buf[HEADER_SIZE..HEADER_SIZE + 4]), 2);
    }
}
