//! Fixed-size notifications sent over the link, and the single-slot queue gating them.

use crate::adpcm::{self, AdpcmState};
use crate::{BADPCM_DATA_SIZE, NUM_RECS};
use core::mem::size_of;
use heapless::Vec;

pub const STATUS_PACKET_SIZE: usize = size_of::<u32>() * (1 + NUM_RECS + 6);
pub const BADPCM_PACKET_SIZE: usize =
    size_of::<u32>() + 2 * size_of::<u8>() + size_of::<i16>() + BADPCM_DATA_SIZE;
pub const MAX_PACKET_SIZE: usize = if STATUS_PACKET_SIZE > BADPCM_PACKET_SIZE {
    STATUS_PACKET_SIZE
} else {
    BADPCM_PACKET_SIZE
};

/// Decoded samples carried by one [`BadpcmPacket`].
pub const SAMPLES_PER_CHUNK: usize = BADPCM_DATA_SIZE * 2;

pub const FLAG_RECORDING: u32 = 1 << 0;
pub const FLAG_READING: u32 = 1 << 1;

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StatusPacket {
    pub flags: u32,
    pub recordings: [u32; NUM_RECS],
    pub rec_start: u32,
    pub rec_pos: u32,
    pub read_start: u32,
    pub read_end: u32,
    pub read_major: u32,
    pub read_minor: u32,
}

impl StatusPacket {
    pub fn is_recording(&self) -> bool {
        self.flags & FLAG_RECORDING != 0
    }

    pub fn is_reading(&self) -> bool {
        self.flags & FLAG_READING != 0
    }

    pub fn to_bytes(&self) -> [u8; STATUS_PACKET_SIZE] {
        let mut raw = [0u8; STATUS_PACKET_SIZE];
        let words = [self.flags]
            .into_iter()
            .chain(self.recordings)
            .chain([
                self.rec_start,
                self.rec_pos,
                self.read_start,
                self.read_end,
                self.read_major,
                self.read_minor,
            ]);
        for (slot, word) in raw.chunks_exact_mut(size_of::<u32>()).zip(words) {
            slot.copy_from_slice(&word.to_le_bytes());
        }
        raw
    }

    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() != STATUS_PACKET_SIZE {
            return None;
        }
        let mut words = raw
            .chunks_exact(size_of::<u32>())
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]));
        let mut next = || words.next().unwrap_or(u32::MAX);

        let flags = next();
        let mut recordings = [u32::MAX; NUM_RECS];
        recordings.iter_mut().for_each(|r| *r = next());
        Some(Self {
            flags,
            recordings,
            rec_start: next(),
            rec_pos: next(),
            read_start: next(),
            read_end: next(),
            read_major: next(),
            read_minor: next(),
        })
    }
}

/// One write unit of encoded audio with the decoder state needed to play it on its own.
#[derive(Clone, PartialEq, Eq)]
pub struct BadpcmPacket {
    pub major: u32,
    pub minor: u8,
    /// Decoder state before the first code in `data`.
    pub state: AdpcmState,
    pub data: [u8; BADPCM_DATA_SIZE],
}

impl BadpcmPacket {
    pub fn to_bytes(&self) -> [u8; BADPCM_PACKET_SIZE] {
        let mut raw = [0u8; BADPCM_PACKET_SIZE];
        raw[0..4].copy_from_slice(&self.major.to_le_bytes());
        raw[4] = self.minor;
        raw[5] = self.state.step_index;
        raw[6..8].copy_from_slice(&self.state.predicted_sample.to_le_bytes());
        raw[8..].copy_from_slice(&self.data);
        raw
    }

    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() != BADPCM_PACKET_SIZE {
            return None;
        }
        let mut data = [0u8; BADPCM_DATA_SIZE];
        data.copy_from_slice(&raw[8..]);
        Some(Self {
            major: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            minor: raw[4],
            state: AdpcmState::sanitized(i16::from_le_bytes([raw[6], raw[7]]), raw[5]),
            data,
        })
    }

    /// Receiver side: decodes the chunk without any context from earlier packets.
    pub fn decode_into(&self, out: &mut [i16; SAMPLES_PER_CHUNK]) {
        let mut state = self.state;
        adpcm::decode_block(&self.data, &mut state, out);
    }
}

impl core::fmt::Debug for BadpcmPacket {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BadpcmPacket")
            .field("major", &self.major)
            .field("minor", &self.minor)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingMessage {
    Status(StatusPacket),
    AudioChunk(BadpcmPacket),
}

impl OutgoingMessage {
    pub fn to_bytes(&self) -> Vec<u8, MAX_PACKET_SIZE> {
        let mut out = Vec::new();
        // both encodings fit MAX_PACKET_SIZE
        let _ = match self {
            OutgoingMessage::Status(status) => out.extend_from_slice(&status.to_bytes()),
            OutgoingMessage::AudioChunk(chunk) => out.extend_from_slice(&chunk.to_bytes()),
        };
        out
    }
}

enum Slot {
    Free,
    Queued(OutgoingMessage),
    InFlight,
}

/// Pool of exactly one outgoing buffer. A message is queued by the engine, taken by the
/// transport and stays in flight until [`OutboundQueue::ack`]. Nothing new is queued in between.
pub struct OutboundQueue {
    slot: Slot,
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundQueue {
    pub const fn new() -> Self {
        Self { slot: Slot::Free }
    }

    pub fn is_free(&self) -> bool {
        matches!(self.slot, Slot::Free)
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self.slot, Slot::InFlight)
    }

    /// Returns the message back if the slot is occupied.
    pub(crate) fn push(&mut self, message: OutgoingMessage) -> Result<(), OutgoingMessage> {
        if !self.is_free() {
            return Err(message);
        }
        self.slot = Slot::Queued(message);
        Ok(())
    }

    /// Hands the queued message to the transport.
    pub fn take(&mut self) -> Option<OutgoingMessage> {
        match core::mem::replace(&mut self.slot, Slot::InFlight) {
            Slot::Queued(message) => Some(message),
            other => {
                self.slot = other;
                None
            }
        }
    }

    /// The transport finished sending the message taken last; frees the slot.
    pub fn ack(&mut self) {
        if self.is_in_flight() {
            self.slot = Slot::Free;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> StatusPacket {
        StatusPacket {
            flags: FLAG_READING,
            recordings: [u32::MAX; NUM_RECS],
            rec_start: 1,
            rec_pos: 2,
            read_start: 3,
            read_end: 4,
            read_major: 5,
            read_minor: 6,
        }
    }

    #[test]
    fn sizes() {
        assert_eq!(STATUS_PACKET_SIZE, 112);
        assert_eq!(BADPCM_PACKET_SIZE, 168);
        assert_eq!(MAX_PACKET_SIZE, 168);
    }

    #[test]
    fn status_layout() {
        let raw = status().to_bytes();
        assert_eq!(&raw[0..4], &[2, 0, 0, 0]);
        assert_eq!(&raw[88..92], &[1, 0, 0, 0]);
        assert_eq!(&raw[108..112], &[6, 0, 0, 0]);
        assert_eq!(StatusPacket::from_bytes(&raw), Some(status()));
        assert!(StatusPacket::from_bytes(&raw[1..]).is_none());
    }

    #[test]
    fn chunk_layout() {
        let packet = BadpcmPacket {
            major: 0x0A0B_0C0D,
            minor: 7,
            state: AdpcmState::new(-3, 12),
            data: [0x5A; BADPCM_DATA_SIZE],
        };
        let raw = packet.to_bytes();
        assert_eq!(&raw[..8], &[0x0D, 0x0C, 0x0B, 0x0A, 7, 12, 0xFD, 0xFF]);
        assert_eq!(BadpcmPacket::from_bytes(&raw), Some(packet));
    }

    #[test]
    fn single_slot() {
        let mut queue = OutboundQueue::new();
        assert!(queue.take().is_none());

        queue.push(OutgoingMessage::Status(status())).unwrap();
        assert!(queue.push(OutgoingMessage::Status(status())).is_err());

        assert_eq!(queue.take(), Some(OutgoingMessage::Status(status())));
        assert!(queue.is_in_flight());
        assert!(queue.take().is_none());
        assert!(queue.push(OutgoingMessage::Status(status())).is_err());

        queue.ack();
        assert!(queue.is_free());
        assert_eq!(
            OutgoingMessage::Status(status()).to_bytes().len(),
            STATUS_PACKET_SIZE
        );
    }
}
