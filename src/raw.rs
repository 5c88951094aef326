use crate::adpcm::AdpcmState;
use crate::checksum::checksum;
use crate::{HEADER_SIZE, NUM_RECS, UNITS_PER_SECT};
use core::fmt::{Debug, Formatter};
use core::mem::size_of;

// Header layout, all fields little endian:
//   0..4    logical index of this sector
//   4..88   session start sectors, oldest first, u32::MAX for empty slots
//   88..90  predicted sample at the start of this sector
//   90      step index at the start of this sector
//   91      reserved (0xFF)
//   92..94  checksum over 0..92
//   94      valid write units if the sector was given up, 0xFF for a complete sector
//   95      reserved (0xFF)
const SECTOR_OFFSET: usize = 0;
const SESSIONS_OFFSET: usize = SECTOR_OFFSET + size_of::<u32>();
const SAMPLE_OFFSET: usize = SESSIONS_OFFSET + NUM_RECS * size_of::<u32>();
const INDEX_OFFSET: usize = SAMPLE_OFFSET + size_of::<i16>();
const CHECKSUM_OFFSET: usize = INDEX_OFFSET + 2;
/// Outside of the checksum so it can be cleared after the header is on flash.
pub(crate) const UNITS_OFFSET: usize = CHECKSUM_OFFSET + 2;
const PAYLOAD_END: usize = UNITS_OFFSET + 1;

const _: () = assert!(
    PAYLOAD_END <= HEADER_SIZE,
    "Sector header fields must fit into the header area"
);

/// Metadata written at the start of every data sector together with its first write unit.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SectorHeader {
    pub sector: u32,
    pub sessions: [u32; NUM_RECS],
    /// Decoder state valid before the first code of this sector.
    pub state: AdpcmState,
    /// Write units holding data of this sector, counted from the first one.
    pub units: u8,
}

impl SectorHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut raw = [0xFFu8; HEADER_SIZE];
        raw[SECTOR_OFFSET..SESSIONS_OFFSET].copy_from_slice(&self.sector.to_le_bytes());
        for (slot, session) in raw[SESSIONS_OFFSET..SAMPLE_OFFSET]
            .chunks_exact_mut(size_of::<u32>())
            .zip(self.sessions.iter())
        {
            slot.copy_from_slice(&session.to_le_bytes());
        }
        raw[SAMPLE_OFFSET..INDEX_OFFSET]
            .copy_from_slice(&self.state.predicted_sample.to_le_bytes());
        raw[INDEX_OFFSET] = self.state.step_index;

        let (a, b) = checksum(&raw[..CHECKSUM_OFFSET]);
        raw[CHECKSUM_OFFSET] = a;
        raw[CHECKSUM_OFFSET + 1] = b;
        if (self.units as usize) < UNITS_PER_SECT {
            raw[UNITS_OFFSET] = self.units;
        }
        raw
    }

    /// Parses a header, returning `None` if the checksum does not match. An erased sector never
    /// parses since the checksum of 92 `0xFF` bytes is not `0xFFFF`.
    pub fn from_bytes(raw: &[u8; HEADER_SIZE]) -> Option<Self> {
        let (a, b) = checksum(&raw[..CHECKSUM_OFFSET]);
        if raw[CHECKSUM_OFFSET] != a || raw[CHECKSUM_OFFSET + 1] != b {
            return None;
        }

        let mut sessions = [u32::MAX; NUM_RECS];
        for (session, slot) in sessions
            .iter_mut()
            .zip(raw[SESSIONS_OFFSET..SAMPLE_OFFSET].chunks_exact(size_of::<u32>()))
        {
            *session = u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]);
        }

        Some(Self {
            sector: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            sessions,
            state: AdpcmState::sanitized(
                i16::from_le_bytes([raw[SAMPLE_OFFSET], raw[SAMPLE_OFFSET + 1]]),
                raw[INDEX_OFFSET],
            ),
            units: raw[UNITS_OFFSET].min(UNITS_PER_SECT as u8),
        })
    }
}

impl Debug for SectorHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let sector = self.sector;
        let sample = self.state.predicted_sample;
        let index = self.state.step_index;
        let newest = self.sessions[NUM_RECS - 1];
        let units = self.units;
        f.write_fmt(format_args!(
            "SectorHeader {{ sector: {sector}, newest session: {newest:#x}, sample: {sample}, index: {index}, units: {units} }}"
        ))
    }
}
