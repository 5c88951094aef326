//! Ring of data sectors the encoded stream is written into.
//!
//! Every sector starts with a [`SectorHeader`] followed by [`UNITS_PER_SECT`] write units. The
//! header is written together with the first unit, so a sector either has a valid header or is
//! still erased. The logical index of the sector being filled is the value of the
//! [`MonotonicSectorCounter`], which is only incremented once the last unit of a sector is on
//! flash.

use crate::adpcm::AdpcmState;
use crate::counter::MonotonicSectorCounter;
use crate::error::Error;
use crate::platform::{self, Platform};
use crate::raw::{SectorHeader, UNITS_OFFSET};
use crate::{
    ADPCM_BUF_COUNT_PER_SECT, BADPCM_DATA_SIZE, BUFS_PER_WRITE_UNIT, HEADER_SIZE, NUM_RECS,
    SECTOR_SIZE, UNITS_PER_SECT,
};
#[cfg(feature = "defmt")]
use defmt::{debug, trace, warn};

/// Outcome of [`SectorLog::append_unit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Append {
    /// The unit was written, the sector has room for more.
    Unit,
    /// The sector was closed and the counter advanced.
    SectorAdvanced,
    /// The sector was closed and the session reached its length limit.
    SessionFull,
}

pub(crate) struct SectorLog {
    base: u32,
    data_sectors: u32,
    rec_start: u32,
    rec_pos: u32,
    /// Frames written in the current session.
    frames: u32,
    /// Frames written into `rec_pos`.
    frames_in_sect: u32,
    /// Encoder state before the first code of `rec_pos`.
    sector_state: AdpcmState,
    /// Logical sector known to be erased and untouched.
    erased: Option<u32>,
    skipped: u32,
}

impl SectorLog {
    pub(crate) fn new(base: u32, data_sectors: u32, counter_value: u32) -> Self {
        Self {
            base,
            data_sectors,
            rec_start: counter_value,
            rec_pos: counter_value,
            frames: 0,
            frames_in_sect: 0,
            sector_state: AdpcmState::default(),
            erased: None,
            skipped: 0,
        }
    }

    pub(crate) fn rec_start(&self) -> u32 {
        self.rec_start
    }

    pub(crate) fn rec_pos(&self) -> u32 {
        self.rec_pos
    }

    pub(crate) fn data_sectors(&self) -> u32 {
        self.data_sectors
    }

    pub(crate) fn frames(&self) -> u32 {
        self.frames
    }

    /// Write units already on flash in the sector at `rec_pos`.
    pub(crate) fn units_in_sector(&self) -> u32 {
        self.frames_in_sect / BUFS_PER_WRITE_UNIT as u32
    }

    pub(crate) fn skipped_sectors(&self) -> u32 {
        self.skipped
    }

    /// Oldest logical sector that has not been overwritten by the ring yet.
    pub(crate) fn window_start(&self) -> u32 {
        self.rec_pos.saturating_sub(self.data_sectors - 1)
    }

    fn sector_offset(&self, sector: u32) -> u32 {
        self.base + (sector % self.data_sectors) * SECTOR_SIZE as u32
    }

    /// Opens a session at the current counter value. The first sector is erased unless the
    /// previous session already erased it ahead.
    pub(crate) fn start<T: Platform>(&mut self, hal: &mut T, counter: &MonotonicSectorCounter) {
        self.rec_start = counter.value();
        self.rec_pos = self.rec_start;
        self.frames = 0;
        self.frames_in_sect = 0;
        self.sector_state = AdpcmState::default();

        #[cfg(feature = "defmt")]
        debug!("session start @{}", self.rec_start);

        // a failed erase is retried with the first unit
        self.ensure_erased(hal, self.rec_pos).ok();
    }

    /// Closes the session. Returns its start sector if it committed at least one sector; an
    /// empty session leaves nothing behind since its partial sector is reused by the next one.
    pub(crate) fn stop(&mut self) -> Option<u32> {
        let start = self.rec_start;
        self.rec_start = self.rec_pos;
        self.frames_in_sect = 0;

        #[cfg(feature = "defmt")]
        debug!("session stop {}..{}", start, self.rec_pos);

        (self.rec_pos > start).then_some(start)
    }

    fn ensure_erased<T: Platform>(&mut self, hal: &mut T, sector: u32) -> Result<(), Error> {
        if self.erased == Some(sector) {
            return Ok(());
        }

        let offset = self.sector_offset(sector);
        match platform::erase(hal, offset, offset + SECTOR_SIZE as u32) {
            Ok(()) => {
                self.erased = Some(sector);
                Ok(())
            }
            Err(e) => {
                #[cfg(feature = "defmt")]
                warn!("erase of sector {} failed", sector);

                self.erased = None;
                Err(e)
            }
        }
    }

    /// Persists one write unit. `state` is the encoder state after the last code of `unit`,
    /// `sessions` the history to embed if this unit opens a sector.
    ///
    /// A unit that cannot be written after retries causes its sector to be skipped: the rest of
    /// the sector is dropped and the counter advances right away. Only counter failures are
    /// returned as errors.
    pub(crate) fn append_unit<T: Platform>(
        &mut self,
        hal: &mut T,
        counter: &mut MonotonicSectorCounter,
        unit: &[u8; BADPCM_DATA_SIZE],
        state: AdpcmState,
        sessions: &[u32; NUM_RECS],
        max_sectors: u32,
    ) -> Result<Append, Error> {
        let written = if self.frames_in_sect == 0 {
            self.write_first_unit(hal, unit, sessions)
        } else {
            let at = HEADER_SIZE as u32 + self.units_in_sector() * BADPCM_DATA_SIZE as u32;
            platform::write_verified(hal, self.sector_offset(self.rec_pos) + at, unit)
        };

        self.frames += BUFS_PER_WRITE_UNIT as u32;

        match written {
            Ok(()) => {
                self.frames_in_sect += BUFS_PER_WRITE_UNIT as u32;
                if self.frames_in_sect < ADPCM_BUF_COUNT_PER_SECT as u32 {
                    return Ok(Append::Unit);
                }
            }
            Err(_) => {
                #[cfg(feature = "defmt")]
                warn!(
                    "skipping sector {} after {} units",
                    self.rec_pos,
                    self.units_in_sector()
                );

                self.mark_skipped(hal);
                self.skipped += 1;
            }
        }

        self.advance(hal, counter, state, max_sectors)
    }

    fn write_first_unit<T: Platform>(
        &mut self,
        hal: &mut T,
        unit: &[u8; BADPCM_DATA_SIZE],
        sessions: &[u32; NUM_RECS],
    ) -> Result<(), Error> {
        self.ensure_erased(hal, self.rec_pos)?;
        // from here on the sector holds data of this session
        self.erased = None;

        let header = SectorHeader {
            sector: self.rec_pos,
            sessions: *sessions,
            state: self.sector_state,
            units: UNITS_PER_SECT as u8,
        };

        #[cfg(feature = "defmt")]
        trace!("open sector {}", self.rec_pos);

        let mut buf = [0xFFu8; HEADER_SIZE + BADPCM_DATA_SIZE];
        buf[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
        buf[HEADER_SIZE..].copy_from_slice(unit);
        platform::write_verified(hal, self.sector_offset(self.rec_pos), &buf)
    }

    /// Clears the units byte of the header so readers stop after the units that made it to
    /// flash. Without a valid header the sector is skipped by readers anyway.
    fn mark_skipped<T: Platform>(&mut self, hal: &mut T) {
        let at = self.sector_offset(self.rec_pos) + UNITS_OFFSET as u32;
        let units = self.units_in_sector() as u8;
        if let Err(_e) = platform::write_byte_verified(hal, at, units) {
            #[cfg(feature = "defmt")]
            warn!("marking sector {} failed: {}", self.rec_pos, _e);
        }
    }

    fn advance<T: Platform>(
        &mut self,
        hal: &mut T,
        counter: &mut MonotonicSectorCounter,
        state: AdpcmState,
        max_sectors: u32,
    ) -> Result<Append, Error> {
        counter.increment(hal)?;
        self.rec_pos = counter.value();
        self.frames_in_sect = 0;
        self.sector_state = state;

        #[cfg(feature = "defmt")]
        debug!("sector advance to {}", self.rec_pos);

        // a failed erase ahead is retried with the first unit of the sector
        self.ensure_erased(hal, self.rec_pos).ok();

        if self.rec_pos - self.rec_start >= max_sectors {
            Ok(Append::SessionFull)
        } else {
            Ok(Append::SectorAdvanced)
        }
    }

    /// Header of a logical sector, if it is intact and belongs to that sector.
    pub(crate) fn read_header<T: Platform>(
        &self,
        hal: &mut T,
        sector: u32,
    ) -> Result<Option<SectorHeader>, Error> {
        let mut raw = [0u8; HEADER_SIZE];
        platform::read(hal, self.sector_offset(sector), &mut raw)?;
        Ok(SectorHeader::from_bytes(&raw).filter(|header| header.sector == sector))
    }

    /// Newest sector at or before `sector` with an intact header, looking back at most one pass
    /// of the ring.
    pub(crate) fn find_header<T: Platform>(
        &self,
        hal: &mut T,
        sector: u32,
    ) -> Result<Option<SectorHeader>, Error> {
        let oldest = sector.saturating_sub(self.data_sectors - 1);
        for candidate in (oldest..=sector).rev() {
            if let Some(header) = self.read_header(hal, candidate)? {
                return Ok(Some(header));
            }
        }
        Ok(None)
    }

    /// Raw codes of write unit `chunk` of a logical sector.
    pub(crate) fn read_chunk<T: Platform>(
        &self,
        hal: &mut T,
        sector: u32,
        chunk: u8,
        buf: &mut [u8; BADPCM_DATA_SIZE],
    ) -> Result<(), Error> {
        debug_assert!((chunk as usize) < UNITS_PER_SECT);
        let at = HEADER_SIZE as u32 + chunk as u32 * BADPCM_DATA_SIZE as u32;
        platform::read(hal, self.sector_offset(sector) + at, buf)
    }
}
