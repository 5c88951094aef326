use crate::adpcm::{self, AdpcmState};
use crate::error::Error;
use crate::packet::BadpcmPacket;
use crate::platform::Platform;
use crate::sector_log::SectorLog;
use crate::{BADPCM_DATA_SIZE, UNITS_PER_SECT};
#[cfg(feature = "defmt")]
use defmt::{debug, warn};

/// Outcome of a single [`ReadCursor::step`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReadStep {
    Chunk(BadpcmPacket),
    /// Caught up with a live recording, more data will follow.
    Pending,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ReadPosition {
    pub start: u32,
    pub end: u32,
    pub major: u32,
    pub minor: u8,
}

#[derive(Debug, Clone, Copy)]
struct Reading {
    position: ReadPosition,
    /// Started inside the session that is being recorded, follows it up to `rec_pos`.
    live: bool,
    decoder: AdpcmState,
    /// Valid write units of the sector at `major`, known once its header was read.
    units: u8,
}

/// Sequential read-back of logical sectors still present in the ring.
#[derive(Debug, Default)]
pub(crate) struct ReadCursor {
    reading: Option<Reading>,
}

impl ReadCursor {
    pub(crate) const fn new() -> Self {
        Self { reading: None }
    }

    pub(crate) fn is_reading(&self) -> bool {
        self.reading.is_some()
    }

    pub(crate) fn position(&self) -> Option<ReadPosition> {
        self.reading.map(|r| r.position)
    }

    /// Starts reading at `major`. A start outside of `[window_start, rec_pos]` is moved to the
    /// oldest sector still on flash.
    pub(crate) fn start(&mut self, log: &SectorLog, requested: u32, end: u32) {
        let lower = log.window_start();
        let major = if requested < lower || requested > log.rec_pos() {
            lower
        } else {
            requested
        };

        #[cfg(feature = "defmt")]
        debug!("read {}..{} (requested from {})", major, end, requested);

        self.reading = Some(Reading {
            position: ReadPosition {
                start: major,
                end,
                major,
                minor: 0,
            },
            live: major >= log.rec_start(),
            decoder: AdpcmState::default(),
            units: 0,
        });
    }

    pub(crate) fn stop(&mut self) {
        self.reading = None;
    }

    /// Emits the next chunk, if any. Sectors without a valid header were given up while
    /// recording and are passed over, as are the units after a sector's last valid one. A flash
    /// error stops the cursor.
    pub(crate) fn step<T: Platform>(
        &mut self,
        hal: &mut T,
        log: &SectorLog,
        recording: bool,
    ) -> Result<ReadStep, Error> {
        match self.next_chunk(hal, log, recording) {
            Ok(Some(packet)) => Ok(ReadStep::Chunk(packet)),
            Ok(None) => {
                let pending = self.reading.is_some_and(|r| {
                    r.live && recording && r.position.major < r.position.end
                });
                if pending {
                    Ok(ReadStep::Pending)
                } else {
                    self.reading = None;
                    Ok(ReadStep::Finished)
                }
            }
            Err(e) => {
                self.reading = None;
                Err(e)
            }
        }
    }

    fn next_chunk<T: Platform>(
        &mut self,
        hal: &mut T,
        log: &SectorLog,
        recording: bool,
    ) -> Result<Option<BadpcmPacket>, Error> {
        let Some(reading) = self.reading.as_mut() else {
            return Ok(None);
        };

        loop {
            let lower = log.window_start();
            let position = &mut reading.position;
            if position.major < lower {
                #[cfg(feature = "defmt")]
                warn!("read position {} overwritten, skipping to {}", position.major, lower);

                position.major = lower;
                position.minor = 0;
            }

            let limit = if reading.live {
                log.rec_pos()
            } else {
                log.rec_start()
            };
            let available = position.major < limit
                || (reading.live
                    && recording
                    && position.major == limit
                    && (position.minor as u32) < log.units_in_sector());

            if position.major >= position.end || !available {
                return Ok(None);
            }

            let major = position.major;
            if position.minor == 0 {
                match log.read_header(hal, major)? {
                    Some(header) => {
                        reading.decoder = header.state;
                        reading.units = header.units;
                    }
                    None => reading.units = 0,
                }
            }

            if position.minor >= reading.units {
                #[cfg(feature = "defmt")]
                debug!("read passes over sector {} after {} units", major, reading.units);

                position.major += 1;
                position.minor = 0;
                continue;
            }

            let packet = read_chunk(hal, log, major, position.minor, &mut reading.decoder)?;
            position.minor += 1;
            if position.minor as usize == UNITS_PER_SECT {
                position.major += 1;
                position.minor = 0;
            }
            return Ok(Some(packet));
        }
    }
}

fn read_chunk<T: Platform>(
    hal: &mut T,
    log: &SectorLog,
    major: u32,
    minor: u8,
    decoder: &mut AdpcmState,
) -> Result<BadpcmPacket, Error> {
    let mut data = [0u8; BADPCM_DATA_SIZE];
    log.read_chunk(hal, major, minor, &mut data)?;

    let packet = BadpcmPacket {
        major,
        minor,
        state: *decoder,
        data,
    };
    adpcm::advance(&packet.data, decoder);
    Ok(packet)
}
