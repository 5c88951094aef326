#![doc = include_str!("../README.md")]
#![cfg_attr(not(target_arch = "x86_64"), no_std)]

pub mod adpcm;
pub mod capture;
pub mod checksum;
pub mod command;
pub mod counter;
pub mod error;
pub mod packet;
pub mod pipeline;
pub mod platform;
mod raw;
mod read_cursor;
mod sector_log;
pub mod session;

/// Erase granularity the sector layout is built around.
pub const SECTOR_SIZE: usize = 4096;
/// Bytes reserved for the sector header at the start of every data sector.
pub const HEADER_SIZE: usize = 96;
/// Encoded bytes per capture buffer (two codes per byte).
pub const ADPCM_BUF_SIZE: usize = 40;
/// Encoded buffers ("frames") per data sector.
pub const ADPCM_BUF_COUNT_PER_SECT: usize = 100;
pub const ADPCM_SIZE_PER_SECT: usize = ADPCM_BUF_SIZE * ADPCM_BUF_COUNT_PER_SECT;
/// Frames collected before a flash write.
pub const BUFS_PER_WRITE_UNIT: usize = 4;
/// Size of one write unit, which is also the payload of a [`packet::BadpcmPacket`].
pub const BADPCM_DATA_SIZE: usize = ADPCM_BUF_SIZE * BUFS_PER_WRITE_UNIT;
pub const UNITS_PER_SECT: usize = ADPCM_BUF_COUNT_PER_SECT / BUFS_PER_WRITE_UNIT;
pub const PCM_SAMPLES_PER_BUF: usize = ADPCM_BUF_SIZE * 2;
/// Capture buffers circulating between interrupt and task.
pub const PCMBUF_NUM: usize = 4;
/// Sessions remembered in every sector header.
pub const NUM_RECS: usize = 21;

pub const DEFAULT_RESERVED_SECTORS: u32 = 2;
/// One hour at 16 kHz.
pub const DEFAULT_MAX_RECORDING_SECTORS: u32 = 7200;

const _: () = assert!(
    HEADER_SIZE + ADPCM_SIZE_PER_SECT <= SECTOR_SIZE,
    "Header and payload must fit into a flash sector"
);
const _: () = assert!(ADPCM_BUF_COUNT_PER_SECT % BUFS_PER_WRITE_UNIT == 0);
const _: () = assert!(UNITS_PER_SECT <= u8::MAX as usize);

pub use adpcm::AdpcmState;
pub use capture::{Capture, CaptureEnd, PcmChannel, PcmTransaction, TaskEnd};
pub use command::{Command, Opcode};
pub use counter::{COUNTER_MAGIC, CounterState};
pub use packet::{BadpcmPacket, OutboundQueue, OutgoingMessage, StatusPacket};
pub use read_cursor::ReadPosition;
pub use session::SessionTracker;

use crate::command::CommandQueue;
use crate::counter::MonotonicSectorCounter;
use crate::error::Error;
use crate::packet::{FLAG_READING, FLAG_RECORDING};
use crate::pipeline::RecordingPipeline;
use crate::platform::{AlignedOps, Platform};
use crate::read_cursor::{ReadCursor, ReadStep};
use crate::sector_log::{Append, SectorLog};
#[cfg(feature = "defmt")]
use defmt::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Trailing sectors of the partition kept out of the data ring. The counter lives in the
    /// last two, so this is at least 2.
    pub reserved_sectors: u32,
    /// A session is stopped once it spans this many sectors.
    pub max_recording_sectors: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reserved_sectors: DEFAULT_RESERVED_SECTORS,
            max_recording_sectors: DEFAULT_MAX_RECORDING_SECTORS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogStatistics {
    pub counter: CounterState,
    pub rec_start: u32,
    pub rec_pos: u32,
    pub data_sectors: u32,
    /// Frames written in the current or last session.
    pub frames: u32,
    pub sessions: SessionTracker,
    pub overruns: u32,
    pub skipped_sectors: u32,
    pub recording: bool,
    pub reading: bool,
    pub faulted: bool,
}

/// Work done by one [`LogEngine::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PollStatus {
    /// Capture buffers encoded.
    pub encoded: usize,
    /// Messages placed into the outbound slot.
    pub emitted: usize,
    /// Nothing is queued anymore, the caller may wait for the next capture, command or
    /// transport signal.
    pub idle: bool,
}

/// The audio log: owns the flash, the capture device and all recording and read-back state.
/// Driven by a single task through [`LogEngine::poll`].
pub struct LogEngine<'a, T: Platform, C: Capture> {
    hal: T,
    capture: C,
    task: TaskEnd<'a>,
    config: Config,
    faulted: bool,

    counter: MonotonicSectorCounter,
    log: SectorLog,
    sessions: SessionTracker,
    pipeline: RecordingPipeline,
    reader: ReadCursor,
    commands: CommandQueue,
    outbound: OutboundQueue,
    status_dirty: bool,
}

impl<'a, T: Platform, C: Capture> LogEngine<'a, T, C> {
    /// Takes over the partition at `partition_offset`. The last two sectors hold the sector
    /// counter, the data ring starts at the first sector.
    ///
    /// The counter is loaded (or reset if it cannot be trusted) and the session history is
    /// restored from the newest sector header that is intact, normally the one of the last
    /// committed sector.
    pub fn new(
        partition_offset: usize,
        partition_size: usize,
        mut hal: T,
        task: TaskEnd<'a>,
        capture: C,
        config: Config,
    ) -> Result<Self, Error> {
        if !partition_offset.is_multiple_of(SECTOR_SIZE) {
            return Err(Error::InvalidPartitionOffset);
        }

        if !partition_size.is_multiple_of(SECTOR_SIZE) {
            return Err(Error::InvalidPartitionSize);
        }

        if T::ERASE_SIZE != SECTOR_SIZE {
            return Err(Error::UnsupportedSectorSize);
        }

        if !T::supported_alignment() {
            return Err(Error::UnsupportedAlignment);
        }

        let sectors = (partition_size / SECTOR_SIZE) as u32;
        if config.reserved_sectors < DEFAULT_RESERVED_SECTORS
            || sectors < config.reserved_sectors + 2
        {
            return Err(Error::InvalidPartitionSize);
        }

        let base = partition_offset as u32;
        let counter = MonotonicSectorCounter::load(
            &mut hal,
            base + (sectors - 2) * SECTOR_SIZE as u32,
            base + (sectors - 1) * SECTOR_SIZE as u32,
        )?;
        let log = SectorLog::new(base, sectors - config.reserved_sectors, counter.value());

        let sessions = match counter.value().checked_sub(1) {
            Some(last) => log
                .find_header(&mut hal, last)?
                .map(|header| SessionTracker::from_header(header.sessions))
                .unwrap_or_default(),
            None => SessionTracker::new(),
        };

        #[cfg(feature = "defmt")]
        info!(
            "audio log: {} data sectors, counter {}, last session {}",
            log.data_sectors(),
            counter.value(),
            sessions.latest()
        );

        Ok(Self {
            hal,
            capture,
            task,
            config: Config {
                max_recording_sectors: config.max_recording_sectors.max(1),
                ..config
            },
            faulted: false,
            counter,
            log,
            sessions,
            pipeline: RecordingPipeline::new(),
            reader: ReadCursor::new(),
            commands: CommandQueue::new(),
            outbound: OutboundQueue::new(),
            status_dirty: false,
        })
    }

    /// Opens a new session at the current counter value and starts capture.
    pub fn start_recording(&mut self) -> Result<(), Error> {
        if self.faulted {
            return Err(Error::FlashError);
        }

        if self.pipeline.is_recording() {
            return Err(Error::AlreadyRecording);
        }

        self.log.start(&mut self.hal, &self.counter);
        self.pipeline.start();
        self.capture.start();
        self.status_dirty = true;
        Ok(())
    }

    /// Stops capture and closes the session. Buffers captured up to this call are still
    /// encoded. A partially filled sector is not committed, the next session starts over in it.
    pub fn stop_recording(&mut self) -> Result<(), Error> {
        if !self.pipeline.is_recording() {
            return Err(Error::NotRecording);
        }

        self.capture.stop();
        if let Err(e) = self.drain_capture() {
            self.fault(e);
            return Err(e);
        }

        // the drain may have hit the session limit already
        if self.pipeline.is_recording() {
            self.halt();
        }
        Ok(())
    }

    fn halt(&mut self) {
        self.capture.stop();
        while let Some(txn) = self.task.take_ready() {
            self.task.recycle(txn);
        }

        self.pipeline.stop();
        if let Some(start) = self.log.stop() {
            self.sessions.push(start);
        }
        self.status_dirty = true;
    }

    fn fault(&mut self, _error: Error) {
        #[cfg(feature = "defmt")]
        warn!("recording failed: {}", _error);

        self.halt();
        self.faulted = true;
    }

    /// Starts streaming sectors `start..end` through the outbound queue. `start` is moved to
    /// the oldest retained sector if it is no longer (or not yet) on flash.
    pub fn start_read(&mut self, start: u32, end: u32) -> Result<(), Error> {
        if self.faulted {
            return Err(Error::FlashError);
        }

        if start >= end {
            return Err(Error::InvalidReadRange);
        }

        self.reader.start(&self.log, start, end);
        self.status_dirty = true;
        Ok(())
    }

    pub fn stop_read(&mut self) {
        if self.reader.is_reading() {
            self.reader.stop();
            self.status_dirty = true;
        }
    }

    /// Parses a control write and queues it for the next [`LogEngine::poll`].
    pub fn submit_command(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let command = Command::parse(bytes)?;
        self.commands.push(command)
    }

    /// Queues a [`StatusPacket`] ahead of any further audio chunk.
    pub fn request_status(&mut self) {
        self.status_dirty = true;
    }

    /// One iteration of the task loop: encodes and persists ready capture buffers, executes
    /// queued commands and fills the outbound slot if it is free.
    ///
    /// Errors from the recording side latch the engine: capture is stopped and every later call
    /// returns [`Error::FlashError`]. A read error only ends the read.
    pub fn poll(&mut self) -> Result<PollStatus, Error> {
        if self.faulted {
            return Err(Error::FlashError);
        }

        self.task.clear_wake();
        let encoded = match self.drain_capture() {
            Ok(encoded) => encoded,
            Err(e) => {
                self.fault(e);
                return Err(e);
            }
        };

        self.drain_commands();
        let emitted = self.pump_outbound()?;

        Ok(PollStatus {
            encoded,
            emitted,
            idle: self.task.ready_count() == 0 && self.commands.is_empty(),
        })
    }

    fn drain_capture(&mut self) -> Result<usize, Error> {
        let mut encoded = 0;
        while let Some(txn) = self.task.take_ready() {
            if !txn.is_filled() || !self.pipeline.is_recording() {
                self.task.recycle(txn);
                continue;
            }

            let complete = self.pipeline.encode(&txn);
            self.task.recycle(txn);
            encoded += 1;
            if !complete {
                continue;
            }

            let sessions = self.sessions.with_pending(self.log.rec_start());
            let append = self.log.append_unit(
                &mut self.hal,
                &mut self.counter,
                self.pipeline.unit(),
                self.pipeline.encoder_state(),
                &sessions,
                self.config.max_recording_sectors,
            )?;

            if append == Append::SessionFull {
                #[cfg(feature = "defmt")]
                info!("session reached {} sectors, stopping", self.config.max_recording_sectors);

                self.halt();
            }
        }
        Ok(encoded)
    }

    fn drain_commands(&mut self) {
        while let Some(command) = self.commands.pop() {
            let result = match command {
                Command::StartRecording => self.start_recording(),
                Command::StopRecording => self.stop_recording(),
                Command::StartRead { start, end } => self.start_read(start, end),
                Command::StopRead => {
                    self.stop_read();
                    Ok(())
                }
            };

            if let Err(_e) = result {
                #[cfg(feature = "defmt")]
                warn!("command {} ignored: {}", command.opcode(), _e);
            }
        }
    }

    fn pump_outbound(&mut self) -> Result<usize, Error> {
        let mut emitted = 0;
        while self.outbound.is_free() {
            if self.status_dirty {
                self.status_dirty = false;
                let status = self.status();
                if self.outbound.push(OutgoingMessage::Status(status)).is_ok() {
                    emitted += 1;
                }
                continue;
            }

            if !self.reader.is_reading() {
                break;
            }

            let step = self
                .reader
                .step(&mut self.hal, &self.log, self.pipeline.is_recording());
            match step {
                Ok(ReadStep::Chunk(packet)) => {
                    if self.outbound.push(OutgoingMessage::AudioChunk(packet)).is_ok() {
                        emitted += 1;
                    }
                }
                Ok(ReadStep::Pending) => break,
                Ok(ReadStep::Finished) => self.status_dirty = true,
                Err(e) => {
                    self.status_dirty = true;
                    return Err(e);
                }
            }
        }
        Ok(emitted)
    }

    /// Transport side of the single outgoing buffer.
    pub fn outbound(&mut self) -> &mut OutboundQueue {
        &mut self.outbound
    }

    /// The capture device, e.g. to forward its completion interrupt.
    pub fn capture(&mut self) -> &mut C {
        &mut self.capture
    }

    pub fn status(&self) -> StatusPacket {
        let mut flags = 0;
        if self.pipeline.is_recording() {
            flags |= FLAG_RECORDING;
        }
        if self.reader.is_reading() {
            flags |= FLAG_READING;
        }

        let read = self.reader.position().unwrap_or(ReadPosition {
            start: 0,
            end: 0,
            major: 0,
            minor: 0,
        });

        StatusPacket {
            flags,
            recordings: *self.sessions.starts(),
            rec_start: self.log.rec_start(),
            rec_pos: self.log.rec_pos(),
            read_start: read.start,
            read_end: read.end,
            read_major: read.major,
            read_minor: read.minor as u32,
        }
    }

    pub fn statistics(&self) -> LogStatistics {
        LogStatistics {
            counter: self.counter.state(),
            rec_start: self.log.rec_start(),
            rec_pos: self.log.rec_pos(),
            data_sectors: self.log.data_sectors(),
            frames: self.log.frames(),
            sessions: self.sessions.clone(),
            overruns: self.task.overruns(),
            skipped_sectors: self.log.skipped_sectors(),
            recording: self.pipeline.is_recording(),
            reading: self.reader.is_reading(),
            faulted: self.faulted,
        }
    }

    pub fn counter_value(&self) -> u32 {
        self.counter.value()
    }

    pub fn sessions(&self) -> &SessionTracker {
        &self.sessions
    }

    pub fn is_recording(&self) -> bool {
        self.pipeline.is_recording()
    }

    pub fn is_reading(&self) -> bool {
        self.reader.is_reading()
    }
}
