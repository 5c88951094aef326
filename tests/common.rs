#![allow(dead_code)]

// filename according to https://doc.rust-lang.org/book/ch11-03-test-organization.html
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};
use flash_audio_log::error::Error;
use flash_audio_log::{
    Capture, CaptureEnd, Config, LogEngine, OutgoingMessage, PCM_SAMPLES_PER_BUF, PcmChannel,
    PcmTransaction,
};

pub const FLASH_SECTOR_SIZE: usize = 4096;
// Taken from https://github.com/esp-rs/esp-hal/blob/main/esp-storage/src/stub.rs
pub const WORD_SIZE: usize = 4;
pub const COUNTER_HIGH_AREA_SIZE: usize = 2048;

#[derive(Default)]
pub struct Flash {
    pub buf: Vec<u8>,
    pub fail_after_operation: usize,
    pub operations: Vec<Operation>,
    /// Offsets of sectors on which every write and erase fails.
    pub bad_sectors: Vec<u32>,
    /// Addresses on which writes fail, erases still succeed.
    pub bad_words: Vec<u32>,
}

#[derive(Debug, PartialEq, Clone)]
pub enum Operation {
    Read { offset: u32, len: usize },
    Write { offset: u32, len: usize },
    Erase { offset: u32, len: usize },
}

impl Flash {
    pub fn new(pages: usize) -> Self {
        Self {
            buf: vec![0xffu8; FLASH_SECTOR_SIZE * pages],
            fail_after_operation: usize::MAX,
            ..Default::default()
        }
    }

    pub fn new_with_fault(pages: usize, fail_after_operation: usize) -> Self {
        Self {
            buf: vec![0xffu8; FLASH_SECTOR_SIZE * pages],
            fail_after_operation,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn sectors(&self) -> usize {
        self.buf.len() / FLASH_SECTOR_SIZE
    }

    pub fn disable_faults(&mut self) {
        self.fail_after_operation = usize::MAX;
        self.bad_sectors.clear();
        self.bad_words.clear();
    }

    pub fn erases(&mut self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Erase { .. }))
            .count()
    }

    pub fn erases_at(&self, sector: usize) -> usize {
        let at = (sector * FLASH_SECTOR_SIZE) as u32;
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Erase { offset, .. } if *offset == at))
            .count()
    }

    pub fn sector(&self, sector: usize) -> &[u8] {
        &self.buf[sector * FLASH_SECTOR_SIZE..(sector + 1) * FLASH_SECTOR_SIZE]
    }

    /// Writes the two counter sectors at the end of the flash with the given number of cleared
    /// bits and a valid magic.
    pub fn preset_counter(&mut self, low_bits: u32, high_bits: u32) {
        let sectors = self.sectors();
        let low = (sectors - 2) * FLASH_SECTOR_SIZE;
        let high = (sectors - 1) * FLASH_SECTOR_SIZE;

        self.buf[low..low + FLASH_SECTOR_SIZE].copy_from_slice(&marks(low_bits, FLASH_SECTOR_SIZE));
        self.buf[high..high + COUNTER_HIGH_AREA_SIZE]
            .copy_from_slice(&marks(high_bits, COUNTER_HIGH_AREA_SIZE));
        self.buf[high + COUNTER_HIGH_AREA_SIZE..high + COUNTER_HIGH_AREA_SIZE + 4]
            .copy_from_slice(&flash_audio_log::COUNTER_MAGIC.to_le_bytes());
    }

    fn is_bad(&self, from: u32, to: u32) -> bool {
        self.bad_sectors
            .iter()
            .any(|&bad| from < bad + FLASH_SECTOR_SIZE as u32 && bad < to)
    }

    fn is_bad_write(&self, from: u32, to: u32) -> bool {
        self.is_bad(from, to) || self.bad_words.iter().any(|&bad| from <= bad && bad < to)
    }

    /// Position in the operation log of the last write starting in `sector`.
    pub fn last_write_in(&self, sector: usize) -> Option<usize> {
        let range = (sector * FLASH_SECTOR_SIZE) as u32..((sector + 1) * FLASH_SECTOR_SIZE) as u32;
        self.operations
            .iter()
            .rposition(|op| matches!(op, Operation::Write { offset, .. } if range.contains(offset)))
    }

    pub fn dump_operations(&self) {
        println!("Operations:");
        for op in &self.operations {
            println!("  {:?}", op);
        }
    }
}

/// `bits` cleared bits, MSB first, followed by erased bytes.
pub fn marks(bits: u32, size: usize) -> Vec<u8> {
    let mut area = vec![0xffu8; size];
    let full = (bits / 8) as usize;
    area[..full].fill(0x00);
    if bits % 8 != 0 {
        area[full] = 0xff >> (bits % 8);
    }
    area
}

#[derive(Debug)]
pub struct FlashError;

impl NorFlashError for FlashError {
    fn kind(&self) -> NorFlashErrorKind {
        NorFlashErrorKind::Other
    }
}

impl ErrorType for Flash {
    type Error = FlashError;
}

impl ReadNorFlash for Flash {
    const READ_SIZE: usize = WORD_SIZE;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::READ_SIZE as _));

        println!(
            "    flash: read:  0x{offset:04X}[0x{:04X}] #{:>2}",
            bytes.len(),
            self.operations.len()
        );
        if self.operations.len() >= self.fail_after_operation {
            println!("    flash: FAULT");
            return Err(FlashError);
        }
        self.operations.push(Operation::Read {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        bytes.copy_from_slice(&self.buf[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl NorFlash for Flash {
    const WRITE_SIZE: usize = WORD_SIZE;

    const ERASE_SIZE: usize = FLASH_SECTOR_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        assert!(from.is_multiple_of(Self::ERASE_SIZE as _));
        assert!(to.is_multiple_of(Self::ERASE_SIZE as _));

        println!(
            "    flash: erase: {from:04X} - {to:04X} #{:>2}",
            self.operations.len()
        );

        if self.operations.len() >= self.fail_after_operation || self.is_bad(from, to) {
            println!("    flash: FAULT");
            return Err(FlashError);
        }

        self.operations.push(Operation::Erase {
            offset: from,
            len: (to - from) as usize,
        });

        for addr in from..to {
            self.buf[addr as usize] = 0xff;
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::WRITE_SIZE as _));
        assert!(bytes.len().is_multiple_of(Self::WRITE_SIZE as _));

        println!(
            "    flash: write: 0x{offset:04X}[0x{:04X}] #{:>2}",
            bytes.len(),
            self.operations.len()
        );

        if self.operations.len() >= self.fail_after_operation
            || self.is_bad_write(offset, offset + bytes.len() as u32)
        {
            println!("    flash: FAULT");
            return Err(FlashError);
        }
        assert!(!bytes.is_empty());

        self.operations.push(Operation::Write {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        for (i, &val) in bytes.iter().enumerate() {
            // NOR flash can only flip bits from 1 to 0
            self.buf[offset + i] &= val;
        }
        Ok(())
    }
}

/// Capture device producing a deterministic waveform into the buffers it is handed.
pub struct FakeMic<'a> {
    end: CaptureEnd<'a>,
    running: bool,
    held: Option<PcmTransaction>,
    t: u32,
    /// Every sample delivered in a completed buffer.
    pub history: Vec<i16>,
}

impl<'a> FakeMic<'a> {
    pub fn new(end: CaptureEnd<'a>) -> Self {
        Self {
            end,
            running: false,
            held: None,
            t: 0,
            history: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Fills and completes up to `buffers` buffers. Returns how many were delivered; a missing
    /// free buffer counts as an overrun on the channel.
    pub fn produce(&mut self, buffers: usize) -> usize {
        let mut delivered = 0;
        for _ in 0..buffers {
            if !self.running {
                break;
            }
            let Some(mut txn) = self.end.acquire() else {
                continue;
            };
            for sample in txn.samples_mut().iter_mut() {
                *sample = waveform(self.t);
                self.t += 1;
            }
            self.history.extend_from_slice(txn.samples());
            self.end.complete(txn);
            delivered += 1;
        }
        delivered
    }

    /// Takes a buffer as if a transfer into it had started.
    pub fn begin_transfer(&mut self) -> bool {
        if self.held.is_none() {
            self.held = self.end.acquire();
        }
        self.held.is_some()
    }
}

impl Capture for FakeMic<'_> {
    fn start(&mut self) {
        self.running = true;
    }

    fn stop(&mut self) {
        self.running = false;
        if let Some(txn) = self.held.take() {
            self.end.release(txn);
        }
    }
}

fn waveform(t: u32) -> i16 {
    // sawtooth with a slow amplitude sweep, exercises small and large steps
    let phase = (t % 100) as i32 - 50;
    let amplitude = 50 + (t / 100 % 12) as i32 * 50;
    (phase * amplitude) as i16
}

pub type Engine<'a> = LogEngine<'a, &'a mut Flash, FakeMic<'a>>;

pub fn boot<'a>(
    flash: &'a mut Flash,
    channel: &'a mut PcmChannel,
    config: Config,
) -> Result<Engine<'a>, Error> {
    let size = flash.len();
    let (capture, task) = channel.split();
    LogEngine::new(0, size, flash, task, FakeMic::new(capture), config)
}

/// Captures `buffers` buffers, one poll per buffer.
pub fn record(engine: &mut Engine<'_>, buffers: usize) {
    for _ in 0..buffers {
        engine.capture().produce(1);
        engine.poll().unwrap();
    }
}

/// Acts as the transport until the engine has nothing more to send.
pub fn drain_outbound(engine: &mut Engine<'_>) -> Vec<OutgoingMessage> {
    let mut messages = Vec::new();
    loop {
        engine.poll().unwrap();
        match engine.outbound().take() {
            Some(message) => {
                messages.push(message);
                engine.outbound().ack();
            }
            None => break,
        }
    }
    messages
}

pub fn samples_per_sector() -> usize {
    flash_audio_log::ADPCM_BUF_COUNT_PER_SECT * PCM_SAMPLES_PER_BUF
}
