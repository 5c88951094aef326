use crate::adpcm::{self, AdpcmState};
use crate::capture::PcmTransaction;
use crate::{ADPCM_BUF_SIZE, BADPCM_DATA_SIZE, BUFS_PER_WRITE_UNIT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RecordingState {
    Idle,
    Recording,
}

/// Encoder side of a recording: turns PCM buffers into write units.
pub struct RecordingPipeline {
    state: RecordingState,
    encoder: AdpcmState,
    unit: [u8; BADPCM_DATA_SIZE],
    slot: usize,
}

impl Default for RecordingPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingPipeline {
    pub const fn new() -> Self {
        Self {
            state: RecordingState::Idle,
            encoder: AdpcmState::new(0, 0),
            unit: [0xFF; BADPCM_DATA_SIZE],
            slot: 0,
        }
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        self.state == RecordingState::Recording
    }

    pub fn start(&mut self) {
        self.state = RecordingState::Recording;
        self.encoder = AdpcmState::default();
        self.slot = 0;
    }

    /// Drops a partially filled write unit.
    pub fn stop(&mut self) {
        self.state = RecordingState::Idle;
        self.slot = 0;
    }

    /// Encodes one capture buffer into the next slot of the current write unit. Returns `true`
    /// once the unit is complete and ready to be handed to the sector log.
    pub fn encode(&mut self, txn: &PcmTransaction) -> bool {
        let at = self.slot * ADPCM_BUF_SIZE;
        adpcm::encode_block(
            txn.samples(),
            &mut self.encoder,
            &mut self.unit[at..at + ADPCM_BUF_SIZE],
        );

        self.slot += 1;
        if self.slot == BUFS_PER_WRITE_UNIT {
            self.slot = 0;
            true
        } else {
            false
        }
    }

    /// The last completed write unit.
    pub fn unit(&self) -> &[u8; BADPCM_DATA_SIZE] {
        &self.unit
    }

    /// Encoder state after the last encoded sample.
    pub fn encoder_state(&self) -> AdpcmState {
        self.encoder
    }
}
