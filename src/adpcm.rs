//! 4-bit IMA style ADPCM.
//!
//! Two codes are packed per byte, the earlier sample in the low nibble. Decoding the codes
//! produced by [`encode`] walks through exactly the same [`AdpcmState`] sequence as the encoder
//! did, which is what lets a reader resume decoding from any state checkpoint stored on flash.

/// Table of index changes
const INDEX_TABLE: [i8; 16] = [-1, -1, -1, -1, 2, 4, 6, 8, -1, -1, -1, -1, 2, 4, 6, 8];

/// Quantizer step size lookup table
const STEP_SIZE_TABLE: [i32; 89] = [
    7, 8, 9, 10, 11, 12, 13, 14, 16, 17, 19, 21, 23, 25, 28, 31, 34, 37, 41, 45, 50, 55, 60, 66,
    73, 80, 88, 97, 107, 118, 130, 143, 157, 173, 190, 209, 230, 253, 279, 307, 337, 371, 408, 449,
    494, 544, 598, 658, 724, 796, 876, 963, 1060, 1166, 1282, 1411, 1552, 1707, 1878, 2066, 2272,
    2499, 2749, 3024, 3327, 3660, 4026, 4428, 4871, 5358, 5894, 6484, 7132, 7845, 8630, 9493,
    10442, 11487, 12635, 13899, 15289, 16818, 18500, 20350, 22385, 24623, 27086, 29794, 32767,
];

pub const MAX_STEP_INDEX: u8 = 88;

// Both directions clamp to the same symmetric range. A decoder clamping at -32768 would drift one
// LSB away from the encoder after a full-scale negative excursion.
const SAMPLE_MIN: i32 = -32767;
const SAMPLE_MAX: i32 = 32767;

/// Predictor state shared by encoder and decoder.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdpcmState {
    pub predicted_sample: i16,
    pub step_index: u8,
}

impl AdpcmState {
    pub const fn new(predicted_sample: i16, step_index: u8) -> Self {
        Self {
            predicted_sample,
            step_index,
        }
    }

    /// Builds a state from untrusted bytes, e.g. a sector header, clamping the step index.
    pub fn sanitized(predicted_sample: i16, step_index: u8) -> Self {
        Self::new(predicted_sample, step_index.min(MAX_STEP_INDEX))
    }

    fn apply(&mut self, code: u8, diffq: i32) {
        let predicted = i32::from(self.predicted_sample);
        let predicted = if code & 8 != 0 {
            predicted - diffq
        } else {
            predicted + diffq
        };
        self.predicted_sample = predicted.clamp(SAMPLE_MIN, SAMPLE_MAX) as i16;

        let index = i32::from(self.step_index) + i32::from(INDEX_TABLE[code as usize]);
        self.step_index = index.clamp(0, i32::from(MAX_STEP_INDEX)) as u8;
    }

    fn step(&self) -> i32 {
        STEP_SIZE_TABLE[usize::from(self.step_index.min(MAX_STEP_INDEX))]
    }
}

/// Quantizes `sample` against the prediction in `state` and returns the 4-bit code.
pub fn encode(sample: i16, state: &mut AdpcmState) -> u8 {
    let mut step = state.step();
    let mut diff = i32::from(sample) - i32::from(state.predicted_sample);

    let mut code = 0u8;
    if diff < 0 {
        code = 8;
        diff = -diff;
    }

    let mut diffq = step >> 3;
    if diff >= step {
        code |= 4;
        diff -= step;
        diffq += step;
    }
    step >>= 1;
    if diff >= step {
        code |= 2;
        diff -= step;
        diffq += step;
    }
    step >>= 1;
    if diff >= step {
        code |= 1;
        diffq += step;
    }

    state.apply(code, diffq);
    code & 0x0F
}

/// Reconstructs the next sample from a 4-bit `code`.
pub fn decode(code: u8, state: &mut AdpcmState) -> i16 {
    let code = code & 0x0F;
    let step = state.step();

    let mut diffq = step >> 3;
    if code & 4 != 0 {
        diffq += step;
    }
    if code & 2 != 0 {
        diffq += step >> 1;
    }
    if code & 1 != 0 {
        diffq += step >> 2;
    }

    state.apply(code, diffq);
    state.predicted_sample
}

/// Encodes pairs of samples into `out`, which must hold `samples.len() / 2` bytes.
pub fn encode_block(samples: &[i16], state: &mut AdpcmState, out: &mut [u8]) {
    for (pair, byte) in samples.chunks_exact(2).zip(out.iter_mut()) {
        let lo = encode(pair[0], state);
        let hi = encode(pair[1], state);
        *byte = (hi << 4) | lo;
    }
}

/// Decodes packed codes into `out`, which must hold `data.len() * 2` samples.
pub fn decode_block(data: &[u8], state: &mut AdpcmState, out: &mut [i16]) {
    for (&byte, pair) in data.iter().zip(out.chunks_exact_mut(2)) {
        pair[0] = decode(byte & 0x0F, state);
        pair[1] = decode(byte >> 4, state);
    }
}

/// Runs the decoder over `data` only for its effect on `state`.
pub fn advance(data: &[u8], state: &mut AdpcmState) {
    for &byte in data {
        decode(byte & 0x0F, state);
        decode(byte >> 4, state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(len: usize) -> impl Iterator<Item = i16> {
        let mut seed = 0x1234_5678u32;
        (0..len).map(move |i| {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let noise = ((seed >> 16) & 0x03FF) as i32 - 512;
            let ramp = ((i as i32 * 97) % 40_000) - 20_000;
            (ramp + noise).clamp(-32768, 32767) as i16
        })
    }

    #[test]
    fn zero_input_stays_quiet() {
        let mut state = AdpcmState::default();
        for _ in 0..16 {
            assert_eq!(encode(0, &mut state), 0);
        }
        assert_eq!(state, AdpcmState::new(0, 0));
    }

    #[test]
    fn first_step_up() {
        let mut state = AdpcmState::default();
        // step 7: 100 >= 7, 93 >= 3, 90 >= 1 -> 0b0111
        assert_eq!(encode(100, &mut state), 0x7);
        // diffq = 0 + 7 + 3 + 1
        assert_eq!(state, AdpcmState::new(11, 8));
    }

    #[test]
    fn negative_sets_sign_bit() {
        let mut state = AdpcmState::default();
        let code = encode(-100, &mut state);
        assert_eq!(code, 0xF);
        assert_eq!(state.predicted_sample, -11);
    }

    #[test]
    fn decoder_tracks_encoder_state() {
        let mut enc = AdpcmState::default();
        let mut dec = AdpcmState::default();
        for sample in signal(20_000) {
            let code = encode(sample, &mut enc);
            let decoded = decode(code, &mut dec);
            assert_eq!(dec, enc);
            assert_eq!(decoded, enc.predicted_sample);
        }
    }

    #[test]
    fn full_scale_negative_does_not_drift() {
        let mut enc = AdpcmState::default();
        let mut dec = AdpcmState::default();
        for i in 0..4000 {
            let sample = if (i / 50) % 2 == 0 { i16::MIN } else { i16::MAX };
            let code = encode(sample, &mut enc);
            decode(code, &mut dec);
            assert_eq!(dec, enc);
        }
        assert!(enc.predicted_sample >= -32767);
    }

    #[test]
    fn step_index_is_clamped() {
        let mut state = AdpcmState::new(0, MAX_STEP_INDEX);
        decode(0x7, &mut state);
        assert_eq!(state.step_index, MAX_STEP_INDEX);

        let mut state = AdpcmState::new(0, 0);
        decode(0x0, &mut state);
        assert_eq!(state.step_index, 0);
    }

    #[test]
    fn block_nibble_order() {
        let mut state = AdpcmState::default();
        let mut out = [0u8; 1];
        encode_block(&[100, 100], &mut state, &mut out);

        let mut expected = AdpcmState::default();
        let lo = encode(100, &mut expected);
        let hi = encode(100, &mut expected);
        assert_eq!(out[0], (hi << 4) | lo);
        assert_eq!(state, expected);
    }

    #[test]
    fn block_replay_matches_advance() {
        let samples: Vec<i16> = signal(320).collect();
        let mut enc = AdpcmState::default();
        let mut packed = [0u8; 160];
        encode_block(&samples, &mut enc, &mut packed);

        let mut decoded_state = AdpcmState::default();
        let mut pcm = [0i16; 320];
        decode_block(&packed, &mut decoded_state, &mut pcm);

        let mut shadow = AdpcmState::default();
        advance(&packed, &mut shadow);

        assert_eq!(decoded_state, enc);
        assert_eq!(shadow, enc);
        assert_eq!(pcm[319], enc.predicted_sample);
    }
}
