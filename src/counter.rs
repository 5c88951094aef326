//! Crash-safe monotonic counter built from NOR flash bit semantics.
//!
//! Two reserved sectors hold the value as runs of cleared bits. Every increment clears one more
//! bit of the `low` sector. Once all of its 32768 bits are used, one bit of the `high` sector is
//! cleared, `low` is erased and re-marked, and a second `high` bit is cleared. An odd number of
//! cleared `high` bits therefore means the carry was interrupted and has to be finished on load.
//! The `high` sector is only erased by a full reset, never in normal operation.

use crate::SECTOR_SIZE;
use crate::error::Error;
use crate::platform::{self, Platform};
#[cfg(feature = "defmt")]
use defmt::{debug, warn};

pub const COUNTER_MAGIC: u32 = 0xD970576A;

/// Bytes of the high sector used for marks; the magic word follows right after.
pub(crate) const HIGH_AREA_SIZE: usize = 2048;
pub(crate) const MAGIC_OFFSET: u32 = HIGH_AREA_SIZE as u32;

pub const LOW_BITS_MAX: u32 = (SECTOR_SIZE * 8) as u32;
pub const HIGH_BITS_MAX: u32 = (HIGH_AREA_SIZE * 8) as u32;

const LOW_SHIFT: u32 = LOW_BITS_MAX.trailing_zeros();
const _: () = assert!(1 << LOW_SHIFT == LOW_BITS_MAX);

const SCAN_CHUNK: usize = 256;

/// Byte value after clearing bit `n % 8` (and every lower one) of a byte, MSB first.
const MARKED_BYTES: [u8; 8] = [0x7f, 0x3f, 0x1f, 0x0f, 0x07, 0x03, 0x01, 0x00];

/// Raw number of cleared bits in each sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CounterState {
    pub low_bits: u32,
    pub high_bits: u32,
}

impl CounterState {
    pub const fn value(&self) -> u32 {
        (((self.high_bits >> 1) - 1) << LOW_SHIFT) + (self.low_bits - 1)
    }

    /// `high_bits` is odd while a carry into the high sector is in progress.
    pub const fn is_consistent(&self) -> bool {
        self.high_bits % 2 == 0
    }
}

pub struct MonotonicSectorCounter {
    low_offset: u32,
    high_offset: u32,
    state: CounterState,
}

impl MonotonicSectorCounter {
    /// Loads the counter from the two sectors at `low_offset` and `high_offset`, finishing an
    /// interrupted carry or resetting both sectors if their content cannot be trusted.
    pub fn load<T: Platform>(hal: &mut T, low_offset: u32, high_offset: u32) -> Result<Self, Error> {
        let mut counter = Self {
            low_offset,
            high_offset,
            state: CounterState {
                low_bits: 0,
                high_bits: 0,
            },
        };

        if counter.read_magic(hal)? != COUNTER_MAGIC {
            #[cfg(feature = "defmt")]
            debug!("counter: no magic, resetting");

            counter.reset(hal)?;
            return Ok(counter);
        }

        let high_bits = match count_marked_bits(hal, high_offset, HIGH_AREA_SIZE)? {
            Some(bits) if bits > 1 => bits,
            _ => {
                #[cfg(feature = "defmt")]
                warn!("counter: high sector corrupt, resetting");

                counter.reset(hal)?;
                return Ok(counter);
            }
        };
        counter.state.high_bits = high_bits;

        if !counter.state.is_consistent() {
            #[cfg(feature = "defmt")]
            debug!("counter: finishing interrupted carry at {}", high_bits);

            counter.reset_low(hal)?;
            counter.mark_high(hal)?;
        }

        match count_marked_bits(hal, low_offset, SECTOR_SIZE)? {
            Some(bits) if bits > 0 => counter.state.low_bits = bits,
            _ => {
                #[cfg(feature = "defmt")]
                warn!("counter: low sector corrupt, resetting");

                counter.reset(hal)?;
            }
        }

        Ok(counter)
    }

    pub fn value(&self) -> u32 {
        self.state.value()
    }

    pub fn state(&self) -> CounterState {
        self.state
    }

    /// Erases both sectors and starts over at zero.
    pub fn reset<T: Platform>(&mut self, hal: &mut T) -> Result<(), Error> {
        platform::erase(hal, self.high_offset, self.high_offset + SECTOR_SIZE as u32)?;
        self.reset_low(hal)?;

        self.state.high_bits = 0;
        self.mark_high(hal)?;
        self.mark_high(hal)?;

        platform::write_verified(hal, self.high_offset + MAGIC_OFFSET, &COUNTER_MAGIC.to_le_bytes())
    }

    /// Adds one. Only the low sector is ever erased, once every [`LOW_BITS_MAX`] increments.
    pub fn increment<T: Platform>(&mut self, hal: &mut T) -> Result<(), Error> {
        if self.state.low_bits < LOW_BITS_MAX {
            return self.mark_low(hal);
        }

        if self.state.high_bits + 2 > HIGH_BITS_MAX {
            return Err(Error::CounterExhausted);
        }

        #[cfg(feature = "defmt")]
        debug!("counter: carry into high sector");

        self.mark_high(hal)?;
        self.reset_low(hal)?;
        self.mark_high(hal)
    }

    fn reset_low<T: Platform>(&mut self, hal: &mut T) -> Result<(), Error> {
        platform::erase(hal, self.low_offset, self.low_offset + SECTOR_SIZE as u32)?;
        self.state.low_bits = 0;
        self.mark_low(hal)
    }

    fn mark_low<T: Platform>(&mut self, hal: &mut T) -> Result<(), Error> {
        mark_bit(hal, self.low_offset, self.state.low_bits)?;
        self.state.low_bits += 1;
        Ok(())
    }

    fn mark_high<T: Platform>(&mut self, hal: &mut T) -> Result<(), Error> {
        mark_bit(hal, self.high_offset, self.state.high_bits)?;
        self.state.high_bits += 1;
        Ok(())
    }

    fn read_magic<T: Platform>(&self, hal: &mut T) -> Result<u32, Error> {
        let mut buf = [0u8; 4];
        platform::read(hal, self.high_offset + MAGIC_OFFSET, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
}

fn mark_bit<T: Platform>(hal: &mut T, sector_offset: u32, bit: u32) -> Result<(), Error> {
    platform::write_byte_verified(
        hal,
        sector_offset + bit / 8,
        MARKED_BYTES[(bit % 8) as usize],
    )
}

/// Number of cleared bits in a byte that is a valid mark pattern.
fn marked_bits(byte: u8) -> Option<u32> {
    match byte {
        0x00 => Some(8),
        0x01 => Some(7),
        0x03 => Some(6),
        0x07 => Some(5),
        0x0f => Some(4),
        0x1f => Some(3),
        0x3f => Some(2),
        0x7f => Some(1),
        0xff => Some(0),
        _ => None,
    }
}

/// Counts the leading run of cleared bits in `size` bytes at `offset`. Returns `None` if the
/// content is not such a run followed by erased bytes.
fn count_marked_bits<T: Platform>(
    hal: &mut T,
    offset: u32,
    size: usize,
) -> Result<Option<u32>, Error> {
    let mut buf = [0u8; SCAN_CHUNK];
    let mut count = 0;
    let mut complete = false;

    for chunk in 0..size / SCAN_CHUNK {
        platform::read(hal, offset + (chunk * SCAN_CHUNK) as u32, &mut buf)?;
        for &byte in &buf {
            if complete {
                if byte != 0xFF {
                    return Ok(None);
                }
                continue;
            }

            match marked_bits(byte) {
                Some(8) => count += 8,
                Some(bits) => {
                    count += bits;
                    complete = true;
                }
                None => return Ok(None),
            }
        }
    }

    Ok(Some(count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_formula() {
        let fresh = CounterState {
            low_bits: 1,
            high_bits: 2,
        };
        assert_eq!(fresh.value(), 0);

        let after_carry = CounterState {
            low_bits: 1,
            high_bits: 4,
        };
        assert_eq!(after_carry.value(), LOW_BITS_MAX);

        let full_low = CounterState {
            low_bits: LOW_BITS_MAX,
            high_bits: 2,
        };
        assert_eq!(full_low.value(), LOW_BITS_MAX - 1);
    }

    #[test]
    fn consistency() {
        assert!(
            CounterState {
                low_bits: 5,
                high_bits: 4
            }
            .is_consistent()
        );
        assert!(
            !CounterState {
                low_bits: 5,
                high_bits: 3
            }
            .is_consistent()
        );
    }

    #[test]
    fn mark_patterns_scan_back() {
        let mut byte = 0xFFu8;
        for bit in 0..8u32 {
            byte &= MARKED_BYTES[bit as usize];
            assert_eq!(marked_bits(byte), Some(bit + 1));
        }
        assert_eq!(marked_bits(0xFE), None);
        assert_eq!(marked_bits(0x80), None);
    }
}
