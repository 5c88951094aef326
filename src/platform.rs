use crate::error::Error;
use embedded_storage::nor_flash::NorFlash;
#[cfg(feature = "defmt")]
use defmt::{trace, warn};

/// Any NOR flash driver can back the audio log. See README.md for the expected geometry.
pub trait Platform: NorFlash {}

impl<T: NorFlash> Platform for T {}

/// Number of attempts for a single write or erase before the failure is reported.
pub const FLASH_RETRIES: usize = 3;

/// Largest `READ_SIZE`/`WRITE_SIZE` supported by the stack buffers below.
pub(crate) const MAX_WORD_SIZE: usize = 16;

const VERIFY_CHUNK: usize = 64;

pub trait AlignedOps: Platform {
    fn align_write_floor(size: usize) -> usize {
        align_floor(size, Self::WRITE_SIZE)
    }

    fn supported_alignment() -> bool {
        Self::READ_SIZE <= MAX_WORD_SIZE
            && Self::WRITE_SIZE <= MAX_WORD_SIZE
            && MAX_WORD_SIZE.is_multiple_of(Self::READ_SIZE)
            && MAX_WORD_SIZE.is_multiple_of(Self::WRITE_SIZE)
    }
}

#[inline(always)]
const fn align_floor(size: usize, alignment: usize) -> usize {
    if size.is_power_of_two() {
        size & !(alignment - 1)
    } else {
        size / alignment * alignment
    }
}

impl<T: Platform> AlignedOps for T {}

#[inline(always)]
pub(crate) fn write_aligned<T: Platform>(
    hal: &mut T,
    offset: u32,
    bytes: &[u8],
) -> Result<(), T::Error> {
    #[cfg(feature = "defmt")]
    trace!("write_aligned @{:#08x}: [{}]", offset, bytes.len());

    if bytes.len().is_multiple_of(T::WRITE_SIZE) {
        hal.write(offset, bytes)
    } else {
        let pivot = T::align_write_floor(bytes.len());
        let header = &bytes[..pivot];
        let trailer = &bytes[pivot..];
        if !header.is_empty() {
            hal.write(offset, header)?;
        }

        // no need to write the trailer if remaining data is all ones - this the default state of the flash
        if trailer.iter().any(|&e| e != 0xFF) {
            let mut buf = [0xFFu8; MAX_WORD_SIZE];
            buf[..trailer.len()].copy_from_slice(trailer);
            hal.write(offset + (pivot as u32), &buf[..T::WRITE_SIZE])?
        }

        Ok(())
    }
}

/// Reads `bytes.len()` bytes at `offset`. The length may be unaligned, the offset has to be
/// aligned to `READ_SIZE`.
pub(crate) fn read<T: Platform>(hal: &mut T, offset: u32, bytes: &mut [u8]) -> Result<(), Error> {
    let pivot = align_floor(bytes.len(), T::READ_SIZE);
    let (head, tail) = bytes.split_at_mut(pivot);
    if !head.is_empty() {
        hal.read(offset, head).map_err(|_| Error::FlashError)?;
    }
    if !tail.is_empty() {
        let mut buf = [0xFFu8; MAX_WORD_SIZE];
        hal.read(offset + pivot as u32, &mut buf[..T::READ_SIZE])
            .map_err(|_| Error::FlashError)?;
        let len = tail.len();
        tail.copy_from_slice(&buf[..len]);
    }
    Ok(())
}

fn matches<T: Platform>(hal: &mut T, offset: u32, expected: &[u8]) -> Result<bool, Error> {
    let mut buf = [0u8; VERIFY_CHUNK];
    for (i, chunk) in expected.chunks(VERIFY_CHUNK).enumerate() {
        let at = offset + (i * VERIFY_CHUNK) as u32;
        read(hal, at, &mut buf[..chunk.len()])?;
        if buf[..chunk.len()] != *chunk {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Writes `bytes` at an aligned `offset` and reads them back, retrying up to [`FLASH_RETRIES`]
/// times. Rewriting identical data is harmless on NOR as it can only clear bits.
pub(crate) fn write_verified<T: Platform>(
    hal: &mut T,
    offset: u32,
    bytes: &[u8],
) -> Result<(), Error> {
    let mut last = Error::FlashError;
    for _ in 0..FLASH_RETRIES {
        match write_aligned(hal, offset, bytes) {
            Ok(()) => match matches(hal, offset, bytes) {
                Ok(true) => return Ok(()),
                Ok(false) => last = Error::VerifyFailed,
                Err(e) => last = e,
            },
            Err(_) => last = Error::FlashError,
        }

        #[cfg(feature = "defmt")]
        warn!("write @{:#08x} failed, retrying", offset);
    }
    Err(last)
}

/// Writes a single byte by widening it to one aligned word padded with `0xFF`.
pub(crate) fn write_byte_verified<T: Platform>(
    hal: &mut T,
    offset: u32,
    value: u8,
) -> Result<(), Error> {
    let aligned = T::align_write_floor(offset as usize) as u32;
    let position = (offset - aligned) as usize;
    let mut word = [0xFFu8; MAX_WORD_SIZE];
    word[position] = value;

    let mut last = Error::FlashError;
    for _ in 0..FLASH_RETRIES {
        match hal.write(aligned, &word[..T::WRITE_SIZE]) {
            Ok(()) => {
                let mut current = [0u8; MAX_WORD_SIZE];
                match read(hal, aligned, &mut current[..T::WRITE_SIZE]) {
                    Ok(()) if current[position] == value => return Ok(()),
                    Ok(()) => last = Error::VerifyFailed,
                    Err(e) => last = e,
                }
            }
            Err(_) => last = Error::FlashError,
        }
    }
    Err(last)
}

/// Erases `[from, to)` with the same bounded retry as writes.
pub(crate) fn erase<T: Platform>(hal: &mut T, from: u32, to: u32) -> Result<(), Error> {
    #[cfg(feature = "defmt")]
    trace!("erase {:#08x}..{:#08x}", from, to);

    for _ in 0..FLASH_RETRIES {
        if hal.erase(from, to).is_ok() {
            return Ok(());
        }
    }
    Err(Error::FlashError)
}
