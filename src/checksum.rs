//! Two-byte running-sum checksum (the 8-bit Fletcher variant used by u-blox receivers).

/// Returns `(a, b)` where `a` is the wrapping sum of all bytes and `b` the wrapping sum of every
/// intermediate `a`.
pub fn checksum(data: &[u8]) -> (u8, u8) {
    data.iter().fold((0u8, 0u8), |(a, b), &byte| {
        let a = a.wrapping_add(byte);
        (a, b.wrapping_add(a))
    })
}
