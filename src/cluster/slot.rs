//! Redis Cluster slot calculation.
//!
//! Keys map to one of 16384 slots by CRC16 (XMODEM) of the key, or of its
//! hash tag when one is present.

use crc::{Crc, CRC_16_XMODEM};

use crate::{Error, Result};

/// Number of hash slots in Redis Cluster.
pub const SLOT_COUNT: u16 = 16384;

/// CRC-16/XMODEM, the variant Redis uses for key hashing.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Calculates the Redis Cluster slot for a key.
///
/// If the key contains `{...}` with at least one byte between the first `{`
/// and the first `}` after it, only that part is hashed.
///
/// # Examples
///
/// ```
/// use slotmux::key_slot;
///
/// assert_eq!(key_slot("123456789"), 12739);
/// assert_eq!(key_slot("{user1000}.following"), key_slot("{user1000}.followers"));
/// assert_eq!(key_slot(b"foo".as_slice()), key_slot("foo"));
/// ```
pub fn key_slot<K: AsRef<[u8]> + ?Sized>(key: &K) -> u16 {
    CRC16.checksum(hash_tag(key.as_ref())) % SLOT_COUNT
}

/// Returns the slot shared by all `keys`.
///
/// # Errors
///
/// - [`Error::InvalidArgument`] if `keys` is empty
/// - [`Error::CrossSlot`] if two keys hash to different slots
pub fn slot_for_keys<K: AsRef<[u8]>>(keys: &[K]) -> Result<u16> {
    let (first, rest) = keys.split_first().ok_or_else(|| Error::InvalidArgument {
        message: "command requires at least one key".to_string(),
    })?;
    let expected = key_slot(first);
    match rest.iter().map(key_slot).find(|slot| *slot != expected) {
        Some(found) => Err(Error::CrossSlot { expected, found }),
        None => Ok(expected),
    }
}

/// Extracts the part of `key` that is hashed.
///
/// - `{user1000}.following` → `user1000`
/// - `foo{bar}{baz}` → `bar`
/// - `foo{}{bar}` → whole key (first tag is empty)
/// - `foo{bar` → whole key (unterminated)
fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|&b| b == b'{') {
        if let Some(len) = key[open + 1..].iter().position(|&b| b == b'}') {
            if len > 0 {
                return &key[open + 1..open + 1 + len];
            }
        }
    }
    key
}
