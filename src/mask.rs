//! Payload masking ([RFC 6455 Section 5.3](https://datatracker.ietf.org/doc/html/rfc6455#section-5.3)).
//!
//! Every payload byte `i` is XORed with `key[i % 4]`, which makes the operation its own inverse.

/// Masks or unmasks `buf` in place with the 4-byte `key`.
#[inline]
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    apply_mask_fast32(buf, key);
}

/// Generates a fresh masking key for an outgoing client frame.
#[inline]
pub(crate) fn new_mask_key() -> [u8; 4] {
    rand::random()
}

/// Byte-at-a-time masking, used for the unaligned edges of a buffer.
#[inline]
fn apply_mask_fallback(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

/// Masks the aligned middle of the buffer one `u32` word at a time.
#[inline]
fn apply_mask_fast32(buf: &mut [u8], key: [u8; 4]) {
    let key_u32 = u32::from_ne_bytes(key);

    // SAFETY: any bit pattern is a valid u32, and `align_to_mut` only hands out
    // the properly aligned middle section.
    let (prefix, words, suffix) = unsafe { buf.align_to_mut::<u32>() };
    apply_mask_fallback(prefix, key);

    // the word-sized key has to start where the prefix stopped
    let head = prefix.len() & 3;
    let key_u32 = if head > 0 {
        if cfg!(target_endian = "big") {
            key_u32.rotate_left(8 * head as u32)
        } else {
            key_u32.rotate_right(8 * head as u32)
        }
    } else {
        key_u32
    };
    for word in words.iter_mut() {
        *word ^= key_u32;
    }
    apply_mask_fallback(suffix, key_u32.to_ne_bytes());
}
