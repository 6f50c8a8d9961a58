//! Caesar rotation.
//!
//! Letters move `shift` places through their own case's alphabet, wrapping
//! modulo 26. Everything else, including non-ASCII text, passes through.

const ALPHABET_LEN: i32 = 26;

/// Rotate every ASCII letter in `message` by `shift` positions.
///
/// Negative shifts rotate backward. `rotate(&rotate(m, s), -s) == m` for any
/// message and shift.
pub fn rotate(message: &str, shift: i32) -> String {
    message.chars().map(|c| rotate_char(c, shift)).collect()
}

/// Rotate the ASCII letters of a raw buffer in place.
///
/// Any other byte is left alone, so the buffer keeps its length whether or
/// not it holds valid UTF-8.
pub fn rotate_bytes(bytes: &mut [u8], shift: i32) {
    for byte in bytes {
        *byte = rotate_byte(*byte, shift);
    }
}

fn rotate_char(c: char, shift: i32) -> char {
    if c.is_ascii_alphabetic() {
        rotate_byte(c as u8, shift) as char
    } else {
        c
    }
}

fn rotate_byte(byte: u8, shift: i32) -> u8 {
    let base = match byte {
        b'a'..=b'z' => b'a',
        b'A'..=b'Z' => b'A',
        _ => return byte,
    };
    let offset = (i32::from(byte - base) + shift.rem_euclid(ALPHABET_LEN)) % ALPHABET_LEN;
    base + offset as u8
}
