// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;
use std::io::{self, Error, ErrorKind};

use byteorder::{BigEndian, ByteOrder};

const WORD_MASK: u64 = 0o777777_777777;

// Fieldata code points 0o00..0o77 in ASCII.
const ASCII_FROM_FIELDATA: &[u8; 64] =
    b"@[]#^ ABCDEFGHIJKLMNOPQRSTUVWXYZ)-+<=>&$*(%:?!,\\0123456789';/.\"_";

/// A 36-bit storage word held in the low bits of a u64.
///
/// Field accessors follow the conventional partial-word names: S1..S6 are
/// sixths (6 bits), Q1..Q4 quarters (9 bits), T1..T3 thirds (12 bits),
/// H1/H2 halves (18 bits), numbered from the most significant end.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Word36(u64);

impl Word36 {
    pub fn new(value: u64) -> Self {
        Word36(value & WORD_MASK)
    }

    pub fn w(self) -> u64 {
        self.0
    }

    pub fn set_w(&mut self, value: u64) {
        self.0 = value & WORD_MASK;
    }

    pub fn or(&mut self, value: u64) {
        self.0 = (self.0 | value) & WORD_MASK;
    }

    pub fn and(&mut self, value: u64) {
        self.0 &= value & WORD_MASK;
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn h1(self) -> u64 {
        self.0 >> 18
    }

    pub fn h2(self) -> u64 {
        self.0 & 0o777777
    }

    pub fn set_h1(&mut self, value: u64) {
        self.0 = (self.0 & 0o000000_777777) | ((value & 0o777777) << 18);
    }

    pub fn set_h2(&mut self, value: u64) {
        self.0 = (self.0 & 0o777777_000000) | (value & 0o777777);
    }

    pub fn t1(self) -> u64 {
        self.0 >> 24
    }

    pub fn t2(self) -> u64 {
        (self.0 >> 12) & 0o7777
    }

    pub fn t3(self) -> u64 {
        self.0 & 0o7777
    }

    pub fn set_t1(&mut self, value: u64) {
        self.0 = (self.0 & 0o000077_777777) | ((value & 0o7777) << 24);
    }

    pub fn set_t2(&mut self, value: u64) {
        self.0 = (self.0 & 0o777700_007777) | ((value & 0o7777) << 12);
    }

    pub fn set_t3(&mut self, value: u64) {
        self.0 = (self.0 & 0o777777_770000) | (value & 0o7777);
    }

    pub fn q1(self) -> u64 {
        self.0 >> 27
    }

    pub fn q2(self) -> u64 {
        (self.0 >> 18) & 0o777
    }

    pub fn q3(self) -> u64 {
        (self.0 >> 9) & 0o777
    }

    pub fn q4(self) -> u64 {
        self.0 & 0o777
    }

    pub fn s1(self) -> u64 {
        self.0 >> 30
    }

    pub fn s2(self) -> u64 {
        (self.0 >> 24) & 0o77
    }

    pub fn s3(self) -> u64 {
        (self.0 >> 18) & 0o77
    }

    pub fn s4(self) -> u64 {
        (self.0 >> 12) & 0o77
    }

    pub fn s5(self) -> u64 {
        (self.0 >> 6) & 0o77
    }

    pub fn s6(self) -> u64 {
        self.0 & 0o77
    }

    pub fn set_s1(&mut self, value: u64) {
        self.0 = (self.0 & 0o007777_777777) | ((value & 0o77) << 30);
    }

    pub fn set_s2(&mut self, value: u64) {
        self.0 = (self.0 & 0o770077_777777) | ((value & 0o77) << 24);
    }

    pub fn set_s3(&mut self, value: u64) {
        self.0 = (self.0 & 0o777700_777777) | ((value & 0o77) << 18);
    }

    pub fn set_s4(&mut self, value: u64) {
        self.0 = (self.0 & 0o777777_007777) | ((value & 0o77) << 12);
    }

    pub fn set_s5(&mut self, value: u64) {
        self.0 = (self.0 & 0o777777_770077) | ((value & 0o77) << 6);
    }

    pub fn set_s6(&mut self, value: u64) {
        self.0 = (self.0 & 0o777777_777700) | (value & 0o77);
    }

    /// Loads up to 6 characters as Fieldata, left-justified space-filled.
    pub fn from_str_fieldata(&mut self, input: &str) {
        self.from_bytes_fieldata(input.as_bytes());
    }

    fn from_bytes_fieldata(&mut self, bytes: &[u8]) {
        let mut value = 0u64;
        for cx in 0..6 {
            let ch = bytes.get(cx).copied().unwrap_or(b' ');
            value = (value << 6) | u64::from(fieldata_from_ascii(ch));
        }
        self.0 = value;
    }

    /// Loads up to 4 characters as ASCII, left-justified space-filled.
    pub fn from_str_ascii(&mut self, input: &str) {
        self.from_bytes_ascii(input.as_bytes());
    }

    fn from_bytes_ascii(&mut self, bytes: &[u8]) {
        let mut value = 0u64;
        for cx in 0..4 {
            let ch = bytes.get(cx).copied().unwrap_or(b' ');
            value = (value << 9) | u64::from(ch);
        }
        self.0 = value;
    }

    pub fn to_string_fieldata(self) -> String {
        let mut result = String::with_capacity(6);
        for cx in 0..6 {
            let code = ((self.0 >> (30 - 6 * cx)) & 0o77) as usize;
            result.push(ASCII_FROM_FIELDATA[code] as char);
        }
        result
    }

    pub fn to_string_ascii(self) -> String {
        let mut result = String::with_capacity(4);
        for cx in 0..4 {
            let ch = ((self.0 >> (27 - 9 * cx)) & 0o177) as u8;
            result.push(ch as char);
        }
        result
    }
}

impl fmt::Debug for Word36 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:012o}", self.0)
    }
}

impl From<u64> for Word36 {
    fn from(value: u64) -> Self {
        Word36::new(value)
    }
}

fn fieldata_from_ascii(ch: u8) -> u8 {
    let ch = ch.to_ascii_uppercase();
    ASCII_FROM_FIELDATA
        .iter()
        .position(|&c| c == ch)
        .unwrap_or(0o05) as u8
}

/// Spreads a string over `output` as Fieldata, 6 characters per word,
/// left-justified and space-filled over the whole slice.
pub fn fieldata_from_str(input: &str, output: &mut [Word36]) {
    let bytes = input.as_bytes();
    for (wx, word) in output.iter_mut().enumerate() {
        let start = (wx * 6).min(bytes.len());
        word.from_bytes_fieldata(&bytes[start..]);
    }
}

/// Spreads a string over `output` as ASCII, 4 characters per word.
pub fn ascii_from_str(input: &str, output: &mut [Word36]) {
    let bytes = input.as_bytes();
    for (wx, word) in output.iter_mut().enumerate() {
        let start = (wx * 4).min(bytes.len());
        word.from_bytes_ascii(&bytes[start..]);
    }
}

pub fn fieldata_to_string(words: &[Word36]) -> String {
    let joined: String = words.iter().map(|w| w.to_string_fieldata()).collect();
    joined.trim_end().to_string()
}

pub fn ascii_to_string(words: &[Word36]) -> String {
    let joined: String = words.iter().map(|w| w.to_string_ascii()).collect();
    joined.trim_end().to_string()
}

/// Packs pairs of words into 9-byte big-endian groups:
/// bytes 0..4 carry bits 35..4 of the first word, byte 4 carries its low
/// nibble and the top nibble of the second, bytes 5..9 its remaining 32 bits.
pub fn pack_words(source: &[Word36], destination: &mut [u8]) -> io::Result<()> {
    if source.len() % 2 != 0 {
        return Err(malformed_block("word count is not even"));
    }
    if destination.len() != source.len() * 9 / 2 {
        return Err(malformed_block("byte buffer does not match word count"));
    }

    for (pair, chunk) in source.chunks_exact(2).zip(destination.chunks_exact_mut(9)) {
        let w0 = pair[0].w();
        let w1 = pair[1].w();
        BigEndian::write_u32(&mut chunk[0..4], (w0 >> 4) as u32);
        chunk[4] = (((w0 & 0o17) << 4) | (w1 >> 32)) as u8;
        BigEndian::write_u32(&mut chunk[5..9], (w1 & 0xFFFF_FFFF) as u32);
    }

    Ok(())
}

/// Exact inverse of [`pack_words`].
pub fn unpack_words(source: &[u8], destination: &mut [Word36]) -> io::Result<()> {
    if source.len() % 9 != 0 {
        return Err(malformed_block("byte length is not a multiple of 9"));
    }
    if destination.len() != source.len() * 2 / 9 {
        return Err(malformed_block("word buffer does not match byte count"));
    }

    for (chunk, pair) in source.chunks_exact(9).zip(destination.chunks_exact_mut(2)) {
        let high = u64::from(BigEndian::read_u32(&chunk[0..4]));
        let mid = u64::from(chunk[4]);
        let low = u64::from(BigEndian::read_u32(&chunk[5..9]));
        pair[0] = Word36::new((high << 4) | (mid >> 4));
        pair[1] = Word36::new(((mid & 0o17) << 32) | low);
    }

    Ok(())
}

fn malformed_block(detail: &str) -> Error {
    Error::new(ErrorKind::InvalidData, format!("malformed block: {}", detail))
}
