//! A rolling hash over a fixed window of bytes.
//!
//! The hash of a window `b[0..WINDOW]` is the polynomial `sum(b[i] * P^(WINDOW - 1 - i))`
//! modulo 2^64. Sliding the window by one byte ([RollingHash::roll]) removes the oldest
//! byte's term and shifts in the new one, so a rolled hash always equals the hash
//! computed from scratch over the same bytes ([hash_window]).

use crate::Buffer;

/// Number of bytes covered by a full window.
pub const WINDOW: usize = 128;

/// Multiplier of the polynomial.
const P: u64 = 0x100000001b3;

/// `P^WINDOW`, the weight of the byte leaving the window.
const P_WINDOW: u64 = {
    let mut result: u64 = 1;
    let mut i = 0;
    while i < WINDOW {
        result = result.wrapping_mul(P);
        i += 1;
    }
    result
};

/// Incremental hash over the most recent [WINDOW] bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RollingHash {
    value: u64,
    filled: usize,
}

impl RollingHash {
    /// Create an empty hash.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a byte while the window is still filling.
    ///
    /// # Panics
    ///
    /// Panics if the window is already full (use [RollingHash::roll] instead).
    pub fn add(&mut self, byte: u8) {
        assert!(self.filled < WINDOW, "rolling hash window is full");
        self.value = self.value.wrapping_mul(P).wrapping_add(byte as u64);
        self.filled += 1;
    }

    /// Slide a full window by one byte: `out` leaves and `byte` enters.
    ///
    /// # Panics
    ///
    /// Panics if the window is not yet full.
    pub fn roll(&mut self, out: u8, byte: u8) {
        assert!(self.filled == WINDOW, "rolling hash window is not full");
        self.value = self
            .value
            .wrapping_mul(P)
            .wrapping_add(byte as u64)
            .wrapping_sub((out as u64).wrapping_mul(P_WINDOW));
    }

    /// Returns the hash of the bytes currently in the window.
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Returns `true` once [WINDOW] bytes have been added.
    pub fn is_full(&self) -> bool {
        self.filled == WINDOW
    }

    /// Forget all bytes.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Hash `data` from scratch.
///
/// # Panics
///
/// Panics if `data` is longer than [WINDOW].
pub fn hash_window(data: &[u8]) -> u64 {
    let mut hash = RollingHash::new();
    for byte in data {
        hash.add(*byte);
    }
    hash.value()
}

/// Hash every full window of `buffer`, in order.
///
/// Returns one value per window position (`buffer.len() - WINDOW + 1` values), or none if
/// the buffer is shorter than a window.
pub fn hash_buffer(buffer: &Buffer) -> Vec<u64> {
    if buffer.len() < WINDOW {
        return Vec::new();
    }
    let mut hashes = Vec::with_capacity(buffer.len() - WINDOW + 1);
    let mut hash = RollingHash::new();
    let mut history = [0u8; WINDOW];
    for (i, byte) in buffer
        .chunks()
        .flat_map(|chunk| chunk.iter().copied())
        .enumerate()
    {
        let slot = i % WINDOW;
        if hash.is_full() {
            hash.roll(history[slot], byte);
        } else {
            hash.add(byte);
        }
        history[slot] = byte;
        if hash.is_full() {
            hashes.push(hash.value());
        }
    }
    hashes
}
