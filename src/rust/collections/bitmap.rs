// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::limits;
use ::bit_iter::BitIter;
use ::std::fmt;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Number of 32-bit words backing a bitmap.
const WORDS: usize = limits::MAX_CUS / 32;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Fixed-size set of 128 bits.
///
/// Used for CU affinity masks, command queue slot occupancy and per-client CU reservations. Bits are addressed by
/// index and exposed to hardware-facing code as 32-bit words.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Bitmap128 {
    words: [u32; WORDS],
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Bitmap128 {
    /// Total number of addressable bits.
    pub const CAPACITY: usize = WORDS * 32;

    /// Builds a bitmap out of a sequence of 32-bit masks, least significant word first.
    pub fn from_masks(masks: &[u32]) -> Self {
        let mut bitmap: Self = Self::default();
        for (ix, mask) in masks.iter().take(WORDS).enumerate() {
            bitmap.words[ix] = *mask;
        }
        bitmap
    }

    /// Sets bit `ix`. Indexes out of range are ignored.
    pub fn set(&mut self, ix: usize) {
        if ix < Self::CAPACITY {
            self.words[ix >> 5] |= 1 << (ix & 31);
        }
    }

    /// Clears bit `ix`. Indexes out of range are ignored.
    pub fn clear(&mut self, ix: usize) {
        if ix < Self::CAPACITY {
            self.words[ix >> 5] &= !(1 << (ix & 31));
        }
    }

    /// Clears every bit.
    pub fn clear_all(&mut self) {
        self.words = [0; WORDS];
    }

    pub fn is_set(&self, ix: usize) -> bool {
        ix < Self::CAPACITY && (self.words[ix >> 5] & (1 << (ix & 31))) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Index of the lowest set bit, if any.
    pub fn first_set(&self) -> Option<usize> {
        self.iter().next()
    }

    /// Index of the lowest clear bit strictly below `limit`, if any.
    pub fn first_free(&self, limit: usize) -> Option<usize> {
        (0..limit.min(Self::CAPACITY)).find(|ix| !self.is_set(*ix))
    }

    /// Returns the 32-bit word at position `ix`.
    pub fn mask(&self, ix: usize) -> u32 {
        self.words.get(ix).copied().unwrap_or(0)
    }

    /// Checks whether every bit set in `self` is also set in `other`.
    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.words.iter().zip(other.words.iter()).all(|(a, b)| (a & !b) == 0)
    }

    /// Iterates over the indexes of set bits in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words
            .iter()
            .enumerate()
            .flat_map(|(ix, word)| BitIter::from(*word).map(move |bit| (ix << 5) + bit))
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Debug for Bitmap128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}_{:08x}_{:08x}_{:08x}",
            self.words[3], self.words[2], self.words[1], self.words[0]
        )
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
