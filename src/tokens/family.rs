//! Instrument family mapping.
//!
//! The 128 General MIDI programs are grouped into 16 families of 8 programs.
//! Program to family is a fixed range lookup. Family to program goes through a
//! table built once per [`FamilyMapper`], so every event of a given family in
//! one decode gets the same program.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Range;

use super::event::FAMILY_COUNT;

/// A named block of General MIDI programs.
#[derive(Debug, Clone)]
pub struct Family {
    pub name: &'static str,
    pub programs: Range<u8>,
}

const fn family(name: &'static str, start: u8) -> Family {
    Family {
        name,
        programs: start..start + 8,
    }
}

/// The 16 General MIDI instrument families, indexed by family number.
pub const FAMILIES: [Family; FAMILY_COUNT as usize] = [
    family("Piano", 0),
    family("Chromatic Percussion", 8),
    family("Organ", 16),
    family("Guitar", 24),
    family("Bass", 32),
    family("Strings", 40),
    family("Ensemble", 48),
    family("Brass", 56),
    family("Reed", 64),
    family("Pipe", 72),
    family("Synth Lead", 80),
    family("Synth Pad", 88),
    family("Synth Effects", 96),
    family("Ethnic", 104),
    family("Percussive", 112),
    family("Sound Effects", 120),
];

/// Fixed decode programs for the first eleven families.
///
/// Families 11-15 have no entry and fall back to their full range. Three
/// entries land outside their own family: guitar (3) and pipe (9) decode to
/// synth leads, strings (5) to synth strings in the ensemble block.
const CANONICAL_PROGRAMS: [u8; 11] = [
    4,  // Electric Piano 1
    11, // Vibraphone
    17, // Percussive Organ
    80, // Lead 1 (square)
    38, // Synth Bass 1
    50, // Synth Strings 1
    51, // Synth Strings 2
    63, // Synth Brass 2
    64, // Soprano Sax
    82, // Lead 3 (calliope)
    81, // Lead 2 (sawtooth)
];

/// How a family is turned back into a concrete program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReverseMode {
    /// Any program within the family's range.
    FullRange,
    /// A fixed program per family where one is defined.
    #[default]
    Canonical,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FamilyError {
    #[error("family number {0} not found in the mapping table")]
    UnknownFamily(u8),
}

/// Returns the family of a General MIDI program, or `None` above 127.
pub fn family_of(program: u8) -> Option<u8> {
    FAMILIES
        .iter()
        .position(|family| family.programs.contains(&program))
        .map(|index| index as u8)
}

/// Maps family numbers back to programs.
///
/// The table is drawn once from the injected RNG at construction and is
/// immutable afterwards.
#[derive(Debug, Clone)]
pub struct FamilyMapper {
    mode: ReverseMode,
    programs: HashMap<u8, u8>,
}

impl FamilyMapper {
    /// Builds the reverse table.
    ///
    /// # Arguments
    ///
    /// * `mode` - Which candidate programs each family may map to
    /// * `rng` - Source of the per-family choice
    pub fn new<R: Rng + ?Sized>(mode: ReverseMode, rng: &mut R) -> Self {
        let mut programs = HashMap::with_capacity(FAMILIES.len());
        for (number, family) in FAMILIES.iter().enumerate() {
            let candidates: Vec<u8> = match (mode, CANONICAL_PROGRAMS.get(number)) {
                (ReverseMode::Canonical, Some(&program)) => vec![program],
                _ => family.programs.clone().collect(),
            };
            if let Some(&program) = candidates.choose(rng) {
                programs.insert(number as u8, program);
            }
        }
        Self { mode, programs }
    }

    pub fn mode(&self) -> ReverseMode {
        self.mode
    }

    /// Returns the program chosen for `family` in this mapper.
    ///
    /// # Errors
    ///
    /// Returns `FamilyError::UnknownFamily` if the table has no entry.
    pub fn program_of(&self, family: u8) -> Result<u8, FamilyError> {
        self.programs
            .get(&family)
            .copied()
            .ok_or(FamilyError::UnknownFamily(family))
    }
}
