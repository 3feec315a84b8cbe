// ========================================================================================
//                         Collider Event Model & Kinematics
// ========================================================================================

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::{Add, Sub};

/// Collection holding isolated muon candidates.
pub const MUON_COLLECTION: &str = "IsolatedMuons";
/// Collection holding clustered jets.
pub const JET_COLLECTION: &str = "Jets";
/// Collection holding every particle-flow object of the event.
pub const PFO_COLLECTION: &str = "PFOs";

/// A reconstructed particle: energy and three-momentum, in GeV.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    pub energy: f64,
    pub momentum: [f64; 3],
}

impl Particle {
    pub fn new(energy: f64, momentum: [f64; 3]) -> Self {
        Self { energy, momentum }
    }

    #[inline]
    pub fn four_momentum(&self) -> FourMomentum {
        FourMomentum::new(
            self.momentum[0],
            self.momentum[1],
            self.momentum[2],
            self.energy,
        )
    }

    #[inline]
    pub fn is_finite(&self) -> bool {
        self.energy.is_finite() && self.momentum.iter().all(|p| p.is_finite())
    }
}

/// A Lorentz four-vector `(px, py, pz, e)`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FourMomentum {
    pub px: f64,
    pub py: f64,
    pub pz: f64,
    pub e: f64,
}

impl FourMomentum {
    #[inline]
    pub const fn new(px: f64, py: f64, pz: f64, e: f64) -> Self {
        Self { px, py, pz, e }
    }

    /// The four-momentum of a collision at rest with centre-of-mass energy `sqrt_s`.
    #[inline]
    pub const fn at_rest(sqrt_s: f64) -> Self {
        Self::new(0.0, 0.0, 0.0, sqrt_s)
    }

    #[inline]
    pub fn mass_squared(&self) -> f64 {
        self.e * self.e - self.px * self.px - self.py * self.py - self.pz * self.pz
    }

    /// The invariant mass. A space-like vector reports `-sqrt(-m^2)` so the sign of the
    /// mass squared survives.
    #[inline]
    pub fn mass(&self) -> f64 {
        let m2 = self.mass_squared();
        if m2 < 0.0 { -(-m2).sqrt() } else { m2.sqrt() }
    }
}

impl Add for FourMomentum {
    type Output = FourMomentum;

    #[inline]
    fn add(self, rhs: FourMomentum) -> FourMomentum {
        FourMomentum::new(
            self.px + rhs.px,
            self.py + rhs.py,
            self.pz + rhs.pz,
            self.e + rhs.e,
        )
    }
}

impl Sub for FourMomentum {
    type Output = FourMomentum;

    #[inline]
    fn sub(self, rhs: FourMomentum) -> FourMomentum {
        FourMomentum::new(
            self.px - rhs.px,
            self.py - rhs.py,
            self.pz - rhs.pz,
            self.e - rhs.e,
        )
    }
}

/// Invariant mass of a two-particle system, `sqrt(E^2 - |p|^2)`.
///
/// Unlike [`FourMomentum::mass`] this does not guard the square root: an unphysical
/// pair yields NaN, which histograms drop.
#[inline]
pub fn invariant_mass(a: &Particle, b: &Particle) -> f64 {
    (a.four_momentum() + b.four_momentum()).mass_squared().sqrt()
}

/// One collision event: named collections of reconstructed particles.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Event {
    pub run_number: u32,
    pub event_number: u64,
    #[serde(default)]
    pub collections: BTreeMap<String, Vec<Particle>>,
}

impl Event {
    pub fn new(run_number: u32, event_number: u64) -> Self {
        Self {
            run_number,
            event_number,
            collections: BTreeMap::new(),
        }
    }

    pub fn with_collection(mut self, name: &str, particles: Vec<Particle>) -> Self {
        self.collections.insert(name.to_string(), particles);
        self
    }

    /// The particles of collection `name`; a missing collection is empty.
    pub fn collection(&self, name: &str) -> &[Particle] {
        self.collections.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Drops every collection whose name is not in `keep`.
    pub fn retain_collections(&mut self, keep: &[String]) {
        self.collections.retain(|name, _| keep.iter().any(|k| k == name));
    }
}

/// The administrative header that opens a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunHeader {
    pub run_number: u32,
    #[serde(default)]
    pub detector_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// One line of an event file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventRecord {
    RunHeader(RunHeader),
    Event(Event),
}
