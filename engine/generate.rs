// ========================================================================================
//
//                        SYNTHETIC ee -> ZH EVENT GENERATOR
//
// ========================================================================================
//
// Produces reproducible event files for exercising the engine without external data.
// Each event is a Higgs-strahlung candidate at rest in the lab: the Z decays to two
// muons and the Higgs to two jets. A configurable fraction of events is deliberately
// pushed off the selection (a muon lost or an extra jet) so that filtering is exercised.
// Nothing here aims at physical accuracy beyond producing plausible mass peaks.

use crate::event::{
    Event, EventRecord, FourMomentum, JET_COLLECTION, MUON_COLLECTION, PFO_COLLECTION, Particle,
    RunHeader,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::io::{self, Write};
use thiserror::Error;

const Z_MASS: f64 = 91.19;
const Z_WIDTH: f64 = 2.5;
const HIGGS_MASS: f64 = 125.0;
const HIGGS_SMEAR: f64 = 4.0;
const MUON_MASS: f64 = 0.105_66;
const JET_ENERGY_RESOLUTION: f64 = 0.03;

#[derive(Error, Debug)]
pub enum GenerateError {
    #[error("Failed to write generated events: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to serialize a generated event: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Invalid generator settings: {0}")]
    Settings(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorSettings {
    pub events: u64,
    pub runs: u32,
    pub seed: u64,
    pub sqrt_s: f64,
    /// Fraction of events that fail the 2-muon / 2-jet selection.
    pub off_selection_fraction: f64,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            events: 10_000,
            runs: 1,
            seed: 42,
            sqrt_s: 250.0,
            off_selection_fraction: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GenerateSummary {
    pub events: u64,
    pub runs: u32,
}

pub struct EventGenerator {
    rng: StdRng,
    sqrt_s: f64,
    off_selection_fraction: f64,
    z_shape: Normal<f64>,
    higgs_shape: Normal<f64>,
}

impl EventGenerator {
    pub fn new(settings: &GeneratorSettings) -> Result<Self, GenerateError> {
        if !(settings.sqrt_s > Z_MASS + HIGGS_MASS) {
            return Err(GenerateError::Settings(format!(
                "sqrt(s) = {} GeV is below the ZH threshold",
                settings.sqrt_s
            )));
        }
        if !(0.0..=1.0).contains(&settings.off_selection_fraction) {
            return Err(GenerateError::Settings(format!(
                "off-selection fraction {} is not a probability",
                settings.off_selection_fraction
            )));
        }
        let z_shape = Normal::new(Z_MASS, Z_WIDTH)
            .map_err(|e| GenerateError::Settings(e.to_string()))?;
        let higgs_shape = Normal::new(HIGGS_MASS, HIGGS_SMEAR)
            .map_err(|e| GenerateError::Settings(e.to_string()))?;
        Ok(Self {
            rng: StdRng::seed_from_u64(settings.seed),
            sqrt_s: settings.sqrt_s,
            off_selection_fraction: settings.off_selection_fraction,
            z_shape,
            higgs_shape,
        })
    }

    pub fn next_event(&mut self, run_number: u32, event_number: u64) -> Event {
        let headroom = self.sqrt_s - 1.0;
        let z_mass = self.z_shape.sample(&mut self.rng).clamp(2.0 * MUON_MASS + 1.0, 120.0);
        let h_mass = self
            .higgs_shape
            .sample(&mut self.rng)
            .clamp(20.0, headroom - z_mass);

        let (z, h) = self.two_body(FourMomentum::at_rest(self.sqrt_s), z_mass, h_mass);
        let (mu1, mu2) = self.two_body(z, MUON_MASS, MUON_MASS);
        let (j1, j2) = self.two_body(h, 0.0, 0.0);

        let mut muons = vec![to_particle(mu1), to_particle(mu2)];
        let mut jets = vec![self.smear(j1), self.smear(j2)];

        if self.rng.gen_bool(self.off_selection_fraction) {
            if self.rng.gen_bool(0.5) {
                muons.pop();
            } else {
                let extra = self.rng.gen_range(2.0..15.0);
                jets.push(Particle::new(extra, self.direction(extra)));
            }
        }

        let pfos = muons.iter().chain(jets.iter()).copied().collect();
        Event::new(run_number, event_number)
            .with_collection(MUON_COLLECTION, muons)
            .with_collection(JET_COLLECTION, jets)
            .with_collection(PFO_COLLECTION, pfos)
    }

    /// Decays `parent` isotropically (in its rest frame) into masses `m1` and `m2`.
    fn two_body(&mut self, parent: FourMomentum, m1: f64, m2: f64) -> (FourMomentum, FourMomentum) {
        let mass = parent.mass();
        let p = ((mass * mass - (m1 + m2).powi(2)) * (mass * mass - (m1 - m2).powi(2)))
            .max(0.0)
            .sqrt()
            / (2.0 * mass);
        let [x, y, z] = self.direction(p);
        let first = FourMomentum::new(x, y, z, (p * p + m1 * m1).sqrt());
        let second = FourMomentum::new(-x, -y, -z, (p * p + m2 * m2).sqrt());
        (boost(first, parent), boost(second, parent))
    }

    fn direction(&mut self, magnitude: f64) -> [f64; 3] {
        let cos_theta: f64 = self.rng.gen_range(-1.0..=1.0);
        let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();
        let phi = self.rng.gen_range(0.0..2.0 * PI);
        [
            magnitude * sin_theta * phi.cos(),
            magnitude * sin_theta * phi.sin(),
            magnitude * cos_theta,
        ]
    }

    fn smear(&mut self, jet: FourMomentum) -> Particle {
        let scale = 1.0 + JET_ENERGY_RESOLUTION * self.rng.gen_range(-1.0..1.0);
        Particle::new(
            jet.e * scale,
            [jet.px * scale, jet.py * scale, jet.pz * scale],
        )
    }
}

/// Boosts `v`, given in the rest frame of `frame`, into the frame `frame` is measured in.
fn boost(v: FourMomentum, frame: FourMomentum) -> FourMomentum {
    let (bx, by, bz) = (frame.px / frame.e, frame.py / frame.e, frame.pz / frame.e);
    let b2 = bx * bx + by * by + bz * bz;
    if b2 <= 0.0 {
        return v;
    }
    let gamma = 1.0 / (1.0 - b2).sqrt();
    let bp = bx * v.px + by * v.py + bz * v.pz;
    let gamma2 = (gamma - 1.0) / b2;
    let k = gamma2 * bp + gamma * v.e;
    FourMomentum::new(
        v.px + k * bx,
        v.py + k * by,
        v.pz + k * bz,
        gamma * (v.e + bp),
    )
}

fn to_particle(v: FourMomentum) -> Particle {
    Particle::new(v.e, [v.px, v.py, v.pz])
}

/// Writes a complete JSON-lines event file: one run header per run followed by its
/// share of the events.
pub fn write_event_file<W: Write>(
    settings: &GeneratorSettings,
    mut out: W,
) -> Result<GenerateSummary, GenerateError> {
    let runs = settings.runs.max(1);
    let mut generator = EventGenerator::new(settings)?;
    let per_run = settings.events.div_ceil(u64::from(runs));

    writeln!(
        out,
        "# synthetic ee -> ZH -> mu mu j j, sqrt(s) = {} GeV, seed {}",
        settings.sqrt_s, settings.seed
    )?;

    let mut written = 0u64;
    let mut runs_written = 0u32;
    for run in 0..runs {
        if written == settings.events && run > 0 {
            break;
        }
        let mut parameters = BTreeMap::new();
        parameters.insert("sqrt_s".to_string(), settings.sqrt_s.to_string());
        parameters.insert("seed".to_string(), settings.seed.to_string());
        let header = RunHeader {
            run_number: run,
            detector_name: "synthetic".to_string(),
            description: "generated by recoil".to_string(),
            parameters,
        };
        serde_json::to_writer(&mut out, &EventRecord::RunHeader(header))?;
        out.write_all(b"\n")?;
        runs_written += 1;

        let in_run = per_run.min(settings.events - written);
        for number in 0..in_run {
            let event = generator.next_event(run, number);
            serde_json::to_writer(&mut out, &EventRecord::Event(event))?;
            out.write_all(b"\n")?;
        }
        written += in_run;
    }
    out.flush()?;

    log::info!("generated {written} event(s) in {runs_written} run(s)");
    Ok(GenerateSummary {
        events: written,
        runs: runs_written,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::invariant_mass;

    #[test]
    fn same_seed_produces_identical_files() {
        let settings = GeneratorSettings {
            events: 50,
            runs: 2,
            ..GeneratorSettings::default()
        };
        let mut first = Vec::new();
        let mut second = Vec::new();
        write_event_file(&settings, &mut first).unwrap();
        write_event_file(&settings, &mut second).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn events_are_split_across_runs() {
        let settings = GeneratorSettings {
            events: 5,
            runs: 2,
            ..GeneratorSettings::default()
        };
        let mut out = Vec::new();
        let summary = write_event_file(&settings, &mut out).unwrap();
        assert_eq!(summary, GenerateSummary { events: 5, runs: 2 });
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().filter(|l| l.contains("run_header")).count(), 2);
        assert_eq!(text.lines().filter(|l| l.starts_with("{\"event\"")).count(), 5);
    }

    #[test]
    fn selected_muon_pairs_reconstruct_near_the_z_mass() {
        let settings = GeneratorSettings {
            off_selection_fraction: 0.0,
            ..GeneratorSettings::default()
        };
        let mut generator = EventGenerator::new(&settings).unwrap();
        for number in 0..200 {
            let event = generator.next_event(0, number);
            let muons = event.collection(MUON_COLLECTION);
            assert_eq!(muons.len(), 2);
            assert_eq!(event.collection(JET_COLLECTION).len(), 2);
            let mass = invariant_mass(&muons[0], &muons[1]);
            assert!((60.0..=121.0).contains(&mass), "muon pair mass {mass}");
        }
    }

    #[test]
    fn settings_below_threshold_are_rejected() {
        let settings = GeneratorSettings {
            sqrt_s: 150.0,
            ..GeneratorSettings::default()
        };
        assert!(matches!(
            EventGenerator::new(&settings),
            Err(GenerateError::Settings(_))
        ));
    }
}
