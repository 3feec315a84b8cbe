// ========================================================================================
//
//                     PER-RECORD ANALYSIS: THE HIGGS RECOIL SELECTION
//
// ========================================================================================
//
// ### Purpose ###
//
// A `RecordProcessor` turns one record into zero or more histogram fills. It is the
// only piece of user logic the engine runs, and it runs concurrently: the same
// processor instance is shared by every worker, so it must be `Sync` and must keep
// all mutable state in the sink it is handed.
//
// `RecoilAnalysis` is the processor for ee -> ZH -> mu mu j j: it requires exactly two
// isolated muons and two jets, then fills the dimuon mass, the dijet mass and the
// mass recoiling against the dimuon system.

use crate::bank::{BankError, HistogramBank, HistogramSink};
use crate::event::{Event, FourMomentum, JET_COLLECTION, MUON_COLLECTION, Particle, invariant_mass};
use crate::types::{HistKey, Outcome};
use serde::{Deserialize, Serialize};
use std::any::Any;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcessError {
    #[error("Histogram bank rejected a fill: {0}")]
    Bank(#[from] BankError),
    #[error("Invalid record content: {0}")]
    InvalidInput(String),
    #[error("The analysis needs a histogram named '{0}', but none was booked.")]
    MissingHistogram(String),
    #[error("Unusable selection: {0}")]
    InvalidSelection(String),
    #[error("{0}")]
    Failed(String),
}

/// The message of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Derives quantities from one record and fills them into a sink.
pub trait RecordProcessor<R>: Send + Sync {
    /// Processes `record`. A record that fails the selection returns
    /// [`Outcome::Filtered`] and must not fill anything.
    fn process<S: HistogramSink>(&self, record: &R, sink: &mut S) -> Result<Outcome, ProcessError>;
}

/// Names of the histograms the recoil analysis fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoilHistogram {
    MuonMass,
    JetMass,
    RecoilMass,
}

impl RecoilHistogram {
    pub const ALL: [RecoilHistogram; 3] = [
        RecoilHistogram::MuonMass,
        RecoilHistogram::JetMass,
        RecoilHistogram::RecoilMass,
    ];

    pub fn name(self) -> &'static str {
        match self {
            RecoilHistogram::MuonMass => "muon_mass",
            RecoilHistogram::JetMass => "jet_mass",
            RecoilHistogram::RecoilMass => "recoil_mass",
        }
    }
}

/// Multiplicity requirements and beam settings of the selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Selection {
    pub muon_collection: String,
    pub jet_collection: String,
    pub muons: usize,
    pub jets: usize,
    /// Centre-of-mass energy in GeV.
    pub sqrt_s: f64,
}

impl Default for Selection {
    fn default() -> Self {
        Self {
            muon_collection: MUON_COLLECTION.to_string(),
            jet_collection: JET_COLLECTION.to_string(),
            muons: 2,
            jets: 2,
            sqrt_s: 250.0,
        }
    }
}

impl Selection {
    /// The collections the selection reads; everything else can be skipped at read time.
    pub fn collections(&self) -> Vec<String> {
        vec![self.jet_collection.clone(), self.muon_collection.clone()]
    }
}

#[derive(Debug, Clone)]
pub struct RecoilAnalysis {
    selection: Selection,
    muon_mass: HistKey,
    jet_mass: HistKey,
    recoil_mass: HistKey,
}

impl RecoilAnalysis {
    /// Resolves the analysis histograms by name in `bank`. The selection must ask for
    /// at least two muons and two jets and a positive, finite `sqrt_s`.
    pub fn new(selection: Selection, bank: &HistogramBank) -> Result<Self, ProcessError> {
        if selection.muons < 2 || selection.jets < 2 {
            return Err(ProcessError::InvalidSelection(format!(
                "{} muon(s) and {} jet(s) requested, the analysis pairs the first two of each",
                selection.muons, selection.jets
            )));
        }
        if !(selection.sqrt_s.is_finite() && selection.sqrt_s > 0.0) {
            return Err(ProcessError::InvalidSelection(format!(
                "sqrt_s = {} is not a positive, finite energy",
                selection.sqrt_s
            )));
        }
        let resolve = |which: RecoilHistogram| {
            bank.key_of(which.name())
                .ok_or_else(|| ProcessError::MissingHistogram(which.name().to_string()))
        };
        Ok(Self {
            muon_mass: resolve(RecoilHistogram::MuonMass)?,
            jet_mass: resolve(RecoilHistogram::JetMass)?,
            recoil_mass: resolve(RecoilHistogram::RecoilMass)?,
            selection,
        })
    }
}

impl RecordProcessor<Event> for RecoilAnalysis {
    fn process<S: HistogramSink>(&self, event: &Event, sink: &mut S) -> Result<Outcome, ProcessError> {
        let jets = event.collection(&self.selection.jet_collection);
        let muons = event.collection(&self.selection.muon_collection);

        if jets.len() != self.selection.jets || muons.len() != self.selection.muons {
            return Ok(Outcome::Filtered);
        }

        let ([mu1, mu2, ..], [j1, j2, ..]) = (muons, jets) else {
            return Ok(Outcome::Filtered);
        };
        check_finite(event, [mu1, mu2, j1, j2])?;

        sink.fill(self.muon_mass, invariant_mass(mu1, mu2), 1.0)?;
        sink.fill(self.jet_mass, invariant_mass(j1, j2), 1.0)?;

        let recoil =
            FourMomentum::at_rest(self.selection.sqrt_s) - (mu1.four_momentum() + mu2.four_momentum());
        sink.fill(self.recoil_mass, recoil.mass(), 1.0)?;

        Ok(Outcome::Accepted {
            value: mu1.energy + mu2.energy + j1.energy + j2.energy,
        })
    }
}

fn check_finite(event: &Event, particles: [&Particle; 4]) -> Result<(), ProcessError> {
    match particles.iter().position(|p| !p.is_finite()) {
        None => Ok(()),
        Some(index) => Err(ProcessError::InvalidInput(format!(
            "run {} event {}: selected particle {index} has a non-finite component",
            event.run_number, event.event_number
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::Binning;
    use approx::assert_relative_eq;

    fn booked_bank() -> HistogramBank {
        let mut bank = HistogramBank::new(3);
        bank.create(HistKey(0), "muon_mass", "", Binning::uniform(100, 60.0, 120.0))
            .unwrap();
        bank.create(HistKey(1), "jet_mass", "", Binning::uniform(100, 0.0, 150.0))
            .unwrap();
        bank.create(HistKey(2), "recoil_mass", "", Binning::uniform(100, 110.0, 170.0))
            .unwrap();
        bank
    }

    fn zh_event() -> Event {
        Event::new(1, 1)
            .with_collection(
                MUON_COLLECTION,
                vec![
                    Particle::new(45.5, [0.0, 0.0, 45.5]),
                    Particle::new(45.5, [0.0, 0.0, -45.5]),
                ],
            )
            .with_collection(
                JET_COLLECTION,
                vec![
                    Particle::new(62.5, [62.5, 0.0, 0.0]),
                    Particle::new(62.5, [-62.5, 0.0, 0.0]),
                ],
            )
    }

    #[test]
    fn accepted_event_fills_all_three_histograms() {
        let mut bank = booked_bank();
        let analysis = RecoilAnalysis::new(Selection::default(), &bank).unwrap();
        let outcome = analysis.process(&zh_event(), &mut bank).unwrap();
        match outcome {
            Outcome::Accepted { value } => assert_relative_eq!(value, 216.0),
            Outcome::Filtered => panic!("event should pass the selection"),
        }
        let snaps = bank.snapshot_all();
        assert!(snaps.iter().all(|s| s.entries == 1));
        // 91 GeV dimuon, 125 GeV dijet, 250 - 91 = 159 GeV recoil.
        assert_relative_eq!(snaps[0].mean, 91.0);
        assert_relative_eq!(snaps[1].mean, 125.0);
        assert_relative_eq!(snaps[2].mean, 159.0);
    }

    #[test]
    fn wrong_multiplicity_fills_nothing() {
        let bank = booked_bank();
        let analysis = RecoilAnalysis::new(Selection::default(), &bank).unwrap();

        let mut three_jets = zh_event();
        three_jets
            .collections
            .get_mut(JET_COLLECTION)
            .unwrap()
            .push(Particle::new(5.0, [0.0, 5.0, 0.0]));
        let mut one_muon = zh_event();
        one_muon.collections.get_mut(MUON_COLLECTION).unwrap().pop();
        let mut no_muons = zh_event();
        no_muons.collections.remove(MUON_COLLECTION);

        let mut sink = &bank;
        for event in [three_jets, one_muon, no_muons] {
            assert_eq!(analysis.process(&event, &mut sink).unwrap(), Outcome::Filtered);
        }
        assert!(bank.snapshot_all().iter().all(|s| s.entries == 0));
    }

    #[test]
    fn non_finite_particles_are_processing_errors() {
        let mut bank = booked_bank();
        let analysis = RecoilAnalysis::new(Selection::default(), &bank).unwrap();
        let mut event = zh_event();
        event.collections.get_mut(JET_COLLECTION).unwrap()[0].energy = f64::NAN;
        assert!(matches!(
            analysis.process(&event, &mut bank),
            Err(ProcessError::InvalidInput(_))
        ));
    }

    #[test]
    fn selections_that_cannot_be_paired_are_rejected() {
        let bank = booked_bank();
        for selection in [
            Selection {
                muons: 1,
                ..Selection::default()
            },
            Selection {
                jets: 0,
                ..Selection::default()
            },
            Selection {
                sqrt_s: f64::NAN,
                ..Selection::default()
            },
        ] {
            assert!(matches!(
                RecoilAnalysis::new(selection, &bank),
                Err(ProcessError::InvalidSelection(_))
            ));
        }
    }

    #[test]
    fn single_muon_event_is_filtered_not_indexed() {
        let bank = booked_bank();
        let analysis = RecoilAnalysis::new(Selection::default(), &bank).unwrap();
        let mut one_muon = zh_event();
        one_muon.collections.get_mut(MUON_COLLECTION).unwrap().pop();
        let mut sink = &bank;
        assert_eq!(analysis.process(&one_muon, &mut sink).unwrap(), Outcome::Filtered);
        assert!(bank.snapshot_all().iter().all(|s| s.entries == 0));
    }

    #[test]
    fn missing_histograms_are_reported_by_name() {
        let bank = HistogramBank::new(0);
        assert_eq!(
            RecoilAnalysis::new(Selection::default(), &bank).err(),
            Some(ProcessError::MissingHistogram("muon_mass".to_string()))
        );
    }
}
