pub mod event;
pub mod features;
pub mod hmm;
pub mod metrics;
pub mod phase;

pub use event::{Foot, GaitEvent, GaitEventType};
pub use features::FeatureExtractor;
pub use hmm::{EmissionModel, GaitFeatures, GaitPhaseHmm, HmmObservation, PhaseEstimate, PhaseUpdate};
pub use metrics::{DataQuality, GaitMetricsAggregator, GaitParameters};
pub use phase::{GaitPhase, TransitionMatrix};
