pub mod extrapolate;
pub mod history;
pub mod lowpass;
pub mod smooth;
pub mod trajectory;

pub use extrapolate::Extrapolator;
pub use history::{FilterState, HistoryArena, HistorySample, JointHistory};
pub use smooth::{KeypointSmoother, SampleSource, SmoothStats, SmoothedKeypoint};
pub use trajectory::{GaitTrajectory, Limb, TrajectoryPoint, TrajectoryTracker};
