pub mod keypoint;

pub use keypoint::{JointName, Keypoint, PersonId, Pose};
