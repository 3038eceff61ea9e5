pub mod config;
pub mod error;
pub mod gait;
pub mod geometry;
pub mod pipeline;
pub mod pose;
pub mod tracker;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::GaitError;
pub use pipeline::{FrameOutput, GaitPipeline};
