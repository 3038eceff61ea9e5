use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::GaitError;
use crate::gait::event::{Foot, GaitEvent};
use crate::gait::features::FeatureExtractor;
use crate::gait::hmm::{GaitPhaseHmm, PhaseEstimate};
use crate::gait::metrics::{GaitMetricsAggregator, GaitParameters};
use crate::gait::phase::GaitPhase;
use crate::pose::{Keypoint, PersonId, Pose};
use crate::tracker::history::HistoryArena;
use crate::tracker::smooth::{KeypointSmoother, SmoothedKeypoint};
use crate::tracker::trajectory::{GaitTrajectory, TrajectoryTracker};

/// 1人分の足ごとの状態（左右の順）
struct PersonState {
    extractors: [FeatureExtractor; 2],
    hmms: [GaitPhaseHmm; 2],
    last_seen: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FootPhase {
    pub foot: Foot,
    pub estimate: PhaseEstimate,
}

/// フレーム処理の計測値
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMetrics {
    pub processing_time_us: u64,
    pub smoothed: usize,
    pub predicted: usize,
    pub passthrough: usize,
    pub rejected: usize,
    pub neutralised: usize,
    pub duplicates: usize,
    /// 欠損関節などで特徴量が有限にならなかった足の数
    pub non_finite_features: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameOutput {
    pub smoothed: Vec<SmoothedKeypoint>,
    pub events: Vec<GaitEvent>,
    pub phases: Vec<FootPhase>,
    pub metrics: FrameMetrics,
}

/// 平滑化 → 軌跡 → 特徴量 → HMM → 集計 をフレームごとに回す
///
/// 状態はすべて人物IDで分離している。
pub struct GaitPipeline {
    config: Config,
    smoother: KeypointSmoother,
    arena: HistoryArena,
    tracker: TrajectoryTracker,
    metrics: GaitMetricsAggregator,
    /// 新しい人物用に複製する初期状態のHMM（左右）
    hmm_template: [GaitPhaseHmm; 2],
    persons: HashMap<PersonId, PersonState>,
}

impl GaitPipeline {
    pub fn new(config: &Config) -> Result<Self, GaitError> {
        config.validate()?;
        let smoother = KeypointSmoother::new(&config.smoothing)?;
        let arena = smoother.new_arena();
        let hmm_template = [
            GaitPhaseHmm::new(&config.hmm, Foot::Left)?,
            GaitPhaseHmm::new(&config.hmm, Foot::Right)?,
        ];
        Ok(Self {
            config: config.clone(),
            smoother,
            arena,
            tracker: TrajectoryTracker::new(&config.trajectory)?,
            metrics: GaitMetricsAggregator::new(&config.metrics)?,
            hmm_template,
            persons: HashMap::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn process_pose(&mut self, person: PersonId, pose: &Pose) -> FrameOutput {
        let start = Instant::now();

        let (smoothed, stats) = self.smoother.smooth_pose(&mut self.arena, person, pose);
        let keypoints: Vec<Keypoint> = smoothed.iter().map(|s| s.keypoint).collect();
        self.tracker.update(person, &keypoints);

        if !self.persons.contains_key(&person) {
            let state = self.new_person_state(pose.timestamp);
            self.persons.insert(person, state);
        }

        let mut events = Vec::new();
        let mut phases = Vec::with_capacity(2);
        let mut non_finite_features = 0;
        if let Some(state) = self.persons.get_mut(&person) {
            state.last_seen = pose.timestamp;
            for (extractor, hmm) in state.extractors.iter_mut().zip(state.hmms.iter_mut()) {
                let obs = extractor.extract(&keypoints, pose.timestamp);
                if !obs.features.is_finite() {
                    non_finite_features += 1;
                }
                let update = hmm.process_observation(&obs);
                phases.push(FootPhase {
                    foot: hmm.foot(),
                    estimate: update.estimate,
                });
                if let Some(event) = update.event {
                    self.metrics.record(person, event);
                    events.push(event);
                }
            }
        }

        let metrics = FrameMetrics {
            processing_time_us: start.elapsed().as_micros() as u64,
            smoothed: stats.smoothed,
            predicted: stats.predicted,
            passthrough: stats.passthrough,
            rejected: stats.rejected,
            neutralised: stats.neutralised,
            duplicates: stats.duplicates,
            non_finite_features,
        };

        FrameOutput {
            smoothed,
            events,
            phases,
            metrics,
        }
    }

    /// 最後に観測した時刻を基準にした歩行パラメータ
    pub fn gait_parameters(&self, person: PersonId) -> GaitParameters {
        match self.persons.get(&person) {
            Some(state) => self.metrics.snapshot(person, &self.tracker, state.last_seen),
            None => GaitParameters::empty(),
        }
    }

    pub fn trajectory(&self, person: PersonId) -> Option<GaitTrajectory> {
        self.tracker.trajectory(person)
    }

    pub fn tracker(&self) -> &TrajectoryTracker {
        &self.tracker
    }

    /// 現在の推定フェーズ（左右の順）
    pub fn phases(&self, person: PersonId) -> Option<[Option<GaitPhase>; 2]> {
        let state = self.persons.get(&person)?;
        Some([state.hmms[0].current_phase(), state.hmms[1].current_phase()])
    }

    pub fn events(&self, person: PersonId) -> Vec<GaitEvent> {
        self.metrics.events(person)
    }

    pub fn persons(&self) -> Vec<PersonId> {
        let mut ids: Vec<PersonId> = self.persons.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn remove_person(&mut self, person: PersonId) -> bool {
        let joints = self.arena.remove_person(person);
        self.tracker.clear(person);
        self.metrics.remove_person(person);
        let removed = self.persons.remove(&person).is_some();
        if removed {
            log::info!("pipeline: removed person {} ({} joint histories)", person, joints);
        }
        removed
    }

    /// `person_timeout_ms` を超えて観測の無い人物の状態をすべて破棄する
    pub fn prune_lost(&mut self, now: i64) -> Vec<PersonId> {
        let timeout = self.config.trajectory.person_timeout_ms;
        let mut lost: Vec<PersonId> = self
            .persons
            .iter()
            .filter(|(_, s)| now.saturating_sub(s.last_seen) > timeout)
            .map(|(&id, _)| id)
            .collect();
        lost.sort_unstable();
        for &id in &lost {
            self.remove_person(id);
        }
        lost
    }

    fn new_person_state(&self, timestamp: i64) -> PersonState {
        let axis = self.config.trajectory.vertical_axis;
        let extractors = Foot::BOTH.map(|foot| FeatureExtractor::new(&self.config.features, axis, foot));
        log::info!("pipeline: new person at {}", timestamp);
        PersonState {
            extractors,
            hmms: self.hmm_template.clone(),
            last_seen: timestamp,
        }
    }
}
