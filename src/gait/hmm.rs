//! Hidden-Markov gait-phase classifier.
//!
//! One instance tracks one foot of one person. Each observation performs a
//! single forward (filtering) step over the 8 canonical phases:
//!
//! ```text
//! posterior(s) ∝ emission(obs | s) · Σ_prev belief(prev) · P(prev → s)
//! ```
//!
//! The step is O(8²) on fixed-size arrays and never allocates. Non-finite
//! observations are treated as maximally uncertain (uniform emission), so the
//! belief falls back to the transition-propagated prior. `min_probability`
//! floors the emission likelihoods, not the posterior.

use serde::{Deserialize, Serialize};

use crate::config::HmmConfig;
use crate::error::GaitError;
use crate::geometry::Point3D;

use super::event::{Foot, GaitEvent, GaitEventType};
use super::phase::{GaitPhase, TransitionMatrix};

pub const FEATURE_COUNT: usize = 4;

pub type Belief = [f64; GaitPhase::COUNT];

/// 平滑化済みキーポイントから導出した特徴ベクトル
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GaitFeatures {
    /// 足首速度（脚長/秒）
    pub ankle_velocity: f64,
    /// 膝屈曲角（度、伸展=0）
    pub knee_flexion: f64,
    /// 股関節屈曲角（度、進行方向へ屈曲で正）
    pub hip_flexion: f64,
    /// 床からの足首高さ（脚長単位）
    pub vertical_position: f64,
    pub confidence: f64,
}

impl GaitFeatures {
    pub fn values(&self) -> [f64; FEATURE_COUNT] {
        [
            self.ankle_velocity,
            self.knee_flexion,
            self.hip_flexion,
            self.vertical_position,
        ]
    }

    pub fn is_finite(&self) -> bool {
        self.values().iter().all(|v| v.is_finite()) && self.confidence.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HmmObservation {
    pub timestamp: i64,
    pub features: GaitFeatures,
    /// イベント位置として使う足首位置
    #[serde(default)]
    pub position: Option<Point3D>,
}

/// フェーズ毎・特徴毎のガウス尤度モデル
///
/// 既定値は `FeatureExtractor` の単位（足首速度は脚長/秒、角度は度、高さは脚長）
/// で表した典型的な歩行。立脚期は足首速度と高さがほぼ0で、膝と股関節の角度で区別する。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmissionModel {
    /// `[phase][feature]`、特徴順は ankle_velocity, knee_flexion, hip_flexion, vertical_position
    pub means: [[f64; FEATURE_COUNT]; GaitPhase::COUNT],
    pub std_devs: [[f64; FEATURE_COUNT]; GaitPhase::COUNT],
}

impl Default for EmissionModel {
    fn default() -> Self {
        const STD: [f64; FEATURE_COUNT] = [0.5, 8.0, 6.0, 0.02];
        Self {
            means: [
                [0.2, 5.0, 20.0, 0.0],   // HeelStrike
                [0.0, 15.0, 20.0, 0.0],  // LoadingResponse
                [0.0, 12.0, 10.0, 0.0],  // Midstance
                [0.0, 8.0, -3.0, 0.0],   // TerminalStance
                [0.1, 30.0, 0.0, 0.0],   // PreSwing
                [1.8, 50.0, 8.0, 0.04],  // InitialSwing
                [3.0, 68.0, 33.0, 0.06], // Midswing
                [1.8, 38.0, 36.0, 0.01], // TerminalSwing
            ],
            std_devs: [STD; GaitPhase::COUNT],
        }
    }
}

impl EmissionModel {
    pub fn validate(&self) -> Result<(), GaitError> {
        for phase in GaitPhase::ALL {
            let i = phase.index();
            if self.means[i].iter().any(|m| !m.is_finite()) {
                return Err(GaitError::invalid(
                    "hmm.emission.means",
                    format!("non-finite mean for phase {}", phase),
                ));
            }
            if self.std_devs[i].iter().any(|s| !(s.is_finite() && *s > 0.0)) {
                return Err(GaitError::invalid(
                    "hmm.emission.std_devs",
                    format!("standard deviations for phase {} must be finite and > 0", phase),
                ));
            }
        }
        Ok(())
    }

    /// 最大値で正規化した尤度（最大のフェーズが1.0）
    ///
    /// 非有限な観測では None。信頼度で対数尤度を弱め、信頼度0では一様になる。
    pub fn likelihoods(&self, features: &GaitFeatures) -> Option<Belief> {
        if !features.is_finite() {
            return None;
        }
        let values = features.values();
        let weight = features.confidence.clamp(0.0, 1.0);
        if weight == 0.0 {
            return Some([1.0; GaitPhase::COUNT]);
        }

        let mut log_lik = [0.0; GaitPhase::COUNT];
        for (s, ll) in log_lik.iter_mut().enumerate() {
            let mut sum = 0.0;
            for f in 0..FEATURE_COUNT {
                let sigma = self.std_devs[s][f];
                let z = (values[f] - self.means[s][f]) / sigma;
                sum += -0.5 * z * z - sigma.ln();
            }
            *ll = if sum.is_nan() { f64::NEG_INFINITY } else { weight * sum };
        }

        let max = log_lik.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !max.is_finite() {
            return None;
        }
        let mut out = [0.0; GaitPhase::COUNT];
        for (o, ll) in out.iter_mut().zip(log_lik.iter()) {
            *o = (ll - max).exp();
        }
        Some(out)
    }
}

impl HmmConfig {
    /// 設定から遷移行列を構築・検証
    pub fn transitions(&self) -> Result<TransitionMatrix, GaitError> {
        if !(self.min_probability.is_finite()
            && self.min_probability > 0.0
            && self.min_probability < 1.0 / GaitPhase::COUNT as f64)
        {
            return Err(GaitError::invalid(
                "hmm.min_probability",
                format!("must be within (0, 1/8), got {}", self.min_probability),
            ));
        }
        match self.transition_matrix {
            Some(rows) => TransitionMatrix::from_rows(rows),
            None => TransitionMatrix::cyclic(self.persistence),
        }
    }
}

/// 1ステップの推定結果
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseEstimate {
    pub phase: GaitPhase,
    /// 報告フェーズの事後確率
    pub confidence: f64,
    pub belief: Belief,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseUpdate {
    pub estimate: PhaseEstimate,
    pub event: Option<GaitEvent>,
}

#[derive(Debug, Clone, Copy, Default)]
struct DwellStats {
    total_ms: i64,
    visits: u32,
}

#[derive(Debug, Clone)]
pub struct GaitPhaseHmm {
    foot: Foot,
    transitions: TransitionMatrix,
    emission: EmissionModel,
    emit_midphase_events: bool,
    min_probability: f64,
    belief: Belief,
    current: Option<GaitPhase>,
    entered_at: Option<i64>,
    dwell: [DwellStats; GaitPhase::COUNT],
}

impl GaitPhaseHmm {
    pub fn new(config: &HmmConfig, foot: Foot) -> Result<Self, GaitError> {
        let transitions = config.transitions()?;
        config.emission.validate()?;
        Ok(Self {
            foot,
            transitions,
            emission: config.emission.clone(),
            emit_midphase_events: config.emit_midphase_events,
            min_probability: config.min_probability,
            belief: uniform(),
            current: None,
            entered_at: None,
            dwell: [DwellStats::default(); GaitPhase::COUNT],
        })
    }

    pub fn foot(&self) -> Foot {
        self.foot
    }

    pub fn belief(&self) -> &Belief {
        &self.belief
    }

    pub fn current_phase(&self) -> Option<GaitPhase> {
        self.current
    }

    pub fn reset(&mut self) {
        self.belief = uniform();
        self.current = None;
        self.entered_at = None;
        self.dwell = [DwellStats::default(); GaitPhase::COUNT];
    }

    /// 各フェーズの平均滞在時間（ミリ秒）。一度も完了していないフェーズはNone。
    pub fn phase_durations(&self) -> [Option<f64>; GaitPhase::COUNT] {
        let mut out = [None; GaitPhase::COUNT];
        for (o, d) in out.iter_mut().zip(self.dwell.iter()) {
            if d.visits > 0 {
                *o = Some(d.total_ms as f64 / d.visits as f64);
            }
        }
        out
    }

    pub fn process_observation(&mut self, obs: &HmmObservation) -> PhaseUpdate {
        let prior = self.transitions.propagate(&self.belief);

        let emission = self.floored_likelihoods(obs);
        let informative = emission.is_some();
        let emission = emission.unwrap_or([1.0; GaitPhase::COUNT]);

        let mut posterior = [0.0; GaitPhase::COUNT];
        for s in 0..GaitPhase::COUNT {
            posterior[s] = prior[s] * emission[s];
        }
        if !normalize(&mut posterior) {
            posterior = prior;
            if !normalize(&mut posterior) {
                posterior = uniform();
            }
        }
        self.belief = posterior;

        let candidate = argmax(&posterior);
        let phase = match self.current {
            Some(prev) => advance(prev, candidate),
            None => candidate,
        };
        let confidence = posterior[phase.index()];

        // 有効な観測が来るまでは報告フェーズを確定しない
        let event = if self.current.is_some() || informative {
            self.enter(phase, confidence, obs)
        } else {
            None
        };

        PhaseUpdate {
            estimate: PhaseEstimate {
                phase,
                confidence,
                belief: posterior,
            },
            event,
        }
    }

    /// 報告フェーズを更新し、入ったフェーズに応じたイベントを返す
    fn enter(&mut self, phase: GaitPhase, confidence: f64, obs: &HmmObservation) -> Option<GaitEvent> {
        let Some(prev) = self.current.replace(phase) else {
            self.entered_at = Some(obs.timestamp);
            return None;
        };
        if prev == phase {
            return None;
        }
        if let Some(entered) = self.entered_at {
            let stats = &mut self.dwell[prev.index()];
            stats.total_ms = stats.total_ms.saturating_add(obs.timestamp.saturating_sub(entered).max(0));
            stats.visits += 1;
        }
        self.entered_at = Some(obs.timestamp);

        GaitEventType::on_entry(phase, self.emit_midphase_events).map(|event_type| GaitEvent {
            event_type,
            foot: self.foot,
            timestamp: obs.timestamp,
            confidence,
            position: obs.position.unwrap_or_default(),
        })
    }

    /// `min_probability` を下限にした尤度。非有限な観測ではNone。
    fn floored_likelihoods(&self, obs: &HmmObservation) -> Option<Belief> {
        let Some(mut likelihoods) = self.emission.likelihoods(&obs.features) else {
            log::debug!(
                "{:?} foot: non-finite observation at {}, using prior",
                self.foot,
                obs.timestamp
            );
            return None;
        };
        for l in likelihoods.iter_mut() {
            *l = l.max(self.min_probability);
        }
        Some(likelihoods)
    }
}

/// 報告フェーズは1観測につき高々1つ進む
///
/// arg-max が前方（2〜4フェーズ先）にあれば1つ進め、後方にあれば留まる。
fn advance(prev: GaitPhase, candidate: GaitPhase) -> GaitPhase {
    let ahead = (candidate.index() + GaitPhase::COUNT - prev.index()) % GaitPhase::COUNT;
    match ahead {
        0 | 1 => candidate,
        d if d <= GaitPhase::COUNT / 2 => prev.next(),
        _ => prev,
    }
}

fn uniform() -> Belief {
    [1.0 / GaitPhase::COUNT as f64; GaitPhase::COUNT]
}

/// 和が正で有限なら正規化して true
fn normalize(p: &mut Belief) -> bool {
    let sum: f64 = p.iter().sum();
    if !(sum.is_finite() && sum > 0.0) {
        return false;
    }
    for v in p.iter_mut() {
        *v /= sum;
    }
    true
}

fn argmax(p: &Belief) -> GaitPhase {
    let mut best = 0;
    for i in 1..GaitPhase::COUNT {
        if p[i] > p[best] {
            best = i;
        }
    }
    GaitPhase::ALL[best]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::gait_observations;
    use proptest::prelude::*;
    use std::time::Instant;

    fn features(values: [f64; FEATURE_COUNT], confidence: f64) -> GaitFeatures {
        GaitFeatures {
            ankle_velocity: values[0],
            knee_flexion: values[1],
            hip_flexion: values[2],
            vertical_position: values[3],
            confidence,
        }
    }

    fn obs(timestamp: i64, f: GaitFeatures) -> HmmObservation {
        HmmObservation {
            timestamp,
            features: f,
            position: None,
        }
    }

    fn hmm() -> GaitPhaseHmm {
        GaitPhaseHmm::new(&HmmConfig::default(), Foot::Left).unwrap()
    }

    fn belief_sum(b: &Belief) -> f64 {
        b.iter().sum()
    }

    #[test]
    fn test_initial_belief_uniform() {
        let h = hmm();
        for p in h.belief() {
            assert!((p - 0.125).abs() < 1e-12);
        }
        assert!(h.current_phase().is_none());
    }

    #[test]
    fn test_first_observation_picks_matching_phase_without_event() {
        let mut h = hmm();
        let model = EmissionModel::default();
        let update = h.process_observation(&obs(0, features(model.means[5], 1.0)));
        assert_eq!(update.estimate.phase, GaitPhase::InitialSwing);
        assert!(update.event.is_none());
    }

    #[test]
    fn test_gait_cycle_emits_heel_strike_then_toe_off() {
        let mut h = hmm();
        let mut events = Vec::new();
        // 60サンプル・20ms間隔で1周期。遊脚中期から開始する。
        for o in gait_observations(60, 20, 1200, 0.75) {
            let update = h.process_observation(&o);
            assert!(update.estimate.confidence > 0.0 && update.estimate.confidence <= 1.0);
            if let Some(e) = update.event {
                events.push(e);
            }
        }

        let heel = events
            .iter()
            .position(|e| e.event_type == GaitEventType::HeelStrike)
            .expect("no heel strike");
        let toe = events
            .iter()
            .position(|e| e.event_type == GaitEventType::ToeOff)
            .expect("no toe off");
        assert!(heel < toe);
        assert!(events[heel].timestamp < events[toe].timestamp);
        // 踵接地は周期位置 1.0（t = 300ms）付近、離地は前遊脚期（1.5, t = 900ms）付近
        assert!((200..=340).contains(&events[heel].timestamp), "{}", events[heel].timestamp);
        assert!((840..=1000).contains(&events[toe].timestamp), "{}", events[toe].timestamp);
        for e in &events {
            assert!(e.confidence > 0.0 && e.confidence <= 1.0, "confidence {}", e.confidence);
            assert_eq!(e.foot, Foot::Left);
            assert!(e.position.y > 0.8);
        }
    }

    #[test]
    fn test_repeated_cycles_emit_one_event_pair_per_cycle() {
        let mut h = hmm();
        let events: Vec<GaitEvent> = gait_observations(200, 33, 1320, 0.0)
            .iter()
            .filter_map(|o| h.process_observation(o).event)
            .collect();
        let heel: Vec<i64> = events
            .iter()
            .filter(|e| e.event_type == GaitEventType::HeelStrike)
            .map(|e| e.timestamp)
            .collect();
        let toe = events.iter().filter(|e| e.event_type == GaitEventType::ToeOff).count();
        // 200 × 33ms = 5 周期
        assert!((4..=5).contains(&heel.len()), "{:?}", heel);
        assert!((4..=5).contains(&toe), "{}", toe);
        for w in heel.windows(2) {
            assert!((w[1] - w[0] - 1320).abs() <= 66, "{:?}", heel);
        }
        // 踵接地と離地が交互に来る
        for w in events.windows(2) {
            assert_ne!(w[0].event_type, w[1].event_type);
        }
    }

    #[test]
    fn test_phase_sequence_never_skips() {
        let mut h = hmm();
        let mut prev: Option<GaitPhase> = None;
        for o in gait_observations(240, 33, 1320, 0.3) {
            let update = h.process_observation(&o);
            if let Some(p) = prev {
                assert!(
                    p.can_transition_to(update.estimate.phase),
                    "{} -> {} skips a phase",
                    p,
                    update.estimate.phase
                );
            }
            prev = h.current_phase();
        }
    }

    #[test]
    fn test_skip_is_not_accepted() {
        let mut h = hmm();
        let model = EmissionModel::default();
        for t in 0..10 {
            h.process_observation(&obs(t * 33, features(model.means[2], 1.0)));
        }
        assert_eq!(h.current_phase(), Some(GaitPhase::Midstance));

        // Midstance から直接 InitialSwing の観測
        let update = h.process_observation(&obs(400, features(model.means[5], 1.0)));
        assert!(GaitPhase::Midstance.can_transition_to(update.estimate.phase));
    }

    #[test]
    fn test_reported_phase_catches_up_with_belief() {
        let mut h = hmm();
        let model = EmissionModel::default();
        for t in 0..10 {
            h.process_observation(&obs(t * 33, features(model.means[2], 1.0)));
        }

        let mut reported = vec![GaitPhase::Midstance];
        let mut events = Vec::new();
        let mut last = None;
        for t in 10..40 {
            let update = h.process_observation(&obs(t * 33, features(model.means[5], 1.0)));
            if reported.last() != Some(&update.estimate.phase) {
                reported.push(update.estimate.phase);
            }
            events.extend(update.event);
            last = Some(update.estimate);
        }

        // 1ステップずつ InitialSwing まで進み、そこで止まる
        assert_eq!(
            reported,
            vec![
                GaitPhase::Midstance,
                GaitPhase::TerminalStance,
                GaitPhase::PreSwing,
                GaitPhase::InitialSwing
            ]
        );
        let last = last.unwrap();
        assert_eq!(last.phase, GaitPhase::InitialSwing);
        assert!(last.confidence > 0.9, "confidence {}", last.confidence);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, GaitEventType::ToeOff);
    }

    #[test]
    fn test_floor_applies_to_emission_not_posterior() {
        let mut h = hmm();
        let model = EmissionModel::default();
        let midstance = obs(0, features(model.means[2], 1.0));
        let floored = h.floored_likelihoods(&midstance).unwrap();
        assert!(floored.iter().all(|&l| l >= h.min_probability && l <= 1.0));
        assert_eq!(floored[GaitPhase::Midstance.index()], 1.0);

        for t in 0..10 {
            h.process_observation(&obs(t * 33, features(model.means[2], 1.0)));
        }
        // 遷移で遠いフェーズの確率は下限より小さいまま残る
        let far = h.belief()[GaitPhase::Midswing.index()];
        assert!(far > 0.0 && far < h.min_probability, "{}", far);
    }

    #[test]
    fn test_uninformative_first_observation_does_not_commit() {
        let mut h = hmm();
        let first = gait_observations(1, 20, 1200, 0.9);
        assert!(first[0].features.ankle_velocity.is_nan());
        let update = h.process_observation(&first[0]);
        assert!(update.event.is_none());
        assert!(h.current_phase().is_none());
    }

    #[test]
    fn test_non_finite_observation_falls_back_to_prior() {
        let mut h = hmm();
        let model = EmissionModel::default();
        for t in 0..5 {
            h.process_observation(&obs(t * 33, features(model.means[2], 1.0)));
        }
        let before = *h.belief();
        let prior = h.transitions.propagate(&before);

        let bad = features([f64::NAN, f64::INFINITY, 0.0, f64::NEG_INFINITY], 1.0);
        let update = h.process_observation(&obs(200, bad));
        for (p, q) in update.estimate.belief.iter().zip(prior.iter()) {
            assert!(p.is_finite());
            assert!((p - q).abs() < 1e-6, "{} vs {}", p, q);
        }
        assert!((belief_sum(&update.estimate.belief) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_confidence_is_uninformative() {
        let model = EmissionModel::default();
        let l = model.likelihoods(&features(model.means[0], 0.0)).unwrap();
        for v in l {
            assert!((v - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_heel_strike_prefers_low_velocity() {
        let model = EmissionModel::default();
        let hs = GaitPhase::HeelStrike.index();
        let sw = GaitPhase::Midswing.index();
        assert!(model.means[hs][0] < model.means[sw][0]);
        assert!(model.means[hs][3] < model.means[sw][3]);
    }

    #[test]
    fn test_phase_durations_recorded() {
        let mut h = hmm();
        for o in gait_observations(120, 25, 1000, 0.0) {
            h.process_observation(&o);
        }
        let durations = h.phase_durations();
        assert!(durations.iter().any(|d| d.is_some()));
        for d in durations.iter().flatten() {
            assert!(*d > 0.0);
        }
    }

    #[test]
    fn test_reset() {
        let mut h = hmm();
        let model = EmissionModel::default();
        h.process_observation(&obs(0, features(model.means[3], 1.0)));
        h.reset();
        assert!(h.current_phase().is_none());
        assert!((h.belief()[0] - 0.125).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = HmmConfig {
            persistence: -0.1,
            ..HmmConfig::default()
        };
        assert!(GaitPhaseHmm::new(&config, Foot::Right).is_err());

        let mut emission = EmissionModel::default();
        emission.std_devs[1][2] = 0.0;
        let config = HmmConfig {
            emission,
            ..HmmConfig::default()
        };
        assert!(GaitPhaseHmm::new(&config, Foot::Right).is_err());
    }

    #[test]
    fn test_single_observation_latency() {
        let mut h = hmm();
        let o = gait_observations(4, 20, 1200, 0.0)[3];
        let start = Instant::now();
        h.process_observation(&o);
        assert!(start.elapsed().as_millis() < 100);
    }

    #[test]
    fn test_average_observation_latency() {
        let mut h = hmm();
        let observations = gait_observations(100, 20, 1200, 0.0);
        let start = Instant::now();
        for o in &observations {
            h.process_observation(o);
        }
        let avg_ms = start.elapsed().as_secs_f64() * 1000.0 / 100.0;
        assert!(avg_ms < 10.0, "average {} ms", avg_ms);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_belief_normalized(
            seq in prop::collection::vec(
                (prop::num::f64::ANY, prop::num::f64::ANY, prop::num::f64::ANY, prop::num::f64::ANY, prop::num::f64::ANY),
                1..40,
            )
        ) {
            let mut h = hmm();
            for (t, (v, k, hf, y, c)) in seq.into_iter().enumerate() {
                let update = h.process_observation(&obs(t as i64 * 33, features([v, k, hf, y], c)));
                let b = update.estimate.belief;
                prop_assert!((belief_sum(&b) - 1.0).abs() < 1e-6);
                prop_assert!(b.iter().all(|p| p.is_finite() && *p >= 0.0));
                prop_assert!(update.estimate.confidence > 0.0 && update.estimate.confidence <= 1.0);
            }
        }

        #[test]
        fn prop_cyclic_rows_sum_to_one(persistence in 0.0f64..=1.0) {
            let m = TransitionMatrix::cyclic(persistence).unwrap();
            for row in m.rows() {
                let sum: f64 = row.iter().sum();
                prop_assert!((sum - 1.0).abs() < 1e-6);
            }
        }
    }
}
