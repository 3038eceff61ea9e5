use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::config::MetricsConfig;
use crate::error::GaitError;
use crate::pose::PersonId;
use crate::tracker::trajectory::TrajectoryTracker;

use super::event::{Foot, GaitEvent, GaitEventType};

/// 表示側が「データ無し」「低信頼」を区別できるようにするフラグ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataQuality {
    NoData,
    LowConfidence,
    Reliable,
}

/// 解析窓ごとに再計算する歩行パラメータ
///
/// 時間は秒、距離は入力座標系の単位。算出できない値は0、比率系はNone。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GaitParameters {
    /// 歩/分
    pub cadence: f32,
    pub stride_time: f32,
    pub step_time: f32,
    pub stance_time: f32,
    pub swing_time: f32,
    pub double_support_time: f32,
    pub stride_length: f32,
    pub step_length: f32,
    pub step_width: f32,
    /// ストライドの向きと進行方向のなす角（度）
    pub foot_angle: f32,
    /// 単位/秒
    pub velocity: f32,
    /// Robinson の対称性指数（左右のストライド時間、%）
    pub symmetry_index: Option<f32>,
    /// ストライド時間の変動係数（%）
    pub variability_index: Option<f32>,
    pub stride_count: usize,
    pub confidence: f32,
    pub quality: DataQuality,
}

impl GaitParameters {
    pub fn empty() -> Self {
        Self {
            cadence: 0.0,
            stride_time: 0.0,
            step_time: 0.0,
            stance_time: 0.0,
            swing_time: 0.0,
            double_support_time: 0.0,
            stride_length: 0.0,
            step_length: 0.0,
            step_width: 0.0,
            foot_angle: 0.0,
            velocity: 0.0,
            symmetry_index: None,
            variability_index: None,
            stride_count: 0,
            confidence: 0.0,
            quality: DataQuality::NoData,
        }
    }
}

/// 人物ごとのイベントログから歩行パラメータを集計する
pub struct GaitMetricsAggregator {
    config: MetricsConfig,
    logs: HashMap<PersonId, VecDeque<GaitEvent>>,
}

impl GaitMetricsAggregator {
    pub fn new(config: &MetricsConfig) -> Result<Self, GaitError> {
        config.validate()?;
        Ok(Self {
            config: config.clone(),
            logs: HashMap::new(),
        })
    }

    pub fn record(&mut self, person: PersonId, event: GaitEvent) {
        let log = self.logs.entry(person).or_default();
        log.push_back(event);
        let horizon = event.timestamp.saturating_sub(self.config.analysis_window_ms);
        while log.front().is_some_and(|e| e.timestamp < horizon) {
            log.pop_front();
        }
        while log.len() > self.config.max_events {
            log.pop_front();
        }
    }

    pub fn events(&self, person: PersonId) -> Vec<GaitEvent> {
        self.logs
            .get(&person)
            .map(|log| log.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn remove_person(&mut self, person: PersonId) {
        self.logs.remove(&person);
    }

    /// `now` までの解析窓でパラメータを計算。空間量は `tracker` から取る。
    pub fn snapshot(&self, person: PersonId, tracker: &TrajectoryTracker, now: i64) -> GaitParameters {
        let horizon = now.saturating_sub(self.config.analysis_window_ms);
        let events: Vec<GaitEvent> = match self.logs.get(&person) {
            Some(log) => log
                .iter()
                .filter(|e| e.timestamp >= horizon && e.timestamp <= now)
                .copied()
                .collect(),
            None => Vec::new(),
        };

        let times = |foot: Foot, kind: GaitEventType| -> Vec<i64> {
            let mut t: Vec<i64> = events
                .iter()
                .filter(|e| e.foot == foot && e.event_type == kind)
                .map(|e| e.timestamp)
                .collect();
            t.sort_unstable();
            t
        };
        let strikes = [
            times(Foot::Left, GaitEventType::HeelStrike),
            times(Foot::Right, GaitEventType::HeelStrike),
        ];
        let toe_offs = [
            times(Foot::Left, GaitEventType::ToeOff),
            times(Foot::Right, GaitEventType::ToeOff),
        ];

        if strikes.iter().all(|s| s.is_empty()) {
            return GaitParameters::empty();
        }

        let strides_per_foot: Vec<Vec<f32>> = strikes.iter().map(|s| intervals(s)).collect();
        let strides: Vec<f32> = strides_per_foot.iter().flatten().copied().collect();
        let stride_time = mean(&strides);

        let mut merged: Vec<(i64, Foot)> = strikes[0]
            .iter()
            .map(|&t| (t, Foot::Left))
            .chain(strikes[1].iter().map(|&t| (t, Foot::Right)))
            .collect();
        merged.sort_unstable_by_key(|&(t, _)| t);
        let steps: Vec<f32> = merged
            .windows(2)
            .filter(|w| w[0].1 != w[1].1)
            .map(|w| secs(w[1].0.saturating_sub(w[0].0)))
            .collect();
        let step_time = mean(&steps);

        let cadence = if step_time > 0.0 {
            60.0 / step_time
        } else if stride_time > 0.0 {
            120.0 / stride_time
        } else {
            0.0
        };

        let mut stance = Vec::new();
        let mut swing = Vec::new();
        for i in 0..2 {
            stance.extend(first_following(&strikes[i], &toe_offs[i]));
            swing.extend(first_following(&toe_offs[i], &strikes[i]));
        }
        let stance_time = mean(&stance);
        let swing_time = mean(&swing);
        let double_support_time = if stance_time > 0.0 && swing_time > 0.0 {
            (stance_time - swing_time).max(0.0)
        } else {
            0.0
        };

        let stride_lengths: Vec<f32> = Foot::BOTH
            .iter()
            .map(|&f| tracker.stride_length(person, f))
            .filter(|&l| l > 0.0)
            .collect();
        let stride_length = mean(&stride_lengths);
        let velocity = if stride_length > 0.0 && stride_time > 0.0 {
            stride_length / stride_time
        } else {
            0.0
        };

        let symmetry_index = match (
            nonzero(mean(&strides_per_foot[0])),
            nonzero(mean(&strides_per_foot[1])),
        ) {
            (Some(l), Some(r)) => Some((l - r).abs() / (0.5 * (l + r)) * 100.0),
            _ => None,
        };
        let variability_index = coefficient_of_variation(&strides);

        let confidence = (events.iter().map(|e| e.confidence).sum::<f64>() / events.len() as f64) as f32;
        let quality = if strides.len() < self.config.min_strides || confidence < self.config.low_confidence {
            DataQuality::LowConfidence
        } else {
            DataQuality::Reliable
        };

        GaitParameters {
            cadence,
            stride_time,
            step_time,
            stance_time,
            swing_time,
            double_support_time,
            stride_length,
            step_length: tracker.step_length(person),
            step_width: tracker.step_width(person),
            foot_angle: foot_angle(tracker, person),
            velocity,
            symmetry_index,
            variability_index,
            stride_count: strides.len(),
            confidence,
            quality,
        }
    }
}

fn secs(ms: i64) -> f32 {
    ms as f32 / 1000.0
}

fn intervals(times: &[i64]) -> Vec<f32> {
    times.windows(2).map(|w| secs(w[1].saturating_sub(w[0]))).collect()
}

/// `starts` の各時刻について、次の `starts` より前にある最初の `ends` までの時間
fn first_following(starts: &[i64], ends: &[i64]) -> Vec<f32> {
    starts
        .iter()
        .enumerate()
        .filter_map(|(i, &s)| {
            let limit = starts.get(i + 1).copied().unwrap_or(i64::MAX);
            ends.iter()
                .find(|&&e| e > s && e < limit)
                .map(|&e| secs(e.saturating_sub(s)))
        })
        .collect()
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f32>() / values.len() as f32
    }
}

fn nonzero(v: f32) -> Option<f32> {
    (v > 0.0).then_some(v)
}

fn coefficient_of_variation(values: &[f32]) -> Option<f32> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values);
    if m <= 0.0 {
        return None;
    }
    let variance = values.iter().map(|v| (v - m) * (v - m)).sum::<f32>() / values.len() as f32;
    Some(variance.sqrt() / m * 100.0)
}

/// 同じ足の連続する踵接地を結ぶ向きと進行方向の角度の平均（度）
fn foot_angle(tracker: &TrajectoryTracker, person: PersonId) -> f32 {
    let Some(d) = tracker.progression_direction(person) else {
        return 0.0;
    };
    let angles: Vec<f32> = Foot::BOTH
        .iter()
        .flat_map(|&f| {
            let strikes = tracker.heel_strikes(person, f);
            strikes
                .windows(2)
                .filter_map(|w| {
                    let dx = w[1].position.x - w[0].position.x;
                    let dz = w[1].position.z - w[0].position.z;
                    let len = (dx * dx + dz * dz).sqrt();
                    (len > 0.0).then(|| {
                        let cos = ((dx * d.x + dz * d.z) / len).clamp(-1.0, 1.0);
                        cos.acos().to_degrees()
                    })
                })
                .collect::<Vec<_>>()
        })
        .collect();
    mean(&angles)
}
