use serde::{Deserialize, Serialize};

use crate::config::{SmoothingAlgorithm, SmoothingConfig};
use crate::error::GaitError;
use crate::geometry::{distance_3d, Point3D};
use crate::pose::{JointName, Keypoint, PersonId, Pose};

use super::extrapolate::Extrapolator;
use super::history::{FilterState, HistoryArena, HistorySample, JointHistory};
use super::lowpass::{smoothing_factor, Cascade, LowPass};

/// 連続してこの回数外れ値と判定されたら、実際に移動したとみなして生値に再同期する
const MAX_CONSECUTIVE_REJECTIONS: u32 = 3;

// Savitzky–Golay 係数（2次多項式、中心点）。3点は線形フィットになる。
const SG_3: [f32; 3] = [1.0, 1.0, 1.0];
const SG_5: [f32; 5] = [-3.0, 12.0, 17.0, 12.0, -3.0];
const SG_7: [f32; 7] = [-2.0, 3.0, 6.0, 7.0, 6.0, 3.0, -2.0];

/// 出力位置の由来
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleSource {
    /// フィルタを通した観測値
    Smoothed,
    /// 外れ値・欠損の代わりに外挿した位置
    Predicted,
    /// フィルタを通さない生値（初回、再同期、履歴無しの外れ値）
    Passthrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SmoothedKeypoint {
    #[serde(flatten)]
    pub keypoint: Keypoint,
    pub source: SampleSource,
}

/// `smooth_pose` 1回分の集計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmoothStats {
    pub smoothed: usize,
    pub predicted: usize,
    pub passthrough: usize,
    /// 移動量が閾値を超えて棄却した数
    pub rejected: usize,
    /// 非有限座標・範囲外スコアを無効化した数
    pub neutralised: usize,
    /// 同一フレーム内で重複していた関節
    pub duplicates: usize,
}

impl SmoothStats {
    fn record(&mut self, source: SampleSource) {
        match source {
            SampleSource::Smoothed => self.smoothed += 1,
            SampleSource::Predicted => self.predicted += 1,
            SampleSource::Passthrough => self.passthrough += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Accepted,
    Rejected,
    Neutralised,
}

/// 構築時に解決済みのフィルタパラメータ
#[derive(Debug, Clone, Copy, PartialEq)]
enum Filter {
    Exponential { base_factor: f32 },
    MovingAverage { window: usize },
    Kalman { process_noise: f32 },
    Butterworth { alpha: f32 },
    SavitzkyGolay { coefficients: &'static [f32], norm: f32 },
}

impl Filter {
    fn resolve(algorithm: SmoothingAlgorithm) -> Result<Self, GaitError> {
        Ok(match algorithm {
            SmoothingAlgorithm::Exponential { base_factor } => Filter::Exponential { base_factor },
            SmoothingAlgorithm::MovingAverage { window } => Filter::MovingAverage { window },
            SmoothingAlgorithm::Kalman { process_noise } => Filter::Kalman { process_noise },
            SmoothingAlgorithm::Butterworth {
                cutoff_hz,
                sample_rate_hz,
            } => Filter::Butterworth {
                alpha: smoothing_factor(1.0 / sample_rate_hz, cutoff_hz),
            },
            SmoothingAlgorithm::SavitzkyGolay { window } => {
                let coefficients: &'static [f32] = match window {
                    3 => &SG_3,
                    5 => &SG_5,
                    7 => &SG_7,
                    other => return Err(GaitError::SavitzkyGolayWindow(other)),
                };
                Filter::SavitzkyGolay {
                    coefficients,
                    norm: coefficients.iter().sum(),
                }
            }
        })
    }
}

/// キーポイント平滑化フィルタ
///
/// 外れ値棄却 → アルゴリズム適用 → 履歴更新 の順で1関節ずつ処理する。
/// どんな入力でも位置を返し、パニックしない。
#[derive(Debug, Clone)]
pub struct KeypointSmoother {
    filter: Filter,
    max_movement: f32,
    prediction_decay: f32,
    history_size: usize,
    extrapolator: Extrapolator,
}

impl KeypointSmoother {
    pub fn new(config: &SmoothingConfig) -> Result<Self, GaitError> {
        config.validate()?;
        Ok(Self {
            filter: Filter::resolve(config.filter)?,
            max_movement: config.max_movement,
            prediction_decay: config.prediction_decay,
            history_size: config.history_size,
            extrapolator: Extrapolator::new(config.nominal_fps),
        })
    }

    /// このスムーザ用の空の履歴アリーナ
    pub fn new_arena(&self) -> HistoryArena {
        HistoryArena::new(self.history_size)
    }

    pub fn initial_state(&self) -> FilterState {
        match self.filter {
            Filter::Exponential { .. } | Filter::Kalman { .. } => FilterState::Recursive(LowPass::new()),
            Filter::Butterworth { .. } => FilterState::Cascade(Cascade::default()),
            Filter::MovingAverage { .. } | Filter::SavitzkyGolay { .. } => FilterState::Windowed,
        }
    }

    /// 履歴から `timestamp` 時点の位置を外挿
    pub fn predict(&self, history: &JointHistory, timestamp: i64) -> Option<Point3D> {
        self.extrapolator.predict(history, timestamp)
    }

    pub fn smooth(&self, keypoint: &Keypoint, history: &mut JointHistory) -> SmoothedKeypoint {
        self.step(keypoint, history).0
    }

    /// 1人分の姿勢を平滑化。同一関節の重複は最初の1つだけ使う。
    pub fn smooth_pose(
        &self,
        arena: &mut HistoryArena,
        person: PersonId,
        pose: &Pose,
    ) -> (Vec<SmoothedKeypoint>, SmoothStats) {
        let mut stats = SmoothStats::default();
        let mut seen = [false; JointName::COUNT];
        let mut out = Vec::with_capacity(pose.keypoints.len());

        for keypoint in &pose.keypoints {
            if std::mem::replace(&mut seen[keypoint.name.index()], true) {
                stats.duplicates += 1;
                continue;
            }
            let history = arena.entry(person, keypoint.name, || self.initial_state());
            let (smoothed, disposition) = self.step(keypoint, history);
            match disposition {
                Disposition::Accepted => {}
                Disposition::Rejected => stats.rejected += 1,
                Disposition::Neutralised => stats.neutralised += 1,
            }
            stats.record(smoothed.source);
            out.push(smoothed);
        }

        (out, stats)
    }

    fn step(&self, keypoint: &Keypoint, history: &mut JointHistory) -> (SmoothedKeypoint, Disposition) {
        let timestamp = keypoint.timestamp;
        let nominal_dt = self.extrapolator.nominal_dt();

        if !keypoint.has_finite_position() {
            log::debug!("{}: non-finite position at {}, holding", keypoint.name, timestamp);
            return (self.hold(keypoint, history), Disposition::Neutralised);
        }

        if !(keypoint.score.is_finite() && (0.0..=1.0).contains(&keypoint.score)) {
            log::debug!("{}: score {} out of range at {}, holding", keypoint.name, keypoint.score, timestamp);
            return (self.hold(keypoint, history), Disposition::Neutralised);
        }
        let confidence = keypoint.score;
        let raw = keypoint.position();

        if let Some(last) = history.last().copied() {
            if distance_3d(raw, last.position) > self.max_movement {
                history.rejection_streak += 1;
                if history.rejection_streak <= MAX_CONSECUTIVE_REJECTIONS {
                    if let Some(predicted) = self.extrapolator.predict(history, timestamp) {
                        let score = last.confidence * self.prediction_decay;
                        history.push(
                            HistorySample {
                                position: predicted,
                                confidence: score,
                                timestamp,
                            },
                            nominal_dt,
                        );
                        history.filter.seed(predicted);
                        return (
                            output(keypoint, predicted, score, SampleSource::Predicted),
                            Disposition::Rejected,
                        );
                    }
                    log::debug!("{}: jump without velocity history, passing raw sample", keypoint.name);
                } else {
                    log::debug!("{}: re-acquired after {} rejections", keypoint.name, history.rejection_streak - 1);
                }
                history.rejection_streak = 0;
                history.push(
                    HistorySample {
                        position: raw,
                        confidence,
                        timestamp,
                    },
                    nominal_dt,
                );
                history.filter.seed(raw);
                return (output(keypoint, raw, confidence, SampleSource::Passthrough), Disposition::Accepted);
            }
        }
        history.rejection_streak = 0;

        let first = history.is_empty();
        history.push(
            HistorySample {
                position: raw,
                confidence,
                timestamp,
            },
            nominal_dt,
        );
        let smoothed = self.apply(raw, confidence, history);
        let source = if first {
            SampleSource::Passthrough
        } else {
            SampleSource::Smoothed
        };
        (output(keypoint, smoothed, confidence, source), Disposition::Accepted)
    }

    /// 現在サンプルは既に履歴に積まれている
    fn apply(&self, raw: Point3D, confidence: f32, history: &mut JointHistory) -> Point3D {
        let smoothed = match self.filter {
            Filter::Exponential { base_factor } => {
                history.filter.update(raw, (base_factor * confidence).min(1.0))
            }
            Filter::Kalman { process_noise } => {
                let gain = process_noise / (process_noise + (1.0 - confidence));
                history.filter.update(raw, gain)
            }
            Filter::Butterworth { alpha } => history.filter.update(raw, alpha),
            Filter::MovingAverage { window } => mean(history.recent_positions(window)),
            Filter::SavitzkyGolay { coefficients, norm } => {
                if history.len() >= coefficients.len() {
                    let weighted = history
                        .recent_positions(coefficients.len())
                        .zip(coefficients.iter())
                        .fold(Point3D::ZERO, |acc, (p, &w)| acc + p * w);
                    weighted * (1.0 / norm)
                } else {
                    mean(history.recent_positions(coefficients.len()))
                }
            }
        };
        if smoothed.is_finite() {
            smoothed
        } else {
            raw
        }
    }

    /// 座標が使えないとき: 予測 → 最後の位置 → 原点（信頼度0）
    fn hold(&self, keypoint: &Keypoint, history: &JointHistory) -> SmoothedKeypoint {
        let Some(last) = history.last() else {
            return output(keypoint, Point3D::ZERO, 0.0, SampleSource::Passthrough);
        };
        let position = self
            .extrapolator
            .predict(history, keypoint.timestamp)
            .unwrap_or(last.position);
        output(
            keypoint,
            position,
            last.confidence * self.prediction_decay,
            SampleSource::Predicted,
        )
    }
}

fn mean(points: impl Iterator<Item = Point3D>) -> Point3D {
    let (sum, count) = points.fold((Point3D::ZERO, 0usize), |(s, n), p| (s + p, n + 1));
    if count == 0 {
        Point3D::ZERO
    } else {
        sum * (1.0 / count as f32)
    }
}

fn output(keypoint: &Keypoint, position: Point3D, score: f32, source: SampleSource) -> SmoothedKeypoint {
    SmoothedKeypoint {
        keypoint: Keypoint {
            name: keypoint.name,
            x: position.x,
            y: position.y,
            z: keypoint.z.map(|_| position.z),
            score,
            timestamp: keypoint.timestamp,
        },
        source,
    }
}
