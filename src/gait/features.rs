//! Turns one frame of smoothed keypoints into the per-foot observation the
//! phase classifier consumes.
//!
//! Distances are normalised by a running leg-length estimate so the features
//! do not depend on how far the person stands from the camera. A joint that is
//! missing or below the confidence threshold yields a NaN feature; the
//! classifier treats such observations as uninformative.

use crate::config::{FeatureConfig, VerticalAxis};
use crate::geometry::{angle_between, distance_3d, Point3D};
use crate::pose::{JointName, Keypoint};

use super::event::Foot;
use super::hmm::{GaitFeatures, HmmObservation};

/// 進行方向推定のEMA係数
const TRAVEL_SMOOTHING: f32 = 0.2;

pub struct FeatureExtractor {
    foot: Foot,
    threshold: f32,
    leg_smoothing: f32,
    floor_relaxation: f32,
    vertical_axis: VerticalAxis,
    leg_length: f32,
    /// 床の高さ（上向き正）
    floor: Option<f32>,
    last_ankle: Option<(Point3D, i64)>,
    last_speed: f64,
    last_hip_x: Option<f32>,
    /// 腰のx方向移動のEMA。符号が進行方向。
    travel: f32,
}

impl FeatureExtractor {
    pub fn new(config: &FeatureConfig, vertical_axis: VerticalAxis, foot: Foot) -> Self {
        Self {
            foot,
            threshold: config.confidence_threshold,
            leg_smoothing: config.leg_length_smoothing,
            floor_relaxation: config.floor_relaxation,
            vertical_axis,
            leg_length: config.default_leg_length,
            floor: None,
            last_ankle: None,
            last_speed: f64::NAN,
            last_hip_x: None,
            travel: 0.0,
        }
    }

    pub fn foot(&self) -> Foot {
        self.foot
    }

    /// 現在の脚長推定（正規化座標）
    pub fn leg_length(&self) -> f32 {
        self.leg_length
    }

    pub fn reset(&mut self) {
        self.floor = None;
        self.last_ankle = None;
        self.last_speed = f64::NAN;
        self.last_hip_x = None;
        self.travel = 0.0;
    }

    pub fn extract(&mut self, keypoints: &[Keypoint], timestamp: i64) -> HmmObservation {
        let joint = |name: JointName| {
            keypoints
                .iter()
                .find(|k| k.name == name)
                .filter(|k| k.is_valid(self.threshold))
                .copied()
        };
        let hip = joint(self.foot.hip());
        let knee = joint(self.foot.knee());
        let ankle = joint(self.foot.ankle());
        let shoulder = joint(self.foot.shoulder());

        if let (Some(h), Some(k), Some(a)) = (hip, knee, ankle) {
            self.update_leg_length(h.position(), k.position(), a.position());
        }
        if let Some(h) = hip {
            self.update_travel(h.x);
        }
        let leg = self.leg_length as f64;

        let ankle_velocity = match ankle {
            Some(a) => self.ankle_speed(a.position(), timestamp) / leg,
            None => {
                self.last_ankle = None;
                f64::NAN
            }
        };

        let knee_flexion = match (hip, knee, ankle) {
            (Some(h), Some(k), Some(a)) => 180.0 - angle_between(h.position(), k.position(), a.position()) as f64,
            _ => f64::NAN,
        };

        let hip_flexion = match (hip, knee) {
            (Some(h), Some(k)) => {
                // 肩が無ければ腰の真上の仮想点で代用
                let reference = match shoulder {
                    Some(s) => s.position(),
                    None => h.position() + self.up() * self.leg_length,
                };
                let magnitude = 180.0 - angle_between(reference, h.position(), k.position()) as f64;
                let forward = (k.x - h.x) * self.direction() >= 0.0;
                if forward {
                    magnitude
                } else {
                    -magnitude
                }
            }
            _ => f64::NAN,
        };

        let vertical_position = match ankle {
            Some(a) => {
                let height = self.vertical_axis.height(a.y);
                let floor = self.update_floor(height);
                ((height - floor) / self.leg_length) as f64
            }
            None => f64::NAN,
        };

        let confidence = [hip, knee, ankle]
            .iter()
            .map(|k| k.map_or(0.0, |k| k.score.clamp(0.0, 1.0)))
            .fold(1.0f32, f32::min) as f64;

        HmmObservation {
            timestamp,
            features: GaitFeatures {
                ankle_velocity,
                knee_flexion,
                hip_flexion,
                vertical_position,
                confidence,
            },
            position: ankle.map(|a| a.position()),
        }
    }

    fn update_leg_length(&mut self, hip: Point3D, knee: Point3D, ankle: Point3D) {
        let measured = distance_3d(hip, knee) + distance_3d(knee, ankle);
        if measured.is_finite() && measured > 0.0 {
            self.leg_length += self.leg_smoothing * (measured - self.leg_length);
        }
    }

    fn update_travel(&mut self, hip_x: f32) {
        if let Some(prev) = self.last_hip_x {
            self.travel += TRAVEL_SMOOTHING * ((hip_x - prev) - self.travel);
        }
        self.last_hip_x = Some(hip_x);
    }

    /// 進行方向の x 符号（不明なら +1）
    fn direction(&self) -> f32 {
        if self.travel < 0.0 {
            -1.0
        } else {
            1.0
        }
    }

    /// 画像座標での「上」方向の単位ベクトル
    fn up(&self) -> Point3D {
        match self.vertical_axis {
            VerticalAxis::YDown => Point3D::new(0.0, -1.0, 0.0),
            VerticalAxis::YUp => Point3D::new(0.0, 1.0, 0.0),
        }
    }

    /// 足首速度（単位/秒）。同一時刻のフレームでは直前の値を使う。
    fn ankle_speed(&mut self, position: Point3D, timestamp: i64) -> f64 {
        let speed = match self.last_ankle {
            Some((prev, prev_ts)) if timestamp > prev_ts => {
                let dt = timestamp.saturating_sub(prev_ts) as f64 / 1000.0;
                distance_3d(prev, position) as f64 / dt
            }
            Some(_) => self.last_speed,
            None => f64::NAN,
        };
        self.last_ankle = Some((position, timestamp));
        self.last_speed = speed;
        speed
    }

    /// 床は足首の最低点まで即座に下がり、上側へはゆっくり戻る
    fn update_floor(&mut self, height: f32) -> f32 {
        let floor = match self.floor {
            Some(f) if height < f => height,
            Some(f) => f + self.floor_relaxation * (height - f),
            None => height,
        };
        self.floor = Some(floor);
        floor
    }
}
