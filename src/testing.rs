//! テスト用の合成歩行データ
//!
//! 立脚期は足首が床に固定され、遊脚期は正弦波で持ち上がる。膝は2リンクの
//! 逆運動学で求めるので、特徴抽出器が見る角度・速度は実際の歩行に近い。

use std::f32::consts::PI;

use crate::config::{FeatureConfig, VerticalAxis};
use crate::gait::event::Foot;
use crate::gait::features::FeatureExtractor;
use crate::gait::hmm::HmmObservation;
use crate::pose::{JointName, Keypoint, Pose};

/// 大腿・下腿の長さ（脚長 0.4）
pub const SEGMENT: f32 = 0.2;
pub const FLOOR_Y: f32 = 0.9;
/// 1周期あたりの前進量
pub const STRIDE: f32 = 0.4;
/// `walking_pose` の1周期のフレーム数
pub const FRAMES_PER_CYCLE: i64 = 30;
pub const FRAME_MS: i64 = 33;

const STANCE: f32 = 0.6;
const LIFT: f32 = 0.05;
const SHOULDER_ABOVE_HIP: f32 = 0.3;
/// 立脚期の膝屈曲角（周期位置, 度）
const STANCE_KNEE: [(f32, f32); 4] = [(0.0, 5.0), (0.12, 18.0), (0.4, 5.0), (0.6, 35.0)];

#[derive(Debug, Clone, Copy)]
pub struct Leg {
    pub hip: (f32, f32),
    pub knee: (f32, f32),
    pub ankle: (f32, f32),
}

impl Leg {
    /// 腰から `phi`（0 = 踵接地、1周期で1.0）の位置にある片脚
    pub fn at(hip_x: f32, phi: f32) -> Self {
        let phi = phi.rem_euclid(1.0);
        let (dx, lift, height) = if phi < STANCE {
            (STRIDE * (0.3 - phi), 0.0, stance_hip_height(phi))
        } else {
            let s = (phi - STANCE) / (1.0 - STANCE);
            (
                STRIDE * (0.3 - phi + (1.0 - (PI * s).cos()) / 2.0),
                LIFT * (PI * s).sin(),
                ease(stance_hip_height(STANCE), stance_hip_height(0.0), s),
            )
        };
        let hip = (hip_x, FLOOR_Y - height);
        let ankle = (hip_x + dx, FLOOR_Y - lift);

        // 膝は進行方向（+x）側に曲げる
        let (vx, vy) = (ankle.0 - hip.0, ankle.1 - hip.1);
        let d = (vx * vx + vy * vy).sqrt();
        let (ux, uy) = (vx / d, vy / d);
        let half = d.min(2.0 * SEGMENT) / 2.0;
        let offset = (SEGMENT * SEGMENT - half * half).max(0.0).sqrt();
        let knee = (hip.0 + ux * half + uy * offset, hip.1 + uy * half - ux * offset);
        Self { hip, knee, ankle }
    }

    pub fn keypoints(&self, foot: Foot, score: f32, timestamp: i64) -> Vec<Keypoint> {
        vec![
            Keypoint::new(foot.shoulder(), self.hip.0, self.hip.1 - SHOULDER_ABOVE_HIP, score, timestamp),
            Keypoint::new(foot.hip(), self.hip.0, self.hip.1, score, timestamp),
            Keypoint::new(foot.knee(), self.knee.0, self.knee.1, score, timestamp),
            Keypoint::new(foot.ankle(), self.ankle.0, self.ankle.1, score, timestamp),
        ]
    }
}

fn ease(from: f32, to: f32, u: f32) -> f32 {
    from + (to - from) * (1.0 - (PI * u).cos()) / 2.0
}

fn stance_knee(phi: f32) -> f32 {
    for w in STANCE_KNEE.windows(2) {
        let ((p0, v0), (p1, v1)) = (w[0], w[1]);
        if phi <= p1 {
            return ease(v0, v1, (phi - p0) / (p1 - p0));
        }
    }
    STANCE_KNEE[STANCE_KNEE.len() - 1].1
}

/// 足首を床に付けたまま膝角を保つ腰の高さ
fn stance_hip_height(phi: f32) -> f32 {
    let dx = STRIDE * (0.3 - phi);
    let reach = 2.0 * SEGMENT * (stance_knee(phi).to_radians() / 2.0).cos();
    (reach * reach - dx * dx).sqrt()
}

/// 左脚1本を `samples` 回、`interval_ms` 間隔で特徴抽出まで通した観測列
///
/// `period_ms` で1周期、`start` は開始時の周期位置。
pub fn gait_observations(samples: usize, interval_ms: i64, period_ms: i64, start: f32) -> Vec<HmmObservation> {
    let mut extractor = FeatureExtractor::new(&FeatureConfig::default(), VerticalAxis::YDown, Foot::Left);
    (0..samples)
        .map(|i| {
            let t = i as i64 * interval_ms;
            let progress = start + t as f32 / period_ms as f32;
            let leg = Leg::at(0.2 + STRIDE * progress, progress);
            extractor.extract(&leg.keypoints(Foot::Left, 0.9, t), t)
        })
        .collect()
}

/// +x 方向へ歩く全身姿勢。`FRAMES_PER_CYCLE` フレームで1周期、右脚は半周期ずれる。
pub fn walking_pose(frame: i64) -> Pose {
    let t = frame * FRAME_MS;
    let progress = frame as f32 / FRAMES_PER_CYCLE as f32;
    let hip_x = 0.2 + STRIDE * progress;
    let mut keypoints = Vec::new();
    for (foot, offset) in [(Foot::Left, 0.0f32), (Foot::Right, 0.5)] {
        let leg = Leg::at(hip_x, progress + offset);
        let scores = [0.9, 0.9, 0.85, 0.8];
        for (k, score) in leg.keypoints(foot, 1.0, t).into_iter().zip(scores) {
            keypoints.push(Keypoint { score, ..k });
        }
    }
    keypoints.push(Keypoint::new(JointName::Nose, hip_x, 0.1, 0.9, t));
    Pose {
        keypoints,
        score: 0.85,
        timestamp: t,
    }
}
