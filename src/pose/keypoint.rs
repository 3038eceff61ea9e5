use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::geometry::Point3D;

/// 追跡対象人物のID
pub type PersonId = u32;

/// COCO/MoveNet の 17 関節
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(usize)]
pub enum JointName {
    Nose = 0,
    LeftEye = 1,
    RightEye = 2,
    LeftEar = 3,
    RightEar = 4,
    LeftShoulder = 5,
    RightShoulder = 6,
    LeftElbow = 7,
    RightElbow = 8,
    LeftWrist = 9,
    RightWrist = 10,
    LeftHip = 11,
    RightHip = 12,
    LeftKnee = 13,
    RightKnee = 14,
    LeftAnkle = 15,
    RightAnkle = 16,
}

impl JointName {
    pub const COUNT: usize = 17;

    pub const ALL: [JointName; JointName::COUNT] = [
        JointName::Nose,
        JointName::LeftEye,
        JointName::RightEye,
        JointName::LeftEar,
        JointName::RightEar,
        JointName::LeftShoulder,
        JointName::RightShoulder,
        JointName::LeftElbow,
        JointName::RightElbow,
        JointName::LeftWrist,
        JointName::RightWrist,
        JointName::LeftHip,
        JointName::RightHip,
        JointName::LeftKnee,
        JointName::RightKnee,
        JointName::LeftAnkle,
        JointName::RightAnkle,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nose => "nose",
            Self::LeftEye => "left_eye",
            Self::RightEye => "right_eye",
            Self::LeftEar => "left_ear",
            Self::RightEar => "right_ear",
            Self::LeftShoulder => "left_shoulder",
            Self::RightShoulder => "right_shoulder",
            Self::LeftElbow => "left_elbow",
            Self::RightElbow => "right_elbow",
            Self::LeftWrist => "left_wrist",
            Self::RightWrist => "right_wrist",
            Self::LeftHip => "left_hip",
            Self::RightHip => "right_hip",
            Self::LeftKnee => "left_knee",
            Self::RightKnee => "right_knee",
            Self::LeftAnkle => "left_ankle",
            Self::RightAnkle => "right_ankle",
        }
    }
}

impl fmt::Display for JointName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JointName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|j| j.as_str() == s)
            .ok_or_else(|| format!("unknown joint name: {}", s))
    }
}

/// 単一キーポイント（外部の姿勢推定モデルが1フレームごとに出力）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub name: JointName,
    pub x: f32,
    pub y: f32,
    /// 3Dモデルの場合のみ
    #[serde(default)]
    pub z: Option<f32>,
    /// 信頼度スコア (0.0〜1.0)
    pub score: f32,
    /// ミリ秒
    pub timestamp: i64,
}

impl Keypoint {
    pub fn new(name: JointName, x: f32, y: f32, score: f32, timestamp: i64) -> Self {
        Self {
            name,
            x,
            y,
            z: None,
            score,
            timestamp,
        }
    }

    pub fn new_3d(name: JointName, x: f32, y: f32, z: f32, score: f32, timestamp: i64) -> Self {
        Self {
            name,
            x,
            y,
            z: Some(z),
            score,
            timestamp,
        }
    }

    /// 座標がすべて有限か
    pub fn has_finite_position(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.map_or(true, f32::is_finite)
    }

    /// 有限な座標を持ち、信頼度が閾値以上か
    pub fn is_valid(&self, threshold: f32) -> bool {
        self.has_finite_position() && self.score.is_finite() && self.score >= threshold
    }

    /// zが無い場合は0として扱う
    pub fn position(&self) -> Point3D {
        Point3D::new(self.x, self.y, self.z.unwrap_or(0.0))
    }
}

/// 1フレーム分の姿勢
///
/// キーポイントの欠落や重複は許容する。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub keypoints: Vec<Keypoint>,
    pub score: f32,
    pub timestamp: i64,
}

impl Pose {
    pub fn new(keypoints: Vec<Keypoint>, score: f32, timestamp: i64) -> Self {
        Self {
            keypoints,
            score,
            timestamp,
        }
    }

    /// 名前で最初のキーポイントを取得
    pub fn get(&self, name: JointName) -> Option<&Keypoint> {
        self.keypoints.iter().find(|k| k.name == name)
    }

    /// 閾値以上の場合のみ取得
    pub fn get_valid(&self, name: JointName, threshold: f32) -> Option<&Keypoint> {
        self.get(name).filter(|k| k.is_valid(threshold))
    }

    /// 全キーポイントの平均信頼度（非有限スコアは0扱い）
    pub fn average_confidence(&self) -> f32 {
        if self.keypoints.is_empty() {
            return 0.0;
        }
        let sum: f32 = self
            .keypoints
            .iter()
            .map(|k| if k.score.is_finite() { k.score.clamp(0.0, 1.0) } else { 0.0 })
            .sum();
        sum / self.keypoints.len() as f32
    }
}
