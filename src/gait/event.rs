use serde::{Deserialize, Serialize};

use crate::geometry::Point3D;
use crate::pose::JointName;

use super::phase::GaitPhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Foot {
    Left,
    Right,
}

impl Foot {
    pub const BOTH: [Foot; 2] = [Foot::Left, Foot::Right];

    pub fn opposite(self) -> Foot {
        match self {
            Foot::Left => Foot::Right,
            Foot::Right => Foot::Left,
        }
    }

    pub fn ankle(self) -> JointName {
        match self {
            Foot::Left => JointName::LeftAnkle,
            Foot::Right => JointName::RightAnkle,
        }
    }

    pub fn knee(self) -> JointName {
        match self {
            Foot::Left => JointName::LeftKnee,
            Foot::Right => JointName::RightKnee,
        }
    }

    pub fn hip(self) -> JointName {
        match self {
            Foot::Left => JointName::LeftHip,
            Foot::Right => JointName::RightHip,
        }
    }

    pub fn shoulder(self) -> JointName {
        match self {
            Foot::Left => JointName::LeftShoulder,
            Foot::Right => JointName::RightShoulder,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GaitEventType {
    HeelStrike,
    ToeOff,
    MidStance,
    MidSwing,
}

impl GaitEventType {
    /// フェーズへの進入で発生するイベント
    pub fn on_entry(phase: GaitPhase, include_midphase: bool) -> Option<Self> {
        match phase {
            GaitPhase::HeelStrike => Some(Self::HeelStrike),
            GaitPhase::PreSwing => Some(Self::ToeOff),
            GaitPhase::Midstance if include_midphase => Some(Self::MidStance),
            GaitPhase::Midswing if include_midphase => Some(Self::MidSwing),
            _ => None,
        }
    }
}

/// フェーズ遷移で発行される離散イベント（保持はしない）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GaitEvent {
    #[serde(rename = "type")]
    pub event_type: GaitEventType,
    pub foot: Foot,
    pub timestamp: i64,
    /// 新フェーズの事後確率
    pub confidence: f64,
    pub position: Point3D,
}
