use crate::geometry::Point3D;

use super::history::{elapsed_secs, JointHistory};

/// 外挿する時間の上限（秒）。長い遮蔽で位置が流れないようにする。
const MAX_HORIZON_SECS: f32 = 0.25;

/// 関節履歴の最後の速度で線形外挿する
#[derive(Debug, Clone, Copy)]
pub struct Extrapolator {
    nominal_dt: f32,
}

impl Extrapolator {
    pub fn new(nominal_fps: f32) -> Self {
        Self {
            nominal_dt: 1.0 / nominal_fps,
        }
    }

    pub fn nominal_dt(&self) -> f32 {
        self.nominal_dt
    }

    /// `timestamp` 時点の予測位置。速度履歴が無ければNone。
    pub fn predict(&self, history: &JointHistory, timestamp: i64) -> Option<Point3D> {
        let last = history.last()?;
        let velocity = history.last_velocity()?;
        let dt = elapsed_secs(last.timestamp, timestamp, self.nominal_dt).min(MAX_HORIZON_SECS);
        let predicted = last.position + velocity * dt;
        predicted.is_finite().then_some(predicted)
    }
}
