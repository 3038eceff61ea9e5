use std::collections::{HashMap, VecDeque};

use crate::geometry::Point3D;
use crate::pose::{JointName, PersonId};

use super::lowpass::{Cascade, LowPass};

/// 履歴に積む1サンプル（採用した生位置、または予測位置）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistorySample {
    pub position: Point3D,
    pub confidence: f32,
    pub timestamp: i64,
}

/// 関節ごとのフィルタ内部状態。アルゴリズムが必要とする分だけ持つ。
#[derive(Debug, Clone, Copy)]
pub enum FilterState {
    /// 指数平滑・簡易カルマン: 直前の出力
    Recursive(LowPass),
    /// Butterworth 近似
    Cascade(Cascade),
    /// 移動平均・Savitzky–Golay: 履歴のみを使う
    Windowed,
}

impl FilterState {
    /// 再帰フィルタを1ステップ進める。窓型は値をそのまま返す。
    pub fn update(&mut self, value: Point3D, alpha: f32) -> Point3D {
        match self {
            FilterState::Recursive(f) => f.filter(value, alpha),
            FilterState::Cascade(c) => c.filter(value, alpha),
            FilterState::Windowed => value,
        }
    }

    /// 予測値で置き換えたときに再帰フィルタを追従させる
    pub fn seed(&mut self, value: Point3D) {
        match self {
            FilterState::Recursive(f) => f.seed(value),
            FilterState::Cascade(c) => c.seed(value),
            FilterState::Windowed => {}
        }
    }
}

/// タイムスタンプ差を秒で返す。縮退（0以下）なら `nominal_dt`。
pub fn elapsed_secs(from: i64, to: i64, nominal_dt: f32) -> f32 {
    let dt = to.saturating_sub(from) as f32 / 1000.0;
    if dt > 0.0 && dt.is_finite() {
        dt
    } else {
        nominal_dt
    }
}

/// 1関節分の固定容量リングバッファ
///
/// 速度はサンプルが2つ以上、加速度は3つ以上あるときに導出する。
#[derive(Debug, Clone)]
pub struct JointHistory {
    capacity: usize,
    samples: VecDeque<HistorySample>,
    velocities: VecDeque<Point3D>,
    accelerations: VecDeque<Point3D>,
    pub filter: FilterState,
    /// 連続して外れ値と判定された回数
    pub(crate) rejection_streak: u32,
}

impl JointHistory {
    pub fn new(capacity: usize, filter: FilterState) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity + 1),
            velocities: VecDeque::with_capacity(capacity + 1),
            accelerations: VecDeque::with_capacity(capacity + 1),
            filter,
            rejection_streak: 0,
        }
    }

    pub fn push(&mut self, sample: HistorySample, nominal_dt: f32) {
        if let Some(prev) = self.samples.back() {
            let dt = elapsed_secs(prev.timestamp, sample.timestamp, nominal_dt);
            let velocity = (sample.position - prev.position) * (1.0 / dt);
            if let Some(&prev_velocity) = self.velocities.back() {
                self.accelerations.push_back((velocity - prev_velocity) * (1.0 / dt));
            }
            self.velocities.push_back(velocity);
        }
        self.samples.push_back(sample);

        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
        while self.velocities.len() > self.capacity {
            self.velocities.pop_front();
        }
        while self.accelerations.len() > self.capacity {
            self.accelerations.pop_front();
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &VecDeque<HistorySample> {
        &self.samples
    }

    pub fn last(&self) -> Option<&HistorySample> {
        self.samples.back()
    }

    pub fn last_velocity(&self) -> Option<Point3D> {
        self.velocities.back().copied()
    }

    pub fn last_acceleration(&self) -> Option<Point3D> {
        self.accelerations.back().copied()
    }

    pub fn velocities(&self) -> &VecDeque<Point3D> {
        &self.velocities
    }

    pub fn accelerations(&self) -> &VecDeque<Point3D> {
        &self.accelerations
    }

    /// 直近 `n` 個の位置（古い順）
    pub fn recent_positions(&self, n: usize) -> impl Iterator<Item = Point3D> + '_ {
        let skip = self.samples.len().saturating_sub(n);
        self.samples.iter().skip(skip).map(|s| s.position)
    }
}

/// `(PersonId, JointName)` をキーにした履歴の集合
///
/// 人物・関節ごとに完全に独立している。
#[derive(Debug, Default)]
pub struct HistoryArena {
    capacity: usize,
    joints: HashMap<(PersonId, JointName), JointHistory>,
}

impl HistoryArena {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            joints: HashMap::new(),
        }
    }

    /// 無ければ `init` のフィルタ状態で作成
    pub fn entry(
        &mut self,
        person: PersonId,
        joint: JointName,
        init: impl FnOnce() -> FilterState,
    ) -> &mut JointHistory {
        let capacity = self.capacity;
        self.joints
            .entry((person, joint))
            .or_insert_with(|| JointHistory::new(capacity, init()))
    }

    pub fn get(&self, person: PersonId, joint: JointName) -> Option<&JointHistory> {
        self.joints.get(&(person, joint))
    }

    /// 人物の全関節履歴を削除し、削除数を返す
    pub fn remove_person(&mut self, person: PersonId) -> usize {
        let before = self.joints.len();
        self.joints.retain(|(p, _), _| *p != person);
        before - self.joints.len()
    }

    pub fn len(&self) -> usize {
        self.joints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(x: f32, timestamp: i64) -> HistorySample {
        HistorySample {
            position: Point3D::new(x, 0.0, 0.0),
            confidence: 1.0,
            timestamp,
        }
    }

    #[test]
    fn test_derivatives_need_samples() {
        let mut h = JointHistory::new(30, FilterState::Windowed);
        h.push(sample(0.0, 0), 1.0 / 30.0);
        assert!(h.last_velocity().is_none());
        h.push(sample(0.1, 100), 1.0 / 30.0);
        let v = h.last_velocity().unwrap();
        assert!((v.x - 1.0).abs() < 1e-5);
        assert!(h.last_acceleration().is_none());
        h.push(sample(0.3, 200), 1.0 / 30.0);
        let a = h.last_acceleration().unwrap();
        assert!((a.x - 10.0).abs() < 1e-3);
    }

    #[test]
    fn test_degenerate_timestamp_uses_nominal() {
        let mut h = JointHistory::new(30, FilterState::Windowed);
        h.push(sample(0.0, 500), 0.1);
        h.push(sample(0.1, 500), 0.1);
        let v = h.last_velocity().unwrap();
        assert!((v.x - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_extreme_timestamps_do_not_overflow() {
        assert!(elapsed_secs(i64::MIN, i64::MAX, 0.1) > 0.0);
        assert_eq!(elapsed_secs(i64::MAX, i64::MIN, 0.1), 0.1);

        let mut h = JointHistory::new(30, FilterState::Windowed);
        h.push(sample(0.0, i64::MIN), 0.1);
        h.push(sample(0.1, i64::MAX), 0.1);
        assert!(h.last_velocity().unwrap().is_finite());
    }

    #[test]
    fn test_capacity_bound() {
        let mut h = JointHistory::new(5, FilterState::Windowed);
        for i in 0..20 {
            h.push(sample(i as f32, i * 33), 1.0 / 30.0);
            assert!(h.len() <= 5);
            assert!(h.velocities().len() <= 5);
            assert!(h.accelerations().len() <= 5);
        }
        assert_eq!(h.samples().front().unwrap().timestamp, 15 * 33);
        let recent: Vec<f32> = h.recent_positions(2).map(|p| p.x).collect();
        assert_eq!(recent, vec![18.0, 19.0]);
    }

    #[test]
    fn test_arena_isolation() {
        let mut arena = HistoryArena::new(10);
        arena
            .entry(1, JointName::LeftAnkle, || FilterState::Windowed)
            .push(sample(1.0, 0), 1.0 / 30.0);
        arena
            .entry(2, JointName::LeftAnkle, || FilterState::Windowed)
            .push(sample(2.0, 0), 1.0 / 30.0);
        arena.entry(1, JointName::RightAnkle, || FilterState::Windowed);
        assert_eq!(arena.len(), 3);
        assert_eq!(arena.get(2, JointName::LeftAnkle).unwrap().last().unwrap().position.x, 2.0);

        assert_eq!(arena.remove_person(1), 2);
        assert_eq!(arena.len(), 1);
        assert!(arena.get(1, JointName::LeftAnkle).is_none());
    }
}
