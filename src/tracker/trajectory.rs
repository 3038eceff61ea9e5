use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::config::{Separation, TrajectoryConfig};
use crate::error::GaitError;
use crate::gait::event::Foot;
use crate::geometry::{center_of_mass, distance_3d, Point3D, CENTER_OF_MASS_WEIGHTS};
use crate::pose::{Keypoint, PersonId};

/// 進行方向の推定に必要な重心移動量
const MIN_PROGRESSION: f32 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    pub position: Point3D,
    pub timestamp: i64,
    pub confidence: f32,
}

/// 軌跡を持つ部位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Limb {
    LeftFoot,
    RightFoot,
    CenterOfMass,
}

impl From<Foot> for Limb {
    fn from(foot: Foot) -> Self {
        match foot {
            Foot::Left => Limb::LeftFoot,
            Foot::Right => Limb::RightFoot,
        }
    }
}

/// 1人分の軌跡。各部位とも `max_length` を超えたら古い順に捨てる。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaitTrajectory {
    pub left_foot: VecDeque<TrajectoryPoint>,
    pub right_foot: VecDeque<TrajectoryPoint>,
    pub center_of_mass: VecDeque<TrajectoryPoint>,
    pub max_length: usize,
}

impl GaitTrajectory {
    pub fn new(max_length: usize) -> Self {
        Self {
            left_foot: VecDeque::with_capacity(max_length + 1),
            right_foot: VecDeque::with_capacity(max_length + 1),
            center_of_mass: VecDeque::with_capacity(max_length + 1),
            max_length,
        }
    }

    pub fn points(&self, limb: Limb) -> &VecDeque<TrajectoryPoint> {
        match limb {
            Limb::LeftFoot => &self.left_foot,
            Limb::RightFoot => &self.right_foot,
            Limb::CenterOfMass => &self.center_of_mass,
        }
    }

    fn points_mut(&mut self, limb: Limb) -> &mut VecDeque<TrajectoryPoint> {
        match limb {
            Limb::LeftFoot => &mut self.left_foot,
            Limb::RightFoot => &mut self.right_foot,
            Limb::CenterOfMass => &mut self.center_of_mass,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.left_foot.is_empty() && self.right_foot.is_empty() && self.center_of_mass.is_empty()
    }

    /// 直前の点とEMAで混ぜてから追加し、長さを切り詰める
    fn push(&mut self, limb: Limb, point: TrajectoryPoint, blend: f32) {
        let max_length = self.max_length;
        let points = self.points_mut(limb);
        let position = match points.back() {
            Some(prev) => prev.position.lerp(point.position, blend),
            None => point.position,
        };
        points.push_back(TrajectoryPoint { position, ..point });
        while points.len() > max_length {
            points.pop_front();
        }
    }
}

struct PersonTrack {
    trajectory: GaitTrajectory,
    last_seen: i64,
}

/// 人物ごとの足首・重心軌跡と空間パラメータ
///
/// 未知の人物への問い合わせは空・0を返す。
pub struct TrajectoryTracker {
    config: TrajectoryConfig,
    persons: HashMap<PersonId, PersonTrack>,
}

impl TrajectoryTracker {
    pub fn new(config: &TrajectoryConfig) -> Result<Self, GaitError> {
        config.validate()?;
        Ok(Self {
            config: config.clone(),
            persons: HashMap::new(),
        })
    }

    pub fn config(&self) -> &TrajectoryConfig {
        &self.config
    }

    /// 平滑化済みキーポイント1フレーム分で更新
    pub fn update(&mut self, person: PersonId, keypoints: &[Keypoint]) {
        let timestamp = keypoints.iter().map(|k| k.timestamp).max();
        let config = &self.config;
        let track = self.persons.entry(person).or_insert_with(|| {
            log::info!("trajectory: new person {}", person);
            PersonTrack {
                trajectory: GaitTrajectory::new(config.max_length),
                last_seen: timestamp.unwrap_or(0),
            }
        });
        let Some(timestamp) = timestamp else {
            return;
        };
        track.last_seen = track.last_seen.max(timestamp);

        for foot in Foot::BOTH {
            let ankle = keypoints
                .iter()
                .find(|k| k.name == foot.ankle())
                .filter(|k| k.has_finite_position() && k.score.is_finite() && k.score > config.ankle_confidence);
            if let Some(ankle) = ankle {
                track.trajectory.push(
                    foot.into(),
                    TrajectoryPoint {
                        position: ankle.position(),
                        timestamp: ankle.timestamp,
                        confidence: ankle.score.min(1.0),
                    },
                    config.blend_factor,
                );
            }
        }

        if let Some(com) = center_of_mass(keypoints, &CENTER_OF_MASS_WEIGHTS, config.com_confidence) {
            track.trajectory.push(
                Limb::CenterOfMass,
                TrajectoryPoint {
                    position: com.position,
                    timestamp,
                    confidence: com.confidence,
                },
                config.blend_factor,
            );
        }
    }

    pub fn contains(&self, person: PersonId) -> bool {
        self.persons.contains_key(&person)
    }

    /// 追跡中の人物（昇順）
    pub fn persons(&self) -> Vec<PersonId> {
        let mut ids: Vec<PersonId> = self.persons.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// 軌跡のコピー。未知の人物はNone。
    pub fn trajectory(&self, person: PersonId) -> Option<GaitTrajectory> {
        self.persons.get(&person).map(|t| t.trajectory.clone())
    }

    pub fn points(&self, person: PersonId, limb: Limb) -> Vec<TrajectoryPoint> {
        self.persons
            .get(&person)
            .map(|t| t.trajectory.points(limb).iter().copied().collect())
            .unwrap_or_default()
    }

    /// 直近2点の差分から速度（単位/秒）
    pub fn velocity(&self, person: PersonId, limb: Limb) -> Option<Point3D> {
        let points = self.persons.get(&person)?.trajectory.points(limb);
        let n = points.len();
        if n < 2 {
            return None;
        }
        let (a, b) = (points[n - 2], points[n - 1]);
        let dt = b.timestamp.saturating_sub(a.timestamp) as f32 / 1000.0;
        if dt <= 0.0 {
            return None;
        }
        Some((b.position - a.position) * (1.0 / dt))
    }

    pub fn heel_strikes(&self, person: PersonId, foot: Foot) -> Vec<TrajectoryPoint> {
        match self.persons.get(&person) {
            Some(track) => detect_heel_strikes(track.trajectory.points(foot.into()), &self.config),
            None => Vec::new(),
        }
    }

    /// 同じ足の連続する踵接地間距離の平均。2回未満なら0。
    pub fn stride_length(&self, person: PersonId, foot: Foot) -> f32 {
        let strikes = self.heel_strikes(person, foot);
        mean(strikes.windows(2).map(|w| distance_3d(w[0].position, w[1].position)))
    }

    /// 左右交互の踵接地間距離（進行方向成分）の平均
    pub fn step_length(&self, person: PersonId) -> f32 {
        let direction = self.progression_direction(person);
        mean(self.alternating_steps(person).map(|step| match direction {
            Some(d) => (step.x * d.x + step.z * d.z).abs(),
            None => step.norm(),
        }))
    }

    /// 左右交互の踵接地の、進行方向に垂直な（x–z平面の）距離の平均
    pub fn step_width(&self, person: PersonId) -> f32 {
        let Some(d) = self.progression_direction(person) else {
            return 0.0;
        };
        mean(self.alternating_steps(person).map(|step| (step.x * d.z - step.z * d.x).abs()))
    }

    pub fn clear(&mut self, person: PersonId) -> bool {
        let removed = self.persons.remove(&person).is_some();
        if removed {
            log::info!("trajectory: cleared person {}", person);
        }
        removed
    }

    /// `now - timeout_ms` より前から観測の無い人物を削除し、そのIDを返す
    pub fn prune_lost(&mut self, now: i64, timeout_ms: i64) -> Vec<PersonId> {
        let mut lost: Vec<PersonId> = self
            .persons
            .iter()
            .filter(|(_, t)| now.saturating_sub(t.last_seen) > timeout_ms)
            .map(|(&id, _)| id)
            .collect();
        lost.sort_unstable();
        for id in &lost {
            self.persons.remove(id);
            log::info!("trajectory: person {} lost", id);
        }
        lost
    }

    /// 時刻順に並べた左右の踵接地のうち、足が入れ替わる隣接ペアの変位
    fn alternating_steps(&self, person: PersonId) -> impl Iterator<Item = Point3D> {
        let mut strikes: Vec<(Foot, TrajectoryPoint)> = Foot::BOTH
            .iter()
            .flat_map(|&foot| self.heel_strikes(person, foot).into_iter().map(move |p| (foot, p)))
            .collect();
        strikes.sort_by_key(|(_, p)| p.timestamp);
        let steps: Vec<Point3D> = strikes
            .windows(2)
            .filter(|w| w[0].0 != w[1].0)
            .map(|w| w[1].1.position - w[0].1.position)
            .collect();
        steps.into_iter()
    }

    /// 重心軌跡の始点→終点から求めた x–z 平面の進行方向（単位ベクトル）
    pub fn progression_direction(&self, person: PersonId) -> Option<Point3D> {
        let com = self.persons.get(&person)?.trajectory.points(Limb::CenterOfMass);
        let (first, last) = (com.front()?, com.back()?);
        let dx = last.position.x - first.position.x;
        let dz = last.position.z - first.position.z;
        let len = (dx * dx + dz * dz).sqrt();
        (len > MIN_PROGRESSION).then(|| Point3D::new(dx / len, 0.0, dz / len))
    }
}

/// 鉛直方向の極小を踵接地とみなす
///
/// `span` 前後の点より `prominence` を超えて低く、その間で最小の点が候補。
/// 直前に採用した接地から `separation` 以上離れていなければ捨てる。
fn detect_heel_strikes(points: &VecDeque<TrajectoryPoint>, config: &TrajectoryConfig) -> Vec<TrajectoryPoint> {
    let span = config.heel_strike_span;
    let prominence = config.heel_strike_prominence;
    if span == 0 || points.len() < 2 * span + 1 {
        return Vec::new();
    }
    let height = |i: usize| config.vertical_axis.height(points[i].position.y);

    let mut accepted: Vec<(usize, TrajectoryPoint)> = Vec::new();
    for i in span..points.len() - span {
        let h = height(i);
        if !(h < height(i - span) - prominence && h < height(i + span) - prominence) {
            continue;
        }
        if (i - span..=i + span).any(|j| height(j) < h) {
            continue;
        }
        if let Some(&(prev_index, prev)) = accepted.last() {
            let separated = match config.heel_strike_separation {
                Separation::Frames(n) => i - prev_index >= n,
                Separation::Millis(ms) => points[i].timestamp.saturating_sub(prev.timestamp) >= ms,
            };
            if !separated {
                continue;
            }
        }
        accepted.push((i, points[i]));
    }
    accepted.into_iter().map(|(_, p)| p).collect()
}

fn mean(values: impl Iterator<Item = f32>) -> f32 {
    let (sum, count) = values.fold((0.0f32, 0usize), |(s, n), v| (s + v, n + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f32
    }
}
