//! Stateless geometry helpers shared by the smoother, the trajectory tracker
//! and the feature extractor.
//!
//! All functions are total: insufficient or non-finite input yields a neutral
//! result (`0.0` or `None`) instead of an error.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::ops::{Add, Mul, Sub};

use crate::pose::{JointName, Keypoint};

/// 3D位置（2D入力ではz=0）
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point3D {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Point3D {
    pub const ZERO: Point3D = Point3D { x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn to_vector(self) -> Vector3<f32> {
        Vector3::new(self.x, self.y, self.z)
    }

    pub fn norm(self) -> f32 {
        self.to_vector().norm()
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// `self * (1 - t) + other * t`
    pub fn lerp(self, other: Point3D, t: f32) -> Point3D {
        self * (1.0 - t) + other * t
    }
}

impl Add for Point3D {
    type Output = Point3D;

    fn add(self, rhs: Point3D) -> Point3D {
        Point3D::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Point3D {
    type Output = Point3D;

    fn sub(self, rhs: Point3D) -> Point3D {
        Point3D::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f32> for Point3D {
    type Output = Point3D;

    fn mul(self, rhs: f32) -> Point3D {
        Point3D::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

/// 信頼度付きの合成点
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightedPoint {
    pub position: Point3D,
    pub confidence: f32,
}

/// 正規化座標のバウンディングボックス
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f32,
    pub min_y: f32,
    pub max_x: f32,
    pub max_y: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f32 {
        self.max_y - self.min_y
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.min_x + self.max_x) / 2.0, (self.min_y + self.max_y) / 2.0)
    }
}

/// 体節長の推定値。欠けた体節は0。
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BodyProportions {
    pub shoulder_width: f32,
    pub hip_width: f32,
    pub torso_length: f32,
    pub left_upper_arm: f32,
    pub right_upper_arm: f32,
    pub left_forearm: f32,
    pub right_forearm: f32,
    pub left_thigh: f32,
    pub right_thigh: f32,
    pub left_shank: f32,
    pub right_shank: f32,
    /// 太もも+すねの左右平均（片側のみなら片側の値）
    pub leg_length: f32,
    /// 寄与した関節の平均信頼度
    pub confidence: f32,
}

/// 重心計算の重み: 肩0.2, 腰0.3, 膝0.1
pub const CENTER_OF_MASS_WEIGHTS: [(JointName, f32); 6] = [
    (JointName::LeftShoulder, 0.2),
    (JointName::RightShoulder, 0.2),
    (JointName::LeftHip, 0.3),
    (JointName::RightHip, 0.3),
    (JointName::LeftKnee, 0.1),
    (JointName::RightKnee, 0.1),
];

pub fn distance_2d(a: Point3D, b: Point3D) -> f32 {
    let dx = a.x - b.x;
    let dy = a.y - b.y;
    (dx * dx + dy * dy).sqrt()
}

pub fn distance_3d(a: Point3D, b: Point3D) -> f32 {
    (a - b).norm()
}

pub fn manhattan_distance_2d(a: Point3D, b: Point3D) -> f32 {
    (a.x - b.x).abs() + (a.y - b.y).abs()
}

pub fn manhattan_distance_3d(a: Point3D, b: Point3D) -> f32 {
    (a.x - b.x).abs() + (a.y - b.y).abs() + (a.z - b.z).abs()
}

/// `vertex` における a-vertex-c の角度（度）
///
/// cos(θ) = (v1 · v2) / (|v1| × |v2|)。浮動小数誤差で acos が定義域外にならないよう
/// [-1, 1] にクランプする。長さ0の線分や非有限入力では0を返す。
pub fn angle_between(a: Point3D, vertex: Point3D, c: Point3D) -> f32 {
    let v1 = (a - vertex).to_vector();
    let v2 = (c - vertex).to_vector();

    let mag1 = v1.norm();
    let mag2 = v2.norm();
    if !(mag1.is_finite() && mag2.is_finite()) || mag1 < 1e-6 || mag2 < 1e-6 {
        return 0.0;
    }

    let cos_angle = (v1.dot(&v2) / (mag1 * mag2)).clamp(-1.0, 1.0);
    cos_angle.acos().to_degrees()
}

fn find(keypoints: &[Keypoint], name: JointName, threshold: f32) -> Option<&Keypoint> {
    keypoints
        .iter()
        .find(|k| k.name == name)
        .filter(|k| k.is_valid(threshold))
}

/// 閾値以上のキーポイントの min/max に padding を加えたボックス
///
/// 有効なキーポイントが2個未満ならNone。
pub fn bounding_box(keypoints: &[Keypoint], threshold: f32, padding: f32) -> Option<BoundingBox> {
    let mut min_x = f32::MAX;
    let mut min_y = f32::MAX;
    let mut max_x = f32::MIN;
    let mut max_y = f32::MIN;
    let mut count = 0u32;

    for kp in keypoints.iter().filter(|k| k.is_valid(threshold)) {
        min_x = min_x.min(kp.x);
        min_y = min_y.min(kp.y);
        max_x = max_x.max(kp.x);
        max_y = max_y.max(kp.y);
        count += 1;
    }

    if count < 2 {
        return None;
    }

    let padding = if padding.is_finite() { padding.max(0.0) } else { 0.0 };
    Some(BoundingBox {
        min_x: min_x - padding,
        min_y: min_y - padding,
        max_x: max_x + padding,
        max_y: max_y + padding,
    })
}

/// 重み付き重心
///
/// `floor` を超える信頼度の関節のみ使い、重みは存在する関節で再正規化する。
/// 結果の信頼度は寄与した関節の平均信頼度。該当関節が無ければNone。
pub fn center_of_mass(
    keypoints: &[Keypoint],
    weights: &[(JointName, f32)],
    floor: f32,
) -> Option<WeightedPoint> {
    let mut sum = Point3D::ZERO;
    let mut weight_sum = 0.0f32;
    let mut confidence_sum = 0.0f32;
    let mut count = 0u32;

    for &(name, weight) in weights {
        let Some(kp) = find(keypoints, name, 0.0) else {
            continue;
        };
        if kp.score <= floor || !(weight.is_finite() && weight > 0.0) {
            continue;
        }
        sum = sum + kp.position() * weight;
        weight_sum += weight;
        confidence_sum += kp.score.min(1.0);
        count += 1;
    }

    if count == 0 || weight_sum <= 0.0 {
        return None;
    }

    Some(WeightedPoint {
        position: sum * (1.0 / weight_sum),
        confidence: confidence_sum / count as f32,
    })
}

/// 体節長と信頼度を推定
pub fn body_proportions(keypoints: &[Keypoint], threshold: f32) -> BodyProportions {
    use JointName::*;

    let mut contributing: Vec<JointName> = Vec::with_capacity(JointName::COUNT);
    let mut segment = |a: JointName, b: JointName| -> f32 {
        match (find(keypoints, a, threshold), find(keypoints, b, threshold)) {
            (Some(ka), Some(kb)) => {
                for name in [a, b] {
                    if !contributing.contains(&name) {
                        contributing.push(name);
                    }
                }
                distance_3d(ka.position(), kb.position())
            }
            _ => 0.0,
        }
    };

    let shoulder_width = segment(LeftShoulder, RightShoulder);
    let hip_width = segment(LeftHip, RightHip);
    let left_upper_arm = segment(LeftShoulder, LeftElbow);
    let right_upper_arm = segment(RightShoulder, RightElbow);
    let left_forearm = segment(LeftElbow, LeftWrist);
    let right_forearm = segment(RightElbow, RightWrist);
    let left_thigh = segment(LeftHip, LeftKnee);
    let right_thigh = segment(RightHip, RightKnee);
    let left_shank = segment(LeftKnee, LeftAnkle);
    let right_shank = segment(RightKnee, RightAnkle);

    let torso_length = match (
        midpoint(keypoints, LeftShoulder, RightShoulder, threshold),
        midpoint(keypoints, LeftHip, RightHip, threshold),
    ) {
        (Some(s), Some(h)) => distance_3d(s, h),
        _ => 0.0,
    };

    let left_leg = if left_thigh > 0.0 && left_shank > 0.0 { left_thigh + left_shank } else { 0.0 };
    let right_leg = if right_thigh > 0.0 && right_shank > 0.0 { right_thigh + right_shank } else { 0.0 };
    let leg_length = match (left_leg > 0.0, right_leg > 0.0) {
        (true, true) => (left_leg + right_leg) / 2.0,
        (true, false) => left_leg,
        (false, true) => right_leg,
        (false, false) => 0.0,
    };

    let confidence = if contributing.is_empty() {
        0.0
    } else {
        let sum: f32 = contributing
            .iter()
            .filter_map(|&n| find(keypoints, n, threshold))
            .map(|k| k.score.min(1.0))
            .sum();
        sum / contributing.len() as f32
    };

    BodyProportions {
        shoulder_width,
        hip_width,
        torso_length,
        left_upper_arm,
        right_upper_arm,
        left_forearm,
        right_forearm,
        left_thigh,
        right_thigh,
        left_shank,
        right_shank,
        leg_length,
        confidence,
    }
}

/// 左右の関節が両方有効なときの中点
pub fn midpoint(keypoints: &[Keypoint], a: JointName, b: JointName, threshold: f32) -> Option<Point3D> {
    let ka = find(keypoints, a, threshold)?;
    let kb = find(keypoints, b, threshold)?;
    Some(ka.position().lerp(kb.position(), 0.5))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f32, b: f32, eps: f32) -> bool {
        (a - b).abs() < eps
    }

    fn kp(name: JointName, x: f32, y: f32, score: f32) -> Keypoint {
        Keypoint::new(name, x, y, score, 0)
    }

    #[test]
    fn test_point_arithmetic() {
        let a = Point3D::new(1.0, -2.0, 0.5);
        let b = Point3D::new(0.25, 4.0, -1.5);
        assert_eq!(a + b, Point3D::new(1.25, 2.0, -1.0));
        assert_eq!(a - b, Point3D::new(0.75, -6.0, 2.0));
        assert_eq!(a * 2.0, Point3D::new(2.0, -4.0, 1.0));
        assert_eq!(a.lerp(b, 0.0), a);
        assert_eq!(a.to_vector(), Vector3::new(1.0, -2.0, 0.5));
        assert!(approx_eq(Point3D::new(3.0, 4.0, 0.0).norm(), 5.0, 1e-6));
    }

    #[test]
    fn test_distances() {
        let a = Point3D::new(0.0, 0.0, 0.0);
        let b = Point3D::new(3.0, 4.0, 12.0);
        assert!(approx_eq(distance_2d(a, b), 5.0, 1e-6));
        assert!(approx_eq(distance_3d(a, b), 13.0, 1e-5));
        assert!(approx_eq(manhattan_distance_2d(a, b), 7.0, 1e-6));
        assert!(approx_eq(manhattan_distance_3d(a, b), 19.0, 1e-6));
    }

    #[test]
    fn test_angle_straight_and_right() {
        let a = Point3D::new(0.0, 0.0, 0.0);
        let v = Point3D::new(0.5, 0.0, 0.0);
        assert!(approx_eq(angle_between(a, v, Point3D::new(1.0, 0.0, 0.0)), 180.0, 0.01));
        assert!(approx_eq(angle_between(a, v, Point3D::new(0.5, 0.5, 0.0)), 90.0, 0.01));
    }

    #[test]
    fn test_angle_collinear_clamped() {
        // 浮動小数誤差で |cos| > 1 になり得るケースでもNaNにならない
        let a = Point3D::new(0.1, 0.1, 0.1);
        let v = Point3D::new(0.2, 0.2, 0.2);
        let c = Point3D::new(0.3, 0.3, 0.3);
        let angle = angle_between(a, v, c);
        assert!(angle.is_finite());
        assert!(approx_eq(angle, 180.0, 0.1));
    }

    #[test]
    fn test_angle_degenerate() {
        let p = Point3D::new(1.0, 1.0, 0.0);
        assert_eq!(angle_between(p, p, Point3D::new(2.0, 2.0, 0.0)), 0.0);
        assert_eq!(angle_between(Point3D::new(f32::NAN, 0.0, 0.0), p, Point3D::ZERO), 0.0);
    }

    #[test]
    fn test_bounding_box() {
        let kps = vec![
            kp(JointName::Nose, 0.4, 0.2, 0.9),
            kp(JointName::LeftAnkle, 0.6, 0.9, 0.8),
            kp(JointName::RightAnkle, 0.9, 0.9, 0.1), // 低信頼度は除外
        ];
        let bbox = bounding_box(&kps, 0.3, 0.05).unwrap();
        assert!(approx_eq(bbox.min_x, 0.35, 1e-6));
        assert!(approx_eq(bbox.max_x, 0.65, 1e-6));
        assert!(approx_eq(bbox.width(), 0.3, 1e-6));
        assert!(approx_eq(bbox.height(), 0.8, 1e-6));
    }

    #[test]
    fn test_bounding_box_insufficient() {
        let kps = vec![kp(JointName::Nose, 0.4, 0.2, 0.9)];
        assert!(bounding_box(&kps, 0.3, 0.0).is_none());
        assert!(bounding_box(&[], 0.3, 0.0).is_none());
    }

    #[test]
    fn test_center_of_mass_renormalized() {
        // 腰のみ有効 → 重みは腰同士で再正規化される
        let kps = vec![
            kp(JointName::LeftHip, 0.4, 0.5, 0.9),
            kp(JointName::RightHip, 0.6, 0.5, 0.7),
            kp(JointName::LeftShoulder, 0.0, 0.0, 0.2),
        ];
        let com = center_of_mass(&kps, &CENTER_OF_MASS_WEIGHTS, 0.3).unwrap();
        assert!(approx_eq(com.position.x, 0.5, 1e-6));
        assert!(approx_eq(com.position.y, 0.5, 1e-6));
        assert!(approx_eq(com.confidence, 0.8, 1e-6));
    }

    #[test]
    fn test_center_of_mass_weights() {
        let kps = vec![
            kp(JointName::LeftShoulder, 0.5, 0.2, 0.9),
            kp(JointName::RightShoulder, 0.5, 0.2, 0.9),
            kp(JointName::LeftHip, 0.5, 0.5, 0.9),
            kp(JointName::RightHip, 0.5, 0.5, 0.9),
            kp(JointName::LeftKnee, 0.5, 0.7, 0.9),
            kp(JointName::RightKnee, 0.5, 0.7, 0.9),
        ];
        let com = center_of_mass(&kps, &CENTER_OF_MASS_WEIGHTS, 0.3).unwrap();
        // (0.4*0.2 + 0.6*0.5 + 0.2*0.7) / 1.2
        let expected = (0.4 * 0.2 + 0.6 * 0.5 + 0.2 * 0.7) / 1.2;
        assert!(approx_eq(com.position.y, expected, 1e-5));
    }

    #[test]
    fn test_center_of_mass_none() {
        let kps = vec![kp(JointName::LeftHip, 0.4, 0.5, 0.3)];
        assert!(center_of_mass(&kps, &CENTER_OF_MASS_WEIGHTS, 0.3).is_none());
    }

    #[test]
    fn test_body_proportions() {
        let kps = vec![
            kp(JointName::LeftShoulder, 0.4, 0.2, 0.9),
            kp(JointName::RightShoulder, 0.6, 0.2, 0.9),
            kp(JointName::LeftHip, 0.45, 0.5, 0.9),
            kp(JointName::RightHip, 0.55, 0.5, 0.9),
            kp(JointName::LeftKnee, 0.45, 0.7, 0.9),
            kp(JointName::LeftAnkle, 0.45, 0.9, 0.9),
        ];
        let p = body_proportions(&kps, 0.3);
        assert!(approx_eq(p.shoulder_width, 0.2, 1e-5));
        assert!(approx_eq(p.hip_width, 0.1, 1e-5));
        assert!(approx_eq(p.torso_length, 0.3, 1e-5));
        assert!(approx_eq(p.leg_length, 0.4, 1e-5));
        assert_eq!(p.right_thigh, 0.0);
        assert!(approx_eq(p.confidence, 0.9, 1e-6));
    }

    #[test]
    fn test_body_proportions_empty() {
        let p = body_proportions(&[], 0.3);
        assert_eq!(p, BodyProportions::default());
    }
}
