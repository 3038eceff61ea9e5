use crate::geometry::Point3D;

/// 1次IIRローパス（初回は素通し）
#[derive(Debug, Clone, Copy, Default)]
pub struct LowPass {
    prev: Option<Point3D>,
}

impl LowPass {
    pub fn new() -> Self {
        Self { prev: None }
    }

    pub fn filter(&mut self, value: Point3D, alpha: f32) -> Point3D {
        let result = match self.prev {
            Some(prev) => prev.lerp(value, alpha),
            None => value,
        };
        self.prev = Some(result);
        result
    }

    pub fn value(&self) -> Option<Point3D> {
        self.prev
    }

    /// 外れ値置換後などに内部状態を上書きする
    pub fn seed(&mut self, value: Point3D) {
        self.prev = Some(value);
    }

    pub fn reset(&mut self) {
        self.prev = None;
    }
}

/// alpha = 1 / (1 + tau/Te), tau = 1/(2*pi*fc)
pub fn smoothing_factor(te: f32, cutoff: f32) -> f32 {
    let r = 2.0 * std::f32::consts::PI * cutoff * te;
    r / (r + 1.0)
}

/// 同じ係数の1次ローパスを2段直列にした2次フィルタ
#[derive(Debug, Clone, Copy, Default)]
pub struct Cascade {
    stages: [LowPass; 2],
}

impl Cascade {
    pub fn filter(&mut self, value: Point3D, alpha: f32) -> Point3D {
        let first = self.stages[0].filter(value, alpha);
        self.stages[1].filter(first, alpha)
    }

    pub fn seed(&mut self, value: Point3D) {
        for stage in &mut self.stages {
            stage.seed(value);
        }
    }
}
