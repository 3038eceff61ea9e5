use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::{ensure_positive, ensure_unit, GaitError};
use crate::gait::hmm::EmissionModel;
use crate::gait::phase::GaitPhase;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub smoothing: SmoothingConfig,
    #[serde(default)]
    pub trajectory: TrajectoryConfig,
    #[serde(default)]
    pub hmm: HmmConfig,
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

// --- smoothing ---

/// 平滑化アルゴリズム（設定時に一度だけ選択する）
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum SmoothingAlgorithm {
    /// α = min(1, base_factor · confidence)
    Exponential {
        #[serde(default = "default_base_factor")]
        base_factor: f32,
    },
    MovingAverage {
        #[serde(default = "default_average_window")]
        window: usize,
    },
    /// gain = process_noise / (process_noise + (1 - confidence))
    Kalman {
        #[serde(default = "default_process_noise")]
        process_noise: f32,
    },
    Butterworth {
        #[serde(default = "default_cutoff_hz")]
        cutoff_hz: f32,
        #[serde(default = "default_sample_rate_hz")]
        sample_rate_hz: f32,
    },
    SavitzkyGolay {
        #[serde(default = "default_sg_window")]
        window: usize,
    },
}

fn default_base_factor() -> f32 { 0.8 }
fn default_average_window() -> usize { 5 }
fn default_process_noise() -> f32 { 0.1 }
fn default_cutoff_hz() -> f32 { 6.0 }
fn default_sample_rate_hz() -> f32 { 30.0 }
fn default_sg_window() -> usize { 5 }

impl Default for SmoothingAlgorithm {
    fn default() -> Self {
        Self::Exponential {
            base_factor: default_base_factor(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmoothingConfig {
    #[serde(default)]
    pub filter: SmoothingAlgorithm,
    /// 1フレームで許容する最大移動量（これを超えたら外れ値として予測値に置き換える）
    #[serde(default = "default_max_movement")]
    pub max_movement: f32,
    /// 関節ごとの履歴サンプル数
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    /// タイムスタンプが縮退しているときに仮定するフレームレート
    #[serde(default = "default_nominal_fps")]
    pub nominal_fps: f32,
    /// 予測出力に掛ける信頼度の減衰率
    #[serde(default = "default_prediction_decay")]
    pub prediction_decay: f32,
}

fn default_max_movement() -> f32 { 0.15 }
fn default_history_size() -> usize { 30 }
fn default_nominal_fps() -> f32 { 30.0 }
fn default_prediction_decay() -> f32 { 0.9 }

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            filter: SmoothingAlgorithm::default(),
            max_movement: default_max_movement(),
            history_size: default_history_size(),
            nominal_fps: default_nominal_fps(),
            prediction_decay: default_prediction_decay(),
        }
    }
}

impl SmoothingConfig {
    pub fn validate(&self) -> Result<(), GaitError> {
        ensure_positive("smoothing.max_movement", self.max_movement)?;
        ensure_positive("smoothing.nominal_fps", self.nominal_fps)?;
        ensure_unit("smoothing.prediction_decay", self.prediction_decay)?;
        if self.history_size < 3 {
            return Err(GaitError::invalid(
                "smoothing.history_size",
                format!("must be >= 3, got {}", self.history_size),
            ));
        }
        match self.filter {
            SmoothingAlgorithm::Exponential { base_factor } => {
                ensure_positive("smoothing.filter.base_factor", base_factor)
            }
            SmoothingAlgorithm::MovingAverage { window } => {
                if window == 0 || window > self.history_size {
                    Err(GaitError::invalid(
                        "smoothing.filter.window",
                        format!("must be within 1..={}, got {}", self.history_size, window),
                    ))
                } else {
                    Ok(())
                }
            }
            SmoothingAlgorithm::Kalman { process_noise } => {
                ensure_positive("smoothing.filter.process_noise", process_noise)
            }
            SmoothingAlgorithm::Butterworth {
                cutoff_hz,
                sample_rate_hz,
            } => {
                ensure_positive("smoothing.filter.cutoff_hz", cutoff_hz)?;
                ensure_positive("smoothing.filter.sample_rate_hz", sample_rate_hz)
            }
            SmoothingAlgorithm::SavitzkyGolay { window } => match window {
                3 | 5 | 7 => Ok(()),
                other => Err(GaitError::SavitzkyGolayWindow(other)),
            },
        }
    }
}

// --- trajectory ---

/// 踵接地検出のデバウンス単位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Separation {
    /// 軌跡配列のインデックス差（一定サンプリングを前提）
    Frames(usize),
    /// 経過時間（ミリ秒）
    Millis(i64),
}

impl Default for Separation {
    fn default() -> Self {
        Separation::Frames(5)
    }
}

/// 画像座標の縦軸方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerticalAxis {
    /// 画像座標（下が正）。接地点は y の極大。
    #[default]
    YDown,
    /// ワールド座標（上が正）
    YUp,
}

impl VerticalAxis {
    /// 高さ（上が正）に変換
    pub fn height(self, y: f32) -> f32 {
        match self {
            VerticalAxis::YDown => -y,
            VerticalAxis::YUp => y,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrajectoryConfig {
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default = "default_ankle_confidence")]
    pub ankle_confidence: f32,
    #[serde(default = "default_com_confidence")]
    pub com_confidence: f32,
    /// 軌跡レベルのEMA係数（キーポイント平滑化とは別帯域のジッタ用）
    #[serde(default = "default_blend_factor")]
    pub blend_factor: f32,
    #[serde(default = "default_heel_strike_prominence")]
    pub heel_strike_prominence: f32,
    /// 極小判定で比較する前後のサンプル数
    #[serde(default = "default_heel_strike_span")]
    pub heel_strike_span: usize,
    #[serde(default)]
    pub heel_strike_separation: Separation,
    #[serde(default)]
    pub vertical_axis: VerticalAxis,
    /// この時間観測が無い人物は消失とみなす
    #[serde(default = "default_person_timeout_ms")]
    pub person_timeout_ms: i64,
}

fn default_max_length() -> usize { 100 }
fn default_ankle_confidence() -> f32 { 0.5 }
fn default_com_confidence() -> f32 { 0.3 }
fn default_blend_factor() -> f32 { 0.7 }
fn default_heel_strike_prominence() -> f32 { 0.002 }
fn default_heel_strike_span() -> usize { 1 }
fn default_person_timeout_ms() -> i64 { 2000 }

impl Default for TrajectoryConfig {
    fn default() -> Self {
        Self {
            max_length: default_max_length(),
            ankle_confidence: default_ankle_confidence(),
            com_confidence: default_com_confidence(),
            blend_factor: default_blend_factor(),
            heel_strike_prominence: default_heel_strike_prominence(),
            heel_strike_span: default_heel_strike_span(),
            heel_strike_separation: Separation::default(),
            vertical_axis: VerticalAxis::default(),
            person_timeout_ms: default_person_timeout_ms(),
        }
    }
}

impl TrajectoryConfig {
    pub fn validate(&self) -> Result<(), GaitError> {
        if self.max_length == 0 {
            return Err(GaitError::invalid("trajectory.max_length", "must be > 0"));
        }
        if self.heel_strike_span == 0 {
            return Err(GaitError::invalid("trajectory.heel_strike_span", "must be > 0"));
        }
        ensure_unit("trajectory.ankle_confidence", self.ankle_confidence)?;
        ensure_unit("trajectory.com_confidence", self.com_confidence)?;
        ensure_unit("trajectory.blend_factor", self.blend_factor)?;
        if self.blend_factor == 0.0 {
            return Err(GaitError::invalid("trajectory.blend_factor", "must be > 0"));
        }
        if !(self.heel_strike_prominence.is_finite() && self.heel_strike_prominence >= 0.0) {
            return Err(GaitError::invalid(
                "trajectory.heel_strike_prominence",
                format!("must be finite and >= 0, got {}", self.heel_strike_prominence),
            ));
        }
        if let Separation::Millis(ms) = self.heel_strike_separation {
            if ms < 0 {
                return Err(GaitError::invalid("trajectory.heel_strike_separation", "must be >= 0 ms"));
            }
        }
        if self.person_timeout_ms <= 0 {
            return Err(GaitError::invalid("trajectory.person_timeout_ms", "must be > 0"));
        }
        Ok(())
    }
}

// --- hmm ---

#[derive(Debug, Clone, Deserialize)]
pub struct HmmConfig {
    /// 各フェーズの自己遷移確率（残りは次フェーズへ）
    #[serde(default = "default_persistence")]
    pub persistence: f64,
    /// 完全な遷移行列の上書き（行=遷移元）
    #[serde(default)]
    pub transition_matrix: Option<[[f64; GaitPhase::COUNT]; GaitPhase::COUNT]>,
    #[serde(default)]
    pub emission: EmissionModel,
    /// mid_stance / mid_swing イベントも出力する
    #[serde(default)]
    pub emit_midphase_events: bool,
    /// 尤度の下限（事後確率には掛けない）
    #[serde(default = "default_min_probability")]
    pub min_probability: f64,
}

fn default_persistence() -> f64 { 0.7 }
fn default_min_probability() -> f64 { 1e-9 }

impl Default for HmmConfig {
    fn default() -> Self {
        Self {
            persistence: default_persistence(),
            transition_matrix: None,
            emission: EmissionModel::default(),
            emit_midphase_events: false,
            min_probability: default_min_probability(),
        }
    }
}

// --- features ---

#[derive(Debug, Clone, Deserialize)]
pub struct FeatureConfig {
    #[serde(default = "default_feature_confidence")]
    pub confidence_threshold: f32,
    /// 脚長が測れないときの既定値（正規化座標）
    #[serde(default = "default_leg_length")]
    pub default_leg_length: f32,
    /// 脚長推定のEMA係数
    #[serde(default = "default_leg_length_smoothing")]
    pub leg_length_smoothing: f32,
    /// 床推定が現在の足首高さへ戻る速さ（1フレームあたり）
    #[serde(default = "default_floor_relaxation")]
    pub floor_relaxation: f32,
}

fn default_feature_confidence() -> f32 { 0.3 }
fn default_leg_length() -> f32 { 0.4 }
fn default_leg_length_smoothing() -> f32 { 0.1 }
fn default_floor_relaxation() -> f32 { 0.01 }

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_feature_confidence(),
            default_leg_length: default_leg_length(),
            leg_length_smoothing: default_leg_length_smoothing(),
            floor_relaxation: default_floor_relaxation(),
        }
    }
}

impl FeatureConfig {
    pub fn validate(&self) -> Result<(), GaitError> {
        ensure_unit("features.confidence_threshold", self.confidence_threshold)?;
        ensure_positive("features.default_leg_length", self.default_leg_length)?;
        ensure_unit("features.leg_length_smoothing", self.leg_length_smoothing)?;
        ensure_unit("features.floor_relaxation", self.floor_relaxation)
    }
}

// --- metrics ---

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// 解析窓（ミリ秒）
    #[serde(default = "default_analysis_window_ms")]
    pub analysis_window_ms: i64,
    /// 人物ごとに保持するイベント数の上限
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    /// 信頼できる結果とみなす最小ストライド数
    #[serde(default = "default_min_strides")]
    pub min_strides: usize,
    #[serde(default = "default_low_confidence")]
    pub low_confidence: f32,
}

fn default_analysis_window_ms() -> i64 { 10_000 }
fn default_max_events() -> usize { 256 }
fn default_min_strides() -> usize { 2 }
fn default_low_confidence() -> f32 { 0.5 }

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            analysis_window_ms: default_analysis_window_ms(),
            max_events: default_max_events(),
            min_strides: default_min_strides(),
            low_confidence: default_low_confidence(),
        }
    }
}

impl MetricsConfig {
    pub fn validate(&self) -> Result<(), GaitError> {
        if self.analysis_window_ms <= 0 {
            return Err(GaitError::invalid("metrics.analysis_window_ms", "must be > 0"));
        }
        if self.max_events == 0 {
            return Err(GaitError::invalid("metrics.max_events", "must be > 0"));
        }
        if self.min_strides == 0 {
            return Err(GaitError::invalid("metrics.min_strides", "must be > 0"));
        }
        ensure_unit("metrics.low_confidence", self.low_confidence)
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_toml(&content)?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config")?;
        config.validate().context("Invalid config")?;
        Ok(config)
    }

    /// 読み込みに失敗したらデフォルト値を使う
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("{}: {:#}; using defaults", path.as_ref().display(), e);
                Self::default()
            }
        }
    }

    /// HMMの検証は遷移行列の構築時に行う（`GaitPhaseHmm::new`）
    pub fn validate(&self) -> Result<(), GaitError> {
        self.smoothing.validate()?;
        self.trajectory.validate()?;
        self.hmm.transitions()?;
        self.hmm.emission.validate()?;
        self.features.validate()?;
        self.metrics.validate()
    }
}
