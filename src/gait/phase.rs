use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::GaitError;

/// 歩行周期の8フェーズ（正準順序）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GaitPhase {
    /// Initial contact
    HeelStrike,
    LoadingResponse,
    Midstance,
    TerminalStance,
    PreSwing,
    InitialSwing,
    Midswing,
    TerminalSwing,
}

impl GaitPhase {
    pub const COUNT: usize = 8;

    pub const ALL: [GaitPhase; GaitPhase::COUNT] = [
        GaitPhase::HeelStrike,
        GaitPhase::LoadingResponse,
        GaitPhase::Midstance,
        GaitPhase::TerminalStance,
        GaitPhase::PreSwing,
        GaitPhase::InitialSwing,
        GaitPhase::Midswing,
        GaitPhase::TerminalSwing,
    ];

    pub fn index(self) -> usize {
        match self {
            GaitPhase::HeelStrike => 0,
            GaitPhase::LoadingResponse => 1,
            GaitPhase::Midstance => 2,
            GaitPhase::TerminalStance => 3,
            GaitPhase::PreSwing => 4,
            GaitPhase::InitialSwing => 5,
            GaitPhase::Midswing => 6,
            GaitPhase::TerminalSwing => 7,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// 正準順序で次のフェーズ（TerminalSwing → HeelStrike で一周）
    pub fn next(self) -> Self {
        Self::ALL[(self.index() + 1) % Self::COUNT]
    }

    /// 自己遷移か1ステップ前進のみ許可
    pub fn can_transition_to(self, to: GaitPhase) -> bool {
        to == self || to == self.next()
    }

    /// PreSwing までは足が接地している
    pub fn is_stance(self) -> bool {
        self.index() <= GaitPhase::PreSwing.index()
    }

    pub fn name(self) -> &'static str {
        match self {
            GaitPhase::HeelStrike => "heel_strike",
            GaitPhase::LoadingResponse => "loading_response",
            GaitPhase::Midstance => "midstance",
            GaitPhase::TerminalStance => "terminal_stance",
            GaitPhase::PreSwing => "pre_swing",
            GaitPhase::InitialSwing => "initial_swing",
            GaitPhase::Midswing => "midswing",
            GaitPhase::TerminalSwing => "terminal_swing",
        }
    }
}

impl fmt::Display for GaitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const ROW_SUM_TOLERANCE: f64 = 1e-6;

/// 検証済みの遷移確率行列。`rows[from][to]`。
///
/// 構築時にのみ検証し、推論中は変更しない。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransitionMatrix {
    rows: [[f64; GaitPhase::COUNT]; GaitPhase::COUNT],
}

impl TransitionMatrix {
    /// 全フェーズ共通の自己遷移確率 `persistence` と、残りを次フェーズへ割り当てる巡回行列
    pub fn cyclic(persistence: f64) -> Result<Self, GaitError> {
        let mut rows = [[0.0; GaitPhase::COUNT]; GaitPhase::COUNT];
        for phase in GaitPhase::ALL {
            rows[phase.index()][phase.index()] = persistence;
            rows[phase.index()][phase.next().index()] = 1.0 - persistence;
        }
        Self::from_rows(rows)
    }

    /// 行和が1、各要素が[0,1]、フェーズの飛び越しが無いことを検証する
    pub fn from_rows(rows: [[f64; GaitPhase::COUNT]; GaitPhase::COUNT]) -> Result<Self, GaitError> {
        for (from, row) in rows.iter().enumerate() {
            for (to, &value) in row.iter().enumerate() {
                if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                    return Err(GaitError::InvalidProbability {
                        row: from,
                        col: to,
                        value,
                    });
                }
                let from_phase = GaitPhase::ALL[from];
                let to_phase = GaitPhase::ALL[to];
                if value > 0.0 && !from_phase.can_transition_to(to_phase) {
                    return Err(GaitError::SkippedPhase {
                        from: from_phase.name(),
                        to: to_phase.name(),
                        value,
                    });
                }
            }
            let sum: f64 = row.iter().sum();
            if (sum - 1.0).abs() > ROW_SUM_TOLERANCE {
                return Err(GaitError::TransitionRowSum { row: from, sum });
            }
        }
        Ok(Self { rows })
    }

    pub fn probability(&self, from: GaitPhase, to: GaitPhase) -> f64 {
        self.rows[from.index()][to.index()]
    }

    pub fn rows(&self) -> &[[f64; GaitPhase::COUNT]; GaitPhase::COUNT] {
        &self.rows
    }

    /// 事前分布を1ステップ伝播: `out[s] = Σ_prev belief[prev] · P(prev → s)`
    pub fn propagate(&self, belief: &[f64; GaitPhase::COUNT]) -> [f64; GaitPhase::COUNT] {
        let mut out = [0.0; GaitPhase::COUNT];
        for (prev, row) in self.rows.iter().enumerate() {
            let mass = belief[prev];
            if mass == 0.0 {
                continue;
            }
            for (s, &p) in row.iter().enumerate() {
                out[s] += mass * p;
            }
        }
        out
    }
}
