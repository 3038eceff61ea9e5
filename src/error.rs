use thiserror::Error;

/// 構築時の設定エラー
///
/// フレーム毎の処理経路はこのエラーを返さない。コンポーネント生成時にのみ発生する。
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GaitError {
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("transition row {row} sums to {sum}, expected 1.0")]
    TransitionRowSum { row: usize, sum: f64 },

    #[error("transition probability [{row}][{col}] = {value} is not a valid probability")]
    InvalidProbability { row: usize, col: usize, value: f64 },

    #[error("transition {from} -> {to} skips a gait phase (p = {value})")]
    SkippedPhase {
        from: &'static str,
        to: &'static str,
        value: f64,
    },

    #[error("unsupported Savitzky-Golay window {0} (expected 3, 5 or 7)")]
    SavitzkyGolayWindow(usize),
}

impl GaitError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

/// `value` が有限かつ正であることを確認
pub(crate) fn ensure_positive(name: &'static str, value: f32) -> Result<(), GaitError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(GaitError::invalid(name, format!("must be finite and > 0, got {}", value)))
    }
}

/// `value` が [0, 1] に収まることを確認
pub(crate) fn ensure_unit(name: &'static str, value: f32) -> Result<(), GaitError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(GaitError::invalid(name, format!("must be within [0, 1], got {}", value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_positive() {
        assert!(ensure_positive("x", 1.0).is_ok());
        assert!(ensure_positive("x", 0.0).is_err());
        assert!(ensure_positive("x", f32::NAN).is_err());
        assert!(ensure_positive("x", f32::INFINITY).is_err());
    }

    #[test]
    fn test_ensure_unit() {
        assert!(ensure_unit("x", 0.0).is_ok());
        assert!(ensure_unit("x", 1.0).is_ok());
        assert!(ensure_unit("x", 1.01).is_err());
        assert!(ensure_unit("x", -0.1).is_err());
    }

    #[test]
    fn test_error_message() {
        let err = GaitError::TransitionRowSum { row: 2, sum: 0.9 };
        assert_eq!(err.to_string(), "transition row 2 sums to 0.9, expected 1.0");
    }
}
