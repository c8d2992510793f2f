use thiserror::Error;

/// 話者検出コアのエラー
///
/// コア処理（特徴量抽出・話者分類・集計）が返す構造的なエラーのみを表す。
/// 無音やピーク無しなどの数値的なエッジケースはエラーにせず、
/// 0 などの番兵値で解決する。
///
/// # Examples
///
/// ```
/// # use speaker_tally::error::SpeakerError;
/// let err = SpeakerError::invalid_input("波形が空です");
/// assert!(err.is_invalid_input());
/// ```
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpeakerError {
    /// 入力フレームが契約に違反している
    ///
    /// バッファ長の不一致、非有限値、空バッファなど。
    /// 該当フレームのみを失敗させ、呼び出し側はフレームを読み飛ばして処理を継続する。
    #[error("不正な入力フレーム: {0}")]
    InvalidInput(String),

    /// 設定値が不正
    ///
    /// セッション開始時（フレーム処理前）に検出される。
    #[error("設定エラー: {0}")]
    Configuration(String),
}

impl SpeakerError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        SpeakerError::InvalidInput(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        SpeakerError::Configuration(message.into())
    }

    /// フレーム単位のエラーかどうか
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, SpeakerError::InvalidInput(_))
    }
}

/// コア処理の結果型
pub type SpeakerResult<T> = Result<T, SpeakerError>;
