use crate::config::DetectorConfig;
use crate::types::FeatureVector;

/// この音量を超えたらピッチ・重心に関係なく音声とみなす (RMS)
pub const LOUD_VOLUME: f32 = 0.02;

/// 小音量時に音声らしいとみなすピッチ範囲 (Hz、両端を含まない)
pub const VOICED_PITCH_RANGE: (f32, f32) = (50.0, 600.0);

/// 小音量時に音声らしいとみなすスペクトル重心の下限 (Hz)
pub const VOICED_CENTROID_MIN: f32 = 100.0;

/// VADの判定理由
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VadDecision {
    /// 十分な音量がある
    Loud,
    /// 小音量だが音声らしい特徴を持つ
    QuietVoiced,
    /// 無音
    Silent,
}

impl VadDecision {
    pub fn is_voice(self) -> bool {
        !matches!(self, VadDecision::Silent)
    }
}

/// Voice Activity Detector (音声区間検出器)
///
/// 特徴量と無音閾値だけで判定する純粋な述語。状態を持たない。
///
/// # アルゴリズム
///
/// 1. 音量 > 0.02 なら無条件で音声
/// 2. 音量 > 無音閾値 かつ (ピッチが 50〜600 Hz または 重心 > 100 Hz) なら音声
/// 3. それ以外は無音
///
/// 小音量でも音声らしい信号を拾うため、誤検出は許容する。
/// 誤検出されたフレームは後段の話者分類でピッチ範囲によって除外される。
///
/// # Examples
///
/// ```
/// # use speaker_tally::vad::VoiceActivityDetector;
/// # use speaker_tally::types::FeatureVector;
/// let vad = VoiceActivityDetector::new(0.008);
///
/// let silence = FeatureVector { volume: 0.001, ..Default::default() };
/// assert!(!vad.is_voice_active(&silence));
///
/// let voice = FeatureVector { volume: 0.05, ..Default::default() };
/// assert!(vad.is_voice_active(&voice));
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VoiceActivityDetector {
    /// 無音閾値 (RMS)
    silence_threshold: f32,
}

impl VoiceActivityDetector {
    pub fn new(silence_threshold: f32) -> Self {
        Self { silence_threshold }
    }

    pub fn from_config(config: &DetectorConfig) -> Self {
        Self::new(config.silence_threshold)
    }

    pub fn silence_threshold(&self) -> f32 {
        self.silence_threshold
    }

    /// 特徴量を判定し、判定理由を返す
    pub fn classify(&self, features: &FeatureVector) -> VadDecision {
        if features.volume > LOUD_VOLUME {
            return VadDecision::Loud;
        }

        let (pitch_low, pitch_high) = VOICED_PITCH_RANGE;
        let voiced_pitch = features.pitch > pitch_low && features.pitch < pitch_high;
        let voiced_centroid = features.spectral_centroid > VOICED_CENTROID_MIN;

        if features.volume > self.silence_threshold && (voiced_pitch || voiced_centroid) {
            VadDecision::QuietVoiced
        } else {
            VadDecision::Silent
        }
    }

    /// 音声区間かどうか
    ///
    /// # Returns
    /// * `true` - 音声あり
    /// * `false` - 無音
    pub fn is_voice_active(&self, features: &FeatureVector) -> bool {
        self.classify(features).is_voice()
    }
}

impl Default for VoiceActivityDetector {
    fn default() -> Self {
        Self::from_config(&DetectorConfig::default())
    }
}
