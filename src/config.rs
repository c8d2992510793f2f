use crate::error::{SpeakerError, SpeakerResult};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// 話者数上限の下限値（ポリシー）
pub const MIN_SPEAKERS: usize = 2;

/// 話者数上限の上限値（スロットテーブルの最大サイズ）
pub const MAX_SPEAKERS: usize = 8;

/// FFTサイズの下限
pub const MIN_FFT_SIZE: usize = 64;

/// FFTサイズの上限
///
/// ピッチ推定の自己相関は O(N × ラグ数) なので、フレーム間隔内に収まるよう制限する
pub const MAX_FFT_SIZE: usize = 8192;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// オーディオ入力設定
///
/// # デフォルト値
///
/// - `device_id`: "default" (システムのデフォルトデバイス)
/// - `sample_rate`: 48000 Hz
/// - `channels`: 1 (モノラル。複数チャンネルはダウンミックスする)
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AudioConfig {
    #[serde(default = "default_device_id")]
    pub device_id: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
}

/// フレーム解析設定
///
/// 時間波形から周波数スペクトルを作る解析器の設定。
///
/// # デフォルト値
///
/// - `fft_size`: 2048 サンプル
/// - `mel_bands`: 13 バンド
/// - `min_decibels`: -100.0 dB (0 にマップされる)
/// - `max_decibels`: -30.0 dB (255 にマップされる)
/// - `smoothing`: 0.8 (前フレームとの平滑化係数)
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_fft_size")]
    pub fft_size: usize,
    #[serde(default = "default_mel_bands")]
    pub mel_bands: usize,
    #[serde(default = "default_min_decibels")]
    pub min_decibels: f32,
    #[serde(default = "default_max_decibels")]
    pub max_decibels: f32,
    #[serde(default = "default_smoothing")]
    pub smoothing: f32,
}

/// 話者検出設定
///
/// VAD・話者分類・集計で使う全ての調整値をまとめたもの。
///
/// # デフォルト値
///
/// - `silence_threshold`: 0.008 (RMS)
/// - `min_speech_duration_ms`: 50 ms
/// - `change_threshold`: 0.4 (これ未満の類似度なら別話者とみなす)
/// - `max_speakers`: 2
/// - `profile_stable_samples`: 10 (プロファイルが安定するまでのサンプル数)
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DetectorConfig {
    #[serde(default = "default_silence_threshold")]
    pub silence_threshold: f32,
    #[serde(default = "default_min_speech_duration_ms")]
    pub min_speech_duration_ms: u64,
    #[serde(default = "default_change_threshold")]
    pub change_threshold: f32,
    #[serde(default = "default_max_speakers")]
    pub max_speakers: usize,
    #[serde(default = "default_profile_stable_samples")]
    pub profile_stable_samples: u32,
}

/// 出力設定
///
/// # デフォルト値
///
/// - `log_level`: "info"
/// - `emit_frames`: false (true の場合、フレーム毎のレポートも出力する)
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub emit_frames: bool,
}

// Default functions
fn default_device_id() -> String {
    "default".to_string()
}

fn default_sample_rate() -> u32 {
    48000
}

fn default_channels() -> u16 {
    1
}

fn default_fft_size() -> usize {
    2048
}

fn default_mel_bands() -> usize {
    13
}

fn default_min_decibels() -> f32 {
    -100.0
}

fn default_max_decibels() -> f32 {
    -30.0
}

fn default_smoothing() -> f32 {
    0.8
}

fn default_silence_threshold() -> f32 {
    0.008
}

fn default_min_speech_duration_ms() -> u64 {
    50 // 1フレームだけの誤検出を除外
}

fn default_change_threshold() -> f32 {
    0.4
}

fn default_max_speakers() -> usize {
    2
}

fn default_profile_stable_samples() -> u32 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            analysis: AnalysisConfig::default(),
            detector: DetectorConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            fft_size: default_fft_size(),
            mel_bands: default_mel_bands(),
            min_decibels: default_min_decibels(),
            max_decibels: default_max_decibels(),
            smoothing: default_smoothing(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            silence_threshold: default_silence_threshold(),
            min_speech_duration_ms: default_min_speech_duration_ms(),
            change_threshold: default_change_threshold(),
            max_speakers: default_max_speakers(),
            profile_stable_samples: default_profile_stable_samples(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            emit_frames: false,
        }
    }
}

impl AnalysisConfig {
    /// 解析設定を検証
    ///
    /// # Errors
    ///
    /// FFTサイズが範囲外・奇数、バンド数が0、dB範囲や平滑化係数が不正な場合
    pub fn validate(&self) -> SpeakerResult<()> {
        validate_fft_size(self.fft_size)?;
        if self.mel_bands == 0 {
            return Err(SpeakerError::configuration("mel_bands は 1 以上が必要です"));
        }
        if !(self.min_decibels < self.max_decibels) {
            return Err(SpeakerError::configuration(format!(
                "min_decibels ({}) は max_decibels ({}) より小さい必要があります",
                self.min_decibels, self.max_decibels
            )));
        }
        if !(0.0..1.0).contains(&self.smoothing) {
            return Err(SpeakerError::configuration(format!(
                "smoothing は 0.0 以上 1.0 未満が必要です: {}",
                self.smoothing
            )));
        }
        Ok(())
    }
}

impl DetectorConfig {
    /// 話者数上限を差し替えた設定を返す
    pub fn with_max_speakers(&self, max_speakers: usize) -> Self {
        Self {
            max_speakers,
            ..self.clone()
        }
    }

    /// 最小発話時間
    pub fn min_speech_duration(&self) -> Duration {
        Duration::from_millis(self.min_speech_duration_ms)
    }

    /// 話者検出設定を検証
    ///
    /// # Errors
    ///
    /// 話者数上限がポリシー範囲 (`MIN_SPEAKERS..=MAX_SPEAKERS`) 外、
    /// または閾値が範囲外の場合
    pub fn validate(&self) -> SpeakerResult<()> {
        if !(MIN_SPEAKERS..=MAX_SPEAKERS).contains(&self.max_speakers) {
            return Err(SpeakerError::configuration(format!(
                "max_speakers は {}〜{} の範囲で指定してください: {}",
                MIN_SPEAKERS, MAX_SPEAKERS, self.max_speakers
            )));
        }
        if !self.silence_threshold.is_finite() || self.silence_threshold < 0.0 {
            return Err(SpeakerError::configuration(format!(
                "silence_threshold が不正です: {}",
                self.silence_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.change_threshold) {
            return Err(SpeakerError::configuration(format!(
                "change_threshold は 0.0〜1.0 の範囲で指定してください: {}",
                self.change_threshold
            )));
        }
        if self.profile_stable_samples == 0 {
            return Err(SpeakerError::configuration(
                "profile_stable_samples は 1 以上が必要です",
            ));
        }
        Ok(())
    }
}

/// FFTサイズを検証
pub(crate) fn validate_fft_size(fft_size: usize) -> SpeakerResult<()> {
    if !(MIN_FFT_SIZE..=MAX_FFT_SIZE).contains(&fft_size) || fft_size % 2 != 0 {
        return Err(SpeakerError::configuration(format!(
            "fft_size は {}〜{} の偶数で指定してください: {}",
            MIN_FFT_SIZE, MAX_FFT_SIZE, fft_size
        )));
    }
    Ok(())
}

/// 設定の読み込み元
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    /// 設定ファイル
    File,
    /// ファイルが無いためデフォルト値
    Default,
}

impl Config {
    /// 設定ファイルから読み込み
    ///
    /// TOML形式の設定ファイルをパースしてConfig構造体を生成する。
    ///
    /// # Errors
    ///
    /// ファイルの読み込みまたはパースに失敗した場合にエラーを返す。
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use speaker_tally::config::Config;
    /// let config = Config::from_file("config.toml").unwrap();
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("設定ファイルの読み込みに失敗: {:?}", path.as_ref()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "設定ファイルのパースに失敗")?;
        Ok(config)
    }

    /// デフォルト設定をファイルに書き出し
    ///
    /// 既存のファイルは上書きされる。
    ///
    /// # Errors
    ///
    /// ファイルの書き込みに失敗した場合にエラーを返す。
    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<()> {
        let config = Config::default();
        let content =
            toml::to_string_pretty(&config).with_context(|| "設定のシリアライズに失敗")?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("設定ファイルの書き込みに失敗: {:?}", path.as_ref()))?;
        Ok(())
    }

    /// 設定ファイルがあれば読み込み、なければデフォルトを使用（ログは出さない）
    ///
    /// ロガーの初期化前に呼べるよう、どちらを使ったかを戻り値で返す。
    ///
    /// # Errors
    ///
    /// ファイルが存在するがパースに失敗した場合にエラーを返す。
    pub fn load<P: AsRef<Path>>(path: P) -> Result<(Self, ConfigSource)> {
        if path.as_ref().exists() {
            Ok((Self::from_file(path)?, ConfigSource::File))
        } else {
            Ok((Config::default(), ConfigSource::Default))
        }
    }

    /// 設定ファイルがあれば読み込み、なければデフォルトを使用
    ///
    /// # Errors
    ///
    /// ファイルが存在するがパースに失敗した場合にエラーを返す。
    /// ファイルが存在しない場合はエラーにならず、デフォルト設定を返す。
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let (config, source) = Self::load(path.as_ref())?;
        if source == ConfigSource::Default {
            log::warn!(
                "設定ファイルが見つかりません。デフォルト設定を使用します: {:?}",
                path.as_ref()
            );
        }
        Ok(config)
    }

    /// 全セクションを検証
    pub fn validate(&self) -> SpeakerResult<()> {
        if self.audio.sample_rate == 0 {
            return Err(SpeakerError::configuration("sample_rate は 1 以上が必要です"));
        }
        self.analysis.validate()?;
        self.detector.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.audio.sample_rate, 48000);
        assert_eq!(config.audio.channels, 1);
        assert_eq!(config.analysis.fft_size, 2048);
        assert_eq!(config.analysis.mel_bands, 13);
        assert_eq!(config.detector.silence_threshold, 0.008);
        assert_eq!(config.detector.min_speech_duration_ms, 50);
        assert_eq!(config.detector.change_threshold, 0.4);
        assert_eq!(config.detector.max_speakers, 2);
        assert_eq!(config.detector.profile_stable_samples, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_write_and_read_config() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        Config::write_default(path).unwrap();

        let config = Config::from_file(path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_custom_config() {
        let toml_content = r#"
[audio]
device_id = "test-device"
sample_rate = 16000
channels = 2

[analysis]
fft_size = 1024
mel_bands = 20
smoothing = 0.5

[detector]
silence_threshold = 0.01
min_speech_duration_ms = 100
change_threshold = 0.35
max_speakers = 4
profile_stable_samples = 20

[output]
log_level = "debug"
emit_frames = true
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = Config::from_file(temp_file.path()).unwrap();

        assert_eq!(config.audio.device_id, "test-device");
        assert_eq!(config.audio.sample_rate, 16000);
        assert_eq!(config.audio.channels, 2);
        assert_eq!(config.analysis.fft_size, 1024);
        assert_eq!(config.analysis.mel_bands, 20);
        assert_eq!(config.analysis.smoothing, 0.5);
        assert_eq!(config.analysis.min_decibels, -100.0);
        assert_eq!(config.detector.silence_threshold, 0.01);
        assert_eq!(config.detector.min_speech_duration(), Duration::from_millis(100));
        assert_eq!(config.detector.change_threshold, 0.35);
        assert_eq!(config.detector.max_speakers, 4);
        assert_eq!(config.detector.profile_stable_samples, 20);
        assert_eq!(config.output.log_level, "debug");
        assert!(config.output.emit_frames);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_or_default_nonexistent() {
        let config = Config::load_or_default("nonexistent_file.toml").unwrap();
        assert_eq!(config.detector.max_speakers, 2);
    }

    #[test]
    fn test_partial_config() {
        // 一部の設定のみ記述した場合、残りはデフォルト値が使われる
        let toml_content = r#"
[detector]
max_speakers = 3
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = Config::from_file(temp_file.path()).unwrap();

        assert_eq!(config.detector.max_speakers, 3);
        assert_eq!(config.detector.silence_threshold, 0.008);
        assert_eq!(config.audio.device_id, "default");
        assert_eq!(config.analysis.fft_size, 2048);
    }

    #[test]
    fn test_invalid_max_speakers() {
        let detector = DetectorConfig::default();
        assert!(detector.with_max_speakers(0).validate().is_err());
        assert!(detector.with_max_speakers(1).validate().is_err());
        assert!(detector.with_max_speakers(MAX_SPEAKERS + 1).validate().is_err());
        assert!(detector.with_max_speakers(MIN_SPEAKERS).validate().is_ok());
        assert!(detector.with_max_speakers(MAX_SPEAKERS).validate().is_ok());

        let err = detector.with_max_speakers(0).validate().unwrap_err();
        assert!(matches!(err, SpeakerError::Configuration(_)));
    }

    #[test]
    fn test_invalid_analysis() {
        let mut analysis = AnalysisConfig::default();
        analysis.fft_size = 1023;
        assert!(analysis.validate().is_err());

        analysis.fft_size = MAX_FFT_SIZE * 2;
        assert!(analysis.validate().is_err());

        analysis.fft_size = 512;
        analysis.mel_bands = 0;
        assert!(analysis.validate().is_err());

        analysis.mel_bands = 13;
        analysis.min_decibels = -20.0;
        assert!(analysis.validate().is_err());

        analysis.min_decibels = -100.0;
        analysis.smoothing = 1.0;
        assert!(analysis.validate().is_err());
    }

    #[test]
    fn test_invalid_thresholds() {
        let mut detector = DetectorConfig::default();
        detector.silence_threshold = f32::NAN;
        assert!(detector.validate().is_err());

        let mut detector = DetectorConfig::default();
        detector.change_threshold = 1.5;
        assert!(detector.validate().is_err());

        let mut detector = DetectorConfig::default();
        detector.profile_stable_samples = 0;
        assert!(detector.validate().is_err());
    }

    #[test]
    fn test_load_reports_source() {
        let (config, source) = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(source, ConfigSource::Default);
        assert_eq!(config, Config::default());

        let temp_file = NamedTempFile::new().unwrap();
        Config::write_default(temp_file.path()).unwrap();
        let (config, source) = Config::load(temp_file.path()).unwrap();
        assert_eq!(source, ConfigSource::File);
        assert_eq!(config, Config::default());
    }
}
