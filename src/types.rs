use serde::{Serialize, Serializer};
use std::time::Duration;

/// 話者ID
///
/// セッション内で作成順に 0 から割り当てられ、再利用されない。
pub type SpeakerId = usize;

/// オーディオフォーマット情報
///
/// # Examples
///
/// ```
/// # use speaker_tally::types::AudioFormat;
/// let format = AudioFormat {
///     sample_rate: 48000,  // 48kHz
///     channels: 1,          // モノラル
/// };
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioFormat {
    /// サンプリングレート (Hz)
    pub sample_rate: u32,

    /// チャンネル数
    pub channels: u16,
}

/// オーディオチャンク
///
/// 入力デバイスから受信したモノラル音声のまとまり。
/// サンプル数は解析器のFFTサイズと一致する。
#[derive(Clone, Debug)]
pub struct AudioChunk {
    /// 正規化済みサンプル (-1.0 ~ 1.0)
    pub samples: Vec<f32>,

    /// オーディオフォーマット情報
    pub format: AudioFormat,

    /// ストリーム開始からの経過時間
    pub timestamp: Duration,
}

/// サンプル数をサンプリングレートに基づく経過時間に変換する
///
/// 秒と端数に分けて計算するので、長時間のストリームでも桁あふれしない。
pub fn samples_to_duration(samples: u64, sample_rate: u32) -> Duration {
    let rate = u64::from(sample_rate.max(1));
    let secs = samples / rate;
    let nanos = (samples % rate) * 1_000_000_000 / rate;
    Duration::from_secs(secs) + Duration::from_nanos(nanos)
}

/// 解析済みフレーム
///
/// フレームソースからコアに渡される1単位。
/// 時間波形と振幅スペクトルを同じタイミングで保持する。
///
/// # Examples
///
/// ```
/// # use speaker_tally::types::Frame;
/// # use std::time::Duration;
/// let frame = Frame {
///     timestamp: Duration::from_millis(16),
///     waveform: vec![0.0; 2048],
///     spectrum: vec![0.0; 1024],
///     sample_rate: 48000,
///     fft_size: 2048,
/// };
/// assert_eq!(frame.spectrum.len(), frame.fft_size / 2);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// ストリーム開始からの経過時間（単調非減少）
    pub timestamp: Duration,

    /// 時間波形（長さ `fft_size`、値は -1.0 ~ 1.0）
    pub waveform: Vec<f32>,

    /// 振幅スペクトル（長さ `fft_size / 2`、値は 0 ~ 255）
    pub spectrum: Vec<f32>,

    /// サンプリングレート (Hz)
    pub sample_rate: u32,

    /// スペクトル算出に使ったFFTサイズ
    pub fft_size: usize,
}

/// 1フレーム分の音響特徴量
///
/// `FeatureExtractor` がフレーム毎に新規作成する。作成後は変更しない。
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FeatureVector {
    /// RMS音量 (>= 0)
    pub volume: f32,

    /// 基本周波数 (Hz)。0 は周期性が見つからなかったことを表す
    pub pitch: f32,

    /// スペクトル重心 (Hz)
    pub spectral_centroid: f32,

    /// ゼロ交差率 (0.0 ~ 1.0)
    pub zero_crossing_rate: f32,

    /// メルバンドエネルギー（フレーム内最大値で正規化、0.0 ~ 1.0）
    pub mel_bands: Vec<f32>,

    /// 振幅スペクトルのコピー（診断用、分類には使わない）
    #[serde(skip)]
    pub frequency_magnitudes: Vec<f32>,

    /// 時間波形のコピー（診断用、分類には使わない）
    #[serde(skip)]
    pub waveform: Vec<f32>,
}

/// 話者の音響プロファイル
///
/// ピッチとスペクトル重心の指数移動平均 (EMA) を保持する。
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VoiceProfile {
    pub speaker_id: SpeakerId,

    /// ピッチのEMA (Hz)
    pub avg_pitch: f32,

    /// スペクトル重心のEMA (Hz)
    pub avg_spectral_centroid: f32,

    /// ピッチ偏差二乗のEMA
    pub pitch_variance: f32,

    /// プロファイルに取り込んだフレーム数
    pub samples: u32,
}

/// 話者分類の結果
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Classification {
    /// 割り当てられた話者（まだ誰もいない場合は None）
    pub speaker_id: Option<SpeakerId>,

    /// このフレームで新しい話者が作成されたかどうか
    pub is_new: bool,

    /// 判定の確信度 (0.0 ~ 1.0)
    pub confidence: f32,
}

/// 話者の集計レコード
///
/// `SessionAggregator` だけが更新する。
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Speaker {
    pub id: SpeakerId,

    /// 確定済みの累積発話時間
    #[serde(serialize_with = "serialize_duration_ms")]
    pub total_time: Duration,

    /// 現在発話中かどうか
    pub is_active: bool,

    /// 最後に発話していた時刻
    #[serde(serialize_with = "serialize_optional_duration_ms")]
    pub last_active_time: Option<Duration>,
}

impl Speaker {
    pub fn new(id: SpeakerId) -> Self {
        Self {
            id,
            total_time: Duration::ZERO,
            is_active: false,
            last_active_time: None,
        }
    }
}

/// セッション状態
///
/// 遷移は外部のセッション制御からのみ行われる。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// 未開始
    Idle,
    /// 処理中
    Running,
    /// 一時停止中（フレームは無視される）
    Paused,
    /// 停止済み（集計結果は保持される）
    Stopped,
}

/// セッション中に発生する離散イベント
///
/// # JSON出力例
///
/// ```json
/// {"event":"speaker_changed","previous":0,"current":1,"timestamp_ms":3350.0}
/// ```
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// 発話中の話者が切り替わった
    SpeakerChanged {
        previous: Option<SpeakerId>,
        current: SpeakerId,
        #[serde(rename = "timestamp_ms", serialize_with = "serialize_duration_ms")]
        timestamp: Duration,
    },

    /// 音声区間の開始/終了
    VoiceActivityChanged {
        active: bool,
        #[serde(rename = "timestamp_ms", serialize_with = "serialize_duration_ms")]
        timestamp: Duration,
    },

    /// 新しい話者が名簿に追加された
    SpeakerJoined {
        id: SpeakerId,
        #[serde(rename = "timestamp_ms", serialize_with = "serialize_duration_ms")]
        timestamp: Duration,
    },
}

/// 1フレーム処理後のレポート
///
/// オブザーバーにそのまま渡される。
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FrameReport {
    #[serde(rename = "timestamp_ms", serialize_with = "serialize_duration_ms")]
    pub timestamp: Duration,

    /// このフレームの特徴量
    pub features: FeatureVector,

    /// 音声区間かどうか
    pub voice_active: bool,

    /// 現在の話者
    pub speaker_id: Option<SpeakerId>,

    /// 話者分類の結果（無音フレームでは None）
    pub classification: Option<Classification>,

    /// 話者名簿のスナップショット（ID昇順）
    pub speakers: Vec<Speaker>,

    /// このフレームで発生したイベント
    pub events: Vec<SessionEvent>,
}

fn serialize_duration_ms<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
}

fn serialize_optional_duration_ms<S: Serializer>(
    duration: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match duration {
        Some(d) => serializer.serialize_some(&(d.as_secs_f64() * 1000.0)),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speaker_creation() {
        let speaker = Speaker::new(3);
        assert_eq!(speaker.id, 3);
        assert_eq!(speaker.total_time, Duration::ZERO);
        assert!(!speaker.is_active);
        assert!(speaker.last_active_time.is_none());
    }

    #[test]
    fn test_speaker_json_serialization() {
        let speaker = Speaker {
            id: 1,
            total_time: Duration::from_millis(1500),
            is_active: true,
            last_active_time: Some(Duration::from_millis(2000)),
        };

        let json = serde_json::to_string(&speaker).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed["id"], 1);
        assert_eq!(parsed["total_time"], 1500.0);
        assert_eq!(parsed["is_active"], true);
        assert_eq!(parsed["last_active_time"], 2000.0);
    }

    #[test]
    fn test_session_event_json_serialization() {
        let event = SessionEvent::SpeakerChanged {
            previous: Some(0),
            current: 1,
            timestamp: Duration::from_millis(250),
        };

        let json = serde_json::to_string(&event).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed["event"], "speaker_changed");
        assert_eq!(parsed["previous"], 0);
        assert_eq!(parsed["current"], 1);
        assert_eq!(parsed["timestamp_ms"], 250.0);
    }

    #[test]
    fn test_feature_vector_skips_raw_buffers() {
        let features = FeatureVector {
            volume: 0.5,
            waveform: vec![0.1; 16],
            frequency_magnitudes: vec![1.0; 8],
            ..Default::default()
        };

        let json = serde_json::to_string(&features).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed["volume"], 0.5);
        assert!(parsed.get("waveform").is_none());
        assert!(parsed.get("frequency_magnitudes").is_none());
    }

    #[test]
    fn test_session_status_serialization() {
        let json = serde_json::to_string(&SessionStatus::Running).unwrap();
        assert_eq!(json, r#""running""#);
    }

    #[test]
    fn test_samples_to_duration() {
        assert_eq!(samples_to_duration(0, 48000), Duration::ZERO);
        assert_eq!(samples_to_duration(48000, 48000), Duration::from_secs(1));
        assert_eq!(samples_to_duration(4, 1000), Duration::from_millis(4));
        assert_eq!(samples_to_duration(2048, 48000), Duration::from_nanos(42_666_666));
    }

    #[test]
    fn test_samples_to_duration_long_stream() {
        // 48kHz で 200 時間分（ナノ秒換算の積は u64 を超える）
        let samples = 48000u64 * 3600 * 200;
        assert!(samples.checked_mul(1_000_000_000).is_none());
        assert_eq!(samples_to_duration(samples, 48000), Duration::from_secs(3600 * 200));

        let later = samples_to_duration(samples + 2048, 48000);
        assert_eq!(later - samples_to_duration(samples, 48000), Duration::from_nanos(42_666_666));

        // 上限付近でも単調
        let max = samples_to_duration(u64::MAX, 48000);
        assert!(max > samples_to_duration(u64::MAX - 48000, 48000));
    }
}
