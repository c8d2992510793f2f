use crate::aggregator::SessionAggregator;
use crate::clusterer::{SpeakerClusterer, SpeakerDetectorState};
use crate::config::{Config, DetectorConfig};
use crate::error::{SpeakerError, SpeakerResult};
use crate::features::FeatureExtractor;
use crate::types::{FeatureVector, Frame, FrameReport, SessionEvent, SessionStatus, Speaker, SpeakerId};
use crate::vad::VoiceActivityDetector;
use std::time::Duration;

/// セッションの通知を受け取るオブザーバー
///
/// 必要なメソッドだけ実装すればよい。
pub trait SessionObserver: Send + 'static {
    /// 1フレーム処理する毎に呼ばれる
    fn on_frame(&mut self, _report: &FrameReport) {}

    /// 発話中の話者が切り替わった
    fn on_speaker_change(&mut self, _previous: Option<SpeakerId>, _current: SpeakerId, _timestamp: Duration) {}

    /// 音声区間の開始/終了
    fn on_voice_activity(&mut self, _active: bool, _timestamp: Duration) {}

    /// 新しい話者が名簿に追加された
    fn on_speaker_joined(&mut self, _id: SpeakerId, _timestamp: Duration) {}

    /// セッション状態が変わった
    fn on_status_change(&mut self, _status: SessionStatus) {}
}

/// セッションの可変状態
///
/// リセット・開始時はこの値ごと置き換える。
#[derive(Clone, Debug)]
struct SessionState {
    status: SessionStatus,
    detector_state: SpeakerDetectorState,
    aggregator: SessionAggregator,
    /// 最初のフレームの形式で作成する（以降の形式はこれに固定）
    extractor: Option<FeatureExtractor>,
    last_timestamp: Option<Duration>,
    last_features: Option<FeatureVector>,
}

impl SessionState {
    fn new(status: SessionStatus, clusterer: &SpeakerClusterer, config: &DetectorConfig) -> Self {
        Self {
            status,
            detector_state: clusterer.initial_state(),
            aggregator: SessionAggregator::new(config.min_speech_duration()),
            extractor: None,
            last_timestamp: None,
            last_features: None,
        }
    }
}

/// 話者集計セッション
///
/// フレーム毎に 特徴量抽出 → VAD → 話者分類 → 集計 を同期的に実行し、
/// 結果をオブザーバーに通知する。
///
/// # Architecture
///
/// ```text
/// Frame ──> FeatureExtractor ──> VoiceActivityDetector ──┬─ 無音 ──────────────┐
///                                                        │                      v
///                                                        └─ 音声 ─> Clusterer ─> Aggregator ─> FrameReport
/// ```
///
/// # Examples
///
/// ```
/// # use speaker_tally::session::SpeakerSession;
/// # use speaker_tally::config::DetectorConfig;
/// # use speaker_tally::types::{Frame, SessionStatus};
/// # use std::time::Duration;
/// let mut session = SpeakerSession::new(&DetectorConfig::default(), 13).unwrap();
/// session.start(2).unwrap();
///
/// let frame = Frame {
///     timestamp: Duration::ZERO,
///     waveform: vec![0.0; 2048],
///     spectrum: vec![0.0; 1024],
///     sample_rate: 48000,
///     fft_size: 2048,
/// };
/// let report = session.process_frame(&frame).unwrap().unwrap();
/// assert!(!report.voice_active);
///
/// session.stop();
/// assert_eq!(session.status(), SessionStatus::Stopped);
/// ```
pub struct SpeakerSession {
    /// 作成時の設定（`reset` で戻す先）
    initial_config: DetectorConfig,
    initial_clusterer: SpeakerClusterer,
    config: DetectorConfig,
    mel_bands: usize,
    vad: VoiceActivityDetector,
    clusterer: SpeakerClusterer,
    state: SessionState,
    observers: Vec<Box<dyn SessionObserver>>,
}

impl SpeakerSession {
    /// 新しいセッションを作成（Idle 状態）
    ///
    /// # Errors
    ///
    /// 設定値が不正な場合は `SpeakerError::Configuration`
    pub fn new(config: &DetectorConfig, mel_bands: usize) -> SpeakerResult<Self> {
        if mel_bands == 0 {
            return Err(SpeakerError::configuration("mel_bands は 1 以上が必要です"));
        }
        let clusterer = SpeakerClusterer::new(config)?;
        let state = SessionState::new(SessionStatus::Idle, &clusterer, config);

        Ok(Self {
            initial_config: config.clone(),
            initial_clusterer: clusterer.clone(),
            config: config.clone(),
            mel_bands,
            vad: VoiceActivityDetector::from_config(config),
            clusterer,
            state,
            observers: Vec::new(),
        })
    }

    /// アプリケーション設定から作成
    pub fn from_config(config: &Config) -> SpeakerResult<Self> {
        config.analysis.validate()?;
        Self::new(&config.detector, config.analysis.mel_bands)
    }

    /// オブザーバーを登録
    pub fn add_observer(&mut self, observer: Box<dyn SessionObserver>) {
        self.observers.push(observer);
    }

    /// セッションを開始
    ///
    /// 話者数上限を指定して分類器を作り直し、名簿を空にする。
    /// 実行中に呼んだ場合も最初からやり直す。
    ///
    /// # Errors
    ///
    /// `max_speakers` がポリシー範囲外の場合。この場合セッションは変更されない。
    pub fn start(&mut self, max_speakers: usize) -> SpeakerResult<()> {
        let config = self.config.with_max_speakers(max_speakers);
        let clusterer = SpeakerClusterer::new(&config)?;

        self.state = SessionState::new(SessionStatus::Running, &clusterer, &config);
        self.clusterer = clusterer;
        self.config = config;

        log::info!("セッション開始 (最大話者数: {})", max_speakers);
        self.notify_status();
        Ok(())
    }

    /// 一時停止（発話中の区間を閉じる）
    pub fn pause(&mut self) {
        if self.state.status != SessionStatus::Running {
            return;
        }
        self.finalize_intervals();
        self.state.status = SessionStatus::Paused;
        log::info!("セッション一時停止");
        self.notify_status();
    }

    /// 一時停止から再開
    pub fn resume(&mut self) {
        if self.state.status != SessionStatus::Paused {
            return;
        }
        self.state.status = SessionStatus::Running;
        log::info!("セッション再開");
        self.notify_status();
    }

    /// セッションを停止
    ///
    /// 発話中の区間を確定させる。累積時間と名簿は保持される。
    pub fn stop(&mut self) {
        match self.state.status {
            SessionStatus::Running | SessionStatus::Paused => {}
            SessionStatus::Idle | SessionStatus::Stopped => return,
        }
        self.finalize_intervals();
        self.state.status = SessionStatus::Stopped;
        log::info!(
            "セッション停止 (話者数: {}, 経過時間: {:.1}秒)",
            self.state.aggregator.speakers().len(),
            self.state.aggregator.elapsed().as_secs_f64()
        );
        self.notify_status();
    }

    /// 初期状態（Idle、話者なし）に戻す
    ///
    /// 話者数上限も作成時の設定に戻る。何度呼んでも同じ状態になる。
    pub fn reset(&mut self) {
        self.config = self.initial_config.clone();
        self.clusterer = self.initial_clusterer.clone();
        self.state = SessionState::new(SessionStatus::Idle, &self.clusterer, &self.config);
        log::info!("セッションをリセット");
        self.notify_status();
    }

    /// 1フレームを処理
    ///
    /// # Returns
    /// * `Ok(Some(report))` - 処理結果
    /// * `Ok(None)` - 実行中でないためフレームを無視した
    ///
    /// # Errors
    ///
    /// フレームが不正な場合は `SpeakerError::InvalidInput`。
    /// この場合セッションの状態は一切変更されない。
    pub fn process_frame(&mut self, frame: &Frame) -> SpeakerResult<Option<FrameReport>> {
        if self.state.status != SessionStatus::Running {
            return Ok(None);
        }

        if let Some(last) = self.state.last_timestamp {
            if frame.timestamp < last {
                return Err(SpeakerError::invalid_input(format!(
                    "タイムスタンプが逆行しています: {:?} < {:?}",
                    frame.timestamp, last
                )));
            }
        }

        let features = match &self.state.extractor {
            Some(extractor) => extractor.extract_frame(frame)?,
            None => {
                let extractor = FeatureExtractor::new(frame.sample_rate, frame.fft_size, self.mel_bands)
                    .map_err(|e| SpeakerError::invalid_input(e.to_string()))?;
                let features = extractor.extract_frame(frame)?;
                log::debug!(
                    "フレーム形式を固定: {}Hz, FFT {}",
                    frame.sample_rate,
                    frame.fft_size
                );
                self.state.extractor = Some(extractor);
                features
            }
        };

        let voice_active = self.vad.is_voice_active(&features);

        let classification = if voice_active {
            let (classification, next) = self.clusterer.classify(&self.state.detector_state, &features);
            self.state.detector_state = next;
            Some(classification)
        } else {
            None
        };

        let speaker = classification.and_then(|c| c.speaker_id);
        let events = self.state.aggregator.update(frame.timestamp, voice_active, speaker);

        self.state.last_timestamp = Some(frame.timestamp);
        self.state.last_features = Some(features.clone());

        let report = FrameReport {
            timestamp: frame.timestamp,
            features,
            voice_active,
            speaker_id: self.state.aggregator.current_speaker(),
            classification,
            speakers: self.state.aggregator.speakers(),
            events,
        };

        for observer in &mut self.observers {
            observer.on_frame(&report);
        }
        self.notify_events(&report.events);

        Ok(Some(report))
    }

    fn finalize_intervals(&mut self) {
        let Some(now) = self.state.last_timestamp else {
            return;
        };
        let events = self.state.aggregator.finalize(now);
        self.notify_events(&events);
    }

    fn notify_events(&mut self, events: &[SessionEvent]) {
        for event in events {
            for observer in &mut self.observers {
                match *event {
                    SessionEvent::SpeakerChanged {
                        previous,
                        current,
                        timestamp,
                    } => observer.on_speaker_change(previous, current, timestamp),
                    SessionEvent::VoiceActivityChanged { active, timestamp } => {
                        observer.on_voice_activity(active, timestamp)
                    }
                    SessionEvent::SpeakerJoined { id, timestamp } => observer.on_speaker_joined(id, timestamp),
                }
            }
        }
    }

    fn notify_status(&mut self) {
        let status = self.state.status;
        for observer in &mut self.observers {
            observer.on_status_change(status);
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.state.status
    }

    pub fn max_speakers(&self) -> usize {
        self.clusterer.max_speakers()
    }

    /// 話者名簿のスナップショット（ID昇順）
    pub fn speakers(&self) -> Vec<Speaker> {
        self.state.aggregator.speakers()
    }

    pub fn current_speaker(&self) -> Option<SpeakerId> {
        self.state.aggregator.current_speaker()
    }

    pub fn detector_state(&self) -> &SpeakerDetectorState {
        &self.state.detector_state
    }

    pub fn aggregator(&self) -> &SessionAggregator {
        &self.state.aggregator
    }

    /// 最後に処理したフレームの特徴量
    pub fn last_features(&self) -> Option<&FeatureVector> {
        self.state.last_features.as_ref()
    }

    /// 最後に処理したフレームの時刻
    pub fn last_timestamp(&self) -> Option<Duration> {
        self.state.last_timestamp
    }
}
