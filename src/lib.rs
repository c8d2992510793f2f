//! speaker-tally - 会話の話者別発話時間をリアルタイムに集計するシステム
//!
//! このクレートは、マイク入力を一定間隔のフレームに分割して音響特徴量を求め、
//! 音声区間の検出と話者のオンライン分類を行い、話者毎の発話時間を集計します。
//!
//! # 主な機能
//!
//! - **特徴量抽出**: 音量 (RMS)・ピッチ・スペクトル重心・ゼロ交差率・メルバンド
//! - **VAD (Voice Activity Detection)**: 音量優先の緩い判定で小さな声も拾う
//! - **話者分類**: ピッチとスペクトル重心のプロファイルによるオンラインクラスタリング
//! - **集計**: 話者毎の累積発話時間・発話割合・無音時間
//! - **JSON Lines出力**: 話者の切り替わりなどのイベントを標準出力へ
//!
//! # アーキテクチャ
//!
//! ```text
//! [Microphone] → [AudioInput] → [FrameAnalyzer] → [SpeakerSession]
//!                                                        ↓
//!                                                [FeatureExtractor]
//!                                                        ↓
//!                                             [VoiceActivityDetector]
//!                                                        ↓ 音声あり
//!                                                [SpeakerClusterer]
//!                                                        ↓
//!                                                [SessionAggregator] → [SessionObserver]
//! ```
//!
//! # 使用例
//!
//! ```no_run
//! use speaker_tally::config::Config;
//! use speaker_tally::session::SpeakerSession;
//!
//! // 設定ファイルを読み込み
//! let config = Config::load_or_default("config.toml").unwrap();
//!
//! let mut session = SpeakerSession::from_config(&config).unwrap();
//! session.start(config.detector.max_speakers).unwrap();
//! ```

pub mod aggregator;
pub mod analyzer;
pub mod audio_input;
pub mod clusterer;
pub mod config;
pub mod error;
pub mod features;
pub mod output;
pub mod session;
pub mod types;
pub mod vad;
