use crate::config::AudioConfig;
use crate::types::{samples_to_duration, AudioChunk, AudioFormat};
use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Sample, SizedSample};
use regex_lite::Regex;
use tokio::sync::mpsc;

/// 入力デバイスとして使わないデバイス名
const EXCLUDED_DEVICE_PATTERN: &str =
    "MacBook (Air|Pro)|AirPods|iPhone|Webcam|Background|Microsoft Teams|ZoomAudioDevice";

/// インターリーブされた入力をモノラルのブロックに組み立てる
///
/// ドライバのコールバック長は一定ではないので、端数は次回に持ち越す。
/// タイムスタンプはストリーム開始からのサンプル数で計算する。
#[derive(Debug)]
pub struct ChunkAssembler {
    block_size: usize,
    sample_rate: u32,
    pending: Vec<f32>,
    /// 送出済みのサンプル数（モノラル換算）
    emitted: u64,
}

impl ChunkAssembler {
    pub fn new(block_size: usize, sample_rate: u32) -> Self {
        Self {
            block_size,
            sample_rate,
            pending: Vec::with_capacity(block_size * 2),
            emitted: 0,
        }
    }

    /// インターリーブされたサンプルを追加し、揃ったブロックを返す
    pub fn push_interleaved(&mut self, data: &[f32], channels: u16) -> Vec<AudioChunk> {
        let channels = channels.max(1) as usize;
        self.pending.extend(
            data.chunks_exact(channels)
                .map(|frame| (frame.iter().sum::<f32>() / channels as f32).clamp(-1.0, 1.0)),
        );

        let mut chunks = Vec::new();
        while self.pending.len() >= self.block_size {
            let samples: Vec<f32> = self.pending.drain(..self.block_size).collect();
            let timestamp = samples_to_duration(self.emitted, self.sample_rate);
            self.emitted += self.block_size as u64;

            chunks.push(AudioChunk {
                samples,
                format: AudioFormat {
                    sample_rate: self.sample_rate,
                    channels: 1,
                },
                timestamp,
            });
        }
        chunks
    }
}

/// オーディオデバイスからの音声入力
///
/// 複数チャンネルのデバイスはモノラルにダウンミックスし、
/// 解析器のFFTサイズ単位で `AudioChunk` を送信する。
pub struct AudioInput {
    device: cpal::Device,
    config: cpal::StreamConfig,
    stream: Option<cpal::Stream>,
    num_channels: u16,
}

impl AudioInput {
    /// 新しいAudioInputを作成
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        log::info!("設定: {:?}", config);

        let device = if config.device_id == "default" {
            host.default_input_device()
                .context("デフォルト入力デバイスが見つかりません")?
        } else {
            Self::input_devices()?
                .into_iter()
                .find(|d| d.name().ok().as_deref() == Some(&config.device_id))
                .with_context(|| format!("デバイスが見つかりません: {}", config.device_id))?
        };

        log::info!("入力デバイス: {:?}", device.name());

        let default_config = device
            .default_input_config()
            .context("デフォルト入力設定が取得できません")?;

        log::info!(
            "デバイス設定: {:?}, {}Hz, {}ch",
            default_config.sample_format(),
            default_config.sample_rate().0,
            default_config.channels()
        );

        let stream_config = cpal::StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        Ok(Self {
            device,
            config: stream_config,
            stream: None,
            num_channels: config.channels,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    /// ストリームを開始
    ///
    /// # Arguments
    /// * `block_size` - 1チャンクのサンプル数（FFTサイズ）
    /// * `sender` - チャンクの送信先
    pub fn start(&mut self, block_size: usize, sender: mpsc::Sender<AudioChunk>) -> Result<()> {
        let default_config = self.device.default_input_config()?;

        let stream = match default_config.sample_format() {
            cpal::SampleFormat::F32 => self.build_stream::<f32>(block_size, sender)?,
            cpal::SampleFormat::I16 => self.build_stream::<i16>(block_size, sender)?,
            cpal::SampleFormat::U16 => self.build_stream::<u16>(block_size, sender)?,
            cpal::SampleFormat::I32 => self.build_stream::<i32>(block_size, sender)?,
            _ => anyhow::bail!("サポートされていないサンプルフォーマット"),
        };

        stream.play().context("ストリームの再生開始に失敗")?;
        self.stream = Some(stream);

        log::info!("音声入力ストリームを開始しました");

        Ok(())
    }

    fn build_stream<T>(&self, block_size: usize, sender: mpsc::Sender<AudioChunk>) -> Result<cpal::Stream>
    where
        T: SizedSample + Sample + Send + 'static,
        <T as Sample>::Float: Into<f32>,
    {
        let num_channels = self.num_channels;
        let mut assembler = ChunkAssembler::new(block_size, self.sample_rate());
        let mut converted: Vec<f32> = Vec::new();

        let data_callback = move |data: &[T], _info: &cpal::InputCallbackInfo| {
            converted.clear();
            converted.extend(data.iter().map(|s| s.to_float_sample().into()));

            for chunk in assembler.push_interleaved(&converted, num_channels) {
                // ドライバのスレッドはブロックしない
                match sender.try_send(chunk) {
                    Ok(_) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        log::warn!("フレーム送信失敗: バッファ満杯");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        log::warn!("フレーム送信失敗: チャンネルクローズ");
                    }
                }
            }
        };

        let error_callback = move |err| {
            log::error!("ストリームエラー: {}", err);
        };

        let stream = self
            .device
            .build_input_stream(&self.config, data_callback, error_callback, None)
            .context("入力ストリームの構築に失敗")?;

        Ok(stream)
    }

    /// ストリームを停止
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            log::info!("音声入力ストリームを停止しました");
        }
    }

    /// デバイス一覧を表示
    pub fn list_devices() -> Result<()> {
        println!("利用可能な入力デバイス:");
        println!();

        for (idx, device) in Self::input_devices()?.into_iter().enumerate() {
            let name = device.name()?;
            println!("  [{}] {}", idx, name);

            device.supported_input_configs()?.for_each(|config_range| {
                println!(
                    "      フォーマット: {:?}, {}-{}Hz, {}ch",
                    config_range.sample_format(),
                    config_range.min_sample_rate().0,
                    config_range.max_sample_rate().0,
                    config_range.channels()
                );
            });
            println!();
        }

        Ok(())
    }

    /// 内蔵マイク・WebCam など、会話の入力に使わないデバイスを除外したデバイス一覧
    fn input_devices() -> Result<Vec<cpal::Device>> {
        let host = cpal::default_host();
        let excluded = Regex::new(EXCLUDED_DEVICE_PATTERN).context("除外パターンが不正です")?;
        let devices = host
            .input_devices()?
            .filter(|device| match device.name() {
                Ok(name) => !is_excluded(&excluded, &name),
                Err(_) => true,
            })
            .collect();
        Ok(devices)
    }
}

fn is_excluded(pattern: &Regex, name: &str) -> bool {
    pattern.is_match(name)
}

impl Drop for AudioInput {
    fn drop(&mut self) {
        self.stop();
    }
}
