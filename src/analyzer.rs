use crate::config::AnalysisConfig;
use crate::error::{SpeakerError, SpeakerResult};
use crate::types::{samples_to_duration, AudioChunk, Frame};
use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;
use std::time::Duration;

/// スペクトルの最大値（バイト範囲）
pub const MAX_MAGNITUDE: f32 = 255.0;

/// フレーム解析器
///
/// モノラルのサンプル列から、時間波形と振幅スペクトルを持つ `Frame` を作る。
///
/// # 処理の流れ
///
/// 1. Blackman窓を掛けて FFT
/// 2. 各ビンの振幅を FFTサイズで割る
/// 3. 前フレームと平滑化: `smoothing × 前回 + (1 - smoothing) × 今回`
/// 4. dB に変換し、`[min_decibels, max_decibels]` を `[0, 255]` に線形マップ
///
/// 平滑化のため状態を持つ。`analyze_chunk` はチャンクの欠落（キュー満杯による破棄など）を
/// 検出すると平滑化をリセットする。
pub struct FrameAnalyzer {
    sample_rate: u32,
    fft_size: usize,
    min_decibels: f32,
    max_decibels: f32,
    smoothing: f32,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    fft_buf: Vec<Complex32>,
    /// 平滑化済みの振幅（線形）
    smoothed: Vec<f32>,
    /// 1チャンクの長さ
    block_duration: Duration,
    /// 次に届くはずのチャンクの時刻
    next_timestamp: Option<Duration>,
}

impl FrameAnalyzer {
    /// # Errors
    ///
    /// 解析設定が不正な場合は `SpeakerError::Configuration`
    pub fn new(sample_rate: u32, config: &AnalysisConfig) -> SpeakerResult<Self> {
        config.validate()?;
        if sample_rate == 0 {
            return Err(SpeakerError::configuration("sample_rate は 1 以上が必要です"));
        }

        let fft_size = config.fft_size;
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(fft_size);

        Ok(Self {
            sample_rate,
            fft_size,
            min_decibels: config.min_decibels,
            max_decibels: config.max_decibels,
            smoothing: config.smoothing,
            fft,
            window: blackman_window(fft_size),
            fft_buf: vec![Complex32::new(0.0, 0.0); fft_size],
            smoothed: vec![0.0; fft_size / 2],
            block_duration: samples_to_duration(fft_size as u64, sample_rate),
            next_timestamp: None,
        })
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// サンプル列を解析してフレームを作る
    ///
    /// # Errors
    ///
    /// サンプル数が FFTサイズと一致しない場合は `SpeakerError::InvalidInput`
    pub fn analyze(&mut self, samples: &[f32], timestamp: Duration) -> SpeakerResult<Frame> {
        if samples.len() != self.fft_size {
            return Err(SpeakerError::invalid_input(format!(
                "サンプル数 {} が FFT サイズ {} と一致しません",
                samples.len(),
                self.fft_size
            )));
        }

        for (dst, (&x, &w)) in self.fft_buf.iter_mut().zip(samples.iter().zip(&self.window)) {
            *dst = Complex32::new(x * w, 0.0);
        }
        self.fft.process(&mut self.fft_buf);

        let scale = 1.0 / self.fft_size as f32;
        let range = self.max_decibels - self.min_decibels;
        let mut spectrum = Vec::with_capacity(self.fft_size / 2);

        for (smoothed, bin) in self.smoothed.iter_mut().zip(&self.fft_buf) {
            let magnitude = bin.norm() * scale;
            let value = self.smoothing * *smoothed + (1.0 - self.smoothing) * magnitude;
            // NaN は次のフレームに持ち越さない
            *smoothed = if value.is_finite() { value } else { 0.0 };

            let db = 20.0 * smoothed.log10();
            let scaled = MAX_MAGNITUDE * (db - self.min_decibels) / range;
            spectrum.push(if scaled.is_finite() {
                scaled.clamp(0.0, MAX_MAGNITUDE).floor()
            } else {
                0.0
            });
        }

        Ok(Frame {
            timestamp,
            waveform: samples.to_vec(),
            spectrum,
            sample_rate: self.sample_rate,
            fft_size: self.fft_size,
        })
    }

    /// 入力チャンクを解析してフレームを作る
    ///
    /// 前のチャンクから時間が飛んでいる場合は平滑化をリセットしてから解析する。
    ///
    /// # Errors
    ///
    /// チャンクの形式（サンプリングレート・チャンネル数）やサンプル数が
    /// 解析器と一致しない場合は `SpeakerError::InvalidInput`
    pub fn analyze_chunk(&mut self, chunk: &AudioChunk) -> SpeakerResult<Frame> {
        if chunk.format.sample_rate != self.sample_rate || chunk.format.channels != 1 {
            return Err(SpeakerError::invalid_input(format!(
                "チャンク形式が一致しません: {}Hz/{}ch (期待値 {}Hz/1ch)",
                chunk.format.sample_rate, chunk.format.channels, self.sample_rate
            )));
        }

        if let Some(expected) = self.next_timestamp {
            if chunk.timestamp > expected + self.block_duration / 2 {
                log::debug!(
                    "チャンクの欠落を検出 ({:?})、平滑化をリセット",
                    chunk.timestamp - expected
                );
                self.reset();
            }
        }

        let frame = self.analyze(&chunk.samples, chunk.timestamp)?;
        self.next_timestamp = Some(chunk.timestamp + self.block_duration);
        Ok(frame)
    }

    /// 平滑化の状態を破棄する
    pub fn reset(&mut self) {
        self.smoothed.iter_mut().for_each(|s| *s = 0.0);
        self.next_timestamp = None;
    }
}

/// Blackman窓 (a0 = 0.42, a1 = 0.5, a2 = 0.08)
fn blackman_window(size: usize) -> Vec<f32> {
    let n = size as f32;
    (0..size)
        .map(|i| {
            let x = 2.0 * PI * i as f32 / n;
            0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos()
        })
        .collect()
}
