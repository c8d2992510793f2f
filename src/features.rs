use crate::config::validate_fft_size;
use crate::error::{SpeakerError, SpeakerResult};
use crate::types::{FeatureVector, Frame};

/// ピッチ探索の下限周波数 (Hz)
pub const PITCH_MIN_HZ: f32 = 50.0;

/// ピッチ探索の上限周波数 (Hz)
pub const PITCH_MAX_HZ: f32 = 500.0;

/// メルフィルタバンクの下端周波数 (Hz)
pub const MEL_LOW_HZ: f32 = 20.0;

/// 特徴量抽出器 (Feature Extractor)
///
/// 1フレーム分の時間波形と振幅スペクトルから、話者判定に使う
/// 固定サイズの特徴量を計算する。副作用は無く、同じ入力には同じ出力を返す。
///
/// # 特徴量
///
/// 1. 音量: 時間波形の RMS
/// 2. ゼロ交差率: 符号反転の回数 / サンプル数
/// 3. スペクトル重心: 振幅で重み付けした周波数の平均
/// 4. ピッチ: 50〜500 Hz の範囲で自己相関が最大となる周期
/// 5. メルバンド: 三角フィルタバンクのエネルギー（フレーム内最大値で正規化）
///
/// 無音などで分母が 0 になる場合はエラーにせず 0 を返す。
///
/// # Examples
///
/// ```
/// # use speaker_tally::features::FeatureExtractor;
/// let extractor = FeatureExtractor::new(48000, 2048, 13).unwrap();
///
/// let waveform = vec![0.0f32; 2048];
/// let spectrum = vec![0.0f32; 1024];
/// let features = extractor.extract(&waveform, &spectrum).unwrap();
///
/// assert_eq!(features.volume, 0.0);
/// assert_eq!(features.pitch, 0.0);
/// assert_eq!(features.spectral_centroid, 0.0);
/// assert_eq!(features.mel_bands.len(), 13);
/// ```
#[derive(Clone, Debug)]
pub struct FeatureExtractor {
    sample_rate: u32,
    fft_size: usize,
    /// メルフィルタバンク（バンド毎の (ビン番号, 重み) の疎表現）
    filter_bank: Vec<Vec<(usize, f32)>>,
}

impl FeatureExtractor {
    /// 新しい特徴量抽出器を作成
    ///
    /// # Arguments
    /// * `sample_rate` - サンプリングレート (Hz)
    /// * `fft_size` - FFTサイズ（時間波形の長さ）
    /// * `num_bands` - メルバンド数
    ///
    /// # Errors
    ///
    /// FFTサイズが範囲外、サンプリングレートまたはバンド数が 0 の場合
    pub fn new(sample_rate: u32, fft_size: usize, num_bands: usize) -> SpeakerResult<Self> {
        validate_fft_size(fft_size)?;
        if sample_rate == 0 {
            return Err(SpeakerError::configuration("sample_rate は 1 以上が必要です"));
        }
        if num_bands == 0 {
            return Err(SpeakerError::configuration("mel_bands は 1 以上が必要です"));
        }

        Ok(Self {
            sample_rate,
            fft_size,
            filter_bank: mel_filter_bank(sample_rate, fft_size, num_bands),
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn num_bands(&self) -> usize {
        self.filter_bank.len()
    }

    /// フレームから特徴量を抽出
    ///
    /// フレームのサンプリングレート・FFTサイズが抽出器と一致することも検証する。
    pub fn extract_frame(&self, frame: &Frame) -> SpeakerResult<FeatureVector> {
        if frame.sample_rate != self.sample_rate || frame.fft_size != self.fft_size {
            return Err(SpeakerError::invalid_input(format!(
                "フレーム形式が一致しません: {}Hz/FFT {} (期待値 {}Hz/FFT {})",
                frame.sample_rate, frame.fft_size, self.sample_rate, self.fft_size
            )));
        }
        self.extract(&frame.waveform, &frame.spectrum)
    }

    /// 時間波形と振幅スペクトルから特徴量を抽出
    ///
    /// # Errors
    ///
    /// バッファ長の不一致、空バッファ、非有限値、負の振幅を含む場合
    pub fn extract(&self, waveform: &[f32], spectrum: &[f32]) -> SpeakerResult<FeatureVector> {
        self.validate(waveform, spectrum)?;

        let volume = calculate_rms(waveform);
        let zero_crossing_rate = calculate_zero_crossing_rate(waveform);
        let spectral_centroid = self.calculate_spectral_centroid(spectrum);
        let pitch = self.detect_pitch(waveform);
        let mel_bands = self.calculate_mel_bands(spectrum);

        Ok(FeatureVector {
            volume,
            pitch,
            spectral_centroid,
            zero_crossing_rate,
            mel_bands,
            frequency_magnitudes: spectrum.to_vec(),
            waveform: waveform.to_vec(),
        })
    }

    fn validate(&self, waveform: &[f32], spectrum: &[f32]) -> SpeakerResult<()> {
        if waveform.is_empty() || spectrum.is_empty() {
            return Err(SpeakerError::invalid_input("空のバッファは処理できません"));
        }
        if waveform.len() != self.fft_size {
            return Err(SpeakerError::invalid_input(format!(
                "波形長 {} が FFT サイズ {} と一致しません",
                waveform.len(),
                self.fft_size
            )));
        }
        if spectrum.len() != self.fft_size / 2 {
            return Err(SpeakerError::invalid_input(format!(
                "スペクトル長 {} が {} と一致しません",
                spectrum.len(),
                self.fft_size / 2
            )));
        }
        if let Some(i) = waveform.iter().position(|s| !s.is_finite()) {
            return Err(SpeakerError::invalid_input(format!(
                "波形に非有限値が含まれています (index {})",
                i
            )));
        }
        if let Some(i) = spectrum.iter().position(|m| !m.is_finite() || *m < 0.0) {
            return Err(SpeakerError::invalid_input(format!(
                "スペクトルに不正な振幅が含まれています (index {})",
                i
            )));
        }
        Ok(())
    }

    /// ビン番号に対応する周波数 (Hz)
    fn bin_frequency(&self, bin: usize) -> f64 {
        bin as f64 * self.sample_rate as f64 / self.fft_size as f64
    }

    /// スペクトル重心を計算
    ///
    /// 振幅の総和が 0 の場合は 0 を返す
    fn calculate_spectral_centroid(&self, spectrum: &[f32]) -> f32 {
        let (weighted, total) = spectrum.iter().enumerate().fold(
            (0.0f64, 0.0f64),
            |(weighted, total), (i, &mag)| {
                let mag = mag as f64;
                (weighted + mag * self.bin_frequency(i), total + mag)
            },
        );

        if total > 0.0 {
            (weighted / total) as f32
        } else {
            0.0
        }
    }

    /// ピッチ探索の周期範囲 (サンプル数)
    ///
    /// 波形長を超えない範囲に制限される。探索できない場合は None
    pub fn pitch_period_range(&self) -> Option<(usize, usize)> {
        let min_period = ((self.sample_rate as f32 / PITCH_MAX_HZ).floor() as usize).max(1);
        let max_period =
            ((self.sample_rate as f32 / PITCH_MIN_HZ).floor() as usize).min(self.fft_size - 1);
        (min_period <= max_period).then_some((min_period, max_period))
    }

    /// 自己相関によるピッチ推定
    ///
    /// 正の相関が見つからない場合は 0 を返す
    fn detect_pitch(&self, waveform: &[f32]) -> f32 {
        let Some((min_period, max_period)) = self.pitch_period_range() else {
            return 0.0;
        };

        let mut best_period = 0;
        let mut best_correlation = 0.0f64;

        for period in min_period..=max_period {
            let correlation: f64 = waveform
                .iter()
                .zip(&waveform[period..])
                .map(|(&a, &b)| a as f64 * b as f64)
                .sum();

            if correlation > best_correlation {
                best_correlation = correlation;
                best_period = period;
            }
        }

        if best_period > 0 {
            self.sample_rate as f32 / best_period as f32
        } else {
            0.0
        }
    }

    /// メルバンドエネルギーを計算
    ///
    /// フレーム内の最大バンドエネルギーで正規化する（全て 0 の場合は 1 で割る）
    fn calculate_mel_bands(&self, spectrum: &[f32]) -> Vec<f32> {
        let energies: Vec<f32> = self
            .filter_bank
            .iter()
            .map(|filter| {
                filter
                    .iter()
                    .map(|&(bin, weight)| spectrum[bin] * weight)
                    .sum::<f32>()
            })
            .collect();

        let max_energy = energies.iter().copied().fold(0.0f32, f32::max);
        let norm = if max_energy > 0.0 { max_energy } else { 1.0 };

        energies.into_iter().map(|e| e / norm).collect()
    }
}

/// RMS (Root Mean Square) を計算
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_of_squares: f64 = samples.iter().map(|&s| s as f64 * s as f64).sum();
    (sum_of_squares / samples.len() as f64).sqrt() as f32
}

/// ゼロ交差率を計算
///
/// 0 は非負として扱い、連続するサンプル間の厳密な符号反転を数える
pub fn calculate_zero_crossing_rate(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let crossings = samples
        .windows(2)
        .filter(|pair| (pair[0] >= 0.0) != (pair[1] >= 0.0))
        .count();
    crossings as f32 / samples.len() as f32
}

/// 周波数 (Hz) をメル尺度に変換
pub fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

/// メル尺度を周波数 (Hz) に変換
pub fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10f32.powf(mel / 2595.0) - 1.0)
}

/// 三角メルフィルタバンクを構築
///
/// 20 Hz からナイキスト周波数までをメル尺度で等間隔に分割し、
/// 隣接するフィルタが半分ずつ重なるように配置する。
fn mel_filter_bank(sample_rate: u32, fft_size: usize, num_bands: usize) -> Vec<Vec<(usize, f32)>> {
    let num_bins = fft_size / 2;
    let nyquist = sample_rate as f32 / 2.0;
    let mel_low = hz_to_mel(MEL_LOW_HZ);
    let mel_high = hz_to_mel(nyquist);
    let mel_step = (mel_high - mel_low) / (num_bands + 1) as f32;

    // 各フィルタの端点・中心のビン番号
    let bin_points: Vec<usize> = (0..num_bands + 2)
        .map(|i| {
            let hz = mel_to_hz(mel_low + mel_step * i as f32);
            let bin = (hz * fft_size as f32 / sample_rate as f32).floor() as usize;
            bin.min(num_bins - 1)
        })
        .collect();

    (0..num_bands)
        .map(|band| {
            let start = bin_points[band];
            let center = bin_points[band + 1];
            let end = bin_points[band + 2];

            (start..=end)
                .filter_map(|bin| {
                    let weight = if bin < center {
                        (bin - start) as f32 / (center - start) as f32
                    } else if bin > center {
                        (end - bin) as f32 / (end - center) as f32
                    } else {
                        1.0
                    };
                    (weight > 0.0).then_some((bin, weight))
                })
                .collect()
        })
        .collect()
}
