use crate::config::DetectorConfig;
use crate::error::SpeakerResult;
use crate::types::{Classification, FeatureVector, SpeakerId, VoiceProfile};

/// 話者分類に使うピッチの範囲 (Hz、両端を含まない)
///
/// 範囲外のフレームは話者の作成・切り替えに使わない
pub const PITCH_GATE: (f32, f32) = (60.0, 400.0);

/// 同一話者とみなすピッチの許容幅 (Hz)
///
/// 差がこの値に達するとピッチ類似度は 0 になる
pub const PITCH_TOLERANCE_HZ: f32 = 150.0;

/// 同一話者とみなすスペクトル重心の許容幅 (Hz)
pub const CENTROID_TOLERANCE_HZ: f32 = 1000.0;

/// 類似度におけるピッチの重み
pub const PITCH_WEIGHT: f32 = 0.6;

/// 類似度におけるスペクトル重心の重み
pub const SPECTRAL_WEIGHT: f32 = 0.4;

/// サンプル不足のプロファイルに対する中立の類似度
pub const UNSTABLE_SIMILARITY: f32 = 0.5;

/// EMA係数の上限
pub const MAX_ALPHA: f32 = 0.1;

/// 話者分類器の状態
///
/// 話者ID (`0..max_speakers`) で引く固定長のスロットテーブル。
/// 各スロットは空か、1人分のプロファイルを持つ。
/// スロット数を超える話者は構造的に作成できない。
#[derive(Clone, Debug, PartialEq)]
pub struct SpeakerDetectorState {
    slots: Vec<Option<VoiceProfile>>,
    current_speaker_id: Option<SpeakerId>,
    speaker_count: usize,
}

impl SpeakerDetectorState {
    /// 空の状態を作成
    pub fn new(max_speakers: usize) -> Self {
        Self {
            slots: vec![None; max_speakers],
            current_speaker_id: None,
            speaker_count: 0,
        }
    }

    /// スロット数（話者数の上限）
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// これまでに作成された話者数
    pub fn speaker_count(&self) -> usize {
        self.speaker_count
    }

    /// 最後に割り当てられた話者
    pub fn current_speaker_id(&self) -> Option<SpeakerId> {
        self.current_speaker_id
    }

    pub fn profile(&self, speaker_id: SpeakerId) -> Option<&VoiceProfile> {
        self.slots.get(speaker_id).and_then(Option::as_ref)
    }

    /// 作成済みプロファイルをID順に列挙
    pub fn profiles(&self) -> impl Iterator<Item = &VoiceProfile> {
        self.slots.iter().flatten()
    }

    pub fn is_full(&self) -> bool {
        self.speaker_count >= self.capacity()
    }
}

/// オンライン話者分類器 (Speaker Clusterer)
///
/// 入力フレームを最も似ている既存プロファイルに割り当てるか、
/// 似ているものが無ければ新しい話者を作成する貪欲な分類器。
/// 状態は `SpeakerDetectorState` として呼び出し側が保持し、
/// `classify` が新しい状態を返す。
///
/// プロファイルの統合・分割・再クラスタリングは行わない。
/// 初期に誤って割り当てられたフレームも、そのままプロファイルに残る。
///
/// # 類似度
///
/// - サンプル数が `profile_stable_samples` 未満: 0.5（中立）
/// - それ以外: `0.6 × max(0, 1 − |Δpitch| / 150) + 0.4 × max(0, 1 − |Δcentroid| / 1000)`
///
/// # Examples
///
/// ```
/// # use speaker_tally::clusterer::SpeakerClusterer;
/// # use speaker_tally::config::DetectorConfig;
/// # use speaker_tally::types::FeatureVector;
/// let clusterer = SpeakerClusterer::new(&DetectorConfig::default()).unwrap();
/// let state = clusterer.initial_state();
///
/// let features = FeatureVector { volume: 0.05, pitch: 120.0, spectral_centroid: 800.0, ..Default::default() };
/// let (result, state) = clusterer.classify(&state, &features);
///
/// assert_eq!(result.speaker_id, Some(0));
/// assert!(result.is_new);
/// assert_eq!(state.speaker_count(), 1);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct SpeakerClusterer {
    max_speakers: usize,
    change_threshold: f32,
    profile_stable_samples: u32,
}

impl SpeakerClusterer {
    /// 設定から分類器を作成
    ///
    /// # Errors
    ///
    /// 話者数上限や閾値が不正な場合は `SpeakerError::Configuration`
    pub fn new(config: &DetectorConfig) -> SpeakerResult<Self> {
        config.validate()?;
        Ok(Self {
            max_speakers: config.max_speakers,
            change_threshold: config.change_threshold,
            profile_stable_samples: config.profile_stable_samples,
        })
    }

    pub fn max_speakers(&self) -> usize {
        self.max_speakers
    }

    /// セッション開始時の空の状態
    pub fn initial_state(&self) -> SpeakerDetectorState {
        SpeakerDetectorState::new(self.max_speakers)
    }

    /// プロファイルと特徴量の類似度 (0.0 ~ 1.0)
    pub fn similarity(&self, profile: &VoiceProfile, features: &FeatureVector) -> f32 {
        if profile.samples < self.profile_stable_samples {
            return UNSTABLE_SIMILARITY;
        }

        let pitch_similarity =
            (1.0 - (features.pitch - profile.avg_pitch).abs() / PITCH_TOLERANCE_HZ).max(0.0);
        let spectral_similarity = (1.0
            - (features.spectral_centroid - profile.avg_spectral_centroid).abs()
                / CENTROID_TOLERANCE_HZ)
            .max(0.0);

        PITCH_WEIGHT * pitch_similarity + SPECTRAL_WEIGHT * spectral_similarity
    }

    /// フレームを話者に割り当て、更新後の状態を返す
    ///
    /// ピッチが `PITCH_GATE` の範囲外の場合は直前の話者を返し、状態は変更しない。
    pub fn classify(
        &self,
        state: &SpeakerDetectorState,
        features: &FeatureVector,
    ) -> (Classification, SpeakerDetectorState) {
        let (gate_low, gate_high) = PITCH_GATE;
        if !(features.pitch > gate_low && features.pitch < gate_high) {
            let result = Classification {
                speaker_id: state.current_speaker_id,
                is_new: false,
                confidence: 0.0,
            };
            return (result, state.clone());
        }

        // 最も類似度の高いプロファイルを探す（同値なら ID の小さい方）
        let mut best_similarity = 0.0f32;
        let mut best_speaker_id: Option<SpeakerId> = None;
        for profile in state.profiles() {
            let similarity = self.similarity(profile, features);
            if similarity > best_similarity {
                best_similarity = similarity;
                best_speaker_id = Some(profile.speaker_id);
            }
        }

        let mut next = state.clone();
        let result = match best_speaker_id {
            Some(speaker_id) if best_similarity >= self.change_threshold => {
                update_profile(&mut next, speaker_id, features);
                Classification {
                    speaker_id: Some(speaker_id),
                    is_new: false,
                    confidence: best_similarity,
                }
            }
            _ if !state.is_full() => {
                let speaker_id = next.speaker_count;
                next.slots[speaker_id] = Some(VoiceProfile {
                    speaker_id,
                    avg_pitch: features.pitch,
                    avg_spectral_centroid: features.spectral_centroid,
                    pitch_variance: 0.0,
                    samples: 1,
                });
                next.speaker_count += 1;
                log::debug!(
                    "新しい話者を検出: {} (pitch {:.1} Hz, centroid {:.1} Hz, 最大類似度 {:.2})",
                    speaker_id,
                    features.pitch,
                    features.spectral_centroid,
                    best_similarity
                );
                Classification {
                    speaker_id: Some(speaker_id),
                    is_new: true,
                    confidence: 1.0 - best_similarity,
                }
            }
            _ => {
                // 上限到達: 最も近い話者、どれにも似ていなければ話者 0 に割り当てる
                let speaker_id = best_speaker_id.unwrap_or(0);
                update_profile(&mut next, speaker_id, features);
                log::trace!(
                    "話者数上限のため話者 {} に割り当て (類似度 {:.2})",
                    speaker_id,
                    best_similarity
                );
                Classification {
                    speaker_id: Some(speaker_id),
                    is_new: false,
                    confidence: best_similarity,
                }
            }
        };

        next.current_speaker_id = result.speaker_id;
        (result, next)
    }
}

/// 既存プロファイルにフレームを指数移動平均で取り込む
///
/// `alpha = min(0.1, 1 / (samples + 1))` なので、最初の数フレームは大きく、
/// 以降は小さく反映される。
fn update_profile(state: &mut SpeakerDetectorState, speaker_id: SpeakerId, features: &FeatureVector) {
    let Some(profile) = state.slots.get_mut(speaker_id).and_then(Option::as_mut) else {
        return;
    };

    let alpha = MAX_ALPHA.min(1.0 / (profile.samples as f32 + 1.0));
    profile.avg_pitch = profile.avg_pitch * (1.0 - alpha) + features.pitch * alpha;
    profile.avg_spectral_centroid =
        profile.avg_spectral_centroid * (1.0 - alpha) + features.spectral_centroid * alpha;
    let deviation = features.pitch - profile.avg_pitch;
    profile.pitch_variance = profile.pitch_variance * (1.0 - alpha) + deviation * deviation * alpha;
    profile.samples += 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SpeakerError;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn clusterer(max_speakers: usize) -> SpeakerClusterer {
        SpeakerClusterer::new(&DetectorConfig::default().with_max_speakers(max_speakers)).unwrap()
    }

    fn voice(pitch: f32, spectral_centroid: f32) -> FeatureVector {
        FeatureVector {
            volume: 0.05,
            pitch,
            spectral_centroid,
            ..Default::default()
        }
    }

    fn feed(
        clusterer: &SpeakerClusterer,
        mut state: SpeakerDetectorState,
        features: &FeatureVector,
        frames: usize,
    ) -> (Vec<Classification>, SpeakerDetectorState) {
        let mut results = Vec::with_capacity(frames);
        for _ in 0..frames {
            let (result, next) = clusterer.classify(&state, features);
            results.push(result);
            state = next;
        }
        (results, state)
    }

    #[test]
    fn test_first_voiced_frame_creates_speaker() {
        let clusterer = clusterer(2);
        let (result, state) = clusterer.classify(&clusterer.initial_state(), &voice(120.0, 800.0));

        assert_eq!(result.speaker_id, Some(0));
        assert!(result.is_new);
        assert_eq!(result.confidence, 1.0);

        let profile = state.profile(0).unwrap();
        assert_eq!(profile.avg_pitch, 120.0);
        assert_eq!(profile.avg_spectral_centroid, 800.0);
        assert_eq!(profile.pitch_variance, 0.0);
        assert_eq!(profile.samples, 1);
        assert_eq!(state.current_speaker_id(), Some(0));
    }

    #[test]
    fn test_pitch_gate_rejects_frame() {
        let clusterer = clusterer(2);
        let initial = clusterer.initial_state();

        for pitch in [0.0, 60.0, 400.0, 750.0] {
            let (result, state) = clusterer.classify(&initial, &voice(pitch, 800.0));
            assert_eq!(result.speaker_id, None);
            assert!(!result.is_new);
            assert_eq!(result.confidence, 0.0);
            assert_eq!(state, initial);
        }

        // 話者がいる場合は直前の話者を返す
        let (_, state) = clusterer.classify(&initial, &voice(120.0, 800.0));
        let (result, after) = clusterer.classify(&state, &voice(0.0, 800.0));
        assert_eq!(result.speaker_id, Some(0));
        assert_eq!(after, state);
    }

    #[test]
    fn test_unstable_profile_has_neutral_similarity() {
        let clusterer = clusterer(2);
        let profile = VoiceProfile {
            speaker_id: 0,
            avg_pitch: 120.0,
            avg_spectral_centroid: 800.0,
            pitch_variance: 0.0,
            samples: 9,
        };
        assert_eq!(clusterer.similarity(&profile, &voice(390.0, 9000.0)), 0.5);
    }

    #[test]
    fn test_stable_profile_similarity() {
        let clusterer = clusterer(2);
        let profile = VoiceProfile {
            speaker_id: 0,
            avg_pitch: 120.0,
            avg_spectral_centroid: 800.0,
            pitch_variance: 0.0,
            samples: 10,
        };

        assert!((clusterer.similarity(&profile, &voice(120.0, 800.0)) - 1.0).abs() < 1e-6);

        // 0.6 × (1 − 100/150) + 0.4 × (1 − 700/1000) = 0.32
        let similarity = clusterer.similarity(&profile, &voice(220.0, 1500.0));
        assert!((similarity - 0.32).abs() < 1e-4);

        // 許容幅を超えると 0
        assert_eq!(clusterer.similarity(&profile, &voice(390.0, 3000.0)), 0.0);
    }

    #[test]
    fn test_ema_update() {
        let clusterer = clusterer(2);
        let (_, state) = clusterer.classify(&clusterer.initial_state(), &voice(100.0, 1000.0));

        // 2フレーム目: alpha = min(0.1, 1/2) = 0.1
        let (result, state) = clusterer.classify(&state, &voice(200.0, 2000.0));
        assert_eq!(result.speaker_id, Some(0));
        assert!(!result.is_new);
        assert_eq!(result.confidence, 0.5);

        let profile = state.profile(0).unwrap();
        assert!((profile.avg_pitch - 110.0).abs() < 1e-4);
        assert!((profile.avg_spectral_centroid - 1100.0).abs() < 1e-3);
        // (200 − 110)² × 0.1 = 810
        assert!((profile.pitch_variance - 810.0).abs() < 1e-2);
        assert_eq!(profile.samples, 2);
    }

    #[test]
    fn test_distinct_voice_creates_second_speaker() {
        let clusterer = clusterer(2);
        let (_, state) = feed(&clusterer, clusterer.initial_state(), &voice(120.0, 800.0), 20);
        assert_eq!(state.speaker_count(), 1);

        let (result, state) = clusterer.classify(&state, &voice(220.0, 1500.0));
        assert_eq!(result.speaker_id, Some(1));
        assert!(result.is_new);
        assert_eq!(state.speaker_count(), 2);
        assert_eq!(state.current_speaker_id(), Some(1));

        // 2人目のプロファイルが安定するまでは中立の類似度で2人目に割り当てられる
        let (results, _) = feed(&clusterer, state, &voice(220.0, 1500.0), 30);
        assert!(results.iter().all(|r| r.speaker_id == Some(1) && !r.is_new));
    }

    #[test]
    fn test_cap_reached_falls_back_to_best_match() {
        let clusterer = clusterer(2);
        let (_, state) = feed(&clusterer, clusterer.initial_state(), &voice(120.0, 800.0), 20);
        let (_, state) = feed(&clusterer, state, &voice(220.0, 1500.0), 20);
        assert!(state.is_full());

        // 話者 1 に少しだけ似ている
        let (result, state) = clusterer.classify(&state, &voice(350.0, 2300.0));
        assert_eq!(result.speaker_id, Some(1));
        assert!(!result.is_new);
        assert!(result.confidence < 0.4);
        assert_eq!(state.speaker_count(), 2);
    }

    #[test]
    fn test_cap_reached_without_any_match_uses_speaker_zero() {
        // どのプロファイルにも全く似ていないフレームは話者 0 に割り当てられる。
        // 話者 0 への誤帰属になり得るが、この挙動は意図的に維持している。
        let clusterer = clusterer(2);
        let (_, state) = feed(&clusterer, clusterer.initial_state(), &voice(100.0, 500.0), 20);
        let (_, state) = feed(&clusterer, state, &voice(230.0, 4000.0), 21);
        assert_eq!(state.speaker_count(), 2);

        let (result, state) = clusterer.classify(&state, &voice(390.0, 9000.0));
        assert_eq!(result.speaker_id, Some(0));
        assert_eq!(result.confidence, 0.0);
        assert_eq!(state.current_speaker_id(), Some(0));
        assert_eq!(state.profile(0).unwrap().samples, 21);
    }

    #[test]
    fn test_cap_invariant() {
        let mut rng = StdRng::seed_from_u64(99);

        for max_speakers in 2..=5 {
            let clusterer = clusterer(max_speakers);
            let mut state = clusterer.initial_state();
            let mut seen = std::collections::BTreeSet::new();

            for _ in 0..2000 {
                let features = voice(rng.random_range(0.0..600.0), rng.random_range(0.0..8000.0));
                let (result, next) = clusterer.classify(&state, &features);
                if let Some(id) = result.speaker_id {
                    assert!(id < max_speakers);
                    seen.insert(id);
                }
                state = next;
            }

            assert!(seen.len() <= max_speakers);
            assert!(state.speaker_count() <= max_speakers);
            assert_eq!(state.profiles().count(), state.speaker_count());
        }
    }

    #[test]
    fn test_deterministic() {
        let clusterer = clusterer(3);
        let (_, state) = feed(&clusterer, clusterer.initial_state(), &voice(150.0, 900.0), 15);
        let features = voice(210.0, 1300.0);

        let (a, state_a) = clusterer.classify(&state, &features);
        let (b, state_b) = clusterer.classify(&state, &features);
        assert_eq!(a, b);
        assert_eq!(state_a, state_b);
    }

    #[test]
    fn test_speaker_ids_assigned_in_order() {
        let clusterer = clusterer(3);
        let (_, state) = feed(&clusterer, clusterer.initial_state(), &voice(100.0, 500.0), 15);
        let (_, state) = feed(&clusterer, state, &voice(250.0, 2500.0), 15);
        let (first, state) = feed(&clusterer, state, &voice(380.0, 6000.0), 1);

        assert_eq!(first[0].speaker_id, Some(2));
        assert!(first[0].is_new);
        let ids: Vec<SpeakerId> = state.profiles().map(|p| p.speaker_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_invalid_config() {
        let err = SpeakerClusterer::new(&DetectorConfig::default().with_max_speakers(0)).unwrap_err();
        assert!(matches!(err, SpeakerError::Configuration(_)));
    }
}
