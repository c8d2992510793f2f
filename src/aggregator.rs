use crate::types::{SessionEvent, Speaker, SpeakerId};
use std::collections::BTreeMap;
use std::time::Duration;

/// 話者毎の発話時間集計器 (Session Aggregator)
///
/// フレーム毎の (時刻, 音声有無, 話者) を受け取り、話者名簿と累積発話時間を管理する。
///
/// # 集計規則
///
/// - 無音フレーム: 発話中の話者の区間を閉じる。区間が `min_speech_duration` を
///   超える場合のみ累積時間に加算する（1フレームだけの誤検出対策）
/// - 話者の切り替え: 直前の話者の区間を無条件に閉じ、新しい話者の区間を開始する
/// - 初めて現れた話者は累積時間 0 で名簿に追加する
///
/// 発話中の話者がいない時間は無音時間として集計するので、
/// `Σ total_time + silence_time + debounced_time = elapsed` が常に成り立つ
/// （発話中・無音中の区間は `finalize` で閉じた後）。
///
/// # Examples
///
/// ```
/// # use speaker_tally::aggregator::SessionAggregator;
/// # use std::time::Duration;
/// let mut aggregator = SessionAggregator::new(Duration::from_millis(50));
///
/// aggregator.update(Duration::from_millis(0), true, Some(0));
/// aggregator.update(Duration::from_millis(500), true, Some(0));
/// aggregator.update(Duration::from_millis(1000), false, None);
///
/// let speakers = aggregator.speakers();
/// assert_eq!(speakers[0].total_time, Duration::from_millis(1000));
/// assert!(!speakers[0].is_active);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct SessionAggregator {
    min_speech_duration: Duration,
    speakers: BTreeMap<SpeakerId, Speaker>,
    /// 発話中の話者
    current_speaker: Option<SpeakerId>,
    /// 発話中の区間の開始時刻
    last_speaking_time: Option<Duration>,
    /// 直前のフレームの音声判定
    voice_active: bool,
    /// 最初のフレームの時刻
    origin: Option<Duration>,
    last_timestamp: Option<Duration>,
    /// 無音区間の開始時刻
    silence_since: Option<Duration>,
    silence_time: Duration,
    debounced_time: Duration,
    /// `finalize` で区間を閉じた時刻（次のフレームまでは集計を止める）
    suspended_at: Option<Duration>,
    suspended_time: Duration,
}

impl SessionAggregator {
    pub fn new(min_speech_duration: Duration) -> Self {
        Self {
            min_speech_duration,
            speakers: BTreeMap::new(),
            current_speaker: None,
            last_speaking_time: None,
            voice_active: false,
            origin: None,
            last_timestamp: None,
            silence_since: None,
            silence_time: Duration::ZERO,
            debounced_time: Duration::ZERO,
            suspended_at: None,
            suspended_time: Duration::ZERO,
        }
    }

    /// 1フレーム分の判定結果を反映する
    ///
    /// # Arguments
    /// * `now` - フレームの時刻
    /// * `voice_active` - VADの判定
    /// * `speaker` - 話者分類の結果（音声なし、または未分類の場合は None）
    ///
    /// # Returns
    /// このフレームで発生したイベント
    pub fn update(
        &mut self,
        now: Duration,
        voice_active: bool,
        speaker: Option<SpeakerId>,
    ) -> Vec<SessionEvent> {
        self.begin_frame(now);

        let mut events = Vec::new();

        if voice_active != self.voice_active {
            self.voice_active = voice_active;
            events.push(SessionEvent::VoiceActivityChanged {
                active: voice_active,
                timestamp: now,
            });
        }

        // 音声ありでも話者が決まらない場合は現在の話者を継続する
        let speaker = if voice_active {
            speaker.or(self.current_speaker)
        } else {
            None
        };

        match speaker {
            Some(id) => {
                if !self.speakers.contains_key(&id) {
                    self.speakers.insert(id, Speaker::new(id));
                    events.push(SessionEvent::SpeakerJoined { id, timestamp: now });
                }

                if self.current_speaker != Some(id) {
                    let previous = self.current_speaker;
                    match previous {
                        Some(previous_id) => self.close_interval(previous_id, now, false),
                        None => self.close_silence(now),
                    }

                    self.current_speaker = Some(id);
                    self.last_speaking_time = Some(now);
                    log::debug!("話者切り替え: {:?} -> {} ({:?})", previous, id, now);
                    events.push(SessionEvent::SpeakerChanged {
                        previous,
                        current: id,
                        timestamp: now,
                    });
                }

                for speaker in self.speakers.values_mut() {
                    speaker.is_active = speaker.id == id;
                }
                if let Some(speaker) = self.speakers.get_mut(&id) {
                    speaker.last_active_time = Some(now);
                }
            }
            None => {
                if let Some(previous_id) = self.current_speaker {
                    self.close_interval(previous_id, now, true);
                    self.silence_since = Some(now);
                }
                for speaker in self.speakers.values_mut() {
                    speaker.is_active = false;
                }
            }
        }

        events
    }

    /// 発話中・無音中の区間を `now` で閉じる
    ///
    /// 停止・一時停止時に呼ぶ。累積時間は破棄しない。
    /// 次に `update` されるまでの時間は集計対象外になる。
    pub fn finalize(&mut self, now: Duration) -> Vec<SessionEvent> {
        if self.suspended_at.is_some() || self.origin.is_none() {
            return Vec::new();
        }
        let now = self.last_timestamp.map_or(now, |last| now.max(last));
        self.last_timestamp = Some(now);

        let mut events = Vec::new();
        match self.current_speaker {
            Some(id) => self.close_interval(id, now, false),
            None => self.close_silence(now),
        }
        for speaker in self.speakers.values_mut() {
            speaker.is_active = false;
        }
        if self.voice_active {
            self.voice_active = false;
            events.push(SessionEvent::VoiceActivityChanged {
                active: false,
                timestamp: now,
            });
        }
        self.suspended_at = Some(now);
        events
    }

    fn begin_frame(&mut self, now: Duration) {
        if self.origin.is_none() {
            self.origin = Some(now);
            self.silence_since = Some(now);
        }
        if let Some(suspended_at) = self.suspended_at.take() {
            self.suspended_time += now.saturating_sub(suspended_at);
            self.silence_since = Some(now);
        }
        self.last_timestamp = Some(now);
    }

    /// 話者の発話区間を閉じる
    ///
    /// `gated` の場合、`min_speech_duration` 以下の区間は加算しない
    fn close_interval(&mut self, id: SpeakerId, now: Duration, gated: bool) {
        let started = self.last_speaking_time.take().unwrap_or(now);
        let elapsed = now.saturating_sub(started);

        if let Some(speaker) = self.speakers.get_mut(&id) {
            if !gated || elapsed > self.min_speech_duration {
                speaker.total_time += elapsed;
            } else {
                log::trace!("話者 {} の短い発話を破棄: {:?}", id, elapsed);
                self.debounced_time += elapsed;
            }
            speaker.is_active = false;
        }
        self.current_speaker = None;
    }

    fn close_silence(&mut self, now: Duration) {
        if let Some(since) = self.silence_since.take() {
            self.silence_time += now.saturating_sub(since);
        }
    }

    /// 話者名簿のスナップショット（ID昇順）
    pub fn speakers(&self) -> Vec<Speaker> {
        self.speakers.values().cloned().collect()
    }

    pub fn speaker(&self, id: SpeakerId) -> Option<&Speaker> {
        self.speakers.get(&id)
    }

    pub fn current_speaker(&self) -> Option<SpeakerId> {
        self.current_speaker
    }

    pub fn is_voice_active(&self) -> bool {
        self.voice_active
    }

    /// 発話中の区間を含めた発話時間
    pub fn speaking_time(&self, id: SpeakerId, now: Duration) -> Option<Duration> {
        let speaker = self.speakers.get(&id)?;
        let in_flight = match (self.current_speaker, self.last_speaking_time) {
            (Some(current), Some(started)) if current == id => now.saturating_sub(started),
            _ => Duration::ZERO,
        };
        Some(speaker.total_time + in_flight)
    }

    /// 確定済み発話時間の合計
    pub fn total_speaking_time(&self) -> Duration {
        self.speakers.values().map(|s| s.total_time).sum()
    }

    /// 各話者の発話時間の割合 (%)
    ///
    /// まだ誰も発話していない場合は全員 0
    pub fn talk_shares(&self) -> Vec<(SpeakerId, f64)> {
        let total = self.total_speaking_time().as_secs_f64();
        self.speakers
            .values()
            .map(|s| {
                let share = if total > 0.0 {
                    s.total_time.as_secs_f64() / total * 100.0
                } else {
                    0.0
                };
                (s.id, share)
            })
            .collect()
    }

    /// 確定済みの無音時間
    pub fn silence_time(&self) -> Duration {
        self.silence_time
    }

    /// `min_speech_duration` により破棄された発話時間
    pub fn debounced_time(&self) -> Duration {
        self.debounced_time
    }

    /// 最初のフレームから最後のフレームまでの経過時間（一時停止中を除く）
    pub fn elapsed(&self) -> Duration {
        match (self.origin, self.last_timestamp) {
            (Some(origin), Some(last)) => last.saturating_sub(origin).saturating_sub(self.suspended_time),
            _ => Duration::ZERO,
        }
    }
}
