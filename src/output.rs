use crate::session::SessionObserver;
use crate::types::{FrameReport, SessionEvent, SessionStatus, SpeakerId};
use serde::Serialize;
use std::io::Write;
use std::time::Duration;

/// セッションの通知を JSON Lines 形式で書き出すオブザーバー
///
/// 各行に `wall_clock`（ローカル時刻, RFC 3339）を付加する。
///
/// # 出力例
///
/// ```json
/// {"event":"speaker_changed","previous":0,"current":1,"timestamp_ms":3350.0,"wall_clock":"2024-05-01T10:00:03.350+09:00"}
/// ```
pub struct JsonLinesObserver<W: Write + Send + 'static> {
    writer: W,
    /// フレーム毎のレポートも出力するかどうか
    emit_frames: bool,
}

impl<W: Write + Send + 'static> JsonLinesObserver<W> {
    pub fn new(writer: W, emit_frames: bool) -> Self {
        Self { writer, emit_frames }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_line<T: Serialize>(&mut self, value: &T) {
        let mut json = match serde_json::to_value(value) {
            Ok(json) => json,
            Err(e) => {
                log::error!("JSON変換に失敗: {}", e);
                return;
            }
        };
        if let Some(object) = json.as_object_mut() {
            object.insert(
                "wall_clock".to_string(),
                serde_json::Value::String(chrono::Local::now().to_rfc3339()),
            );
        }

        if let Err(e) = writeln!(self.writer, "{}", json).and_then(|_| self.writer.flush()) {
            log::error!("出力の書き込みに失敗: {}", e);
        }
    }
}

impl<W: Write + Send + 'static> SessionObserver for JsonLinesObserver<W> {
    fn on_frame(&mut self, report: &FrameReport) {
        if self.emit_frames {
            self.write_line(report);
        }
    }

    fn on_speaker_change(&mut self, previous: Option<SpeakerId>, current: SpeakerId, timestamp: Duration) {
        self.write_line(&SessionEvent::SpeakerChanged {
            previous,
            current,
            timestamp,
        });
    }

    fn on_voice_activity(&mut self, active: bool, timestamp: Duration) {
        self.write_line(&SessionEvent::VoiceActivityChanged { active, timestamp });
    }

    fn on_speaker_joined(&mut self, id: SpeakerId, timestamp: Duration) {
        self.write_line(&SessionEvent::SpeakerJoined { id, timestamp });
    }

    fn on_status_change(&mut self, status: SessionStatus) {
        self.write_line(&serde_json::json!({ "event": "status", "status": status }));
    }
}
