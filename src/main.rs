use anyhow::{Context, Result};
use env_logger::Env;
use speaker_tally::analyzer::FrameAnalyzer;
use speaker_tally::audio_input::AudioInput;
use speaker_tally::config::{Config, ConfigSource};
use speaker_tally::output::JsonLinesObserver;
use speaker_tally::session::SpeakerSession;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::mpsc;

/// キャプチャと解析の間のキュー長（フレーム数）
const FRAME_QUEUE_SIZE: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    // コマンドライン引数をパース
    let args: Vec<String> = std::env::args().collect();

    // デバイス一覧表示モード
    if args.len() > 1 && args[1] == "--show-interfaces" {
        AudioInput::list_devices()?;
        return Ok(());
    }

    // 設定ファイル生成モード
    if args.len() > 1 && args[1] == "--generate-config" {
        let config_path = if args.len() > 2 {
            &args[2]
        } else {
            "config.toml"
        };
        Config::write_default(config_path)?;
        println!("設定ファイルを生成しました: {}", config_path);
        return Ok(());
    }

    let config_path = if args.len() > 1 && !args[1].starts_with("--") {
        &args[1]
    } else {
        "config.toml"
    };

    // ロガーは設定のログレベルで初期化する
    let (config, source) = Config::load(config_path)?;

    env_logger::Builder::from_env(Env::default().default_filter_or(config.output.log_level.as_str()))
        .format_timestamp(None)
        .init();

    if source == ConfigSource::Default {
        log::warn!(
            "設定ファイルが見つかりません。デフォルト設定を使用します: {}",
            config_path
        );
    }

    config.validate().context("設定が不正です")?;

    log::info!("speaker-tally を起動します");
    log::info!("設定: {:?}", config);

    // Ctrl+C ハンドラを設定
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    ctrlc::set_handler(move || {
        log::info!("停止シグナルを受信しました...");
        running_clone.store(false, Ordering::SeqCst);
    })?;

    let mut session = SpeakerSession::from_config(&config).context("セッションの作成に失敗")?;
    session.add_observer(Box::new(JsonLinesObserver::new(
        std::io::stdout(),
        config.output.emit_frames,
    )));

    let mut audio_input = AudioInput::new(&config.audio)?;
    let mut analyzer = FrameAnalyzer::new(audio_input.sample_rate(), &config.analysis)
        .context("解析器の作成に失敗")?;

    let (tx, mut rx) = mpsc::channel(FRAME_QUEUE_SIZE);
    audio_input.start(config.analysis.fft_size, tx)?;

    session
        .start(config.detector.max_speakers)
        .context("セッションの開始に失敗")?;

    log::info!("話者の集計を開始しました (Ctrl+C で停止)");

    // 解析タスク: チャンク → フレーム → セッション
    let running_clone = running.clone();
    let processing_task = tokio::spawn(async move {
        while running_clone.load(Ordering::SeqCst) {
            tokio::select! {
                Some(chunk) = rx.recv() => {
                    let frame = match analyzer.analyze_chunk(&chunk) {
                        Ok(frame) => frame,
                        Err(e) => {
                            log::warn!("フレーム解析エラー: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = session.process_frame(&frame) {
                        log::warn!("フレーム処理エラー: {}", e);
                    }
                }
                _ = tokio::time::sleep(tokio::time::Duration::from_millis(100)) => {
                    // タイムアウト: ループを継続して running をチェック
                }
            }
        }

        session.stop();
        session
    });

    // メインループ: 停止を待つ
    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }

    log::info!("停止処理を開始します...");

    audio_input.stop();

    let session = processing_task.await.context("解析タスクの終了待ちに失敗")?;
    print_summary(&session);

    log::info!("speaker-tally を終了しました");

    Ok(())
}

/// 最終的な話者名簿を表示
fn print_summary(session: &SpeakerSession) {
    let aggregator = session.aggregator();
    let shares = aggregator.talk_shares();

    let summary = serde_json::json!({
        "event": "summary",
        "elapsed_ms": aggregator.elapsed().as_secs_f64() * 1000.0,
        "silence_ms": aggregator.silence_time().as_secs_f64() * 1000.0,
        "speakers": session.speakers(),
        "shares": shares
            .iter()
            .map(|(id, share)| serde_json::json!({ "id": id, "percent": share }))
            .collect::<Vec<_>>(),
    });
    println!("{}", summary);

    eprintln!();
    eprintln!("話者別の発話時間 (経過時間 {:.1}秒):", aggregator.elapsed().as_secs_f64());
    for (speaker, (_, share)) in session.speakers().iter().zip(&shares) {
        eprintln!(
            "  話者 {}: {:>7.1}秒 ({:>5.1}%)",
            speaker.id,
            speaker.total_time.as_secs_f64(),
            share
        );
    }
}
