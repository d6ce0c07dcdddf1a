//! `hark`: terminal host for the turn engine.
//!
//! Stages are local stubs (describe / echo / tone / simulated playback) with
//! a configurable latency, so interrupting yourself is easy to try: type a
//! line, then type another before the first reply has played.

mod args;
mod settings;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use hark_core::audio::device::{list_input_devices, list_output_devices, DeviceInfo};
use hark_core::audio::wav::read_wav_mono;
use hark_core::buffering::{AudioProducer, Producer};
use hark_core::stages::{EchoGenerator, SimulatedPlayer, StubTranscriber, ToneSynthesizer};
use hark_core::{
    ActivityKind, EngineStatus, HarkEngine, SpeechActivityEvent, StageSet, TurnEvent,
    TurnEventKind, TurnState,
};

use args::{parse_args, Args, Mode, USAGE};
use settings::{default_settings_path, load_settings, save_settings, AppSettings};

#[tokio::main]
async fn main() {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("hark=info,hark_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}\n\n{USAGE}");
            std::process::exit(2);
        }
    };
    if args.help {
        println!("{USAGE}");
        return;
    }

    if let Err(e) = run(args).await {
        tracing::error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    if args.list_devices {
        print_devices("input", &list_input_devices());
        print_devices("output", &list_output_devices());
        return Ok(());
    }

    let settings_path = args.settings.clone().unwrap_or_else(default_settings_path);
    let settings = load_settings(&settings_path);
    if args.save_settings {
        save_settings(&settings_path, &settings)
            .with_context(|| format!("saving {}", settings_path.display()))?;
        info!(path = ?settings_path, "settings saved");
    }
    info!(
        settings_path = ?settings_path,
        sample_rate = settings.sample_rate,
        frame_ms = settings.frame_ms,
        start_trigger_frames = settings.start_trigger_frames,
        end_trigger_frames = settings.end_trigger_frames,
        stub_latency_ms = settings.stub_latency_ms,
        "settings loaded"
    );

    // ── Engine setup ──────────────────────────────────────────────────────
    let stages = build_stages(&settings, args.device_playback)?;
    let engine = Arc::new(HarkEngine::with_energy_classifier(
        settings.engine_config(),
        stages,
    )?);
    let printers = spawn_printers(&engine);

    let result = match &args.mode {
        Mode::Wav(path) => replay_wav(&engine, path).await,
        Mode::Listen => {
            engine.start()?;
            prompt_loop(&engine).await
        }
        Mode::Text => {
            engine.start_text_only()?;
            prompt_loop(&engine).await
        }
    };

    if engine.is_running() {
        engine.stop().await?;
    }
    for printer in printers {
        printer.abort();
    }
    result
}

fn build_stages(settings: &AppSettings, device_playback: bool) -> anyhow::Result<StageSet> {
    let latency = Duration::from_millis(settings.stub_latency_ms);
    let stages = StageSet::new(
        Arc::new(StubTranscriber::new(latency)),
        Arc::new(EchoGenerator::new(latency)),
        Arc::new(ToneSynthesizer::new(latency)),
        Arc::new(SimulatedPlayer::new(settings.playback_speed)),
    );
    if !device_playback {
        return Ok(stages);
    }

    #[cfg(feature = "audio-cpal")]
    {
        let player = hark_core::CpalPlayer::open_default()?.with_speed(settings.playback_speed);
        info!(
            device = player.device_name(),
            speed = player.speed(),
            "device playback enabled"
        );
        Ok(stages.with_player(Arc::new(player)))
    }
    #[cfg(not(feature = "audio-cpal"))]
    {
        bail!("--device-playback requires the audio-cpal feature")
    }
}

/// Read lines until `:quit`, end of input or Ctrl-C.
async fn prompt_loop(engine: &HarkEngine) -> anyhow::Result<()> {
    println!("hark is ready. Type a line and press enter (:quit to leave).");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("reading stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        match line.trim() {
            "" => {}
            ":quit" | "quit" | "exit" => break,
            ":status" => println!("{}", serde_json::to_string_pretty(&engine.status())?),
            ":wait" => {
                let status = engine.handle().settled().await;
                print_reply(status.last_reply.as_deref());
            }
            ":diag" => {
                let diag = serde_json::json!({
                    "listener": engine.listener_diagnostics(),
                    "turns": engine.turn_diagnostics(),
                });
                println!("{}", serde_json::to_string_pretty(&diag)?);
            }
            cmd if cmd.starts_with(':') => println!("unknown command {cmd} (try :status, :wait, :diag, :quit)"),
            text => {
                let version = engine.submit_text(text);
                println!("[v{version}] submitted");
            }
        }
    }
    Ok(())
}

/// Feed a WAV file through the listener in real time, wait for the reply.
async fn replay_wav(engine: &HarkEngine, path: &Path) -> anyhow::Result<()> {
    let audio = read_wav_mono(path)?;
    info!(
        path = ?path,
        duration_ms = audio.duration_ms(),
        sample_rate = audio.sample_rate,
        "replaying wav"
    );
    let mut producer = engine.start_headless(audio.sample_rate)?;

    // 20 ms per push.
    let block = (audio.sample_rate as usize / 50).max(1);
    let mut ticker = tokio::time::interval(Duration::from_millis(20));
    for chunk in audio.samples.chunks(block) {
        ticker.tick().await;
        push_all(&mut producer, chunk).await;
    }

    // Trailing silence long enough for the last utterance to end on its own.
    let config = engine.config();
    let tail_ms = u64::from(config.end_trigger_frames * config.frame_ms) + 250;
    let tail = vec![0.0f32; (u64::from(audio.sample_rate) * tail_ms / 1000) as usize];
    push_all(&mut producer, &tail).await;

    let expected = audio.len() + tail.len();
    while engine.listener_diagnostics().samples_in < expected {
        if engine.engine_status() == EngineStatus::Error {
            bail!("listener stopped before the recording was processed");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let status = engine.handle().settled().await;
    if status.input_version == 0 {
        println!("(no speech detected)");
    } else {
        print_reply(status.last_reply.as_deref());
    }
    engine.stop().await?;
    Ok(())
}

async fn push_all(producer: &mut AudioProducer, mut samples: &[f32]) {
    while !samples.is_empty() {
        let written = producer.push_slice(samples);
        samples = &samples[written..];
        if written == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

// ── Output ───────────────────────────────────────────────────────────────────

fn spawn_printers(engine: &HarkEngine) -> Vec<JoinHandle<()>> {
    let mut turns = engine.subscribe_turns();
    let mut activity = engine.subscribe_activity();

    let turn_printer = tokio::spawn(async move {
        loop {
            match turns.recv().await {
                Ok(event) => {
                    if let Some(line) = describe_turn_event(&event) {
                        println!("{line}");
                    }
                }
                Err(RecvError::Lagged(missed)) => warn!(missed, "turn event printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
    let activity_printer = tokio::spawn(async move {
        loop {
            match activity.recv().await {
                Ok(event) => println!("{}", describe_activity(&event)),
                Err(RecvError::Lagged(missed)) => warn!(missed, "activity printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
    vec![turn_printer, activity_printer]
}

fn describe_turn_event(event: &TurnEvent) -> Option<String> {
    let v = event.version;
    let line = match &event.kind {
        TurnEventKind::State {
            state: TurnState::Queued,
            ..
        } => return None,
        TurnEventKind::State {
            state,
            detail: Some(detail),
        } => format!("[v{v}] {state}: {detail}"),
        TurnEventKind::State {
            state,
            detail: None,
        } => format!("[v{v}] {state}"),
        TurnEventKind::Transcript { text } => format!("[v{v}] heard: {text}"),
        TurnEventKind::Reply {
            text,
            superseded: false,
        } => format!("[v{v}] reply: {text}"),
        TurnEventKind::Reply {
            text,
            superseded: true,
        } => format!("[v{v}] reply discarded: {text}"),
        TurnEventKind::Played => format!("[v{v}] played"),
    };
    Some(line)
}

fn describe_activity(event: &SpeechActivityEvent) -> String {
    match (event.kind, event.submitted_version) {
        (ActivityKind::Started, _) => "(speech started)".into(),
        (ActivityKind::Ended, Some(v)) => {
            format!("(speech ended, {} ms) -> v{v}", event.duration_ms)
        }
        (ActivityKind::Ended, None) => "(speech ended, nothing captured)".into(),
    }
}

fn print_reply(reply: Option<&str>) {
    match reply {
        Some(reply) => println!("reply: {reply}"),
        None => println!("(no reply)"),
    }
}

fn print_devices(label: &str, devices: &[DeviceInfo]) {
    println!("{label} devices:");
    if devices.is_empty() {
        println!("  (none)");
    }
    for device in devices {
        let mut tags = Vec::new();
        if device.is_default {
            tags.push("default");
        }
        if device.is_loopback_like {
            tags.push("loopback");
        }
        if tags.is_empty() {
            println!("  {}", device.name);
        } else {
            println!("  {} [{}]", device.name, tags.join(", "));
        }
    }
}
