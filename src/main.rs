use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::EnvFilter;

use lumiere_voice::voice::{
    CaptureSource, CpalInput, CpalOutput, DEFAULT_BLOCK_SIZE, PLAYBACK_SAMPLE_RATE,
    PlaybackScheduler,
};
use lumiere_voice::{Config, ControlHandle, SessionController, SessionEvent};

/// Lumière - real-time voice assistant for the clinic front desk
#[derive(Parser)]
#[command(name = "lumiere", version, about)]
struct Cli {
    /// Model identifier override
    #[arg(long, env = "LUMIERE_MODEL")]
    model: Option<String>,

    /// Prebuilt voice override
    #[arg(long, env = "LUMIERE_VOICE")]
    voice: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Talk to the assistant (Enter starts and stops, q quits)
    Talk,
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,lumiere_voice=info",
        1 => "info,lumiere_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    // Already installed is fine
    let _ = rustls::crypto::ring::default_provider().install_default();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Some(Command::TestMic { duration }) => test_mic(duration).await,
        Some(Command::TestSpeaker) => test_speaker().await,
        Some(Command::Talk) | None => {
            let mut config = Config::load()?;
            if let Some(model) = cli.model {
                config.session.model = model;
            }
            if let Some(voice) = cli.voice {
                config.session.voice = voice;
            }
            config.validate()?;
            talk(config).await
        }
    }
}

/// Interactive session driven from the terminal
#[allow(clippy::future_not_send)]
async fn talk(config: Config) -> anyhow::Result<()> {
    if config.api_key.is_none() {
        anyhow::bail!("no API key: set GEMINI_API_KEY or API_KEY");
    }

    tracing::info!(
        model = %config.session.model,
        voice = %config.session.voice,
        "starting voice session host"
    );

    let (controller, mut events) = SessionController::live(config);
    let handle = controller.handle();
    let live = Arc::new(AtomicBool::new(false));

    let printer_live = Arc::clone(&live);
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match &event {
                SessionEvent::Connecting | SessionEvent::Started => {
                    printer_live.store(true, Ordering::SeqCst);
                }
                SessionEvent::Stopped | SessionEvent::Error { .. } => {
                    printer_live.store(false, Ordering::SeqCst);
                }
                SessionEvent::Listening | SessionEvent::Speaking => {}
            }
            println!("{}", describe(&event));
        }
    });

    let input = tokio::spawn(read_commands(handle, Arc::clone(&live)));

    println!("Press Enter to start or stop talking, q then Enter to quit.");

    // Device streams are tied to this thread, so the controller runs here
    controller.run().await;

    input.abort();
    let _ = printer.await;
    Ok(())
}

/// Map terminal lines onto controller commands
async fn read_commands(handle: ControlHandle, live: Arc<AtomicBool>) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().eq_ignore_ascii_case("q") => break,
            Ok(Some(_)) => {
                if live.load(Ordering::SeqCst) {
                    handle.stop();
                } else {
                    handle.start();
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read stdin");
                break;
            }
        }
    }
    handle.shutdown();
}

fn describe(event: &SessionEvent) -> String {
    match event {
        SessionEvent::Connecting => "… connecting".to_string(),
        SessionEvent::Started => "● session started".to_string(),
        SessionEvent::Listening => "  listening".to_string(),
        SessionEvent::Speaking => "  assistant speaking".to_string(),
        SessionEvent::Stopped => "○ session stopped".to_string(),
        SessionEvent::Error { kind, message } => format!("✕ {kind}: {message}"),
    }
}

/// Test microphone input
#[allow(clippy::future_not_send)]
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let buffer: Arc<Mutex<Vec<f32>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&buffer);

    let mut capture = CaptureSource::open(
        Box::new(CpalInput::new()),
        DEFAULT_BLOCK_SIZE / 4,
        move |frame| {
            if let Ok(mut buf) = sink.lock() {
                buf.extend(frame.to_samples());
            }
        },
    )?;
    capture.start()?;

    println!("Frame size: {} samples", DEFAULT_BLOCK_SIZE / 4);
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples = buffer
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default();
        let energy = calculate_rms(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );
    }

    capture.close();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in and allowed for this terminal?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Calculate RMS energy
#[allow(clippy::cast_precision_loss)]
fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Test speaker output with three tones queued back-to-back
#[allow(clippy::future_not_send)]
async fn test_speaker() -> anyhow::Result<()> {
    const TONES: [f32; 3] = [440.0, 554.37, 659.25];
    const TONE_SECS: f32 = 0.6;

    println!("Testing speaker output...");
    println!("You should hear three rising tones with no gap between them\n");

    let (tx, mut finished) = tokio::sync::mpsc::unbounded_channel();
    let mut scheduler = PlaybackScheduler::open(
        Box::new(CpalOutput::new()),
        PLAYBACK_SAMPLE_RATE,
        Box::new(move |id| {
            let _ = tx.send(id);
        }),
    )?;

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    let num_samples = (PLAYBACK_SAMPLE_RATE as f32 * TONE_SECS) as usize;

    for frequency in TONES {
        #[allow(clippy::cast_precision_loss)]
        let samples: Vec<f32> = (0..num_samples)
            .map(|i| {
                let t = i as f32 / PLAYBACK_SAMPLE_RATE as f32;
                (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
            })
            .collect();
        let id = scheduler.schedule(samples)?;
        println!(
            "Queued {frequency:.0} Hz as {id}, next start at {:.3}s",
            scheduler.next_start_time()
        );
    }

    let wait = Duration::from_secs_f32(TONE_SECS * 3.0 + 2.0);
    let drained = tokio::time::timeout(wait, async {
        while let Some(id) = finished.recv().await {
            scheduler.retire(id);
            if scheduler.is_idle() {
                break;
            }
        }
    })
    .await;

    if drained.is_err() {
        println!("Timed out waiting for playback to finish");
    }
    scheduler.close();

    println!("\n---");
    println!("If you heard the tones, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}
