use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camlink::advisor::{advise_or_default, DeviceStatus, HttpAdvisor, NoAdvisor};
use camlink::config::{AppConfig, ConfigStore};
use camlink::control::message::decode_data_uri;
use camlink::control::{
    CameraDevice, CapturedFrame, ControlMessage, NullCamera, StillImageCamera,
};
use camlink::events::{EventBus, SessionEvent};
use camlink::exchange::CodecKind;
use camlink::negotiation::{ConnectionState, Role};
use camlink::wake_lock::InhibitWakeLock;
use camlink::webrtc::{LoopbackNetwork, LoopbackTrack};
use camlink::{SessionController, SessionOptions};

/// Smallest valid JPEG (1x1 pixel), served by the demo camera
const DEMO_JPEG: &[u8] = &[
    0xFF, 0xD8, 0xFF, 0xDB, 0x00, 0x43, 0x00, 0x03, 0x02, 0x02, 0x02, 0x02, 0x02, 0x03, 0x02,
    0x02, 0x02, 0x03, 0x03, 0x03, 0x03, 0x04, 0x06, 0x04, 0x04, 0x04, 0x04, 0x04, 0x08, 0x06,
    0x06, 0x05, 0x06, 0x09, 0x08, 0x0A, 0x0A, 0x09, 0x08, 0x09, 0x09, 0x0A, 0x0C, 0x0F, 0x0C,
    0x0A, 0x0B, 0x0E, 0x0B, 0x09, 0x09, 0x0D, 0x11, 0x0D, 0x0E, 0x0F, 0x10, 0x10, 0x11, 0x10,
    0x0A, 0x0C, 0x12, 0x13, 0x12, 0x10, 0x13, 0x0F, 0x10, 0x10, 0x10, 0xFF, 0xC9, 0x00, 0x0B,
    0x08, 0x00, 0x01, 0x00, 0x01, 0x01, 0x01, 0x11, 0x00, 0xFF, 0xCC, 0x00, 0x06, 0x00, 0x10,
    0x10, 0x05, 0xFF, 0xDA, 0x00, 0x08, 0x01, 0x01, 0x00, 0x00, 0x3F, 0x00, 0xD2, 0xCF, 0x20,
    0xFF, 0xD9,
];

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// Out-of-band payload format
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CodecArg {
    Qr,
    Text,
}

impl From<CodecArg> for CodecKind {
    fn from(arg: CodecArg) -> Self {
        match arg {
            CodecArg::Qr => CodecKind::Qr,
            CodecArg::Text => CodecKind::Text,
        }
    }
}

/// camlink command line arguments
#[derive(Parser, Debug)]
#[command(name = "camlink")]
#[command(version, about = "Serverless camera-to-viewer pairing over WebRTC", long_about = None)]
struct CliArgs {
    /// Config file (default: $CAMLINK_CONFIG or ./camlink.json)
    #[arg(short = 'c', long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Payload codec (overrides config)
    #[arg(long, value_name = "CODEC", global = true)]
    codec: Option<CodecArg>,

    /// ICE gathering timeout in milliseconds, 0 to wait indefinitely (overrides config)
    #[arg(long, value_name = "MS", global = true)]
    gathering_timeout_ms: Option<u64>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Camera side: create the offer and serve control commands
    Host(HostArgs),
    /// Viewer side: answer an offer and drive the host's camera
    Client(ClientArgs),
    /// Run host and client in one process over a loopback link
    Demo,
}

#[derive(Args, Debug)]
struct HostArgs {
    /// Image served for capture requests (no capture support without it)
    #[arg(long, value_name = "FILE")]
    photo: Option<PathBuf>,

    /// Battery level to report to the power advisor
    #[arg(long, value_name = "PERCENT", allow_hyphen_values = true)]
    battery: Option<i32>,
}

#[derive(Args, Debug)]
struct ClientArgs {
    /// Directory where received photos are written
    #[arg(short = 'o', long, value_name = "DIR", default_value = ".")]
    output_dir: PathBuf,

    /// Do not inhibit system sleep while connected
    #[arg(long)]
    no_wake_lock: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting camlink v{}", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.clone().unwrap_or_else(ConfigStore::default_path);
    let config_store = ConfigStore::open(&config_path).await?;
    tracing::debug!("Configuration file: {}", config_store.path().display());
    let mut config = (*config_store.get()).clone();

    // CLI flags take precedence over the file
    if let Some(codec) = args.codec {
        config.exchange.codec = codec.into();
    }
    if let Some(ms) = args.gathering_timeout_ms {
        config.webrtc.gathering_timeout_ms = (ms > 0).then_some(ms);
    }

    match args.command {
        Command::Host(host) => run_host(&config, host).await,
        Command::Client(client) => run_client(&config, client).await,
        Command::Demo => run_demo(&config).await,
    }
}

async fn run_host(config: &AppConfig, args: HostArgs) -> anyhow::Result<()> {
    let device: Arc<dyn CameraDevice> = match &args.photo {
        Some(path) => {
            let data = tokio::fs::read(path).await?;
            let frame = CapturedFrame::new(mime_for_path(path), data);
            Arc::new(StillImageCamera::new(frame).without_torch())
        }
        None => Arc::new(NullCamera),
    };

    let session = SessionController::open(Role::Initiator, config, device).await?;
    spawn_event_logger(session.events());

    if let Some(battery) = args.battery {
        let status = DeviceStatus::new(
            config.advisor.device_model.clone(),
            config.advisor.os_version.clone(),
            battery,
            true,
        );
        let events = session.events();
        let advice = match HttpAdvisor::from_config(&config.advisor)? {
            Some(advisor) => advise_or_default(&advisor, &status, Some(&events)).await,
            None => advise_or_default(&NoAdvisor, &status, Some(&events)).await,
        };
        println!(
            "Power advice: keep alive = {} ({})",
            advice.should_keep_alive, advice.reason
        );
    }

    let offer = session.create_offer().await?;
    println!("Offer payload, show this to the client:\n\n{}\n", offer);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    eprintln!("Paste the answer payload and press Enter:");
    let Some(answer) = next_payload(&mut stdin).await? else {
        session.close().await?;
        return Ok(());
    };
    session.accept_answer(&answer).await?;

    tracing::info!("Waiting for the client; Ctrl+C to quit");
    let mut state = session.state_watch();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
        _ = state.wait_for(|s| {
            matches!(s, ConnectionState::Disconnected | ConnectionState::Failed)
        }) => {
            tracing::info!("Session ended: {}", session.connection_state());
        }
    }

    session.close().await?;
    Ok(())
}

async fn run_client(config: &AppConfig, args: ClientArgs) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&args.output_dir).await?;

    let session = SessionController::open(Role::Responder, config, Arc::new(NullCamera)).await?;
    spawn_event_logger(session.events());
    spawn_photo_writer(session.events(), args.output_dir.clone());

    if !args.no_wake_lock {
        session
            .acquire_wake_lock(Arc::new(InhibitWakeLock::new("camlink")))
            .await;
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    eprintln!("Paste the offer payload and press Enter:");
    let Some(offer) = next_payload(&mut stdin).await? else {
        session.close().await?;
        return Ok(());
    };
    let answer = session.accept_offer(&offer).await?;
    println!("Answer payload, show this to the host:\n\n{}\n", answer);

    let mut state = session.state_watch();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            session.close().await?;
            return Ok(());
        }
        reached = state.wait_for(|s| *s != ConnectionState::Negotiating) => {
            let reached = reached.map(|s| *s).unwrap_or(ConnectionState::Failed);
            if reached != ConnectionState::Connected {
                session.close().await?;
                anyhow::bail!("Session did not connect: {}", reached);
            }
        }
    }

    eprintln!("Connected. Commands: zoom <level>, flash on|off, capture, quit");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = state.wait_for(|s| *s != ConnectionState::Connected) => {
                eprintln!("Host disconnected");
                break;
            }
            line = stdin.next_line() => {
                let Some(line) = line? else { break };
                match parse_command(&line) {
                    Ok(Some(ClientInput::Quit)) => break,
                    Ok(Some(ClientInput::Control(msg))) => match session.send_control(msg).await {
                        Ok(true) => {}
                        Ok(false) => eprintln!("Control channel not open, command dropped"),
                        Err(e) => eprintln!("{}", e),
                    },
                    Ok(None) => {}
                    Err(msg) => eprintln!("{}", msg),
                }
            }
        }
    }

    session.close().await?;
    Ok(())
}

async fn run_demo(config: &AppConfig) -> anyhow::Result<()> {
    let options = SessionOptions::from_config(config)?;
    let network = LoopbackNetwork::new();

    let host_events = Arc::new(EventBus::new());
    let camera = StillImageCamera::new(CapturedFrame::new("image/jpeg", DEMO_JPEG));
    let host = SessionController::new(
        network.open(Role::Initiator, host_events.clone()),
        Arc::new(camera),
        host_events,
        options.clone(),
    );

    let client_events = Arc::new(EventBus::new());
    let client = SessionController::new(
        network.open(Role::Responder, client_events.clone()),
        Arc::new(NullCamera),
        client_events,
        options,
    );
    spawn_event_logger(host.events());
    spawn_event_logger(client.events());
    let mut photos = client.events().subscribe();

    host.attach_local_media(vec![LoopbackTrack::video("camera")])
        .await?;

    let offer = host.create_offer().await?;
    println!("host   -> offer  ({} chars): {}", offer.len(), offer);
    let answer = client.accept_offer(offer.as_str()).await?;
    println!("client -> answer ({} chars): {}", answer.len(), answer);
    host.accept_answer(answer.as_str()).await?;

    for session_state in [host.state_watch(), client.state_watch()] {
        let mut state = session_state;
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await??;
    }
    println!("Both sides connected");

    client.set_zoom(2.0).await?;
    client.set_flash(true).await?;
    client.request_capture().await?;

    let image = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match photos.recv().await {
                Ok(SessionEvent::PhotoReceived { image_data, .. }) => return Some(image_data),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    })
    .await?;
    match image.map(|uri| decode_data_uri(&uri)).transpose()? {
        Some((mime, data)) => println!("Photo received: {} ({} bytes)", mime, data.len()),
        None => println!("No photo received"),
    }

    client.close().await?;
    host.close().await?;
    println!(
        "Closed: host {}, client {}",
        host.connection_state(),
        client.connection_state()
    );
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
enum ClientInput {
    Control(ControlMessage),
    Quit,
}

fn parse_command(line: &str) -> Result<Option<ClientInput>, String> {
    let mut parts = line.split_whitespace();
    let Some(verb) = parts.next() else {
        return Ok(None);
    };
    let arg = parts.next();
    let msg = match (verb, arg, parts.next()) {
        ("zoom", Some(level), None) => ControlMessage::Zoom {
            level: level
                .parse()
                .map_err(|_| format!("Invalid zoom level: {}", level))?,
        },
        ("flash", Some("on"), None) => ControlMessage::Flash { enabled: true },
        ("flash", Some("off"), None) => ControlMessage::Flash { enabled: false },
        ("capture", None, None) => ControlMessage::CaptureRequest,
        ("quit" | "exit", None, None) => return Ok(Some(ClientInput::Quit)),
        _ => return Err(format!("Unknown command: {}", line.trim())),
    };
    Ok(Some(ClientInput::Control(msg)))
}

/// Next non-empty stdin line, `None` at end of input
async fn next_payload(lines: &mut Lines<BufReader<Stdin>>) -> anyhow::Result<Option<String>> {
    while let Some(line) = lines.next_line().await? {
        if !line.trim().is_empty() {
            return Ok(Some(line));
        }
    }
    Ok(None)
}

fn spawn_event_logger(events: Arc<EventBus>) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            // Photos are large; log them by size only
            if let SessionEvent::PhotoReceived { image_data, .. } = &event {
                tracing::debug!("event control.photo ({} chars)", image_data.len());
                continue;
            }
            match serde_json::to_string(&event) {
                Ok(json) => tracing::debug!("event {}", json),
                Err(e) => tracing::warn!("Unserializable event: {}", e),
            }
        }
    });
}

fn spawn_photo_writer(events: Arc<EventBus>, dir: PathBuf) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            let SessionEvent::PhotoReceived {
                image_data,
                received_at,
            } = event
            else {
                continue;
            };
            let (mime, data) = match decode_data_uri(&image_data) {
                Ok(decoded) => decoded,
                Err(e) => {
                    tracing::warn!("Discarding photo: {}", e);
                    continue;
                }
            };
            let path = dir.join(format!(
                "photo-{}.{}",
                received_at.format("%Y%m%d-%H%M%S%.3f"),
                extension_for_mime(&mime)
            ));
            match tokio::fs::write(&path, &data).await {
                Ok(()) => eprintln!("Saved {} ({} bytes)", path.display(), data.len()),
                Err(e) => tracing::warn!("Failed to write {}: {}", path.display(), e),
            }
        }
    });
}

fn mime_for_path(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/webp" => "webp",
        "image/jpeg" => "jpg",
        _ => "bin",
    }
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "camlink=error,webrtc=error",
        LogLevel::Warn => "camlink=warn,webrtc=warn",
        LogLevel::Info => "camlink=info,webrtc=warn",
        LogLevel::Verbose => "camlink=debug,webrtc=warn",
        LogLevel::Debug => "camlink=debug,webrtc=info",
        LogLevel::Trace => "camlink=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    // Logs go to stderr; stdout carries the payloads
    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        let control = |msg| Ok(Some(ClientInput::Control(msg)));
        assert_eq!(parse_command("zoom 2.5"), control(ControlMessage::Zoom { level: 2.5 }));
        assert_eq!(
            parse_command("  flash on "),
            control(ControlMessage::Flash { enabled: true })
        );
        assert_eq!(
            parse_command("flash off"),
            control(ControlMessage::Flash { enabled: false })
        );
        assert_eq!(parse_command("capture"), control(ControlMessage::CaptureRequest));
        assert_eq!(parse_command("quit"), Ok(Some(ClientInput::Quit)));
        assert_eq!(parse_command(""), Ok(None));
        assert!(parse_command("zoom far").is_err());
        assert!(parse_command("flash maybe").is_err());
        assert!(parse_command("capture now").is_err());
    }

    #[test]
    fn test_mime_mapping() {
        assert_eq!(mime_for_path(Path::new("a/shot.PNG")), "image/png");
        assert_eq!(mime_for_path(Path::new("shot")), "image/jpeg");
        assert_eq!(extension_for_mime("image/jpeg"), "jpg");
        assert_eq!(extension_for_mime("application/x-unknown"), "bin");
    }

    #[test]
    fn test_cli_parses() {
        let args = CliArgs::try_parse_from([
            "camlink", "-vv", "--codec", "text", "client", "-o", "/tmp/x",
        ])
        .unwrap();
        assert_eq!(args.verbose, 2);
        assert!(matches!(args.codec, Some(CodecArg::Text)));
        assert!(matches!(
            args.command,
            Command::Client(ClientArgs { no_wake_lock: false, .. })
        ));
    }
}
