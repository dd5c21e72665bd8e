// ABOUTME: vizlink command line tool
// ABOUTME: Hosts a demo link over TCP or acts as the remote display end

use clap::{Args, Parser, Subcommand};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::MissedTickBehavior;
use vizlink::link::cli::init_tracing;
use vizlink::link::{
    CaptureSource, Link, LinkArgs, LinkEvent, PlayerHost, StateChange, ToneCapture,
};
use vizlink::protocol::framing::{decode_frame, RawFrame};
use vizlink::protocol::messages::{
    BinCount, DataType, MessageType, PlayerCommand, PlayerState, Request, StartRequest,
};
use vizlink::protocol::START_OF_HEADING;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Demo track length for the listen player
const DEMO_TRACK_MS: i32 = 180_000;

/// Volume step for volume up/down commands
const VOLUME_STEP: u8 = 5;

#[derive(Parser, Debug)]
#[command(name = "vizlink")]
#[command(author, version, about = "Visualizer link host and remote", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept one connection and stream a test tone visualization to it
    Listen(ListenArgs),
    /// Connect to a listening host and print what it sends
    Remote(RemoteArgs),
}

#[derive(Args, Debug)]
struct ListenArgs {
    /// Address to accept the display connection on
    #[arg(short, long, default_value = "0.0.0.0:7777")]
    bind: SocketAddr,

    /// Test tone frequency in Hz
    #[arg(short, long, default_value = "440.0")]
    frequency: f64,

    /// Capture sample rate in Hz
    #[arg(short, long, default_value = "44100")]
    sample_rate: u32,

    /// Samples per capture
    #[arg(long, default_value = "1024")]
    capture_len: usize,

    /// Capture tick interval in milliseconds
    #[arg(long, default_value = "16")]
    tick_ms: u64,

    #[command(flatten)]
    link: LinkArgs,
}

#[derive(Args, Debug)]
struct RemoteArgs {
    /// Host address to connect to
    #[arg(short, long, default_value = "127.0.0.1:7777")]
    connect: SocketAddr,

    /// Number of bins to request (4, 8, 16, 32, 64, 128 or 256)
    #[arg(short, long, default_value = "32")]
    bins: usize,

    /// Also request waveform data
    #[arg(long)]
    waveform: bool,

    /// Player command to send after starting (repeatable)
    #[arg(long = "command")]
    commands: Vec<PlayerCommand>,

    /// Exit after this many visualization frames
    #[arg(long)]
    frames: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Player the listen command reports and remote-controls
struct DemoPlayer {
    state: Mutex<PlayerState>,
}

impl DemoPlayer {
    fn new() -> Self {
        Self {
            state: Mutex::new(PlayerState {
                volume: 80,
                position_ms: 0,
                length_ms: DEMO_TRACK_MS,
                playing: true,
                loading: false,
            }),
        }
    }

    /// Apply a remote command, returning what changed
    fn apply(&self, command: PlayerCommand) -> StateChange {
        let mut state = self.state.lock();
        match command {
            PlayerCommand::UpdateState => StateChange::NONE,
            PlayerCommand::Previous | PlayerCommand::Next => {
                state.position_ms = 0;
                StateChange::POSITION
            }
            PlayerCommand::PlayPause => {
                state.playing = !state.playing;
                StateChange::PLAYING
            }
            PlayerCommand::Play => {
                state.playing = true;
                StateChange::PLAYING
            }
            PlayerCommand::Pause => {
                state.playing = false;
                StateChange::PLAYING
            }
            PlayerCommand::IncreaseVolume => {
                state.volume = state.volume.saturating_add(VOLUME_STEP).min(100);
                StateChange::VOLUME
            }
            PlayerCommand::DecreaseVolume => {
                state.volume = state.volume.saturating_sub(VOLUME_STEP);
                StateChange::VOLUME
            }
            PlayerCommand::SetVolume(level) => {
                state.volume = level.min(100);
                StateChange::VOLUME
            }
        }
    }

    /// Advance playback, wrapping at the end of the track
    fn advance(&self, millis: u64) -> StateChange {
        let mut state = self.state.lock();
        if !state.playing {
            return StateChange::NONE;
        }
        state.position_ms = state.position_ms.saturating_add(millis as i32);
        if state.position_ms >= state.length_ms {
            state.position_ms = 0;
            return StateChange::POSITION;
        }
        StateChange::NONE
    }
}

impl PlayerHost for DemoPlayer {
    fn player_state(&self) -> PlayerState {
        *self.state.lock()
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    match cli.command {
        Command::Listen(args) => {
            args.link.init_tracing();
            listen(args).await
        }
        Command::Remote(args) => {
            init_tracing(args.verbose);
            remote(args).await
        }
    }
}

async fn listen(args: ListenArgs) -> Result<(), BoxError> {
    tracing::info!("vizlink v{}", env!("CARGO_PKG_VERSION"));

    let (events_tx, events_rx) = crossbeam::channel::unbounded();
    let player = Arc::new(DemoPlayer::new());
    let link = Link::new(args.link.build_config(), player.clone(), events_tx);

    let listener = std::net::TcpListener::bind(args.bind)?;
    tracing::info!("Waiting for a display on {}", args.bind);
    link.start_connecting()?;

    let accepted = tokio::task::spawn_blocking(move || listener.accept()).await?;
    let (stream, peer) = match accepted {
        Ok(accepted) => accepted,
        Err(e) => {
            link.report_error(vizlink::link::ConnectionError::ConnectionFailed);
            return Err(e.into());
        }
    };
    tracing::info!("Display connected from {}", peer);
    link.on_connected(Box::new(stream))?;

    // Host mailbox: applies commands and logs lifecycle events
    let events_task = tokio::task::spawn_blocking({
        let link = link.clone();
        let player = player.clone();
        move || {
            for notification in events_rx {
                let Some(event) = link.accept(notification) else {
                    continue;
                };
                match event {
                    LinkEvent::Command(command) => {
                        tracing::info!("Command: {}", command);
                        link.notify_player_state_changed(player.apply(command));
                    }
                    LinkEvent::TransmissionStarted { bins, data } => {
                        tracing::info!("Display requested {} bins ({:?})", bins.bins(), data);
                    }
                    LinkEvent::Error(e) => tracing::warn!("Link error: {}", e),
                    LinkEvent::Stopped => {
                        tracing::info!("Link stopped");
                        break;
                    }
                    other => tracing::debug!("{:?}", other),
                }
            }
        }
    });

    let mut source = ToneCapture::new(args.frequency, args.sample_rate);
    let mut waveform = vec![0u8; args.capture_len];
    let mut interval = tokio::time::interval(Duration::from_millis(args.tick_ms));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if !link.is_connected() {
                    break;
                }
                link.notify_player_state_changed(player.advance(args.tick_ms));
                source.capture(&mut waveform);
                link.on_capture_tick(&mut waveform);
            }
            _ = &mut ctrl_c => {
                tracing::info!("Shutting down");
                link.stop();
                break;
            }
        }
    }

    events_task.await?;
    tracing::info!("Sent {} frames", link.packets_sent());
    Ok(())
}

async fn remote(args: RemoteArgs) -> Result<(), BoxError> {
    let bins = BinCount::from_bins(args.bins)
        .ok_or_else(|| format!("unsupported bin count {}", args.bins))?;
    let data = if args.waveform {
        DataType::ALL
    } else {
        DataType::FREQUENCY
    };

    let mut stream = tokio::net::TcpStream::connect(args.connect).await?;
    stream.set_nodelay(true)?;
    tracing::info!("Connected to {}", args.connect);

    stream
        .write_all(&Request::StartTransmission(StartRequest { bins, data }).encode())
        .await?;
    for command in &args.commands {
        // Stay outside the host's command rate limit
        tokio::time::sleep(Duration::from_millis(60)).await;
        stream.write_all(&Request::Command(*command).encode()).await?;
        tracing::info!("Sent {}", command);
    }

    let mut pending = Vec::new();
    let mut chunk = [0u8; 4096];
    let mut received = 0usize;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let n = tokio::select! {
            read = stream.read(&mut chunk) => read?,
            _ = &mut ctrl_c => break,
        };
        if n == 0 {
            tracing::info!("Host closed the connection");
            break;
        }
        pending.extend_from_slice(&chunk[..n]);

        drain_frames(&mut pending, |frame| match frame.message_type {
            MessageType::StartBinTransmission => {
                received += 1;
                tracing::info!("Visualization {:?}", frame.payload);
            }
            MessageType::PlayerState => match PlayerState::from_payload(&frame.payload) {
                Ok(state) => tracing::info!("Player {:?}", state),
                Err(e) => tracing::warn!("Bad player state: {}", e),
            },
            other => tracing::debug!("Unexpected {:?} frame", other),
        });

        if args.frames.is_some_and(|limit| received >= limit) {
            break;
        }
    }

    send_stop(&mut stream).await;
    tracing::info!("Received {} visualization frames", received);
    Ok(())
}

/// Ask the host to stop transmitting. Failure only matters for logging.
async fn send_stop<W: AsyncWrite + Unpin>(stream: &mut W) -> bool {
    match stream.write_all(&Request::StopTransmission.encode()).await {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!("Failed to send stop request: {}", e);
            false
        }
    }
}

/// Parse complete frames off the front of `pending`, resyncing on the next
/// start marker after a malformed frame
fn drain_frames(pending: &mut Vec<u8>, mut on_frame: impl FnMut(RawFrame)) {
    loop {
        match decode_frame(pending) {
            Ok(Some((frame, used))) => {
                pending.drain(..used);
                on_frame(frame);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Resyncing after {}", e);
                let skip = pending
                    .iter()
                    .skip(1)
                    .position(|&b| b == START_OF_HEADING)
                    .map_or(pending.len(), |p| p + 1);
                pending.drain(..skip);
            }
        }
    }
}
