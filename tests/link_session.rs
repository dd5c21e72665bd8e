use crossbeam::channel::{self, Receiver};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use vizlink::link::transport::{pair, ChannelReader, ChannelTransport, ChannelWriter};
use vizlink::link::{
    ConnectionError, Link, LinkConfig, LinkEvent, LinkState, ManualClock, Notification,
    PlayerHost, StateChange,
};
use vizlink::protocol::framing::{decode_frame, RawFrame};
use vizlink::protocol::messages::{
    BinCount, DataType, MessageType, PlayerCommand, PlayerState, Request, StartRequest,
};

const TIMEOUT: Duration = Duration::from_secs(2);

struct TestPlayer {
    state: Mutex<PlayerState>,
}

impl TestPlayer {
    fn new(state: PlayerState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
        })
    }
}

impl PlayerHost for TestPlayer {
    fn player_state(&self) -> PlayerState {
        *self.state.lock()
    }
}

/// Display end of the link
struct Device {
    reader: ChannelReader,
    writer: ChannelWriter,
    pending: Vec<u8>,
    _transport: ChannelTransport,
}

impl Device {
    fn new(mut transport: ChannelTransport) -> Self {
        let mut reader = transport.channel_reader().unwrap();
        reader.set_timeout(Some(TIMEOUT));
        let writer = transport.channel_writer().unwrap();
        Self {
            reader,
            writer,
            pending: Vec::new(),
            _transport: transport,
        }
    }

    fn send(&mut self, request: Request) {
        self.send_raw(&request.encode());
    }

    fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).unwrap();
    }

    fn next_frame(&mut self) -> RawFrame {
        loop {
            if let Some((frame, used)) = decode_frame(&self.pending).unwrap() {
                self.pending.drain(..used);
                return frame;
            }
            let mut buf = [0u8; 256];
            let n = self.reader.read(&mut buf).expect("read from link");
            assert!(n > 0, "link closed the transport");
            self.pending.extend_from_slice(&buf[..n]);
        }
    }

    fn next_state(&mut self) -> PlayerState {
        let frame = self.next_frame();
        assert_eq!(frame.message_type, MessageType::PlayerState);
        PlayerState::from_payload(&frame.payload).unwrap()
    }

    /// Round trip through the receive thread: every frame sent before this
    /// has been handled once the state frame arrives
    fn sync(&mut self) -> PlayerState {
        self.send(Request::Command(PlayerCommand::UpdateState));
        self.next_state()
    }

    fn read_eof(&mut self) -> bool {
        let mut buf = [0u8; 64];
        matches!(self.reader.read(&mut buf), Ok(0))
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn connect(link: &Link) -> Device {
    let (host_end, device_end) = pair();
    link.on_connected(Box::new(host_end)).unwrap();
    Device::new(device_end)
}

fn setup(state: PlayerState) -> (Link, Receiver<Notification>, Device) {
    init_logging();
    let (tx, rx) = channel::unbounded();
    let link = Link::new(LinkConfig::default(), TestPlayer::new(state), tx);
    let mut device = connect(&link);
    assert_eq!(device.next_state(), state);
    (link, rx, device)
}

fn accepted(link: &Link, rx: &Receiver<Notification>) -> Vec<LinkEvent> {
    rx.try_iter().filter_map(|n| link.accept(n)).collect()
}

fn wait_until(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached");
        thread::sleep(Duration::from_millis(5));
    }
}

fn collect_until_stopped(rx: &Receiver<Notification>) -> Vec<LinkEvent> {
    let mut events = Vec::new();
    loop {
        let notification = rx.recv_timeout(TIMEOUT).expect("Stopped notification");
        let stopped = notification.event == LinkEvent::Stopped;
        events.push(notification.event);
        if stopped {
            return events;
        }
    }
}

#[test]
fn test_connect_sends_initial_state() {
    let state = PlayerState {
        volume: 50,
        position_ms: 12345,
        length_ms: -1,
        playing: true,
        loading: false,
    };
    let (link, rx, _device) = setup(state);

    assert_eq!(link.state(), LinkState::Connected);
    assert_eq!(link.packets_sent(), 1);
    assert_eq!(accepted(&link, &rx), vec![LinkEvent::Connected]);
}

#[test]
fn test_state_frame_flags() {
    let state = PlayerState {
        volume: 50,
        position_ms: 12345,
        length_ms: -1,
        playing: true,
        loading: false,
    };
    let (_link, _rx, mut device) = setup(state);

    device.send(Request::Command(PlayerCommand::UpdateState));
    let frame = device.next_frame();
    assert_eq!(frame.payload[0], 0x05);
    assert_eq!(frame.payload[1], 50);
    assert_eq!(&frame.payload[2..6], &12345i32.to_le_bytes());
    assert_eq!(&frame.payload[6..10], &(-1i32).to_le_bytes());
}

#[test]
fn test_start_and_stop_transmission() {
    let (link, rx, mut device) = setup(PlayerState::default());

    // Start, 8 bins
    device.send_raw(&[0x01, 0x30, 0x02, 0x00, 0x21, 0x04]);
    device.sync();
    assert_eq!(link.state(), LinkState::Transmitting);
    assert_eq!(link.bins(), BinCount::Bins8);
    assert_eq!(link.data_type(), DataType::FREQUENCY);

    link.on_capture_tick(&mut [0x80; 256]);
    let frame = device.next_frame();
    assert_eq!(frame.message_type, MessageType::StartBinTransmission);
    assert_eq!(frame.payload.len(), 8);

    device.send(Request::StopTransmission);
    device.sync();
    assert_eq!(link.state(), LinkState::Connected);

    assert_eq!(
        accepted(&link, &rx),
        vec![
            LinkEvent::Connected,
            LinkEvent::TransmissionStarted {
                bins: BinCount::Bins8,
                data: DataType::FREQUENCY,
            },
            LinkEvent::TransmissionStopped,
        ]
    );
}

#[test]
fn test_waveform_request_doubles_payload() {
    let (link, _rx, mut device) = setup(PlayerState::default());

    device.send(Request::StartTransmission(StartRequest {
        bins: BinCount::Bins16,
        data: DataType::ALL,
    }));
    device.sync();
    assert_eq!(link.data_type(), DataType::ALL);

    link.on_capture_tick(&mut [0x80; 256]);
    assert_eq!(device.next_frame().payload.len(), 32);
}

#[test]
fn test_invalid_bin_code_ignored() {
    let (link, _rx, mut device) = setup(PlayerState::default());

    device.send_raw(&[0x01, 0x30, 0x02, 0x00, 0x27, 0x04]);
    device.sync();
    assert_eq!(link.state(), LinkState::Connected);
}

#[test]
fn test_garbage_then_valid_frame() {
    let (link, _rx, mut device) = setup(PlayerState::default());

    // Parity bit set in the length, then junk, then a real request
    device.send_raw(&[0x01, 0x30, 0x03, 0x00, 0x21, 0x04, 0xFF, 0x42]);
    device.sync();
    assert!(!link.is_transmitting());

    device.send(Request::StartTransmission(StartRequest {
        bins: BinCount::Bins4,
        data: DataType::FREQUENCY,
    }));
    device.sync();
    assert!(link.is_transmitting());
    assert_eq!(link.bins(), BinCount::Bins4);
}

#[test]
fn test_tick_sends_visualization_then_dirty_state() {
    let player = TestPlayer::new(PlayerState::default());
    let (tx, rx) = channel::unbounded();
    let link = Link::new(LinkConfig::default(), player.clone(), tx);
    let mut device = connect(&link);
    device.next_state();

    link.start_transmission(BinCount::Bins4, DataType::FREQUENCY)
        .unwrap();
    player.state.lock().volume = 20;
    link.notify_player_state_changed(StateChange::VOLUME);
    link.on_capture_tick(&mut [0x80; 64]);

    assert_eq!(
        device.next_frame().message_type,
        MessageType::StartBinTransmission
    );
    assert_eq!(device.next_state().volume, 20);
    assert_eq!(link.packets_sent(), 3);

    // Dirty mask was drained
    link.stop_transmission();
    link.on_capture_tick(&mut [0x80; 64]);
    assert_eq!(link.packets_sent(), 3);

    let events = accepted(&link, &rx);
    assert_eq!(events.last(), Some(&LinkEvent::TransmissionStopped));
}

#[test]
fn test_state_sent_while_not_transmitting() {
    let (link, _rx, mut device) = setup(PlayerState::default());

    link.notify_player_state_changed(StateChange::PLAYING);
    link.on_capture_tick(&mut [0x80; 64]);
    device.next_state();
    assert_eq!(link.packets_sent(), 2);
}

#[test]
fn test_command_rate_limit() {
    init_logging();
    let clock = Arc::new(ManualClock::new(1000));
    let (tx, rx) = channel::unbounded();
    let link = Link::builder(TestPlayer::new(PlayerState::default()), tx)
        .clock(clock.clone())
        .build();
    let mut device = connect(&link);
    device.next_state();

    device.send(Request::Command(PlayerCommand::Next));
    device.sync();

    clock.set(1010);
    device.send(Request::Command(PlayerCommand::Play));
    device.sync();

    clock.set(1049);
    device.send(Request::Command(PlayerCommand::Pause));
    device.sync();

    clock.set(1050);
    device.send(Request::Command(PlayerCommand::IncreaseVolume));
    device.sync();

    assert_eq!(
        accepted(&link, &rx),
        vec![
            LinkEvent::Connected,
            LinkEvent::Command(PlayerCommand::Next),
            LinkEvent::Command(PlayerCommand::IncreaseVolume),
        ]
    );
}

#[test]
fn test_update_state_bypasses_rate_limit() {
    init_logging();
    let clock = Arc::new(ManualClock::new(0));
    let (tx, rx) = channel::unbounded();
    let link = Link::builder(TestPlayer::new(PlayerState::default()), tx)
        .clock(clock.clone())
        .build();
    let mut device = connect(&link);
    device.next_state();

    device.send(Request::Command(PlayerCommand::PlayPause));
    // Several back-to-back state requests are all answered
    for _ in 0..3 {
        device.sync();
    }

    clock.set(50);
    device.send(Request::Command(PlayerCommand::SetVolume(40)));
    device.sync();

    assert_eq!(
        accepted(&link, &rx),
        vec![
            LinkEvent::Connected,
            LinkEvent::Command(PlayerCommand::PlayPause),
            LinkEvent::Command(PlayerCommand::SetVolume(40)),
        ]
    );
}

#[test]
fn test_stop_invalidates_session() {
    let (link, rx, mut device) = setup(PlayerState::default());
    let version = link.version();

    link.stop();
    assert_eq!(link.state(), LinkState::Initial);
    assert!(!link.is_current(version));

    // Earlier notifications are stale, the stop itself is current
    assert_eq!(accepted(&link, &rx), vec![LinkEvent::Stopped]);

    // Transport was closed and later calls are no-ops
    assert!(device.read_eof());
    link.notify_player_state_changed(StateChange::ALL);
    link.on_capture_tick(&mut [0x80; 64]);
    assert!(!link.send_player_state());

    // A second stop is silent
    link.stop();
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_peer_disconnect_reports_error_then_stop() {
    let (link, rx, device) = setup(PlayerState::default());
    let _ = accepted(&link, &rx);

    drop(device);

    let events = collect_until_stopped(&rx);
    assert!(matches!(
        events.as_slice(),
        [
            LinkEvent::Error(ConnectionError::Communication(_)),
            LinkEvent::Stopped
        ]
    ));
    wait_until(|| link.state() == LinkState::Initial);
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_write_failure_tears_down() {
    init_logging();
    let (tx, rx) = channel::unbounded();
    let link = Link::new(
        LinkConfig::default(),
        TestPlayer::new(PlayerState::default()),
        tx,
    );

    let (host_end, mut device_end) = pair();
    drop(device_end.channel_reader().unwrap());
    link.on_connected(Box::new(host_end)).unwrap();

    let events = collect_until_stopped(&rx);
    assert!(matches!(
        events.as_slice(),
        [
            LinkEvent::Connected,
            LinkEvent::Error(ConnectionError::Communication(_)),
            LinkEvent::Stopped
        ]
    ));
    assert!(!link.is_connected());
}

#[test]
fn test_reconnect_after_stop() {
    let (link, rx, _device) = setup(PlayerState::default());
    link.start_transmission(BinCount::Bins64, DataType::FREQUENCY)
        .unwrap();
    link.stop();

    let mut device = connect(&link);
    device.next_state();
    assert_eq!(link.state(), LinkState::Connected);
    assert_eq!(link.packets_sent(), 1);

    let events = accepted(&link, &rx);
    assert_eq!(events, vec![LinkEvent::Connected]);
}

#[test]
fn test_frames_to_skip() {
    let (link, _rx, mut device) = setup(PlayerState::default());
    link.set_frames_to_skip(1);
    link.start_transmission(BinCount::Bins4, DataType::FREQUENCY)
        .unwrap();

    for _ in 0..4 {
        link.on_capture_tick(&mut [0x80; 64]);
    }
    // Initial state plus ticks 1 and 3
    assert_eq!(link.packets_sent(), 3);
    device.next_frame();
    device.next_frame();
}

#[test]
fn test_tick_driver_on_tokio_interval() {
    let (link, _rx, mut device) = setup(PlayerState::default());
    link.start_transmission(BinCount::Bins32, DataType::ALL)
        .unwrap();

    tokio_test::block_on(async {
        let mut interval = tokio::time::interval(Duration::from_millis(1));
        for _ in 0..5 {
            interval.tick().await;
            link.on_capture_tick(&mut [0x80; 512]);
        }
    });

    for _ in 0..5 {
        let frame = device.next_frame();
        assert_eq!(frame.message_type, MessageType::StartBinTransmission);
        assert_eq!(frame.payload.len(), 64);
    }
}

#[test]
fn test_failed_connect_keeps_live_session() {
    let (link, rx, mut device) = setup(PlayerState::default());
    let version = link.version();

    let (mut broken, _peer) = pair();
    drop(broken.channel_reader().unwrap());
    assert!(link.on_connected(Box::new(broken)).is_err());

    assert_eq!(link.state(), LinkState::Connected);
    assert!(link.is_current(version));
    device.sync();
    assert_eq!(accepted(&link, &rx), vec![LinkEvent::Connected]);
}

#[test]
fn test_failed_connect_while_connecting_reports_error() {
    init_logging();
    let (tx, rx) = channel::unbounded();
    let link = Link::new(
        LinkConfig::default(),
        TestPlayer::new(PlayerState::default()),
        tx,
    );
    link.start_connecting().unwrap();

    let (mut broken, _peer) = pair();
    drop(broken.channel_reader().unwrap());
    assert!(link.on_connected(Box::new(broken)).is_err());

    assert_eq!(link.state(), LinkState::Initial);
    assert_eq!(
        accepted(&link, &rx),
        vec![
            LinkEvent::Error(ConnectionError::ConnectionFailed),
            LinkEvent::Stopped
        ]
    );
}

#[test]
fn test_transmitting_never_outlives_connected() {
    use std::sync::atomic::{AtomicBool, Ordering};

    init_logging();
    let (tx, _rx) = channel::unbounded();
    let link = Link::new(
        LinkConfig::default(),
        TestPlayer::new(PlayerState::default()),
        tx,
    );

    for _ in 0..50 {
        let _device = connect(&link);
        link.start_transmission(BinCount::Bins4, DataType::FREQUENCY)
            .unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let observer = {
            let link = link.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut violations = 0;
                while !done.load(Ordering::Acquire) {
                    let connected = link.is_connected();
                    if link.is_transmitting() && !connected {
                        violations += 1;
                    }
                }
                violations
            })
        };

        link.stop();
        done.store(true, Ordering::Release);
        assert_eq!(observer.join().unwrap(), 0);
    }
}
