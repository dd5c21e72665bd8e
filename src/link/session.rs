// ABOUTME: Link session lifecycle and observer glue
// ABOUTME: Connect/teardown, capture tick, received frame dispatch and command rate limiting

use crate::error::Error;
use crate::link::clock::{Clock, MonotonicClock};
use crate::link::config::LinkConfig;
use crate::link::encoder::{LinkEncoder, TickSettings};
use crate::link::events::{ConnectionError, LinkEvent, Notification, PlayerHost, StateChange};
use crate::link::processor::{SpectrumProcessor, VisualizerProcessor};
use crate::link::receiver;
use crate::link::slim_lock::SlimLock;
use crate::link::transport::Transport;
use crate::protocol::decoder::ReceivedFrame;
use crate::protocol::messages::{BinCount, DataType, MessageType, PlayerCommand, StartRequest};
use crate::Result;
use crossbeam::channel::Sender;
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Builds a fresh processor for every connection
pub type ProcessorFactory = Box<dyn Fn() -> Box<dyn VisualizerProcessor> + Send + Sync>;

fn default_processor() -> Box<dyn VisualizerProcessor> {
    Box::new(SpectrumProcessor::new())
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No transport
    Initial,
    /// Waiting for the external transport to connect
    Connecting,
    /// Connected, not sending visualization frames
    Connected,
    /// Connected and sending visualization frames
    Transmitting,
}

struct Shared {
    config: LinkConfig,
    host: Arc<dyn PlayerHost>,
    events: Sender<Notification>,
    clock: Arc<dyn Clock>,
    processor_factory: ProcessorFactory,

    /// Serializes connect, teardown and transmission changes
    lifecycle: Mutex<()>,
    version: AtomicU32,
    connecting: AtomicBool,
    connected: AtomicBool,
    transmitting: AtomicBool,

    bins: AtomicU8,
    data: AtomicU8,
    frames_to_skip: AtomicU32,

    state_dirty: AtomicU32,
    packets_sent: AtomicU64,
    last_command_ms: Mutex<Option<u64>>,

    encoder: SlimLock<Option<LinkEncoder>>,
    transport: Mutex<Option<Box<dyn Transport>>>,
}

/// Builder for [`Link`]
pub struct LinkBuilder {
    config: LinkConfig,
    host: Arc<dyn PlayerHost>,
    events: Sender<Notification>,
    clock: Option<Arc<dyn Clock>>,
    processor_factory: Option<ProcessorFactory>,
}

impl LinkBuilder {
    /// Set the configuration
    pub fn config(mut self, config: LinkConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the clock used for command rate limiting
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the visualization processor factory
    pub fn processor<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn VisualizerProcessor> + Send + Sync + 'static,
    {
        self.processor_factory = Some(Box::new(factory));
        self
    }

    /// Build the link
    pub fn build(self) -> Link {
        let frames_to_skip = self.config.frames_to_skip;
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(MonotonicClock::new()),
        };
        let processor_factory: ProcessorFactory = match self.processor_factory {
            Some(factory) => factory,
            None => Box::new(default_processor),
        };

        Link {
            shared: Arc::new(Shared {
                config: self.config,
                host: self.host,
                events: self.events,
                clock,
                processor_factory,
                lifecycle: Mutex::new(()),
                version: AtomicU32::new(0),
                connecting: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                transmitting: AtomicBool::new(false),
                bins: AtomicU8::new(BinCount::default().code()),
                data: AtomicU8::new(DataType::default().bits()),
                frames_to_skip: AtomicU32::new(frames_to_skip),
                state_dirty: AtomicU32::new(0),
                packets_sent: AtomicU64::new(0),
                last_command_ms: Mutex::new(None),
                encoder: SlimLock::new(None),
                transport: Mutex::new(None),
            }),
        }
    }
}

/// A visualizer link session.
///
/// Cheap to clone; all clones share one session. The capture driver calls
/// [`Link::on_capture_tick`], the transport owner calls
/// [`Link::on_connected`], and the host drains [`Notification`]s from the
/// channel given at construction, filtering them through [`Link::accept`].
#[derive(Clone)]
pub struct Link {
    shared: Arc<Shared>,
}

impl Link {
    /// Create a link with default clock and processor
    pub fn new(config: LinkConfig, host: Arc<dyn PlayerHost>, events: Sender<Notification>) -> Self {
        Self::builder(host, events).config(config).build()
    }

    /// Start building a link
    pub fn builder(host: Arc<dyn PlayerHost>, events: Sender<Notification>) -> LinkBuilder {
        LinkBuilder {
            config: LinkConfig::default(),
            host,
            events,
            clock: None,
            processor_factory: None,
        }
    }

    /// Get the link configuration
    pub fn config(&self) -> &LinkConfig {
        &self.shared.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> LinkState {
        let shared = &self.shared;
        if shared.transmitting.load(Ordering::Acquire) {
            LinkState::Transmitting
        } else if shared.connected.load(Ordering::Acquire) {
            LinkState::Connected
        } else if shared.connecting.load(Ordering::Acquire) {
            LinkState::Connecting
        } else {
            LinkState::Initial
        }
    }

    /// Live session version
    pub fn version(&self) -> u32 {
        self.shared.version.load(Ordering::Acquire)
    }

    /// Whether `version` is still the live version
    pub fn is_current(&self, version: u32) -> bool {
        self.version() == version
    }

    /// Whether a transport is connected
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Whether visualization frames are being sent
    pub fn is_transmitting(&self) -> bool {
        self.shared.transmitting.load(Ordering::Acquire)
    }

    /// Frames written since the last connect
    pub fn packets_sent(&self) -> u64 {
        self.shared.packets_sent.load(Ordering::Relaxed)
    }

    /// Requested resolution
    pub fn bins(&self) -> BinCount {
        BinCount::from_code(self.shared.bins.load(Ordering::Relaxed)).unwrap_or_default()
    }

    /// Requested data
    pub fn data_type(&self) -> DataType {
        DataType::from_bits(self.shared.data.load(Ordering::Relaxed))
    }

    /// Capture ticks skipped between transmitted frames
    pub fn frames_to_skip(&self) -> u32 {
        self.shared.frames_to_skip.load(Ordering::Relaxed)
    }

    /// Change the number of capture ticks skipped between transmitted frames
    pub fn set_frames_to_skip(&self, frames: u32) {
        self.shared.frames_to_skip.store(frames, Ordering::Relaxed);
    }

    /// Return the event if it was posted under the live version
    pub fn accept(&self, notification: Notification) -> Option<LinkEvent> {
        if self.is_current(notification.version) {
            Some(notification.event)
        } else {
            log::debug!(
                "Dropping stale {:?} (version {}, live {})",
                notification.event,
                notification.version,
                self.version()
            );
            None
        }
    }

    /// Mark the link as waiting for its transport
    pub fn start_connecting(&self) -> Result<()> {
        let shared = &self.shared;
        let _lifecycle = shared.lifecycle.lock();
        if shared.connected.load(Ordering::Acquire) || shared.connecting.load(Ordering::Acquire) {
            return Err(Error::Connection("link already active".to_string()));
        }
        shared.connecting.store(true, Ordering::Release);
        log::info!("Link connecting");
        Ok(())
    }

    /// Take ownership of a connected transport and start the session
    pub fn on_connected(&self, mut transport: Box<dyn Transport>) -> Result<()> {
        let shared = &self.shared;
        if shared.connected.load(Ordering::Acquire) {
            transport.close();
            return Err(Error::Connection("link already connected".to_string()));
        }

        let split = transport
            .reader()
            .and_then(|reader| Ok((reader, transport.writer()?)));
        let (reader, writer) = match split {
            Ok(halves) => halves,
            Err(e) => {
                log::warn!("Failed to open transport streams: {}", e);
                transport.close();
                // A live session stays untouched
                let pending = {
                    let _lifecycle = shared.lifecycle.lock();
                    (!shared.connected.load(Ordering::Acquire)).then(|| self.version())
                };
                if let Some(version) = pending {
                    self.teardown(Some(version), Some(ConnectionError::ConnectionFailed));
                }
                return Err(e.into());
            }
        };

        let version = {
            let _lifecycle = shared.lifecycle.lock();
            if shared.connected.load(Ordering::Acquire) {
                transport.close();
                return Err(Error::Connection("link already connected".to_string()));
            }

            {
                let mut encoder = shared.encoder.lock_high();
                *encoder = Some(LinkEncoder::new(writer, (shared.processor_factory)()));
            }
            *shared.transport.lock() = Some(transport);
            *shared.last_command_ms.lock() = None;
            shared.packets_sent.store(0, Ordering::Relaxed);
            shared.state_dirty.store(0, Ordering::Relaxed);
            shared.transmitting.store(false, Ordering::Release);

            let version = shared.version.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
            shared.connecting.store(false, Ordering::Release);
            shared.connected.store(true, Ordering::Release);
            self.post(version, LinkEvent::Connected);
            version
        };

        log::info!("Link connected (version {})", version);
        self.send_player_state();

        if let Err(e) = receiver::spawn(self.clone(), reader, version) {
            log::error!("Failed to spawn receive thread: {}", e);
            self.teardown(
                Some(version),
                Some(ConnectionError::Communication(e.to_string())),
            );
            return Err(e.into());
        }

        Ok(())
    }

    /// Start sending visualization frames
    pub fn start_transmission(&self, bins: BinCount, data: DataType) -> Result<()> {
        if self.begin_transmission(self.version(), bins, data) {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Stop sending visualization frames
    pub fn stop_transmission(&self) {
        self.end_transmission(self.version());
    }

    /// Record a player state change; the next capture tick sends a state frame
    pub fn notify_player_state_changed(&self, change: StateChange) {
        if !change.is_empty() {
            self.shared
                .state_dirty
                .fetch_or(change.bits(), Ordering::AcqRel);
        }
    }

    /// Send a player state frame now, or on the next tick if the encoder is busy.
    ///
    /// Returns true if the frame was written immediately.
    pub fn send_player_state(&self) -> bool {
        let shared = &self.shared;
        if !shared.connected.load(Ordering::Acquire) {
            return false;
        }
        let version = self.version();

        let Some(mut guard) = shared.encoder.try_lock_low() else {
            shared
                .state_dirty
                .fetch_or(StateChange::ALL.bits(), Ordering::AcqRel);
            return false;
        };
        let Some(encoder) = guard.as_mut() else {
            return false;
        };

        let result = encoder.write_player_state(&shared.host.player_state());
        drop(guard);

        match result {
            Ok(()) => {
                shared.packets_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.on_transport_error(version, e);
                false
            }
        }
    }

    /// Periodic capture callback.
    ///
    /// Writes a visualization frame when one is due and then a player state
    /// frame if the state is dirty. Does nothing if the encoder is busy or the
    /// link is being torn down.
    pub fn on_capture_tick(&self, waveform: &mut [u8]) {
        let shared = &self.shared;
        if !shared.connected.load(Ordering::Acquire) {
            return;
        }
        let version = self.version();

        let Some(mut guard) = shared.encoder.try_lock_low() else {
            return;
        };
        let Some(encoder) = guard.as_mut() else {
            return;
        };

        let result = self.run_tick(encoder, waveform);
        drop(guard);

        match result {
            Ok(sent) => {
                shared.packets_sent.fetch_add(sent, Ordering::Relaxed);
            }
            Err(e) => self.on_transport_error(version, e),
        }
    }

    /// Relay an external connection error, then tear down
    pub fn report_error(&self, error: ConnectionError) {
        log::warn!("Link error: {}", error);
        self.teardown(None, Some(error));
    }

    /// Tear down the session
    pub fn stop(&self) {
        self.teardown(None, None);
    }

    /// Dispatch a frame decoded by the receive task
    pub(crate) fn handle_frame(&self, version: u32, frame: ReceivedFrame) {
        if !self.is_current(version) {
            return;
        }

        match frame.message_type {
            MessageType::StartBinTransmission => match StartRequest::from_byte(frame.payload as u8) {
                Some(request) => {
                    self.begin_transmission(version, request.bins, request.data);
                }
                None => log::debug!("Ignoring start request {:#04x}", frame.payload),
            },
            MessageType::StopBinTransmission => self.end_transmission(version),
            MessageType::PlayerCommand => {
                match PlayerCommand::from_payload(frame.payload, frame.payload_length) {
                    Some(command) => self.handle_command(version, command),
                    None => log::debug!("Ignoring player command {:#06x}", frame.payload),
                }
            }
            MessageType::PlayerState => log::debug!("Ignoring player state from device"),
        }
    }

    /// Transport failure observed by the encoder or the receive task
    pub(crate) fn on_transport_error(&self, version: u32, error: io::Error) {
        if !self.is_current(version) || !self.is_connected() {
            log::debug!("Ignoring transport error on stale link: {}", error);
            return;
        }
        log::warn!("Transport error: {}", error);
        self.teardown(
            Some(version),
            Some(ConnectionError::Communication(error.to_string())),
        );
    }

    fn run_tick(&self, encoder: &mut LinkEncoder, waveform: &mut [u8]) -> io::Result<u64> {
        let shared = &self.shared;
        let mut sent = 0;

        if shared.transmitting.load(Ordering::Acquire) {
            let settings = TickSettings {
                playing: shared.host.is_playing(),
                blank_idle: shared.config.blank_idle_waveform,
                frames_to_skip: self.frames_to_skip(),
                bins: self.bins(),
                data: self.data_type(),
            };
            if encoder.write_visualization(waveform, &settings)? {
                sent += 1;
            }
        }

        if shared.state_dirty.swap(0, Ordering::AcqRel) != 0 {
            encoder.write_player_state(&shared.host.player_state())?;
            sent += 1;
        }

        Ok(sent)
    }

    fn begin_transmission(&self, version: u32, bins: BinCount, data: DataType) -> bool {
        let shared = &self.shared;
        let _lifecycle = shared.lifecycle.lock();
        if !self.is_current(version) || !shared.connected.load(Ordering::Acquire) {
            return false;
        }

        let data = if data.is_empty() {
            DataType::FREQUENCY
        } else {
            data
        };
        shared.bins.store(bins.code(), Ordering::Relaxed);
        shared.data.store(data.bits(), Ordering::Relaxed);
        shared.transmitting.store(true, Ordering::Release);

        log::info!("Transmitting {} bins ({:?})", bins.bins(), data);
        self.post(version, LinkEvent::TransmissionStarted { bins, data });
        true
    }

    fn end_transmission(&self, version: u32) {
        let shared = &self.shared;
        let _lifecycle = shared.lifecycle.lock();
        if !self.is_current(version) {
            return;
        }
        if shared.transmitting.swap(false, Ordering::AcqRel) {
            log::info!("Transmission stopped");
            self.post(version, LinkEvent::TransmissionStopped);
        }
    }

    fn handle_command(&self, version: u32, command: PlayerCommand) {
        if command.is_update_state() {
            self.send_player_state();
            return;
        }

        let now = self.shared.clock.now_millis();
        {
            let mut last = self.shared.last_command_ms.lock();
            if let Some(previous) = *last {
                let elapsed = now.saturating_sub(previous);
                if elapsed < self.shared.config.command_interval_ms {
                    log::debug!("Dropping {} ({}ms after previous)", command, elapsed);
                    return;
                }
            }
            *last = Some(now);
        }

        log::debug!("Player command: {}", command);
        self.post(version, LinkEvent::Command(command));
    }

    /// Shared teardown. With `expected_version`, only runs if still current.
    fn teardown(&self, expected_version: Option<u32>, error: Option<ConnectionError>) {
        let shared = &self.shared;
        let _lifecycle = shared.lifecycle.lock();
        if let Some(version) = expected_version {
            if !self.is_current(version) {
                return;
            }
        }

        // Cleared first so transmitting never outlives connected
        shared.transmitting.store(false, Ordering::Release);
        let was_connected = shared.connected.swap(false, Ordering::AcqRel);
        let was_connecting = shared.connecting.swap(false, Ordering::AcqRel);
        let version = shared.version.fetch_add(1, Ordering::AcqRel).wrapping_add(1);

        {
            // Waits out an in-flight capture tick
            let mut encoder = shared.encoder.lock_high();
            *encoder = None;
        }
        if let Some(mut transport) = shared.transport.lock().take() {
            transport.close();
        }
        shared.state_dirty.store(0, Ordering::Relaxed);

        if was_connected || was_connecting || error.is_some() {
            log::info!("Link stopped (version {})", version);
            if let Some(error) = error {
                self.post(version, LinkEvent::Error(error));
            }
            self.post(version, LinkEvent::Stopped);
        }
    }

    fn post(&self, version: u32, event: LinkEvent) {
        if self
            .shared
            .events
            .send(Notification { version, event })
            .is_err()
        {
            log::debug!("Host mailbox closed");
        }
    }
}
