//! Drives one mirroring session at a time
//!
//! `start()` spawns a driver task that walks the session through device
//! selection, the bridge handshake, capture negotiation and streaming.
//! `stop()` cancels the driver and releases whatever it had acquired, one
//! step at a time, so a failure in one release step never skips the next.

use crate::bridge::{BridgeConnection, BridgeOptions, HandshakeProgress, LinkStatus};
use crate::capture::{
    CaptureClient, CaptureParams, CaptureTunnel, OutputSink, ServiceMonitor, spawn_control_drain,
};
use crate::session::events::{EventSink, SessionEvent};
use crate::session::state::SessionState;
use crate::usb::{DeviceProvider, DeviceSelector, Transport};
use crate::video::{
    DecoderFactory, DrawCallback, PipelineConfig, PipelineState, PipelineStats, StatsSnapshot,
    VideoPipeline, default_decoder_factory, terminal_state,
};
use common::{HostKey, MirrorError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Session tunables
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub bridge: BridgeOptions,
    pub pipeline: PipelineConfig,
    /// Time `stop()` waits for the driver before forcing the transport closed
    pub stop_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            bridge: BridgeOptions::default(),
            pipeline: PipelineConfig::default(),
            stop_timeout: Duration::from_secs(3),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Applies transitions and emits one event for each
#[derive(Clone)]
struct StateMachine {
    state: Arc<watch::Sender<SessionState>>,
    active: Arc<watch::Sender<bool>>,
    events: EventSink,
    order: Arc<Mutex<()>>,
}

impl StateMachine {
    /// Enter `next` if allowed from the current state
    fn enter(&self, next: SessionState, message: impl Into<String>) -> bool {
        self.apply(next, SessionEvent::transition(next, message))
    }

    /// Enter `Error` because of `error`
    fn fail(&self, error: &MirrorError) -> bool {
        let entered = self.apply(SessionState::Error, SessionEvent::failure(error));
        if entered {
            error!("Session failed: {}", error);
        }
        entered
    }

    /// The state watch is published last, so a waiter woken by it already
    /// sees the event and the stream flag
    fn apply(&self, next: SessionState, event: SessionEvent) -> bool {
        let _order = lock(&self.order);
        let current = *self.state.borrow();
        if !current.can_transition_to(next) {
            debug!("Ignoring transition to {} from {}", next, current);
            return false;
        }

        info!("Session state: {}", next);
        self.active.send_if_modified(|active| {
            let streaming = next == SessionState::Streaming;
            let changed = *active != streaming;
            *active = streaming;
            changed
        });
        (self.events)(event);
        self.state.send_replace(next);
        true
    }

    fn emit(&self, event: SessionEvent) {
        let _order = lock(&self.order);
        (self.events)(event);
    }
}

/// Everything a session has acquired, released in reverse order
#[derive(Default)]
struct SessionResources {
    transport: Mutex<Option<Arc<dyn Transport>>>,
    bridge: Mutex<Option<Arc<BridgeConnection>>>,
    service: Mutex<Option<Arc<ServiceMonitor>>>,
    control: Mutex<Option<JoinHandle<()>>>,
    pipeline: Mutex<Option<VideoPipeline>>,
    stats: Mutex<Option<Arc<PipelineStats>>>,
}

impl SessionResources {
    fn transport(&self) -> Option<Arc<dyn Transport>> {
        lock(&self.transport).clone()
    }

    /// Release every resource, logging each step's outcome
    async fn release(&self) {
        let pipeline = lock(&self.pipeline).take();
        if let Some(mut pipeline) = pipeline {
            pipeline.stop().await;
            debug!("Released video pipeline");
        }

        if let Some(control) = lock(&self.control).take() {
            control.abort();
        }
        if let Some(service) = lock(&self.service).take() {
            service.stop();
        }

        let bridge = lock(&self.bridge).take();
        if let Some(bridge) = bridge {
            match bridge.shutdown().await {
                Ok(()) => debug!("Released bridge streams"),
                Err(e) => warn!("Releasing bridge streams failed: {}", e),
            }
        }

        if let Some(transport) = lock(&self.transport).take() {
            transport.close();
            debug!("Released transport for {}", transport.device());
        }
    }
}

struct ActiveSession {
    id: u64,
    cancel: CancellationToken,
    driver: JoinHandle<()>,
    resources: Arc<SessionResources>,
    machine: StateMachine,
}

struct ControllerInner {
    provider: Arc<dyn DeviceProvider>,
    key: Arc<HostKey>,
    options: SessionOptions,
    decoders: DecoderFactory,
    state: Arc<watch::Sender<SessionState>>,
    active: Arc<watch::Sender<bool>>,
    session: tokio::sync::Mutex<Option<ActiveSession>>,
    stop_lock: tokio::sync::Mutex<()>,
    next_id: AtomicU64,
}

/// Owner of at most one mirroring session
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<ControllerInner>,
}

impl SessionController {
    pub fn new(provider: Arc<dyn DeviceProvider>, key: Arc<HostKey>, options: SessionOptions) -> Self {
        Self::with_decoders(provider, key, options, default_decoder_factory())
    }

    pub fn with_decoders(
        provider: Arc<dyn DeviceProvider>,
        key: Arc<HostKey>,
        options: SessionOptions,
        decoders: DecoderFactory,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let (active, _) = watch::channel(false);
        Self {
            inner: Arc::new(ControllerInner {
                provider,
                key,
                options,
                decoders,
                state: Arc::new(state),
                active: Arc::new(active),
                session: tokio::sync::Mutex::new(None),
                stop_lock: tokio::sync::Mutex::new(()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// `true` exactly while the session is `Streaming`
    pub fn stream_active(&self) -> watch::Receiver<bool> {
        self.inner.active.subscribe()
    }

    /// Start a session
    ///
    /// Returns as soon as the driver is running; progress is reported
    /// through `on_event` and the state watch. Fails with `AlreadyActive`
    /// unless the controller is `Idle`, `Stopped` or `Error`.
    pub async fn start(
        &self,
        selector: DeviceSelector,
        params: CaptureParams,
        on_event: EventSink,
        surface: DrawCallback,
    ) -> Result<SessionHandle, MirrorError> {
        let mut slot = self.inner.session.lock().await;
        let current = self.state();
        if !current.can_start() {
            return Err(MirrorError::AlreadyActive);
        }
        if let Some(previous) = slot.take() {
            debug!("Discarding finished session {}", previous.id);
            previous.resources.release().await;
        }

        let machine = StateMachine {
            state: Arc::clone(&self.inner.state),
            active: Arc::clone(&self.inner.active),
            events: on_event,
            order: Arc::new(Mutex::new(())),
        };
        if !machine.enter(SessionState::RequestingDevice, "Requesting device") {
            return Err(MirrorError::AlreadyActive);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let resources = Arc::new(SessionResources::default());
        let driver = SessionDriver {
            provider: Arc::clone(&self.inner.provider),
            key: Arc::clone(&self.inner.key),
            options: self.inner.options.clone(),
            decoders: Arc::clone(&self.inner.decoders),
            selector,
            params: Arc::new(params),
            surface,
            resources: Arc::clone(&resources),
            machine: machine.clone(),
        };
        let driver = tokio::spawn(driver.run(cancel.clone()));

        *slot = Some(ActiveSession {
            id,
            cancel,
            driver,
            resources: Arc::clone(&resources),
            machine,
        });

        Ok(SessionHandle {
            id,
            controller: self.clone(),
            state: self.inner.state.subscribe(),
            active: self.inner.active.subscribe(),
            resources,
        })
    }

    /// Stop the current session, if any
    ///
    /// Idempotent. Always ends in `Stopped`, including from `Idle`.
    pub async fn stop(&self) -> Result<(), MirrorError> {
        self.stop_session(None).await
    }

    async fn stop_session(&self, only: Option<u64>) -> Result<(), MirrorError> {
        let _serialized = self.inner.stop_lock.lock().await;
        let session = {
            let mut slot = self.inner.session.lock().await;
            match slot.as_ref() {
                Some(active) if only.is_none_or(|id| id == active.id) => slot.take(),
                None if only.is_none() => {
                    self.settle_without_session();
                    None
                }
                _ => None,
            }
        };
        let Some(mut session) = session else {
            return Ok(());
        };

        session.machine.enter(SessionState::Stopping, "Stopping session");
        session.cancel.cancel();

        let stop_timeout = self.inner.options.stop_timeout;
        if tokio::time::timeout(stop_timeout, &mut session.driver)
            .await
            .is_err()
        {
            warn!(
                "Session driver did not stop within {:?}, forcing transport closed",
                stop_timeout
            );
            if let Some(transport) = session.resources.transport() {
                transport.close();
            }
            session.driver.abort();
        }

        session.resources.release().await;
        session.machine.enter(SessionState::Stopped, "Session stopped");
        Ok(())
    }

    /// Walk `Stopping -> Stopped` when no session was ever started
    ///
    /// Called with the session slot locked so a concurrent `start()` cannot
    /// interleave. There is no observer yet, so the events are only logged.
    fn settle_without_session(&self) {
        if self.state() == SessionState::Stopped {
            return;
        }
        let machine = StateMachine {
            state: Arc::clone(&self.inner.state),
            active: Arc::clone(&self.inner.active),
            events: Arc::new(|event: SessionEvent| debug!("{}", event)),
            order: Arc::new(Mutex::new(())),
        };
        machine.enter(SessionState::Stopping, "Stopping session");
        machine.enter(SessionState::Stopped, "Session stopped");
    }
}

/// Caller's view of a started session
pub struct SessionHandle {
    id: u64,
    controller: SessionController,
    state: watch::Receiver<SessionState>,
    active: watch::Receiver<bool>,
    resources: Arc<SessionResources>,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn stream_active(&self) -> watch::Receiver<bool> {
        self.active.clone()
    }

    /// Wait until the session reaches a state matching `predicate`
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(SessionState) -> bool,
    ) -> SessionState {
        let reached = self.state.wait_for(|s| predicate(*s)).await.map(|s| *s);
        match reached {
            Ok(state) => state,
            Err(_) => *self.state.borrow(),
        }
    }

    /// Pipeline counters, once streaming has started
    pub fn stats(&self) -> Option<StatsSnapshot> {
        lock(&self.resources.stats).as_ref().map(|s| s.snapshot())
    }

    /// Stop this session; no effect if a newer one has started since
    pub async fn stop(&self) -> Result<(), MirrorError> {
        self.controller.stop_session(Some(self.id)).await
    }
}

struct SessionDriver {
    provider: Arc<dyn DeviceProvider>,
    key: Arc<HostKey>,
    options: SessionOptions,
    decoders: DecoderFactory,
    selector: DeviceSelector,
    params: Arc<CaptureParams>,
    surface: DrawCallback,
    resources: Arc<SessionResources>,
    machine: StateMachine,
}

impl SessionDriver {
    async fn run(self, cancel: CancellationToken) {
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(MirrorError::Cancelled),
            result = self.drive() => result,
        };

        match result {
            Ok(()) | Err(MirrorError::Cancelled) => debug!("Session driver finished"),
            Err(e) => {
                self.resources.release().await;
                self.machine.fail(&e);
            }
        }
    }

    /// Run the session until something ends it
    async fn drive(&self) -> Result<(), MirrorError> {
        let transport = self.provider.open_device(&self.selector).await?;
        *lock(&self.resources.transport) = Some(Arc::clone(&transport));
        self.machine.enter(
            SessionState::Connecting,
            format!("Connecting to {}", transport.device()),
        );

        let machine = self.machine.clone();
        let progress = move |step: HandshakeProgress| match step {
            HandshakeProgress::AuthChallenge => {
                machine.enter(SessionState::Authenticating, "Device requested authentication");
            }
            HandshakeProgress::SignatureRejected => {
                machine.emit(SessionEvent::info("Device does not know this host key yet"));
            }
            HandshakeProgress::AwaitingUserApproval => {
                machine.emit(SessionEvent::info(
                    "Accept the USB debugging prompt on the device",
                ));
            }
        };
        let bridge = BridgeConnection::connect(
            Arc::clone(&transport),
            Arc::clone(&self.key),
            &self.options.bridge,
            &progress,
        )
        .await?;
        let bridge = Arc::new(bridge);
        *lock(&self.resources.bridge) = Some(Arc::clone(&bridge));

        self.machine.enter(
            SessionState::NegotiatingCapture,
            format!(
                "Starting capture service on {}",
                bridge.banner().model().unwrap_or("device")
            ),
        );
        let on_output: OutputSink = {
            let machine = self.machine.clone();
            Arc::new(move |line| machine.emit(SessionEvent::info(line)))
        };
        let CaptureTunnel {
            control,
            video,
            service,
            meta,
        } = CaptureClient::new(&bridge, &self.params, on_output)
            .start()
            .await?;
        let service = Arc::new(service);
        *lock(&self.resources.service) = Some(Arc::clone(&service));
        *lock(&self.resources.control) = Some(spawn_control_drain(control));

        let decoder = (self.decoders)(&meta)?;
        let pipeline = VideoPipeline::start(
            video,
            &meta,
            decoder,
            Arc::clone(&self.surface),
            &self.options.pipeline,
        )?;
        let mut pipeline_state = pipeline.subscribe();
        *lock(&self.resources.stats) = Some(pipeline.stats_handle());
        *lock(&self.resources.pipeline) = Some(pipeline);

        self.machine.enter(
            SessionState::Streaming,
            format!(
                "Stream started: {} at {}x{}",
                meta.device_name, meta.width, meta.height
            ),
        );

        // A link failure also breaks the service and video streams; report it
        // as the cause
        let error = tokio::select! {
            biased;
            status = bridge.closed() => match status {
                LinkStatus::Failed(e) => e,
                _ => MirrorError::Disconnected,
            },
            state = terminal_state(&mut pipeline_state) => match state {
                PipelineState::Error(e) => e,
                _ => end_of_stream(transport.as_ref()),
            },
            e = service.failed() => e,
        };
        Err(error)
    }
}

fn end_of_stream(transport: &dyn Transport) -> MirrorError {
    if transport.is_open() {
        MirrorError::CaptureServiceUnavailable("capture service ended the video stream".to_string())
    } else {
        MirrorError::Disconnected
    }
}
