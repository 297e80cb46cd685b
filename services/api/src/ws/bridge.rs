//! Per-connection bridge between the client socket and the inference stream.
//!
//! Two flows run concurrently. Client intents (`start_session`, audio chunks,
//! end) are encoded into frames and pushed onto the [`OutboundQueue`], which is
//! the outbound stream handed to the [`InferenceStreamClient`]. A demux task
//! reads the inbound stream and relays transcripts and audio to the client.
//! Every fatal condition ends up in [`DuplexStreamBridge::close`].

use super::{
    protocol::{ServerMessage, StartSession, TranscriptRole},
    queue::{OutboundQueue, QueueError},
    transport::ClientTransport,
};
use crate::{audio_utils::pcm16_level_percent, config::Config, prompt::SystemPromptComposer};
use bytes::Bytes;
use futures_util::StreamExt;
use sonic_bridge_core::{
    EventFrameEncoder, InboundFrame, InboundFrames, InferenceStreamClient, OutboundFrame,
    ProtocolViolation, SessionLifecycleManager,
    frame::GenerationStage,
    lifecycle::{ContentKind, Role, SessionStatus},
    media::{AudioChunk, AudioMediaParams, AudioOutputParams, InferenceParams},
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, trace, warn};

/// Consecutive failed client sends after which the client is considered gone.
const MAX_SEND_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    SessionStarting,
    SessionReady,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent `end_session`.
    ClientEnded,
    /// The client socket closed or stopped accepting messages.
    ClientDisconnect,
    RemoteStreamError(String),
    RemoteStreamEnded,
    ProtocolViolation(String),
    ServerShutdown,
}

impl CloseReason {
    /// The `error` message the client should see, if any.
    fn client_message(&self) -> Option<String> {
        match self {
            CloseReason::RemoteStreamError(message) | CloseReason::ProtocolViolation(message) => {
                Some(message.clone())
            }
            _ => None,
        }
    }
}

/// Settings shared by every bridge, derived from [`Config`].
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub inference: InferenceParams,
    pub audio_input: AudioMediaParams,
    pub output_sample_rate: u32,
    pub default_voice_id: String,
    pub queue_capacity: usize,
    pub session_end_timeout: Duration,
}

impl BridgeConfig {
    /// Speech output parameters for the given voice.
    pub fn audio_output(&self, voice_id: &str) -> AudioOutputParams {
        AudioOutputParams::speech(self.output_sample_rate, voice_id)
    }
}

impl From<&Config> for BridgeConfig {
    fn from(config: &Config) -> Self {
        Self {
            inference: config.inference,
            audio_input: config.audio_input(),
            output_sample_rate: config.output_sample_rate,
            default_voice_id: config.voice_id.clone(),
            queue_capacity: config.outbound_queue_capacity,
            session_end_timeout: config.session_end_timeout,
        }
    }
}

struct BridgeState {
    connection: ConnectionState,
    lifecycle: SessionLifecycleManager,
    encoder: EventFrameEncoder,
    /// Set once `SessionStart` reached the queue; only then is a graceful
    /// `SessionEnd` worth sending.
    remote_started: bool,
    /// End frames for blocks a partially enqueued bootstrap left open.
    pending_ends: Vec<OutboundFrame>,
    session_ends: u32,
}

struct Shared {
    config: BridgeConfig,
    state: Mutex<BridgeState>,
    closing: AtomicBool,
    send_failures: AtomicU32,
    queue: Arc<OutboundQueue>,
    cancel: CancellationToken,
    inference: Arc<dyn InferenceStreamClient>,
    transport: Arc<dyn ClientTransport>,
    composer: Arc<dyn SystemPromptComposer>,
}

/// Outcome of relaying one message to the client.
enum Delivery {
    Sent,
    Skipped,
    Failed,
    ClientGone,
}

/// Remote-side turn bookkeeping, owned by the demux task.
#[derive(Debug, Default)]
struct TurnTracker {
    text_role: Option<Role>,
    text_stage: Option<GenerationStage>,
    open_assistant_audio: Option<Option<String>>,
    blocks_started: u64,
    blocks_ended: u64,
    assistant_audio_turns: u64,
}

impl TurnTracker {
    fn content_started(
        &mut self,
        content_id: Option<String>,
        kind: Option<ContentKind>,
        role: Option<Role>,
        stage: Option<GenerationStage>,
    ) {
        self.blocks_started += 1;
        match kind {
            Some(ContentKind::Text) => {
                self.text_role = role;
                self.text_stage = stage;
            }
            Some(ContentKind::Audio) if role == Some(Role::Assistant) => {
                self.open_assistant_audio = Some(content_id);
            }
            _ => {}
        }
    }

    fn content_ended(&mut self, content_id: Option<&str>) {
        self.blocks_ended += 1;
        let ends_audio = match (&self.open_assistant_audio, content_id) {
            (Some(open), Some(id)) => open.as_deref().is_none_or(|open| open == id),
            (Some(_), None) => true,
            (None, _) => false,
        };
        if ends_audio {
            self.open_assistant_audio = None;
            self.assistant_audio_turns += 1;
        }
    }

    /// Role of a text output and whether it should reach the client.
    fn transcript_role(&self, role: Option<Role>) -> (TranscriptRole, bool) {
        match role.or(self.text_role) {
            Some(Role::User) => (TranscriptRole::User, true),
            _ => (
                TranscriptRole::Assistant,
                self.text_stage != Some(GenerationStage::Speculative),
            ),
        }
    }
}

/// Bridges one client connection to one inference stream.
#[derive(Clone)]
pub struct DuplexStreamBridge {
    shared: Arc<Shared>,
}

impl DuplexStreamBridge {
    pub fn new(
        config: BridgeConfig,
        inference: Arc<dyn InferenceStreamClient>,
        transport: Arc<dyn ClientTransport>,
        composer: Arc<dyn SystemPromptComposer>,
    ) -> Self {
        let encoder = EventFrameEncoder::new(
            config.inference,
            config.audio_output(&config.default_voice_id),
        );
        let queue = OutboundQueue::new(config.queue_capacity);
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(BridgeState {
                    connection: ConnectionState::Connected,
                    lifecycle: SessionLifecycleManager::new(),
                    encoder,
                    remote_started: false,
                    pending_ends: Vec::new(),
                    session_ends: 0,
                }),
                closing: AtomicBool::new(false),
                send_failures: AtomicU32::new(0),
                queue,
                cancel: CancellationToken::new(),
                inference,
                transport,
                composer,
            }),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        self.shared.state.lock().await.connection
    }

    pub async fn session_status(&self) -> SessionStatus {
        self.shared.state.lock().await.lifecycle.session_status()
    }

    pub fn is_closing(&self) -> bool {
        self.shared.closing.load(Ordering::SeqCst)
    }

    /// Resolves once teardown has finished.
    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await
    }

    /// Opens the inference stream, bootstraps the session and tells the client
    /// it may start talking.
    pub async fn start_session(&self, request: StartSession) {
        {
            let mut state = self.shared.state.lock().await;
            if state.connection != ConnectionState::Connected {
                warn!(state = ?state.connection, "Ignoring start_session: session already started.");
                return;
            }
            if let Err(e) = state.lifecycle.start_session() {
                drop(state);
                self.fail(ProtocolViolation::from(e)).await;
                return;
            }
            state.connection = ConnectionState::SessionStarting;

            let voice_id = request
                .voice_id
                .as_deref()
                .map(str::trim)
                .filter(|voice| !voice.is_empty())
                .unwrap_or(self.shared.config.default_voice_id.as_str());
            state.encoder = EventFrameEncoder::new(
                self.shared.config.inference,
                self.shared.config.audio_output(voice_id),
            );
            info!(voice_id, "Starting voice session.");
        }

        let system_prompt = self.shared.composer.compose(&request);

        let inbound = match self.shared.inference.open(self.shared.queue.frames()).await {
            Ok(inbound) => inbound,
            Err(e) => {
                error!(error = %e, "Failed to open inference stream.");
                self.close(CloseReason::RemoteStreamError(format!(
                    "Failed to start voice session: {e}"
                )))
                .await;
                return;
            }
        };

        let mut state = self.shared.state.lock().await;
        if state.connection != ConnectionState::SessionStarting {
            debug!("Bridge closed while the inference stream was opening.");
            return;
        }

        let demux = self.clone();
        tokio::spawn(demux.run_demux(inbound).in_current_span());

        let BridgeState {
            lifecycle, encoder, ..
        } = &mut *state;
        let frames = match encoder.bootstrap(lifecycle, &system_prompt) {
            Ok(frames) => frames,
            Err(violation) => {
                drop(state);
                self.fail(violation).await;
                return;
            }
        };

        // Everything is enqueued before the state flips to ready, so no audio
        // frame can land between bootstrap frames.
        for (sent, frame) in frames.iter().enumerate() {
            if let Err(e) = self.shared.queue.push(frame.clone()).await {
                debug!(event = frame.name(), error = %e, "Bootstrap interrupted by teardown.");
                state.pending_ends = EventFrameEncoder::pending_ends(&frames[..sent]);
                return;
            }
            state.remote_started = true;
        }
        state.connection = ConnectionState::SessionReady;
        drop(state);

        info!("Session bootstrapped; ready for audio.");
        if let Delivery::ClientGone = self.relay(ServerMessage::SessionReady).await {
            self.close(CloseReason::ClientDisconnect).await;
        }
    }

    /// Forwards one chunk of caller audio. Audio that arrives before the
    /// session is ready is dropped.
    pub async fn audio_input(&self, bytes: Bytes) {
        if self.is_closing() {
            return;
        }
        trace!(
            bytes = bytes.len(),
            level = pcm16_level_percent(&bytes),
            "Client audio chunk."
        );

        let mut state = self.shared.state.lock().await;
        if state.connection != ConnectionState::SessionReady {
            debug!(state = ?state.connection, "Dropping audio received outside a ready session.");
            return;
        }

        let BridgeState {
            lifecycle, encoder, ..
        } = &mut *state;
        let chunk = AudioChunk::new(bytes, self.shared.config.audio_input.clone());
        let frames = encoder
            .ensure_audio_content_open(lifecycle, &chunk.params)
            .and_then(|mut frames| {
                frames.push(encoder.audio_input(lifecycle, &chunk)?);
                Ok(frames)
            });

        match frames {
            Ok(frames) => {
                for frame in frames {
                    if let Err(e) = self.shared.queue.push(frame).await {
                        debug!(error = %e, "Audio not forwarded.");
                        return;
                    }
                }
            }
            Err(violation) => {
                drop(state);
                self.fail(violation).await;
            }
        }
    }

    /// Tears the bridge down. Safe to call any number of times from any task;
    /// only the first call has an effect.
    pub async fn close(&self, reason: CloseReason) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            debug!(?reason, "Bridge already closing.");
            return;
        }
        info!(?reason, "Closing bridge.");

        // Release any producer blocked on a stalled remote stream before
        // waiting for the state lock.
        self.shared.queue.halt_producers().await;

        if let Some(message) = reason.client_message() {
            if let Err(e) = self.shared.transport.emit(ServerMessage::Error { message }).await {
                warn!(error = %e, "Could not report the error to the client.");
            }
        }

        let mut state = self.shared.state.lock().await;
        state.connection = ConnectionState::Closing;

        let BridgeState {
            lifecycle, encoder, ..
        } = &mut *state;
        let closing = encoder.close_all(lifecycle);
        let mut frames = std::mem::take(&mut state.pending_ends);
        frames.extend(closing);
        state.session_ends += 1;

        if state.remote_started {
            let queue = self.shared.queue.clone();
            let graceful = async move {
                for frame in frames {
                    queue.push_final(frame).await?;
                }
                Ok::<_, QueueError>(())
            };
            match tokio::time::timeout(self.shared.config.session_end_timeout, graceful).await {
                Ok(Ok(())) => debug!("End frames enqueued."),
                Ok(Err(e)) => warn!(error = %e, "Could not enqueue end frames."),
                Err(_) => warn!("Timed out enqueueing end frames; releasing anyway."),
            }
        }

        self.shared.queue.close().await;
        self.shared.cancel.cancel();
        state.connection = ConnectionState::Closed;
        info!("Bridge closed.");
    }

    async fn fail(&self, violation: ProtocolViolation) {
        error!(%violation, "Protocol violation; tearing the session down.");
        self.close(CloseReason::ProtocolViolation(violation.to_string()))
            .await;
    }

    async fn run_demux(self, mut inbound: InboundFrames) {
        let mut turns = TurnTracker::default();
        loop {
            let next = tokio::select! {
                _ = self.shared.cancel.cancelled() => break,
                next = inbound.next() => next,
            };
            match next {
                Some(Ok(frame)) => {
                    if !self.dispatch(frame, &mut turns).await {
                        break;
                    }
                }
                Some(Err(e)) => {
                    error!(error = %e, "Inference stream failed.");
                    self.close(CloseReason::RemoteStreamError(e.to_string()))
                        .await;
                    break;
                }
                None => {
                    info!("Inference stream ended.");
                    self.close(CloseReason::RemoteStreamEnded).await;
                    break;
                }
            }
        }
        debug!(
            blocks_started = turns.blocks_started,
            blocks_ended = turns.blocks_ended,
            assistant_audio_turns = turns.assistant_audio_turns,
            "Demux finished."
        );
    }

    /// Handles one inbound frame. Returns `false` once the bridge is closing.
    async fn dispatch(&self, frame: InboundFrame, turns: &mut TurnTracker) -> bool {
        let delivery = match frame {
            InboundFrame::TextOutput { content, role } => {
                let (role, relay) = turns.transcript_role(role);
                if content.trim().is_empty() {
                    Delivery::Skipped
                } else if !relay {
                    debug!("Skipping speculative assistant text.");
                    Delivery::Skipped
                } else {
                    self.relay(ServerMessage::Transcript { role, content }).await
                }
            }
            InboundFrame::AudioOutput { content } => {
                self.relay(ServerMessage::AudioResponse { data: content })
                    .await
            }
            InboundFrame::ContentStartAck {
                content_id,
                kind,
                role,
                stage,
            } => {
                debug!(?kind, ?role, ?stage, "Remote content started.");
                turns.content_started(content_id, kind, role, stage);
                Delivery::Skipped
            }
            InboundFrame::ContentEndAck {
                content_id,
                stop_reason,
            } => {
                debug!(?stop_reason, "Remote content ended.");
                turns.content_ended(content_id.as_deref());
                Delivery::Skipped
            }
            InboundFrame::CompletionEnd => {
                debug!("Remote completion ended.");
                Delivery::Skipped
            }
            InboundFrame::StreamError { message } => {
                error!(%message, "Inference stream reported an error.");
                self.close(CloseReason::RemoteStreamError(message)).await;
                return false;
            }
            InboundFrame::Other { name } => {
                debug!(event = %name, "Ignoring inbound event.");
                Delivery::Skipped
            }
        };

        if let Delivery::ClientGone = delivery {
            self.close(CloseReason::ClientDisconnect).await;
        }
        !self.is_closing()
    }

    async fn relay(&self, msg: ServerMessage) -> Delivery {
        if self.is_closing() {
            return Delivery::Skipped;
        }
        match self.shared.transport.emit(msg).await {
            Ok(()) => {
                self.shared.send_failures.store(0, Ordering::SeqCst);
                Delivery::Sent
            }
            Err(e) => {
                let failures = self.shared.send_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(error = %e, failures, "Failed to send message to client.");
                if failures >= MAX_SEND_FAILURES {
                    Delivery::ClientGone
                } else {
                    Delivery::Failed
                }
            }
        }
    }

    #[cfg(test)]
    async fn session_ends(&self) -> u32 {
        self.shared.state.lock().await.session_ends
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        prompt::{BasePromptComposer, MockSystemPromptComposer},
        ws::transport::{ChannelTransport, MockClientTransport, TransportSendError},
    };
    use async_trait::async_trait;
    use futures_util::stream;
    use sonic_bridge_core::{InferenceError, OutboundFrame, OutboundFrames};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::{Notify, mpsc, oneshot};

    type Inbound = Result<InboundFrame, InferenceError>;

    const BOOTSTRAP: [&str; 6] = [
        "sessionStart",
        "promptStart",
        "contentStart",
        "textInput",
        "contentEnd",
        "promptEnd",
    ];

    /// Records outbound frames and replays inbound frames fed by the test.
    struct FakeInference {
        sent: Arc<StdMutex<Vec<OutboundFrame>>>,
        inbound: StdMutex<Option<mpsc::Receiver<Inbound>>>,
        gate: StdMutex<Option<oneshot::Receiver<()>>>,
        /// When set, outbound frames are only consumed once this fires.
        drain: StdMutex<Option<oneshot::Receiver<()>>>,
        opened: Arc<Notify>,
    }

    #[async_trait]
    impl InferenceStreamClient for FakeInference {
        async fn open(&self, mut outbound: OutboundFrames) -> Result<InboundFrames, InferenceError> {
            self.opened.notify_one();
            let gate = self.gate.lock().unwrap().take();
            if let Some(gate) = gate {
                let _ = gate.await;
            }

            let sent = self.sent.clone();
            let drain = self.drain.lock().unwrap().take();
            tokio::spawn(async move {
                if let Some(drain) = drain {
                    let _ = drain.await;
                }
                while let Some(frame) = outbound.next().await {
                    sent.lock().unwrap().push(frame);
                }
            });

            let rx = self
                .inbound
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| InferenceError::Connect("already opened".into()))?;
            Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|frame| (frame, rx))
            })))
        }
    }

    struct RefusingInference;

    #[async_trait]
    impl InferenceStreamClient for RefusingInference {
        async fn open(&self, _outbound: OutboundFrames) -> Result<InboundFrames, InferenceError> {
            Err(InferenceError::Connect("connection refused".into()))
        }
    }

    struct Harness {
        bridge: DuplexStreamBridge,
        sent: Arc<StdMutex<Vec<OutboundFrame>>>,
        remote: mpsc::Sender<Inbound>,
        client: mpsc::Receiver<ServerMessage>,
        opened: Arc<Notify>,
        gate: Option<oneshot::Sender<()>>,
        drain: Option<oneshot::Sender<()>>,
    }

    fn bridge_config() -> BridgeConfig {
        BridgeConfig {
            inference: InferenceParams::default(),
            audio_input: AudioMediaParams::lpcm(16000),
            output_sample_rate: 24000,
            default_voice_id: "tiffany".into(),
            queue_capacity: 64,
            session_end_timeout: Duration::from_millis(200),
        }
    }

    fn harness_with(composer: Arc<dyn SystemPromptComposer>, gated: bool) -> Harness {
        build_harness(composer, gated, bridge_config(), false)
    }

    /// A bridge whose remote does not read until `drain` is released.
    fn stalled_harness(queue_capacity: usize) -> Harness {
        let config = BridgeConfig {
            queue_capacity,
            ..bridge_config()
        };
        build_harness(Arc::new(BasePromptComposer::new("Be brief.")), false, config, true)
    }

    fn build_harness(
        composer: Arc<dyn SystemPromptComposer>,
        gated: bool,
        config: BridgeConfig,
        stalled: bool,
    ) -> Harness {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let (remote, inbound_rx) = mpsc::channel(32);
        let (client_tx, client) = mpsc::channel(32);
        let opened = Arc::new(Notify::new());
        let (gate, gate_rx) = if gated {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let (drain, drain_rx) = if stalled {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let inference = Arc::new(FakeInference {
            sent: sent.clone(),
            inbound: StdMutex::new(Some(inbound_rx)),
            gate: StdMutex::new(gate_rx),
            drain: StdMutex::new(drain_rx),
            opened: opened.clone(),
        });
        let bridge = DuplexStreamBridge::new(
            config,
            inference,
            Arc::new(ChannelTransport::new(client_tx)),
            composer,
        );
        Harness {
            bridge,
            sent,
            remote,
            client,
            opened,
            gate,
            drain,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(BasePromptComposer::new("Be brief.")), false)
    }

    async fn wait_for_frames(sent: &Arc<StdMutex<Vec<OutboundFrame>>>, n: usize) -> Vec<OutboundFrame> {
        for _ in 0..200 {
            {
                let frames = sent.lock().unwrap();
                if frames.len() >= n {
                    return frames.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected at least {n} outbound frames, got {:?}", sent.lock().unwrap());
    }

    async fn wait_for_state(bridge: &DuplexStreamBridge, expected: ConnectionState) {
        for _ in 0..200 {
            if bridge.state().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("bridge never reached {expected:?}");
    }

    async fn next_message(client: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(1), client.recv())
            .await
            .expect("timed out waiting for a client message")
            .expect("client channel closed")
    }

    async fn wait_for_queued(bridge: &DuplexStreamBridge, n: usize) {
        for _ in 0..200 {
            if bridge.shared.queue.len().await >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("outbound queue never held {n} frames");
    }

    fn names(frames: &[OutboundFrame]) -> Vec<&'static str> {
        frames.iter().map(OutboundFrame::name).collect()
    }

    async fn ready(h: &mut Harness) {
        h.bridge.start_session(StartSession::default()).await;
        assert_eq!(next_message(&mut h.client).await, ServerMessage::SessionReady);
    }

    #[tokio::test]
    async fn test_start_session_bootstraps_then_reports_ready() {
        let mut composer = MockSystemPromptComposer::new();
        composer
            .expect_compose()
            .times(1)
            .returning(|_| "Composed prompt".to_string());
        let mut h = harness_with(Arc::new(composer), false);

        h.bridge
            .start_session(StartSession {
                voice_id: Some("matthew".into()),
                ..Default::default()
            })
            .await;

        assert_eq!(next_message(&mut h.client).await, ServerMessage::SessionReady);
        assert_eq!(h.bridge.state().await, ConnectionState::SessionReady);

        let frames = wait_for_frames(&h.sent, 6).await;
        assert_eq!(names(&frames), BOOTSTRAP);
        match &frames[1] {
            OutboundFrame::PromptStart(start) => {
                assert_eq!(start.audio_output_configuration.voice_id, "matthew")
            }
            other => panic!("expected promptStart, got {other:?}"),
        }
        match &frames[3] {
            OutboundFrame::TextInput(payload) => assert_eq!(payload.content, "Composed prompt"),
            other => panic!("expected textInput, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bootstrap_is_never_interleaved_with_audio() {
        let h = harness();

        let flood = {
            let bridge = h.bridge.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    bridge.audio_input(Bytes::from_static(&[0, 1, 2, 3])).await;
                    tokio::task::yield_now().await;
                }
            })
        };
        h.bridge.start_session(StartSession::default()).await;
        flood.await.unwrap();
        h.bridge.audio_input(Bytes::from_static(&[0, 1, 2, 3])).await;

        let frames = wait_for_frames(&h.sent, 9).await;
        assert_eq!(names(&frames[..6]), BOOTSTRAP);
        assert_eq!(names(&frames[6..8]), vec!["promptStart", "contentStart"]);
        assert!(frames[8..].iter().all(OutboundFrame::is_audio));
    }

    #[tokio::test]
    async fn test_audio_chunks_share_one_content_block() {
        let mut h = harness();
        ready(&mut h).await;

        for chunk in [[1u8, 1], [2, 2], [3, 3]] {
            h.bridge.audio_input(Bytes::copy_from_slice(&chunk)).await;
        }

        let frames = wait_for_frames(&h.sent, 11).await;
        assert_eq!(
            names(&frames[6..]),
            vec!["promptStart", "contentStart", "audioInput", "audioInput", "audioInput"]
        );
        let audio_starts = frames
            .iter()
            .filter(|f| matches!(f, OutboundFrame::ContentStart(s) if s.kind == ContentKind::Audio))
            .count();
        assert_eq!(audio_starts, 1);

        let payloads: Vec<_> = frames[8..]
            .iter()
            .map(|frame| match frame {
                OutboundFrame::AudioInput(payload) => payload.content.clone(),
                other => panic!("expected audioInput, got {other:?}"),
            })
            .collect();
        assert_eq!(payloads, vec!["AQE=", "AgI=", "AwM="]);
    }

    #[tokio::test]
    async fn test_audio_before_ready_is_dropped() {
        let h = harness();
        h.bridge.audio_input(Bytes::from_static(&[1, 2])).await;

        assert_eq!(h.bridge.state().await, ConnectionState::Connected);
        assert!(h.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remote_stream_error_reports_once_and_closes() {
        let mut h = harness();
        ready(&mut h).await;

        h.remote
            .send(Ok(InboundFrame::StreamError {
                message: "x".into(),
            }))
            .await
            .unwrap();
        // Anything after the error is ignored.
        let _ = h
            .remote
            .send(Ok(InboundFrame::AudioOutput {
                content: "AAAA".into(),
            }))
            .await;

        assert_eq!(
            next_message(&mut h.client).await,
            ServerMessage::Error { message: "x".into() }
        );
        wait_for_state(&h.bridge, ConnectionState::Closed).await;
        h.bridge.close(CloseReason::ClientDisconnect).await;

        assert!(h.client.try_recv().is_err());
        assert_eq!(h.bridge.session_status().await, SessionStatus::Closed);
        assert_eq!(h.bridge.session_ends().await, 1);

        let frames = wait_for_frames(&h.sent, 7).await;
        assert_eq!(frames.last().map(OutboundFrame::name), Some("sessionEnd"));
    }

    #[tokio::test]
    async fn test_disconnect_during_bootstrap() {
        let mut h = harness_with(Arc::new(BasePromptComposer::new("Be brief.")), true);

        let starter = {
            let bridge = h.bridge.clone();
            tokio::spawn(async move { bridge.start_session(StartSession::default()).await })
        };
        h.opened.notified().await;
        assert_eq!(h.bridge.state().await, ConnectionState::SessionStarting);

        h.bridge.close(CloseReason::ClientDisconnect).await;
        h.bridge.close(CloseReason::ClientDisconnect).await;
        if let Some(gate) = h.gate.take() {
            gate.send(()).unwrap();
        }
        starter.await.unwrap();
        let _ = h
            .remote
            .send(Ok(InboundFrame::TextOutput {
                content: "late".into(),
                role: None,
            }))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(h.bridge.state().await, ConnectionState::Closed);
        assert_eq!(h.bridge.session_status().await, SessionStatus::Closed);
        assert_eq!(h.bridge.session_ends().await, 1);
        assert!(h.client.try_recv().is_err());
        assert!(h.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_closes_a_partially_enqueued_bootstrap() {
        let mut h = stalled_harness(2);

        let starter = {
            let bridge = h.bridge.clone();
            tokio::spawn(async move { bridge.start_session(StartSession::default()).await })
        };
        wait_for_queued(&h.bridge, 2).await;

        let closer = {
            let bridge = h.bridge.clone();
            tokio::spawn(async move { bridge.close(CloseReason::ClientDisconnect).await })
        };
        wait_for_state(&h.bridge, ConnectionState::Closing).await;
        if let Some(drain) = h.drain.take() {
            drain.send(()).unwrap();
        }
        starter.await.unwrap();
        closer.await.unwrap();

        let frames = wait_for_frames(&h.sent, 4).await;
        assert_eq!(
            names(&frames),
            vec!["sessionStart", "promptStart", "promptEnd", "sessionEnd"]
        );
        match (&frames[1], &frames[2]) {
            (OutboundFrame::PromptStart(start), OutboundFrame::PromptEnd(end)) => {
                assert_eq!(start.prompt_name, end.prompt_name)
            }
            other => panic!("expected promptStart/promptEnd, got {other:?}"),
        }
        assert_eq!(h.bridge.state().await, ConnectionState::Closed);
        assert_eq!(h.bridge.session_status().await, SessionStatus::Closed);
        assert!(h.client.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_is_bounded_when_the_remote_stops_reading() {
        let h = stalled_harness(2);

        let starter = {
            let bridge = h.bridge.clone();
            tokio::spawn(async move { bridge.start_session(StartSession::default()).await })
        };
        wait_for_queued(&h.bridge, 2).await;

        let started = tokio::time::Instant::now();
        tokio::time::timeout(
            Duration::from_secs(1),
            h.bridge.close(CloseReason::ClientDisconnect),
        )
        .await
        .expect("close waited on a stalled remote");
        assert!(started.elapsed() >= bridge_config().session_end_timeout);

        tokio::time::timeout(Duration::from_millis(100), h.bridge.closed())
            .await
            .expect("closed() did not resolve");
        starter.await.unwrap();

        assert_eq!(h.bridge.state().await, ConnectionState::Closed);
        assert_eq!(h.bridge.session_status().await, SessionStatus::Closed);
        assert!(h.sent.lock().unwrap().is_empty());
        drop(h.drain);
    }

    #[tokio::test]
    async fn test_audio_output_is_passed_through_verbatim() {
        let mut h = harness();
        ready(&mut h).await;

        let payload = "UklGRiQAAABXQVZFZm10IBAAAAABAAEA//8AAA==".to_string();
        h.remote
            .send(Ok(InboundFrame::AudioOutput {
                content: payload.clone(),
            }))
            .await
            .unwrap();

        assert_eq!(
            next_message(&mut h.client).await,
            ServerMessage::AudioResponse { data: payload }
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.client.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_transcripts_follow_remote_content_blocks() {
        let mut h = harness();
        ready(&mut h).await;

        let frames = [
            InboundFrame::ContentStartAck {
                content_id: Some("u1".into()),
                kind: Some(ContentKind::Text),
                role: Some(Role::User),
                stage: None,
            },
            InboundFrame::TextOutput {
                content: "What time do you open?".into(),
                role: None,
            },
            InboundFrame::ContentStartAck {
                content_id: Some("a1".into()),
                kind: Some(ContentKind::Text),
                role: Some(Role::Assistant),
                stage: Some(GenerationStage::Speculative),
            },
            InboundFrame::TextOutput {
                content: "We open at nine, I think.".into(),
                role: None,
            },
            InboundFrame::ContentStartAck {
                content_id: Some("a2".into()),
                kind: Some(ContentKind::Text),
                role: Some(Role::Assistant),
                stage: Some(GenerationStage::Final),
            },
            InboundFrame::TextOutput {
                content: "   ".into(),
                role: None,
            },
            InboundFrame::TextOutput {
                content: "We open at nine.".into(),
                role: None,
            },
            InboundFrame::CompletionEnd,
        ];
        for frame in frames {
            h.remote.send(Ok(frame)).await.unwrap();
        }

        assert_eq!(
            next_message(&mut h.client).await,
            ServerMessage::Transcript {
                role: TranscriptRole::User,
                content: "What time do you open?".into()
            }
        );
        assert_eq!(
            next_message(&mut h.client).await,
            ServerMessage::Transcript {
                role: TranscriptRole::Assistant,
                content: "We open at nine.".into()
            }
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.client.try_recv().is_err());
        assert_eq!(h.bridge.state().await, ConnectionState::SessionReady);
    }

    #[tokio::test]
    async fn test_client_end_closes_open_blocks_without_error() {
        let mut h = harness();
        ready(&mut h).await;
        h.bridge.audio_input(Bytes::from_static(&[0, 0])).await;

        h.bridge.close(CloseReason::ClientEnded).await;

        assert_eq!(h.bridge.state().await, ConnectionState::Closed);
        let frames = wait_for_frames(&h.sent, 12).await;
        assert_eq!(
            names(&frames[9..]),
            vec!["contentEnd", "promptEnd", "sessionEnd"]
        );
        assert!(h.client.try_recv().is_err());

        // Input after teardown is ignored.
        h.bridge.audio_input(Bytes::from_static(&[0, 0])).await;
        h.bridge.start_session(StartSession::default()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.sent.lock().unwrap().len(), 12);
    }

    #[tokio::test]
    async fn test_remote_end_of_stream_closes_quietly() {
        let mut h = harness();
        ready(&mut h).await;

        drop(h.remote);
        wait_for_state(&h.bridge, ConnectionState::Closed).await;
        assert!(h.client.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_open_reports_error() {
        let (client_tx, mut client) = mpsc::channel(8);
        let bridge = DuplexStreamBridge::new(
            bridge_config(),
            Arc::new(RefusingInference),
            Arc::new(ChannelTransport::new(client_tx)),
            Arc::new(BasePromptComposer::new("Be brief.")),
        );

        bridge.start_session(StartSession::default()).await;

        match next_message(&mut client).await {
            ServerMessage::Error { message } => {
                assert!(message.starts_with("Failed to start voice session"));
                assert!(message.contains("connection refused"));
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(bridge.state().await, ConnectionState::Closed);
        assert!(client.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_repeated_send_failures_close_the_bridge() {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let (remote, inbound_rx) = mpsc::channel(8);
        let inference = Arc::new(FakeInference {
            sent: sent.clone(),
            inbound: StdMutex::new(Some(inbound_rx)),
            gate: StdMutex::new(None),
            drain: StdMutex::new(None),
            opened: Arc::new(Notify::new()),
        });
        let mut transport = MockClientTransport::new();
        transport
            .expect_emit()
            .times(3)
            .returning(|_| Err(TransportSendError));

        let bridge = DuplexStreamBridge::new(
            bridge_config(),
            inference,
            Arc::new(transport),
            Arc::new(BasePromptComposer::new("Be brief.")),
        );
        bridge.start_session(StartSession::default()).await;
        assert_eq!(bridge.state().await, ConnectionState::SessionReady);

        for _ in 0..2 {
            remote
                .send(Ok(InboundFrame::AudioOutput {
                    content: "AAAA".into(),
                }))
                .await
                .unwrap();
        }

        wait_for_state(&bridge, ConnectionState::Closed).await;
        let frames = wait_for_frames(&sent, 7).await;
        assert_eq!(frames.last().map(OutboundFrame::name), Some("sessionEnd"));
    }
}
