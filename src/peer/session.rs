//! Одно peer-to-peer медиасоединение на активную сессию.
//!
//! Менеджер захватывает локальные треки, лениво создаёт соединение и ведёт
//! согласование offer/answer/ICE через канал сигнализации. Протокол терпим к
//! порядку сообщений: ранние ICE кандидаты ждут в очереди, `ready` идемпотентен,
//! встречные offer разрешаются откатом на вежливой стороне.
//!
//! Все фоновые задачи (чтение канала, события соединения, heartbeat, grace)
//! держат только `Weak` на менеджер и снимаются в `stop()` или при drop.

use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::broadcast::BroadcastService;
use crate::config::PeerConfig;
use crate::error::{CaptureError, PeerError};
use crate::model::{ParticipantId, Role, SessionId};
use crate::peer::ice::{CandidateTally, PendingCandidates};
use crate::peer::link::{PeerConnector, PeerEvent, PeerLink, SignalingState, TransportState};
use crate::peer::media::{LocalMedia, LocalTrack, MediaSource};
use crate::peer::state::{CallStatus, PeerConnectionState};
use crate::peer::types::{RemoteTrack, SessionDescription, TrackKind};
use crate::signaling::{Signal, SignalReceiver, SignalSender, SignalingChannel, SignalingMessage};

/// Внешние зависимости менеджера
#[derive(Clone)]
pub struct PeerDeps {
    pub channels: Arc<dyn BroadcastService>,
    pub connector: Arc<dyn PeerConnector>,
    pub media: Arc<dyn MediaSource>,
}

#[derive(Clone)]
pub struct PeerSessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    session: SessionId,
    me: ParticipantId,
    role: Role,
    config: PeerConfig,
    deps: PeerDeps,
    state: Mutex<State>,
    status: watch::Sender<CallStatus>,
    tasks: StdMutex<Tasks>,
}

struct State {
    link: Option<Arc<dyn PeerLink>>,
    sender: Option<SignalSender>,
    media: Option<LocalMedia>,
    pending: PendingCandidates,
    /// Есть действующее согласование (answer отправлен или получен)
    negotiated: bool,
    transport: TransportState,
    remote_tracks: Vec<RemoteTrack>,
    local_candidates: Vec<String>,
    audio_enabled: bool,
    video_enabled: bool,
    stopped: bool,
}

#[derive(Default)]
struct Tasks {
    pump: Option<JoinHandle<()>>,
    events: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    grace: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        // таймеры первыми
        for handle in [
            self.grace.take(),
            self.heartbeat.take(),
            self.events.take(),
            self.pump.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(tasks) = self.tasks.get_mut() {
            tasks.abort_all();
        }
    }
}

impl PeerSessionManager {
    pub fn new(
        session: SessionId,
        me: ParticipantId,
        role: Role,
        config: PeerConfig,
        deps: PeerDeps,
    ) -> Self {
        let (status, _) = watch::channel(CallStatus::Idle);
        Self {
            inner: Arc::new(Inner {
                session,
                me,
                role,
                config,
                deps,
                state: Mutex::new(State {
                    link: None,
                    sender: None,
                    media: None,
                    pending: PendingCandidates::new(),
                    negotiated: false,
                    transport: TransportState::New,
                    remote_tracks: Vec::new(),
                    local_candidates: Vec::new(),
                    audio_enabled: true,
                    video_enabled: true,
                    stopped: false,
                }),
                status,
                tasks: StdMutex::new(Tasks::default()),
            }),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.session
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn status(&self) -> CallStatus {
        *self.inner.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<CallStatus> {
        self.inner.status.subscribe()
    }

    pub async fn connection_state(&self) -> PeerConnectionState {
        let st = self.inner.state.lock().await;
        if st.stopped {
            return PeerConnectionState::Closed;
        }
        PeerConnectionState::derive(st.link.as_ref().map(|l| l.signaling_state()), st.transport)
    }

    pub async fn local_tracks(&self) -> Vec<LocalTrack> {
        let st = self.inner.state.lock().await;
        st.media.as_ref().map(|m| m.tracks.clone()).unwrap_or_default()
    }

    pub async fn remote_tracks(&self) -> Vec<RemoteTrack> {
        self.inner.state.lock().await.remote_tracks.clone()
    }

    /// Захватывает камеру и микрофон и запускает (или обновляет) звонок.
    ///
    /// Отказ в доступе и отсутствие устройства выставляют отдельные статусы;
    /// после них `start()` можно вызвать снова.
    #[instrument(skip(self), fields(session = %self.inner.session, role = ?self.inner.role))]
    pub async fn start(&self) -> Result<(), PeerError> {
        let inner = &self.inner;
        {
            let st = inner.state.lock().await;
            if st.stopped {
                return Err(PeerError::Closed);
            }
            if st.link.is_none() {
                inner.set_status(CallStatus::Connecting);
            }
        }

        // без блокировки: пользователь может думать над запросом доступа сколько угодно
        let media = match inner.deps.media.acquire().await {
            Ok(media) => media,
            Err(e) => {
                let status = match e {
                    CaptureError::PermissionDenied => CallStatus::PermissionDenied,
                    CaptureError::DeviceNotFound => CallStatus::DeviceNotFound,
                    CaptureError::Unavailable(_) => CallStatus::Failed,
                };
                warn!("media capture failed: {e}");
                inner.set_status(status);
                return Err(e.into());
            }
        };

        let mut st = inner.state.lock().await;
        if st.stopped {
            media.stop();
            return Err(PeerError::Closed);
        }

        if let Some(track) = media.track(TrackKind::Audio) {
            track.set_enabled(st.audio_enabled);
        }
        if let Some(track) = media.track(TrackKind::Video) {
            track.set_enabled(st.video_enabled);
        }
        if let Some(previous) = st.media.replace(media.clone()) {
            previous.stop();
        }

        let link = match st.link.clone() {
            Some(link) => link,
            None => {
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                let link = match inner.deps.connector.connect(events_tx).await {
                    Ok(link) => link,
                    Err(e) => {
                        warn!("failed to create peer link: {e}");
                        inner.set_status(CallStatus::Failed);
                        return Err(e);
                    }
                };
                st.link = Some(link.clone());
                inner.spawn_events(events_rx);
                info!("peer link created");
                link
            }
        };
        if let Err(e) = link.replace_tracks(&media.tracks).await {
            warn!("failed to attach local tracks: {e}");
            inner.set_status(CallStatus::Failed);
            return Err(e);
        }

        if st.sender.is_none() {
            let channel = match SignalingChannel::open(
                inner.deps.channels.as_ref(),
                &inner.session,
                inner.me.clone(),
            )
            .await
            {
                Ok(channel) => channel,
                Err(e) => {
                    warn!("signaling subscription failed: {e}");
                    inner.set_status(CallStatus::Failed);
                    return Err(e.into());
                }
            };
            let (sender, receiver) = channel.split();
            st.sender = Some(sender);
            inner.spawn_pump(receiver);
            publish(&st, Signal::Ready).await;
            drop(st);
            inner.restart_heartbeat();
            return Ok(());
        }

        if st.negotiated && link.signaling_state() == SignalingState::Stable {
            info!("renegotiating after media re-acquisition");
            match link.create_offer(false).await {
                Ok(offer) => publish(&st, Signal::Offer { description: offer }).await,
                Err(e) => warn!("renegotiation offer failed: {e}"),
            }
        }
        Ok(())
    }

    /// Включает/выключает микрофон, возвращает новое состояние
    pub async fn toggle_audio(&self) -> bool {
        self.toggle(TrackKind::Audio).await
    }

    /// Включает/выключает камеру, возвращает новое состояние
    pub async fn toggle_video(&self) -> bool {
        self.toggle(TrackKind::Video).await
    }

    async fn toggle(&self, kind: TrackKind) -> bool {
        let mut st = self.inner.state.lock().await;
        let enabled = match kind {
            TrackKind::Audio => {
                st.audio_enabled = !st.audio_enabled;
                st.audio_enabled
            }
            TrackKind::Video => {
                st.video_enabled = !st.video_enabled;
                st.video_enabled
            }
        };
        if let Some(track) = st.media.as_ref().and_then(|m| m.track(kind)) {
            track.set_enabled(enabled);
        }
        debug!(?kind, enabled, "local track toggled");
        enabled
    }

    /// Останавливает таймеры, освобождает захват, закрывает соединение и канал.
    /// Повторный вызов ничего не делает.
    #[instrument(skip(self), fields(session = %self.inner.session, role = ?self.inner.role))]
    pub async fn stop(&self) {
        let inner = &self.inner;
        if let Ok(mut tasks) = inner.tasks.lock() {
            tasks.abort_all();
        }

        let mut st = inner.state.lock().await;
        if st.stopped {
            return;
        }
        st.stopped = true;

        if let Some(media) = st.media.take() {
            media.stop();
        }
        if let Some(link) = st.link.take() {
            if let Err(e) = link.close().await {
                warn!("failed to close peer link: {e}");
            }
        }
        if let Some(sender) = st.sender.take() {
            sender.close().await;
        }
        st.pending.clear();
        st.negotiated = false;
        st.transport = TransportState::Closed;
        drop(st);

        inner.set_status(CallStatus::Closed);
        info!("peer session stopped");
    }
}

async fn publish(st: &State, signal: Signal) {
    if let Some(sender) = &st.sender {
        let event = signal.event();
        if let Err(e) = sender.publish(signal).await {
            warn!(event, "failed to publish signal: {e}");
        }
    }
}

impl Inner {
    fn set_status(&self, next: CallStatus) {
        let changed = self.status.send_if_modified(|status| {
            if *status == next {
                return false;
            }
            *status = next;
            true
        });
        if changed {
            info!(session = %self.session, "call status -> {next:?}");
        }
    }

    fn with_tasks(&self, f: impl FnOnce(&mut Tasks)) {
        if let Ok(mut tasks) = self.tasks.lock() {
            f(&mut tasks);
        }
    }

    fn spawn_pump(self: &Arc<Self>, mut receiver: SignalReceiver) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.handle_signal(message).await;
            }
            debug!("signaling pump finished");
        });
        self.with_tasks(|tasks| {
            if let Some(old) = tasks.pump.replace(handle) {
                old.abort();
            }
        });
    }

    fn spawn_events(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.handle_event(event).await;
            }
        });
        self.with_tasks(|tasks| {
            if let Some(old) = tasks.events.replace(handle) {
                old.abort();
            }
        });
    }

    /// (Пере)запускает периодический `ready`, пока соединение не установлено
    fn restart_heartbeat(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.config.heartbeat_interval;
        let handle = tokio::spawn(async move {
            loop {
                sleep(interval).await;
                let Some(inner) = weak.upgrade() else { break };
                if !inner.heartbeat_tick().await {
                    break;
                }
            }
        });
        self.with_tasks(|tasks| {
            if let Some(old) = tasks.heartbeat.replace(handle) {
                old.abort();
            }
        });
    }

    fn stop_heartbeat(&self) {
        self.with_tasks(|tasks| {
            if let Some(handle) = tasks.heartbeat.take() {
                debug!("ready heartbeat stopped");
                handle.abort();
            }
        });
    }

    async fn heartbeat_tick(&self) -> bool {
        let st = self.state.lock().await;
        if st.stopped || st.transport == TransportState::Connected {
            return false;
        }
        publish(&st, Signal::Ready).await;
        true
    }

    fn start_grace(self: &Arc<Self>) {
        let mut already = false;
        self.with_tasks(|tasks| already = tasks.grace.is_some());
        if already {
            debug!("grace period already running");
            return;
        }

        let weak = Arc::downgrade(self);
        let grace = self.config.grace_period;
        info!(secs = grace.as_secs(), "grace period started");
        let handle = tokio::spawn(async move {
            sleep(grace).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_grace_expired().await;
            }
        });
        self.with_tasks(|tasks| tasks.grace = Some(handle));
    }

    fn cancel_grace(&self) {
        self.with_tasks(|tasks| {
            if let Some(handle) = tasks.grace.take() {
                info!("connection recovered during grace period");
                handle.abort();
            }
        });
    }

    async fn on_grace_expired(self: &Arc<Self>) {
        self.with_tasks(|tasks| {
            tasks.grace = None;
        });
        {
            let mut st = self.state.lock().await;
            if st.stopped || st.transport == TransportState::Connected {
                return;
            }
            warn!("connection not recovered, restarting negotiation");
            st.negotiated = false;
            publish(&st, Signal::Ready).await;
        }
        self.restart_heartbeat();
    }

    async fn handle_event(self: &Arc<Self>, event: PeerEvent) {
        let mut st = self.state.lock().await;
        if st.stopped {
            return;
        }

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                st.local_candidates.push(candidate.candidate.clone());
                publish(&st, Signal::IceCandidate { candidate }).await;
            }
            PeerEvent::GatheringComplete => {
                CandidateTally::analyze(st.local_candidates.iter().map(String::as_str)).log();
            }
            PeerEvent::Transport(state) => {
                let previous = std::mem::replace(&mut st.transport, state);
                drop(st);
                match state {
                    TransportState::Connected => {
                        self.cancel_grace();
                        self.stop_heartbeat();
                        self.set_status(CallStatus::Connected);
                    }
                    TransportState::Disconnected | TransportState::Failed => {
                        debug!(?previous, "transport lost: {state:?}");
                        self.set_status(CallStatus::Disconnected);
                        self.start_grace();
                    }
                    _ => {}
                }
            }
            PeerEvent::RemoteTrack(track) => {
                info!(track = %track.id, kind = ?track.kind, "remote track received");
                let first = st.remote_tracks.is_empty();
                st.remote_tracks.push(track);
                drop(st);
                if first {
                    self.stop_heartbeat();
                    self.set_status(CallStatus::Connected);
                }
            }
        }
    }

    async fn handle_signal(&self, message: SignalingMessage) {
        let mut st = self.state.lock().await;
        if st.stopped {
            return;
        }
        let Some(link) = st.link.clone() else {
            debug!(from = %message.from, "no peer link yet, dropping signal");
            return;
        };

        match message.signal {
            Signal::Ready => self.on_ready(&mut st, &link).await,
            Signal::Offer { description } => self.on_offer(&mut st, &link, description).await,
            Signal::Answer { description } => on_answer(&mut st, &link, description).await,
            Signal::IceCandidate { candidate } => {
                if link.remote_description().await.is_some() {
                    if let Err(e) = link.add_ice_candidate(candidate).await {
                        warn!("failed to add ICE candidate: {e}");
                    }
                } else {
                    st.pending.push(candidate);
                    debug!(queued = st.pending.len(), "remote description not set, queuing candidate");
                }
            }
        }
    }

    async fn on_ready(&self, st: &mut State, link: &Arc<dyn PeerLink>) {
        let signaling = link.signaling_state();
        if signaling != SignalingState::Stable || st.negotiated {
            debug!(?signaling, negotiated = st.negotiated, "ready ignored");
            return;
        }

        let ice_restart = link.remote_description().await.is_some();
        match link.create_offer(ice_restart).await {
            Ok(offer) => {
                info!(ice_restart, "peer ready, sending offer");
                publish(st, Signal::Offer { description: offer }).await;
            }
            Err(e) => warn!("failed to create offer: {e}"),
        }
    }

    async fn on_offer(&self, st: &mut State, link: &Arc<dyn PeerLink>, offer: SessionDescription) {
        match link.signaling_state() {
            SignalingState::HaveLocalOffer if self.role.is_polite() => {
                info!("offer collision, rolling back local offer");
                if let Err(e) = link.rollback().await {
                    warn!("rollback failed: {e}");
                    return;
                }
            }
            SignalingState::HaveLocalOffer => {
                // собеседник точно подписан: повторяем свой offer
                info!("offer collision, keeping local offer");
                if let Some(local) = link.local_description().await {
                    publish(st, Signal::Offer { description: local }).await;
                }
                return;
            }
            SignalingState::Stable if st.negotiated => {
                let duplicate = link
                    .remote_description()
                    .await
                    .is_some_and(|remote| remote.sdp == offer.sdp);
                if duplicate {
                    debug!("duplicate offer, repeating answer");
                    if let Some(answer) = link.local_description().await {
                        publish(st, Signal::Answer { description: answer }).await;
                    }
                    return;
                }
            }
            _ => {}
        }

        if let Err(e) = link.set_remote_description(offer).await {
            warn!("failed to apply remote offer: {e}");
            return;
        }
        drain_pending(st, link).await;

        match link.create_answer().await {
            Ok(answer) => {
                st.negotiated = true;
                info!("remote offer applied, sending answer");
                publish(st, Signal::Answer { description: answer }).await;
            }
            Err(e) => warn!("failed to create answer: {e}"),
        }
    }
}

async fn on_answer(st: &mut State, link: &Arc<dyn PeerLink>, answer: SessionDescription) {
    if link.signaling_state() != SignalingState::HaveLocalOffer {
        debug!("stale answer ignored");
        return;
    }
    if let Err(e) = link.set_remote_description(answer).await {
        warn!("failed to apply remote answer: {e}");
        return;
    }
    st.negotiated = true;
    info!("remote answer applied");
    drain_pending(st, link).await;
}

async fn drain_pending(st: &mut State, link: &Arc<dyn PeerLink>) {
    let queued = st.pending.drain();
    if queued.is_empty() {
        return;
    }
    debug!(count = queued.len(), "applying queued ICE candidates");
    for candidate in queued {
        if let Err(e) = link.add_ice_candidate(candidate).await {
            warn!("failed to apply queued candidate: {e}");
        }
    }
}

impl std::fmt::Debug for PeerSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSessionManager")
            .field("session", &self.inner.session)
            .field("me", &self.inner.me)
            .field("role", &self.inner.role)
            .field("status", &self.status())
            .finish()
    }
}
