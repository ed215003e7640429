#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use consult_rtc::broadcast::InMemoryBroadcast;
use consult_rtc::config::PeerConfig;
use consult_rtc::error::{CaptureError, PeerError};
use consult_rtc::logger::init_logging;
use consult_rtc::model::{ParticipantId, Provider, Role, SessionId};
use consult_rtc::peer::link::PeerEventSender;
use consult_rtc::peer::{
    IceCandidate, LocalMedia, LocalTrack, MediaSource, PeerConnector, PeerDeps, PeerEvent,
    PeerLink, PeerSessionManager, SdpKind, SessionDescription, SignalingState,
};
use consult_rtc::signaling::{
    topic_for, Signal, SignalReceiver, SignalSender, SignalingChannel, SignalingMessage,
};
use consult_rtc::store::InMemoryStore;

pub fn providers() -> Vec<Provider> {
    vec![
        Provider::new("dr-a", "Dr. A").with_category("cardiology").with_fee(4_000),
        Provider::new("dr-b", "Dr. B").with_category("cardiology").with_fee(4_500),
        Provider::new("dr-c", "Dr. C").with_category("cardiology").with_fee(5_000),
        Provider::new("dr-d", "Dr. D").with_category("dermatology").with_fee(3_000),
    ]
}

pub fn store() -> Arc<InMemoryStore> {
    init_logging();
    Arc::new(InMemoryStore::with_providers(providers()))
}

pub fn id(value: &str) -> ParticipantId {
    ParticipantId::new(value)
}

/// Ждёт выполнения условия, проверяя его каждые 10 мс (до 5 с)
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached: {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Debug, Default)]
pub struct LinkLog {
    pub signaling: Option<SignalingState>,
    pub local: Option<SessionDescription>,
    pub remote: Option<SessionDescription>,
    committed_local: Option<SessionDescription>,
    pub applied_candidates: Vec<IceCandidate>,
    pub rollbacks: usize,
    pub offers_created: usize,
    pub last_ice_restart: bool,
    pub answers_created: usize,
    pub tracks: Vec<String>,
    pub closed: bool,
}

/// Конечный автомат сигнализации в духе RTCPeerConnection без сети
pub struct FakeLink {
    name: String,
    log: Mutex<LinkLog>,
    events: PeerEventSender,
    reject_tracks: bool,
}

impl FakeLink {
    fn new(name: String, events: PeerEventSender, reject_tracks: bool) -> Self {
        Self {
            name,
            reject_tracks,
            log: Mutex::new(LinkLog {
                signaling: Some(SignalingState::Stable),
                ..Default::default()
            }),
            events,
        }
    }

    pub fn with_log<R>(&self, f: impl FnOnce(&LinkLog) -> R) -> R {
        f(&self.log.lock().unwrap())
    }

    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn state(&self) -> SignalingState {
        self.log.lock().unwrap().signaling.unwrap_or(SignalingState::Stable)
    }
}

fn negotiation(msg: String) -> PeerError {
    PeerError::Negotiation(msg)
}

#[async_trait]
impl PeerLink for FakeLink {
    fn signaling_state(&self) -> SignalingState {
        self.state()
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.log.lock().unwrap().local.clone()
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.log.lock().unwrap().remote.clone()
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError> {
        let mut log = self.log.lock().unwrap();
        if log.signaling != Some(SignalingState::Stable) {
            return Err(negotiation(format!("create_offer in {:?}", log.signaling)));
        }
        log.offers_created += 1;
        log.last_ice_restart = ice_restart;
        let offer = SessionDescription::offer(format!(
            "offer:{}:{}{}",
            self.name,
            log.offers_created,
            if ice_restart { ":restart" } else { "" }
        ));
        log.local = Some(offer.clone());
        log.signaling = Some(SignalingState::HaveLocalOffer);
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let mut log = self.log.lock().unwrap();
        if log.signaling != Some(SignalingState::HaveRemoteOffer) {
            return Err(negotiation(format!("create_answer in {:?}", log.signaling)));
        }
        log.answers_created += 1;
        let answer = SessionDescription::answer(format!("answer:{}:{}", self.name, log.answers_created));
        log.local = Some(answer.clone());
        log.committed_local = Some(answer.clone());
        log.signaling = Some(SignalingState::Stable);
        Ok(answer)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let mut log = self.log.lock().unwrap();
        match (description.kind, log.signaling) {
            (SdpKind::Offer, Some(SignalingState::Stable | SignalingState::HaveRemoteOffer)) => {
                log.remote = Some(description);
                log.signaling = Some(SignalingState::HaveRemoteOffer);
                Ok(())
            }
            (SdpKind::Answer, Some(SignalingState::HaveLocalOffer)) => {
                log.remote = Some(description);
                log.committed_local = log.local.clone();
                log.signaling = Some(SignalingState::Stable);
                Ok(())
            }
            (kind, state) => Err(negotiation(format!("remote {kind:?} in {state:?}"))),
        }
    }

    async fn rollback(&self) -> Result<(), PeerError> {
        let mut log = self.log.lock().unwrap();
        if log.signaling != Some(SignalingState::HaveLocalOffer) {
            return Err(negotiation("nothing to roll back".into()));
        }
        log.rollbacks += 1;
        log.local = log.committed_local.clone();
        log.signaling = Some(SignalingState::Stable);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let mut log = self.log.lock().unwrap();
        if log.remote.is_none() {
            return Err(negotiation("candidate before remote description".into()));
        }
        log.applied_candidates.push(candidate);
        Ok(())
    }

    async fn replace_tracks(&self, tracks: &[LocalTrack]) -> Result<(), PeerError> {
        if self.reject_tracks {
            return Err(negotiation("track rejected by transceiver".into()));
        }
        self.log.lock().unwrap().tracks = tracks.iter().map(|t| t.id().to_string()).collect();
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        let mut log = self.log.lock().unwrap();
        log.closed = true;
        log.signaling = Some(SignalingState::Closed);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeConnector {
    name: String,
    links: Mutex<Vec<Arc<FakeLink>>>,
    reject_tracks: bool,
}

impl FakeConnector {
    pub fn named(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            ..Default::default()
        })
    }

    /// Соединения, которые не принимают локальные треки
    pub fn rejecting_tracks(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            reject_tracks: true,
            ..Default::default()
        })
    }

    pub fn connections(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    pub fn link(&self) -> Arc<FakeLink> {
        self.links
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no link created yet")
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(&self, events: PeerEventSender) -> Result<Arc<dyn PeerLink>, PeerError> {
        let link = Arc::new(FakeLink::new(self.name.clone(), events, self.reject_tracks));
        self.links.lock().unwrap().push(link.clone());
        Ok(link)
    }
}

/// Источник захвата с заранее заданными исходами; когда сценарий кончился, отдаёт треки
#[derive(Default)]
pub struct FakeMediaSource {
    script: Mutex<VecDeque<CaptureError>>,
    acquired: AtomicUsize,
    last: Mutex<Option<LocalMedia>>,
}

impl FakeMediaSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_with(errors: impl IntoIterator<Item = CaptureError>) -> Arc<Self> {
        let source = Self::default();
        source.script.lock().unwrap().extend(errors);
        Arc::new(source)
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn last(&self) -> Option<LocalMedia> {
        self.last.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaSource for FakeMediaSource {
    async fn acquire(&self) -> Result<LocalMedia, CaptureError> {
        if let Some(err) = self.script.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let media = LocalMedia::audio_video();
        *self.last.lock().unwrap() = Some(media.clone());
        Ok(media)
    }
}

pub fn fast_config() -> PeerConfig {
    PeerConfig {
        ice_servers: Vec::new(),
        heartbeat_interval: Duration::from_secs(3),
        grace_period: Duration::from_secs(10),
        ice_candidate_pool_size: 0,
    }
}

/// Участник звонка на фейковом соединении
pub struct Endpoint {
    pub manager: PeerSessionManager,
    pub connector: Arc<FakeConnector>,
    pub media: Arc<FakeMediaSource>,
}

impl Endpoint {
    pub fn new(
        channels: &InMemoryBroadcast,
        session: &SessionId,
        me: &str,
        role: Role,
        media: Arc<FakeMediaSource>,
    ) -> Self {
        Self::with_connector(channels, session, me, role, media, FakeConnector::named(me))
    }

    pub fn with_connector(
        channels: &InMemoryBroadcast,
        session: &SessionId,
        me: &str,
        role: Role,
        media: Arc<FakeMediaSource>,
        connector: Arc<FakeConnector>,
    ) -> Self {
        init_logging();
        let manager = PeerSessionManager::new(
            session.clone(),
            id(me),
            role,
            fast_config(),
            PeerDeps {
                channels: Arc::new(channels.clone()),
                connector: connector.clone(),
                media: media.clone(),
            },
        );
        Self {
            manager,
            connector,
            media,
        }
    }

    pub fn link(&self) -> Arc<FakeLink> {
        self.connector.link()
    }
}

/// Открывает канал сигнализации от имени `me` для ручного управления протоколом
pub async fn probe(
    channels: &InMemoryBroadcast,
    session: &SessionId,
    me: &str,
) -> (SignalSender, SignalReceiver) {
    SignalingChannel::open(channels, session, id(me))
        .await
        .unwrap()
        .split()
}

/// Следующее сообщение собеседника (не дольше 5 с)
pub async fn next_signal(rx: &mut SignalReceiver) -> SignalingMessage {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a signal")
        .expect("signaling channel closed")
}

/// Следующее сообщение, отличное от `ready`
pub async fn next_non_ready(rx: &mut SignalReceiver) -> Signal {
    loop {
        let message = next_signal(rx).await;
        if message.signal != Signal::Ready {
            return message.signal;
        }
    }
}

/// Сколько кадров с событием `event` отправил `from` в канал сессии
pub fn published(channels: &InMemoryBroadcast, session: &SessionId, from: &str, event: &str) -> usize {
    channels
        .history(&topic_for(session))
        .iter()
        .filter(|frame| frame.event == event && frame.payload["from"] == from)
        .count()
}

pub fn candidate(n: u32) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host"),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
    }
}
