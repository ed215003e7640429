mod common;

use std::sync::Arc;

use common::{eventually, fast_config, id, providers, store, FakeConnector, FakeMediaSource};
use consult_rtc::broadcast::InMemoryBroadcast;
use consult_rtc::model::{Role, Session, SessionStatus};
use consult_rtc::peer::{CallStatus, PeerEvent, TransportState};
use consult_rtc::signaling::topic_for;
use consult_rtc::store::{InMemoryStore, SessionStore};
use consult_rtc::{CallContext, CallEndpoint, CallError};

struct Side {
    ctx: CallContext,
    connector: Arc<FakeConnector>,
}

fn side(store: &Arc<InMemoryStore>, channels: &InMemoryBroadcast, me: &str) -> Side {
    let connector = FakeConnector::named(me);
    Side {
        ctx: CallContext {
            store: store.clone(),
            channels: Arc::new(channels.clone()),
            connector: connector.clone(),
            media: FakeMediaSource::new(),
            config: fast_config(),
        },
        connector,
    }
}

async fn session_in(store: &Arc<InMemoryStore>, status: SessionStatus) -> Session {
    let session = Session::new(id("patient"), &providers()[0], status);
    store.insert_session(session.clone()).await.unwrap();
    session
}

fn record(store: &InMemoryStore, session: &Session) -> Session {
    store
        .sessions()
        .into_iter()
        .find(|s| s.id == session.id)
        .unwrap()
}

#[tokio::test]
async fn only_participants_of_a_callable_session_can_join() {
    let store = store();
    let channels = InMemoryBroadcast::new();
    let stranger = side(&store, &channels, "dr-b");

    let accepted = session_in(&store, SessionStatus::Accepted).await;
    let err = CallEndpoint::open(&stranger.ctx, &accepted.id, id("dr-b"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, CallError::NotParticipant));

    let pending = session_in(&store, SessionStatus::Pending).await;
    let patient = side(&store, &channels, "patient");
    let err = CallEndpoint::open(&patient.ctx, &pending.id, id("patient"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, CallError::NotCallable(SessionStatus::Pending)));

    let endpoint = CallEndpoint::open(&patient.ctx, &accepted.id, id("patient"))
        .await
        .unwrap();
    assert_eq!(endpoint.role(), Role::Requester);
    assert_eq!(endpoint.session().provider_id, id("dr-a"));
}

#[tokio::test]
async fn hang_up_reaches_the_other_side_without_signaling() {
    let store = store();
    let channels = InMemoryBroadcast::new();
    let session = session_in(&store, SessionStatus::Accepted).await;

    let patient_side = side(&store, &channels, "patient");
    let doctor_side = side(&store, &channels, "dr-a");
    let patient = CallEndpoint::open(&patient_side.ctx, &session.id, id("patient"))
        .await
        .unwrap();
    let doctor = CallEndpoint::open(&doctor_side.ctx, &session.id, id("dr-a"))
        .await
        .unwrap();
    assert_eq!(doctor.role(), Role::Provider);

    patient.start().await.unwrap();
    doctor.start().await.unwrap();

    // канал сигнализации молчит, завершение идёт только через хранилище
    channels.pause();
    patient.hang_up().await.unwrap();

    assert_eq!(record(&store, &session).status, SessionStatus::Completed);
    assert_eq!(patient.status(), CallStatus::Closed);
    eventually("doctor torn down", || doctor.status() == CallStatus::Closed).await;
    assert!(doctor_side.connector.link().with_log(|l| l.closed));
    assert_eq!(channels.subscriber_count(&topic_for(&session.id)), 0);

    // второй участник тоже может нажать "завершить"
    assert!(doctor.hang_up().await.is_ok());
}

#[tokio::test]
async fn first_connection_marks_the_session_in_call() {
    let store = store();
    let channels = InMemoryBroadcast::new();
    let session = session_in(&store, SessionStatus::PaymentConfirmed).await;
    let doctor_side = side(&store, &channels, "dr-a");
    let doctor = CallEndpoint::open(&doctor_side.ctx, &session.id, id("dr-a"))
        .await
        .unwrap();
    doctor.start().await.unwrap();
    assert_eq!(record(&store, &session).status, SessionStatus::PaymentConfirmed);

    let link = doctor_side.connector.link();
    link.emit(PeerEvent::Transport(TransportState::Connected));
    eventually("session in call", || {
        record(&store, &session).status == SessionStatus::InCall
    })
    .await;
    let started_at = record(&store, &session).started_at;
    assert!(started_at.is_some());

    link.emit(PeerEvent::Transport(TransportState::Disconnected));
    link.emit(PeerEvent::Transport(TransportState::Connected));
    eventually("reconnected", || doctor.status() == CallStatus::Connected).await;
    assert_eq!(record(&store, &session).started_at, started_at);

    doctor.leave().await;
    assert_eq!(doctor.status(), CallStatus::Closed);
    assert_eq!(record(&store, &session).status, SessionStatus::InCall);
}
