//! Звонок с точки зрения одного участника: менеджер соединения, наблюдатель
//! за записью сессии и отметка начала звонка в одном объекте.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::broadcast::BroadcastService;
use crate::config::PeerConfig;
use crate::error::CallError;
use crate::model::{ParticipantId, Role, Session, SessionId};
use crate::peer::link::PeerConnector;
use crate::peer::media::MediaSource;
use crate::peer::session::{PeerDeps, PeerSessionManager};
use crate::peer::state::CallStatus;
use crate::session::SessionLedger;
use crate::store::SessionStore;
use crate::sync::SessionStatusSynchronizer;

#[derive(Clone)]
pub struct CallContext {
    pub store: Arc<dyn SessionStore>,
    pub channels: Arc<dyn BroadcastService>,
    pub connector: Arc<dyn PeerConnector>,
    pub media: Arc<dyn MediaSource>,
    pub config: PeerConfig,
}

pub struct CallEndpoint {
    session: Session,
    role: Role,
    manager: PeerSessionManager,
    ledger: SessionLedger,
    sync: SessionStatusSynchronizer,
    stamp: JoinHandle<()>,
}

impl CallEndpoint {
    /// Проверяет, что `me` участник сессии и звонок сейчас разрешён
    #[instrument(skip(ctx))]
    pub async fn open(
        ctx: &CallContext,
        session_id: &SessionId,
        me: ParticipantId,
    ) -> Result<Self, CallError> {
        let session = ctx.store.session(session_id).await?;
        let role = session.role_of(&me).ok_or(CallError::NotParticipant)?;
        if !session.status.is_callable() {
            return Err(CallError::NotCallable(session.status));
        }

        let manager = PeerSessionManager::new(
            session.id.clone(),
            me,
            role,
            ctx.config.clone(),
            PeerDeps {
                channels: ctx.channels.clone(),
                connector: ctx.connector.clone(),
                media: ctx.media.clone(),
            },
        );

        let on_terminal = manager.clone();
        let sync = SessionStatusSynchronizer::watch(
            ctx.store.clone(),
            session.id.clone(),
            move |ended| async move {
                info!(session = %ended.id, status = ?ended.status, "tearing down after session end");
                on_terminal.stop().await;
            },
        );

        let ledger = SessionLedger::new(ctx.store.clone());
        let stamp = spawn_start_stamp(&manager, ledger.clone());

        Ok(Self {
            session,
            role,
            manager,
            ledger,
            sync,
            stamp,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn manager(&self) -> &PeerSessionManager {
        &self.manager
    }

    pub fn status(&self) -> CallStatus {
        self.manager.status()
    }

    pub async fn start(&self) -> Result<(), CallError> {
        Ok(self.manager.start().await?)
    }

    /// Завершает сессию для обоих участников. Собеседник узнает об этом из ленты изменений.
    pub async fn hang_up(&self) -> Result<(), CallError> {
        let result = self.ledger.complete(&self.session.id).await;
        self.leave().await;
        result?;
        Ok(())
    }

    /// Уходит из звонка только локально, запись сессии не трогает
    pub async fn leave(&self) {
        self.sync.stop();
        self.stamp.abort();
        self.manager.stop().await;
    }
}

impl Drop for CallEndpoint {
    fn drop(&mut self) {
        self.stamp.abort();
    }
}

/// При первом соединении переводит сессию в `in-call`
fn spawn_start_stamp(manager: &PeerSessionManager, ledger: SessionLedger) -> JoinHandle<()> {
    let mut status = manager.subscribe_status();
    let session = manager.session_id().clone();
    tokio::spawn(async move {
        loop {
            if *status.borrow_and_update() == CallStatus::Connected {
                if let Err(e) = ledger.mark_started(&session).await {
                    warn!(%session, "failed to mark session started: {e}");
                }
                return;
            }
            if status.changed().await.is_err() {
                return;
            }
        }
    })
}
