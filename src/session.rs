use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument};

use crate::error::{SessionError, StoreError};
use crate::model::{Notification, ParticipantId, Requester, Session, SessionId, SessionStatus};
use crate::store::SessionStore;

/// Переходы статуса записи звонка. Терминальные статусы липкие:
/// повтор того же статуса ничего не меняет, любой другой отклоняется.
#[derive(Clone)]
pub struct SessionLedger {
    store: Arc<dyn SessionStore>,
}

impl SessionLedger {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Прямой запрос к конкретному специалисту, минуя подбор
    #[instrument(skip(self, requester), fields(requester = %requester.id))]
    pub async fn request_direct(
        &self,
        requester: &Requester,
        provider: &ParticipantId,
    ) -> Result<Session, SessionError> {
        let profile = self.store.provider(provider).await?;
        if self.store.has_active_session(provider).await? {
            return Err(StoreError::Conflict(format!(
                "provider {provider} already has an active session"
            ))
            .into());
        }

        let session = Session::new(requester.id.clone(), &profile, SessionStatus::Pending);
        self.store.insert_session(session.clone()).await?;
        self.store
            .notify(
                provider,
                Notification::SessionRequested {
                    session_id: session.id.clone(),
                    requester_id: requester.id.clone(),
                    requester_name: requester.display_name.clone(),
                },
            )
            .await?;

        info!(session = %session.id, "direct session requested");
        Ok(session)
    }

    pub async fn transition(
        &self,
        id: &SessionId,
        next: SessionStatus,
    ) -> Result<Session, SessionError> {
        self.apply(id, next, false).await
    }

    /// Переводит в `in-call`; `started_at` выставляется только при первом вызове
    pub async fn mark_started(&self, id: &SessionId) -> Result<Session, SessionError> {
        self.apply(id, SessionStatus::InCall, true).await
    }

    pub async fn complete(&self, id: &SessionId) -> Result<Session, SessionError> {
        self.apply(id, SessionStatus::Completed, false).await
    }

    pub async fn cancel(&self, id: &SessionId) -> Result<Session, SessionError> {
        self.apply(id, SessionStatus::Cancelled, false).await
    }

    async fn apply(
        &self,
        id: &SessionId,
        next: SessionStatus,
        stamp_start: bool,
    ) -> Result<Session, SessionError> {
        let updated = self
            .store
            .update_session(
                id,
                Box::new(move |session| {
                    if session.apply(next).is_ok() && stamp_start && session.started_at.is_none() {
                        session.started_at = Some(Utc::now());
                    }
                    Ok(())
                }),
            )
            .await?;

        // запись атомарна: либо статус стал `next`, либо сессия уже терминальна
        if updated.status != next {
            return Err(SessionError::Terminal(updated.status));
        }
        info!(session = %id, status = ?next, "session status updated");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Provider;
    use crate::store::InMemoryStore;

    async fn ledger_with_session(status: SessionStatus) -> (SessionLedger, SessionId) {
        let provider = Provider::new("doc", "Dr. Doc").with_fee(5_000);
        let store = Arc::new(InMemoryStore::with_providers([provider.clone()]));
        let session = Session::new("pat".into(), &provider, status);
        let id = session.id.clone();
        store.insert_session(session).await.unwrap();
        (SessionLedger::new(store), id)
    }

    #[tokio::test]
    async fn started_at_is_stamped_once() {
        let (ledger, id) = ledger_with_session(SessionStatus::Accepted).await;

        let first = ledger.mark_started(&id).await.unwrap();
        let stamped = first.started_at;
        assert!(stamped.is_some());

        let again = ledger.mark_started(&id).await.unwrap();
        assert_eq!(again.started_at, stamped);
    }

    #[tokio::test]
    async fn completed_session_rejects_other_statuses() {
        let (ledger, id) = ledger_with_session(SessionStatus::InCall).await;

        let done = ledger.complete(&id).await.unwrap();
        assert!(done.ended_at.is_some());
        assert!(ledger.complete(&id).await.is_ok(), "repeat is a no-op");

        assert_eq!(
            ledger.cancel(&id).await.unwrap_err(),
            SessionError::Terminal(SessionStatus::Completed)
        );
        assert_eq!(
            ledger.mark_started(&id).await.unwrap_err(),
            SessionError::Terminal(SessionStatus::Completed)
        );
    }

    #[tokio::test]
    async fn direct_request_notifies_provider() {
        let provider = Provider::new("doc", "Dr. Doc");
        let store = Arc::new(InMemoryStore::with_providers([provider]));
        let ledger = SessionLedger::new(store.clone());

        let session = ledger
            .request_direct(&Requester::new("pat", "Pat"), &"doc".into())
            .await
            .unwrap();

        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(
            store.notifications_for(&"doc".into()),
            vec![Notification::SessionRequested {
                session_id: session.id,
                requester_id: "pat".into(),
                requester_name: "Pat".into(),
            }]
        );
    }
}
