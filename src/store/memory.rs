use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{ChangeEvent, ChangeFeed, ChangeFilter, RequestUpdate, SessionStore, SessionUpdate};
use crate::error::StoreError;
use crate::model::{
    MatchRequest, MatchStatus, Notification, ParticipantId, Provider, RequestId, Session,
    SessionId, SessionStatus,
};

const FEED_CAPACITY: usize = 256;

/// Операции, которые можно разово сломать в тестах
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    InsertRequest,
    UpdateRequest,
    AcceptMatch,
    DeclineMatch,
    InsertSession,
    UpdateSession,
    Notify,
}

#[derive(Default)]
struct Tables {
    providers: Vec<Provider>,
    requests: HashMap<RequestId, MatchRequest>,
    sessions: HashMap<SessionId, Session>,
    notifications: Vec<(ParticipantId, Notification)>,
    fail_once: HashSet<StoreOp>,
}

impl Tables {
    fn take_failure(&mut self, op: StoreOp) -> Result<(), StoreError> {
        if self.fail_once.remove(&op) {
            warn!(?op, "injected store failure");
            return Err(StoreError::Unavailable(format!("injected failure in {op:?}")));
        }
        Ok(())
    }

    fn busy(&self, provider: &ParticipantId) -> bool {
        self.sessions
            .values()
            .any(|s| &s.provider_id == provider && s.status.is_active())
    }
}

/// Хранилище в памяти процесса. Один мьютекс на все таблицы, поэтому каждая
/// операция трейта атомарна.
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            tables: Mutex::new(Tables::default()),
            changes,
        }
    }

    pub fn with_providers(providers: impl IntoIterator<Item = Provider>) -> Self {
        let store = Self::new();
        for provider in providers {
            store.add_provider(provider);
        }
        store
    }

    pub fn add_provider(&self, provider: Provider) {
        if let Ok(mut tables) = self.lock() {
            tables.providers.push(provider);
        }
    }

    /// Разово ломает следующую операцию `op`
    pub fn inject_failure_once(&self, op: StoreOp) {
        if let Ok(mut tables) = self.lock() {
            tables.fail_once.insert(op);
        }
    }

    /// Все записанные уведомления в порядке записи
    pub fn notifications(&self) -> Vec<(ParticipantId, Notification)> {
        self.lock()
            .map(|tables| tables.notifications.clone())
            .unwrap_or_default()
    }

    pub fn notifications_for(&self, to: &ParticipantId) -> Vec<Notification> {
        self.notifications()
            .into_iter()
            .filter(|(id, _)| id == to)
            .map(|(_, n)| n)
            .collect()
    }

    pub fn requests(&self) -> Vec<MatchRequest> {
        self.lock()
            .map(|tables| tables.requests.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.lock()
            .map(|tables| tables.sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Unavailable("store mutex poisoned".into()))
    }

    fn emit(&self, event: ChangeEvent) {
        // нет подписчиков - не ошибка
        let _ = self.changes.send(event);
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn available_providers(
        &self,
        category: Option<&str>,
    ) -> Result<Vec<Provider>, StoreError> {
        let tables = self.lock()?;
        Ok(tables
            .providers
            .iter()
            .filter(|p| p.available && p.matches_category(category))
            .cloned()
            .collect())
    }

    async fn provider(&self, id: &ParticipantId) -> Result<Provider, StoreError> {
        let tables = self.lock()?;
        tables
            .providers
            .iter()
            .find(|p| &p.id == id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("provider", id))
    }

    async fn has_active_session(&self, provider: &ParticipantId) -> Result<bool, StoreError> {
        Ok(self.lock()?.busy(provider))
    }

    async fn insert_request(&self, request: MatchRequest) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        tables.take_failure(StoreOp::InsertRequest)?;
        if tables.requests.contains_key(&request.id) {
            return Err(StoreError::Conflict(format!("request {} exists", request.id)));
        }
        tables.requests.insert(request.id.clone(), request.clone());
        self.emit(ChangeEvent::Request(request));
        Ok(())
    }

    async fn request(&self, id: &RequestId) -> Result<MatchRequest, StoreError> {
        self.lock()?
            .requests
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("request", id))
    }

    async fn update_request(
        &self,
        id: &RequestId,
        update: RequestUpdate,
    ) -> Result<MatchRequest, StoreError> {
        let mut tables = self.lock()?;
        tables.take_failure(StoreOp::UpdateRequest)?;
        let current = tables
            .requests
            .get(id)
            .ok_or_else(|| StoreError::not_found("request", id))?;

        let mut next = current.clone();
        update(&mut next)?;
        if &next != current {
            tables.requests.insert(id.clone(), next.clone());
            self.emit(ChangeEvent::Request(next.clone()));
        }
        Ok(next)
    }

    async fn accept_match(
        &self,
        id: &RequestId,
        provider: &ParticipantId,
    ) -> Result<Session, StoreError> {
        let mut tables = self.lock()?;
        tables.take_failure(StoreOp::AcceptMatch)?;

        let request = tables
            .requests
            .get(id)
            .ok_or_else(|| StoreError::not_found("request", id))?;
        if !request.is_offered_to(provider) {
            return Err(StoreError::Conflict(format!(
                "request {id} is not offered to {provider}"
            )));
        }
        if tables.busy(provider) {
            return Err(StoreError::Conflict(format!(
                "provider {provider} already has an active session"
            )));
        }
        let profile = tables
            .providers
            .iter()
            .find(|p| &p.id == provider)
            .cloned()
            .ok_or_else(|| StoreError::not_found("provider", provider))?;

        let mut request = request.clone();
        let session = Session::new(request.requester_id.clone(), &profile, SessionStatus::Accepted);
        request.finish(MatchStatus::Matched);
        request.session_id = Some(session.id.clone());

        tables.sessions.insert(session.id.clone(), session.clone());
        tables.requests.insert(id.clone(), request.clone());
        info!(request = %id, session = %session.id, %provider, "match accepted");

        self.emit(ChangeEvent::Session(session.clone()));
        self.emit(ChangeEvent::Request(request));
        Ok(session)
    }

    async fn decline_match(
        &self,
        id: &RequestId,
        provider: &ParticipantId,
    ) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        tables.take_failure(StoreOp::DeclineMatch)?;

        let request = tables
            .requests
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("request", id))?;
        if !request.is_offered_to(provider) {
            return Err(StoreError::Conflict(format!(
                "request {id} is not offered to {provider}"
            )));
        }
        request.declined_by = Some(provider.clone());
        let snapshot = request.clone();
        debug!(request = %id, %provider, "offer declined");

        self.emit(ChangeEvent::Request(snapshot));
        Ok(())
    }

    async fn insert_session(&self, session: Session) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        tables.take_failure(StoreOp::InsertSession)?;
        if tables.sessions.contains_key(&session.id) {
            return Err(StoreError::Conflict(format!("session {} exists", session.id)));
        }
        tables.sessions.insert(session.id.clone(), session.clone());
        self.emit(ChangeEvent::Session(session));
        Ok(())
    }

    async fn session(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.lock()?
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("session", id))
    }

    async fn update_session(
        &self,
        id: &SessionId,
        update: SessionUpdate,
    ) -> Result<Session, StoreError> {
        let mut tables = self.lock()?;
        tables.take_failure(StoreOp::UpdateSession)?;
        let current = tables
            .sessions
            .get(id)
            .ok_or_else(|| StoreError::not_found("session", id))?;

        let mut next = current.clone();
        update(&mut next)?;
        if &next != current {
            tables.sessions.insert(id.clone(), next.clone());
            self.emit(ChangeEvent::Session(next.clone()));
        }
        Ok(next)
    }

    async fn notify(
        &self,
        to: &ParticipantId,
        notification: Notification,
    ) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        tables.take_failure(StoreOp::Notify)?;
        tables.notifications.push((to.clone(), notification.clone()));
        self.emit(ChangeEvent::Notification {
            to: to.clone(),
            notification,
        });
        Ok(())
    }

    fn subscribe(&self, filter: ChangeFilter) -> ChangeFeed {
        ChangeFeed::new(filter, self.changes.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Requester;

    fn store() -> InMemoryStore {
        InMemoryStore::with_providers([
            Provider::new("a", "Dr. A").with_category("cardiology"),
            Provider::new("b", "Dr. B").with_category("dermatology"),
        ])
    }

    #[tokio::test]
    async fn update_closure_error_leaves_record_untouched() {
        let store = store();
        let request = MatchRequest::new(&Requester::new("p", "Pat"), None);
        let id = request.id.clone();
        store.insert_request(request.clone()).await.unwrap();

        let err = store
            .update_request(
                &id,
                Box::new(|req| {
                    req.status = MatchStatus::Expired;
                    Err(StoreError::Conflict("nope".into()))
                }),
            )
            .await
            .unwrap_err();

        assert_eq!(err, StoreError::Conflict("nope".into()));
        assert_eq!(store.request(&id).await.unwrap(), request);
    }

    #[tokio::test]
    async fn accept_requires_current_offer_and_free_provider() {
        let store = store();
        let provider = ParticipantId::new("a");
        let mut request = MatchRequest::new(&Requester::new("p", "Pat"), None);
        let id = request.id.clone();
        request.offer_to(&provider);
        store.insert_request(request).await.unwrap();

        let other = ParticipantId::new("b");
        assert!(matches!(
            store.accept_match(&id, &other).await,
            Err(StoreError::Conflict(_))
        ));

        let session = store.accept_match(&id, &provider).await.unwrap();
        assert_eq!(session.status, SessionStatus::Accepted);
        assert!(store.has_active_session(&provider).await.unwrap());

        let matched = store.request(&id).await.unwrap();
        assert_eq!(matched.status, MatchStatus::Matched);
        assert_eq!(matched.session_id, Some(session.id));

        // повторный accept уже не пройдёт: заявка терминальна
        assert!(store.accept_match(&id, &provider).await.is_err());
    }

    #[tokio::test]
    async fn feed_filters_by_provider() {
        let store = store();
        let mut feed = store.subscribe(ChangeFilter::SessionsForProvider("b".into()));

        let a = store.provider(&"a".into()).await.unwrap();
        let b = store.provider(&"b".into()).await.unwrap();
        store
            .insert_session(Session::new("p1".into(), &a, SessionStatus::Pending))
            .await
            .unwrap();
        let for_b = Session::new("p2".into(), &b, SessionStatus::Pending);
        store.insert_session(for_b.clone()).await.unwrap();

        assert_eq!(feed.next().await.unwrap(), ChangeEvent::Session(for_b));
    }

    #[tokio::test]
    async fn injected_failure_hits_only_once() {
        let store = store();
        store.inject_failure_once(StoreOp::Notify);
        let note = Notification::SessionRequested {
            session_id: "s".into(),
            requester_id: "p".into(),
            requester_name: "Pat".into(),
        };

        assert!(matches!(
            store.notify(&"a".into(), note.clone()).await,
            Err(StoreError::Unavailable(_))
        ));
        store.notify(&"a".into(), note.clone()).await.unwrap();
        assert_eq!(store.notifications_for(&"a".into()), vec![note]);
    }
}
