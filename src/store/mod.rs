//! Хранилище заявок и сессий с лентой изменений.
//!
//! Ядро читает и пишет записи только через `SessionStore`; схема и CRUD
//! реляционного хранилища остаются снаружи.

mod memory;

pub use memory::{InMemoryStore, StoreOp};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::error::StoreError;
use crate::model::{
    MatchRequest, Notification, ParticipantId, Provider, RequestId, Session, SessionId,
};

pub type RequestUpdate = Box<dyn FnOnce(&mut MatchRequest) -> Result<(), StoreError> + Send>;
pub type SessionUpdate = Box<dyn FnOnce(&mut Session) -> Result<(), StoreError> + Send>;

/// Изменение строки, как его видит подписчик ленты
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Request(MatchRequest),
    Session(Session),
    Notification {
        to: ParticipantId,
        notification: Notification,
    },
}

/// Фильтр по внешнему ключу
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeFilter {
    Request(RequestId),
    Session(SessionId),
    SessionsForProvider(ParticipantId),
    NotificationsFor(ParticipantId),
}

impl ChangeFilter {
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match (self, event) {
            (ChangeFilter::Request(id), ChangeEvent::Request(req)) => &req.id == id,
            (ChangeFilter::Session(id), ChangeEvent::Session(session)) => &session.id == id,
            (ChangeFilter::SessionsForProvider(id), ChangeEvent::Session(session)) => {
                &session.provider_id == id
            }
            (ChangeFilter::NotificationsFor(id), ChangeEvent::Notification { to, .. }) => to == id,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum FeedError {
    #[error("change feed lagged, {0} events skipped")]
    Lagged(u64),
    #[error("change feed closed")]
    Closed,
}

/// Подписка на ленту изменений с фильтром
pub struct ChangeFeed {
    filter: ChangeFilter,
    rx: broadcast::Receiver<ChangeEvent>,
}

impl ChangeFeed {
    pub fn new(filter: ChangeFilter, rx: broadcast::Receiver<ChangeEvent>) -> Self {
        Self { filter, rx }
    }

    pub fn filter(&self) -> &ChangeFilter {
        &self.filter
    }

    /// Следующее подходящее под фильтр событие.
    /// При отставании возвращает `Lagged`; подписчик должен перечитать запись.
    pub async fn next(&mut self) -> Result<ChangeEvent, FeedError> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(&event) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => return Err(FeedError::Lagged(n)),
                Err(broadcast::error::RecvError::Closed) => return Err(FeedError::Closed),
            }
        }
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Доступные специалисты по категории, в естественном порядке каталога
    async fn available_providers(&self, category: Option<&str>)
        -> Result<Vec<Provider>, StoreError>;

    async fn provider(&self, id: &ParticipantId) -> Result<Provider, StoreError>;

    async fn has_active_session(&self, provider: &ParticipantId) -> Result<bool, StoreError>;

    async fn insert_request(&self, request: MatchRequest) -> Result<(), StoreError>;

    async fn request(&self, id: &RequestId) -> Result<MatchRequest, StoreError>;

    /// Атомарное чтение-изменение-запись. Если `update` вернул ошибку, запись не меняется.
    async fn update_request(
        &self,
        id: &RequestId,
        update: RequestUpdate,
    ) -> Result<MatchRequest, StoreError>;

    /// Транзакционное принятие предложения: создаёт сессию и переводит заявку в `matched`
    async fn accept_match(
        &self,
        id: &RequestId,
        provider: &ParticipantId,
    ) -> Result<Session, StoreError>;

    /// Явный отказ кандидата, которому сейчас адресовано предложение
    async fn decline_match(&self, id: &RequestId, provider: &ParticipantId)
        -> Result<(), StoreError>;

    async fn insert_session(&self, session: Session) -> Result<(), StoreError>;

    async fn session(&self, id: &SessionId) -> Result<Session, StoreError>;

    async fn update_session(
        &self,
        id: &SessionId,
        update: SessionUpdate,
    ) -> Result<Session, StoreError>;

    async fn notify(&self, to: &ParticipantId, notification: Notification)
        -> Result<(), StoreError>;

    fn subscribe(&self, filter: ChangeFilter) -> ChangeFeed;
}
