//! Наблюдение за записью сессии через ленту изменений.
//!
//! Лента несёт только завершение звонка, никогда содержимое согласования:
//! решение о завершении должно дойти до обеих сторон, даже если канал
//! сигнализации между ними недоступен.

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::model::{Session, SessionId};
use crate::store::{ChangeEvent, ChangeFilter, FeedError, SessionStore};

pub struct SessionStatusSynchronizer {
    session: SessionId,
    handle: JoinHandle<()>,
}

impl SessionStatusSynchronizer {
    /// Вызывает `on_terminal` ровно один раз, когда сессия станет терминальной
    /// (в том числе если она уже терминальна в момент подписки).
    pub fn watch<F, Fut>(store: Arc<dyn SessionStore>, session: SessionId, on_terminal: F) -> Self
    where
        F: FnOnce(Session) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        // подписываемся до чтения записи, чтобы не пропустить переход между ними
        let mut feed = store.subscribe(ChangeFilter::Session(session.clone()));
        let id = session.clone();

        let handle = tokio::spawn(async move {
            let mut current = match store.session(&id).await {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(session = %id, "initial session read failed: {e}");
                    None
                }
            };

            loop {
                if let Some(record) = current.take() {
                    if record.status.is_terminal() {
                        info!(session = %id, status = ?record.status, "session terminated");
                        on_terminal(record).await;
                        return;
                    }
                }

                current = match feed.next().await {
                    Ok(ChangeEvent::Session(record)) => Some(record),
                    Ok(_) => None,
                    Err(FeedError::Lagged(skipped)) => {
                        debug!(session = %id, skipped, "session feed lagged, re-reading");
                        match store.session(&id).await {
                            Ok(record) => Some(record),
                            Err(e) => {
                                warn!(session = %id, "session re-read failed: {e}");
                                None
                            }
                        }
                    }
                    Err(FeedError::Closed) => {
                        warn!(session = %id, "session feed closed");
                        return;
                    }
                };
            }
        });

        Self { session, handle }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for SessionStatusSynchronizer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
