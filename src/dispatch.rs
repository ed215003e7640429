//! Последовательный подбор специалиста для заявки.
//!
//! Предложение уходит одному кандидату за раз; по таймауту или отказу кандидат
//! попадает в `rejected`, и предложение переходит к следующему в порядке каталога.
//! Единственный писатель `offered_to`/`rejected` - задача прогона.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use crate::config::DispatchConfig;
use crate::error::{DispatchError, StoreError};
use crate::model::{
    MatchRequest, MatchStatus, Notification, ParticipantId, Provider, RequestId, Requester,
    Session,
};
use crate::store::{ChangeEvent, ChangeFeed, ChangeFilter, FeedError, SessionStore};

pub struct CandidateDispatcher {
    store: Arc<dyn SessionStore>,
    config: DispatchConfig,
}

impl CandidateDispatcher {
    pub fn new(store: Arc<dyn SessionStore>, config: DispatchConfig) -> Self {
        Self { store, config }
    }

    /// Создаёт заявку и запускает прогон по кандидатам.
    ///
    /// Пустой пул сразу отменяет заявку и возвращает `NoCandidatesAvailable`,
    /// никому ничего не отправив.
    #[instrument(skip(self, requester), fields(requester = %requester.id))]
    pub async fn start(
        &self,
        requester: &Requester,
        category: Option<String>,
    ) -> Result<DispatchRun, DispatchError> {
        let request = MatchRequest::new(requester, category);
        let id = request.id.clone();
        self.store.insert_request(request.clone()).await?;

        let pool = self.build_pool(&request).await?;
        if pool.is_empty() {
            self.store
                .update_request(
                    &id,
                    Box::new(|req| {
                        req.finish(MatchStatus::Cancelled);
                        Ok(())
                    }),
                )
                .await?;
            warn!(request = %id, "no providers available");
            return Err(DispatchError::NoCandidatesAvailable);
        }

        info!(request = %id, pool = pool.len(), "dispatch started");

        // подписка до запуска задачи, чтобы не потерять ранние изменения
        let feed = self.store.subscribe(ChangeFilter::Request(id.clone()));
        let run = Run {
            store: self.store.clone(),
            request: id.clone(),
            pool,
            offer_timeout: self.config.offer_timeout,
            feed,
        };
        let handle = tokio::spawn(run.drive().instrument(info_span!("dispatch", request = %id)));

        Ok(DispatchRun {
            request: id,
            store: self.store.clone(),
            handle,
        })
    }

    async fn build_pool(&self, request: &MatchRequest) -> Result<Vec<Provider>, StoreError> {
        let mut pool = Vec::new();
        for provider in self
            .store
            .available_providers(request.category.as_deref())
            .await?
        {
            if provider.id == request.requester_id {
                continue;
            }
            if self.store.has_active_session(&provider.id).await? {
                debug!(provider = %provider.id, "skipping busy provider");
                continue;
            }
            pool.push(provider);
        }
        Ok(pool)
    }
}

/// Ручка запущенного прогона. Если её выбросить, прогон продолжится сам.
pub struct DispatchRun {
    request: RequestId,
    store: Arc<dyn SessionStore>,
    handle: JoinHandle<Result<Session, DispatchError>>,
}

impl DispatchRun {
    pub fn request_id(&self) -> &RequestId {
        &self.request
    }

    /// Отменяет заявку. Прогон заметит это при следующем пробуждении.
    /// Возвращает false, если заявка уже была терминальной.
    pub async fn cancel(&self) -> Result<bool, DispatchError> {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        self.store
            .update_request(
                &self.request,
                Box::new(move |req| {
                    flag.store(req.finish(MatchStatus::Cancelled), Ordering::SeqCst);
                    Ok(())
                }),
            )
            .await?;
        let changed = finished.load(Ordering::SeqCst);
        if changed {
            info!(request = %self.request, "dispatch cancelled");
        }
        Ok(changed)
    }

    pub async fn outcome(self) -> Result<Session, DispatchError> {
        self.handle
            .await
            .map_err(|e| DispatchError::Interrupted(e.to_string()))?
    }
}

/// Кандидат принимает предложение. Проходит только для текущего адресата
/// заявки в статусе `searching` и только если у него нет активной сессии.
#[instrument(skip(store))]
pub async fn accept_offer(
    store: &dyn SessionStore,
    request: &RequestId,
    provider: &ParticipantId,
) -> Result<Session, DispatchError> {
    Ok(store.accept_match(request, provider).await?)
}

/// Явный отказ: прогон обработает его как таймаут, но сразу
#[instrument(skip(store))]
pub async fn decline_offer(
    store: &dyn SessionStore,
    request: &RequestId,
    provider: &ParticipantId,
) -> Result<(), DispatchError> {
    Ok(store.decline_match(request, provider).await?)
}

enum Wake {
    TimedOut,
    Declined,
    Changed,
}

struct Run {
    store: Arc<dyn SessionStore>,
    request: RequestId,
    pool: Vec<Provider>,
    offer_timeout: Duration,
    feed: ChangeFeed,
}

impl Run {
    async fn drive(mut self) -> Result<Session, DispatchError> {
        let result = self.drive_inner().await;
        match &result {
            Ok(session) => info!(session = %session.id, "dispatch matched"),
            Err(DispatchError::Store(e)) => error!("dispatch aborted: {e}"),
            Err(e) => info!("dispatch finished: {e}"),
        }
        result
    }

    async fn drive_inner(&mut self) -> Result<Session, DispatchError> {
        loop {
            let current = self.store.request(&self.request).await?;
            if current.status.is_terminal() {
                return self.settle(current).await;
            }

            let Some(candidate) = self
                .pool
                .iter()
                .find(|p| !current.rejected.contains(&p.id))
                .cloned()
            else {
                let updated = self
                    .store
                    .update_request(
                        &self.request,
                        Box::new(|req| {
                            req.finish(MatchStatus::Expired);
                            Ok(())
                        }),
                    )
                    .await?;
                return self.settle(updated).await;
            };

            let target = candidate.id.clone();
            let offered = self
                .store
                .update_request(
                    &self.request,
                    Box::new(move |req| {
                        req.offer_to(&target);
                        Ok(())
                    }),
                )
                .await?;
            if !offered.is_offered_to(&candidate.id) {
                continue;
            }

            self.store
                .notify(
                    &candidate.id,
                    Notification::MatchOffer {
                        request_id: offered.id.clone(),
                        requester_id: offered.requester_id.clone(),
                        requester_name: offered.requester_name.clone(),
                        category: offered.category.clone(),
                    },
                )
                .await?;
            info!(candidate = %candidate.id, "offer sent");

            match self.wait_for_decision(&candidate.id).await? {
                Wake::Changed => {}
                wake @ (Wake::TimedOut | Wake::Declined) => {
                    let target = candidate.id.clone();
                    let withdrawn = self
                        .store
                        .update_request(
                            &self.request,
                            Box::new(move |req| {
                                req.withdraw(&target);
                                Ok(())
                            }),
                        )
                        .await?;
                    if withdrawn.rejected.contains(&candidate.id) {
                        let reason = match wake {
                            Wake::Declined => "declined",
                            _ => "timed out",
                        };
                        info!(candidate = %candidate.id, reason, "offer withdrawn");
                    }
                }
            }
        }
    }

    /// Ждёт решения по текущему предложению не дольше таймаута
    async fn wait_for_decision(&mut self, candidate: &ParticipantId) -> Result<Wake, DispatchError> {
        let deadline = sleep(self.offer_timeout);
        tokio::pin!(deadline);

        loop {
            let request = tokio::select! {
                _ = &mut deadline => return Ok(Wake::TimedOut),
                event = self.feed.next() => match event {
                    Ok(ChangeEvent::Request(request)) => request,
                    Ok(_) => continue,
                    Err(FeedError::Lagged(skipped)) => {
                        debug!(skipped, "request feed lagged, re-reading");
                        self.store.request(&self.request).await?
                    }
                    Err(FeedError::Closed) => {
                        return Err(DispatchError::Interrupted("change feed closed".into()))
                    }
                },
            };

            if !request.is_searching() {
                return Ok(Wake::Changed);
            }
            match &request.offered_to {
                Some(current) if current == candidate => {
                    if request.declined_by.as_ref() == Some(candidate) {
                        return Ok(Wake::Declined);
                    }
                }
                Some(_) => return Ok(Wake::Changed),
                // снимок от предыдущего кандидата, ещё до текущего offer_to
                None => {}
            }
        }
    }

    async fn settle(&self, request: MatchRequest) -> Result<Session, DispatchError> {
        match request.status {
            MatchStatus::Matched => {
                let session_id = request.session_id.ok_or_else(|| {
                    StoreError::Conflict(format!("matched request {} has no session", request.id))
                })?;
                Ok(self.store.session(&session_id).await?)
            }
            MatchStatus::Cancelled => Err(DispatchError::Cancelled),
            MatchStatus::Expired => Err(DispatchError::PoolExhausted),
            MatchStatus::Searching => Err(DispatchError::Interrupted(
                "request is still searching".into(),
            )),
        }
    }
}
