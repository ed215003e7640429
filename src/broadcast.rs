//! Сервис широковещательных каналов: именованный топик, JSON-кадры с именем события.
//!
//! `InMemoryBroadcast` держит всё в процессе. Доставка at-most-once, отправитель
//! свои кадры не получает. Для тестов доставку можно придержать (`pause`) и
//! выпустить разом (`resume`), а также сломать следующую подписку.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::ChannelError;

/// Сколько последних кадров на топик хранит `history`
pub const HISTORY_LIMIT: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastFrame {
    pub event: String,
    pub payload: Value,
}

#[async_trait]
pub trait TopicPublisher: Send + Sync {
    /// Fire-and-forget: успех означает только то, что кадр принят сервисом
    async fn publish(&self, frame: BroadcastFrame) -> Result<(), ChannelError>;

    /// Освобождает подписку на стороне сервиса. Повторный вызов ничего не делает.
    async fn close(&self);
}

pub struct TopicSubscription {
    pub publisher: Arc<dyn TopicPublisher>,
    pub inbound: mpsc::UnboundedReceiver<BroadcastFrame>,
}

#[async_trait]
pub trait BroadcastService: Send + Sync {
    async fn open(&self, topic: &str) -> Result<TopicSubscription, ChannelError>;
}

#[derive(Default)]
struct Hub {
    next_id: u64,
    topics: HashMap<String, Vec<(u64, mpsc::UnboundedSender<BroadcastFrame>)>>,
    paused: bool,
    held: Vec<(String, u64, BroadcastFrame)>,
    history: HashMap<String, VecDeque<BroadcastFrame>>,
    fail_next_open: bool,
}

impl Hub {
    fn deliver(&mut self, topic: &str, from: u64, frame: BroadcastFrame) {
        let Some(subscribers) = self.topics.get_mut(topic) else {
            return;
        };
        subscribers.retain(|(_, tx)| !tx.is_closed());
        for (id, tx) in subscribers.iter() {
            if *id != from {
                let _ = tx.send(frame.clone());
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct InMemoryBroadcast {
    hub: Arc<Mutex<Hub>>,
}

fn lock(hub: &Mutex<Hub>) -> Result<MutexGuard<'_, Hub>, ChannelError> {
    hub.lock()
        .map_err(|_| ChannelError::Publish("broadcast hub poisoned".into()))
}

impl InMemoryBroadcast {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        lock(&self.hub)
            .map(|hub| {
                hub.topics
                    .get(topic)
                    .map(|subs| subs.iter().filter(|(_, tx)| !tx.is_closed()).count())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    /// Придерживает все публикации до `resume`
    pub fn pause(&self) {
        if let Ok(mut hub) = lock(&self.hub) {
            hub.paused = true;
        }
    }

    /// Доставляет придержанные кадры текущим подписчикам в порядке публикации
    pub fn resume(&self) {
        if let Ok(mut hub) = lock(&self.hub) {
            hub.paused = false;
            let held = std::mem::take(&mut hub.held);
            debug!(count = held.len(), "releasing held frames");
            for (topic, from, frame) in held {
                hub.deliver(&topic, from, frame);
            }
        }
    }

    /// Следующий `open` вернёт ошибку подписки
    pub fn fail_next_open(&self) {
        if let Ok(mut hub) = lock(&self.hub) {
            hub.fail_next_open = true;
        }
    }

    /// Последние `HISTORY_LIMIT` кадров топика, включая придержанные
    pub fn history(&self, topic: &str) -> Vec<BroadcastFrame> {
        lock(&self.hub)
            .map(|hub| {
                hub.history
                    .get(topic)
                    .map(|frames| frames.iter().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl BroadcastService for InMemoryBroadcast {
    async fn open(&self, topic: &str) -> Result<TopicSubscription, ChannelError> {
        let mut hub = lock(&self.hub)?;
        if std::mem::take(&mut hub.fail_next_open) {
            return Err(ChannelError::Subscribe(format!("subscription to {topic} refused")));
        }

        hub.next_id += 1;
        let id = hub.next_id;
        let (tx, rx) = mpsc::unbounded_channel();
        hub.topics.entry(topic.to_string()).or_default().push((id, tx));
        debug!(topic, subscriber = id, "topic subscription opened");

        Ok(TopicSubscription {
            publisher: Arc::new(MemoryPublisher {
                hub: self.hub.clone(),
                topic: topic.to_string(),
                id,
            }),
            inbound: rx,
        })
    }
}

struct MemoryPublisher {
    hub: Arc<Mutex<Hub>>,
    topic: String,
    id: u64,
}

impl MemoryPublisher {
    fn is_subscribed(hub: &Hub, topic: &str, id: u64) -> bool {
        hub.topics
            .get(topic)
            .is_some_and(|subs| subs.iter().any(|(sub, _)| *sub == id))
    }
}

#[async_trait]
impl TopicPublisher for MemoryPublisher {
    async fn publish(&self, frame: BroadcastFrame) -> Result<(), ChannelError> {
        let mut hub = lock(&self.hub)?;
        if !Self::is_subscribed(&hub, &self.topic, self.id) {
            return Err(ChannelError::Closed);
        }

        trace!(topic = %self.topic, event = %frame.event, "publish");
        let history = hub.history.entry(self.topic.clone()).or_default();
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(frame.clone());

        if hub.paused {
            hub.held.push((self.topic.clone(), self.id, frame));
        } else {
            hub.deliver(&self.topic, self.id, frame);
        }
        Ok(())
    }

    async fn close(&self) {
        if let Ok(mut hub) = lock(&self.hub) {
            if let Some(subs) = hub.topics.get_mut(&self.topic) {
                let before = subs.len();
                subs.retain(|(id, _)| *id != self.id);
                if subs.len() != before {
                    debug!(topic = %self.topic, subscriber = self.id, "topic subscription closed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn frame(event: &str) -> BroadcastFrame {
        BroadcastFrame {
            event: event.into(),
            payload: json!({ "n": event }),
        }
    }

    #[tokio::test]
    async fn publisher_does_not_receive_own_frames() {
        let service = InMemoryBroadcast::new();
        let mut a = service.open("session-1").await.unwrap();
        let mut b = service.open("session-1").await.unwrap();

        a.publisher.publish(frame("ready")).await.unwrap();

        assert_eq!(b.inbound.recv().await.unwrap().event, "ready");
        assert!(a.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn held_frames_reach_late_subscribers_on_resume() {
        let service = InMemoryBroadcast::new();
        let a = service.open("session-1").await.unwrap();
        service.pause();
        a.publisher.publish(frame("offer")).await.unwrap();

        let mut late = service.open("session-1").await.unwrap();
        assert!(late.inbound.try_recv().is_err());

        service.resume();
        assert_eq!(late.inbound.recv().await.unwrap().event, "offer");
    }

    #[tokio::test]
    async fn close_releases_the_subscription_slot() {
        let service = InMemoryBroadcast::new();
        let a = service.open("session-1").await.unwrap();
        assert_eq!(service.subscriber_count("session-1"), 1);

        a.publisher.close().await;
        a.publisher.close().await;
        assert_eq!(service.subscriber_count("session-1"), 0);
        assert_eq!(
            a.publisher.publish(frame("ready")).await,
            Err(ChannelError::Closed)
        );
    }

    #[tokio::test]
    async fn history_keeps_only_recent_frames() {
        let service = InMemoryBroadcast::new();
        let a = service.open("session-1").await.unwrap();
        for n in 0..HISTORY_LIMIT + 5 {
            a.publisher.publish(frame(&format!("f{n}"))).await.unwrap();
        }

        let history = service.history("session-1");
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history[0].event, "f5");
        assert_eq!(
            history[HISTORY_LIMIT - 1].event,
            format!("f{}", HISTORY_LIMIT + 4)
        );
    }

    #[tokio::test]
    async fn injected_open_failure_is_one_shot() {
        let service = InMemoryBroadcast::new();
        service.fail_next_open();
        assert!(matches!(
            service.open("t").await,
            Err(ChannelError::Subscribe(_))
        ));
        assert!(service.open("t").await.is_ok());
    }
}
