use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::broadcast::{BroadcastFrame, BroadcastService, TopicPublisher};
use crate::error::ChannelError;
use crate::model::{ParticipantId, SessionId};
use crate::peer::types::{IceCandidate, SessionDescription};

/// Полезная нагрузка сигнального сообщения
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Signal {
    Offer { description: SessionDescription },
    Answer { description: SessionDescription },
    IceCandidate { candidate: IceCandidate },
    Ready,
}

impl Signal {
    /// Имя события в канале
    pub fn event(&self) -> &'static str {
        match self {
            Signal::Offer { .. } => "offer",
            Signal::Answer { .. } => "answer",
            Signal::IceCandidate { .. } => "ice-candidate",
            Signal::Ready => "ready",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignalingMessage {
    pub from: ParticipantId,
    #[serde(flatten)]
    pub signal: Signal,
}

impl SignalingMessage {
    pub fn to_frame(&self) -> Result<BroadcastFrame, ChannelError> {
        let payload =
            serde_json::to_value(self).map_err(|e| ChannelError::Decode(e.to_string()))?;
        Ok(BroadcastFrame {
            event: self.signal.event().to_string(),
            payload,
        })
    }

    pub fn from_frame(frame: &BroadcastFrame) -> Result<Self, ChannelError> {
        let message: SignalingMessage = serde_json::from_value(frame.payload.clone())
            .map_err(|e| ChannelError::Decode(e.to_string()))?;
        if message.signal.event() != frame.event {
            return Err(ChannelError::Decode(format!(
                "event {} carries {} payload",
                frame.event,
                message.signal.event()
            )));
        }
        Ok(message)
    }
}

pub fn topic_for(session: &SessionId) -> String {
    format!("session-{session}")
}

/// Канал сигнализации одной сессии между двумя участниками
pub struct SignalingChannel {
    topic: String,
    me: ParticipantId,
    publisher: Arc<dyn TopicPublisher>,
    inbound: mpsc::UnboundedReceiver<BroadcastFrame>,
}

impl SignalingChannel {
    pub async fn open(
        service: &dyn BroadcastService,
        session: &SessionId,
        me: ParticipantId,
    ) -> Result<Self, ChannelError> {
        let topic = topic_for(session);
        let subscription = service.open(&topic).await?;
        debug!(%topic, participant = %me, "signaling channel opened");
        Ok(Self {
            topic,
            me,
            publisher: subscription.publisher,
            inbound: subscription.inbound,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn split(self) -> (SignalSender, SignalReceiver) {
        (
            SignalSender {
                topic: self.topic,
                me: self.me.clone(),
                publisher: self.publisher,
            },
            SignalReceiver {
                me: self.me,
                inbound: self.inbound,
            },
        )
    }
}

#[derive(Clone)]
pub struct SignalSender {
    topic: String,
    me: ParticipantId,
    publisher: Arc<dyn TopicPublisher>,
}

impl SignalSender {
    pub async fn publish(&self, signal: Signal) -> Result<(), ChannelError> {
        let message = SignalingMessage {
            from: self.me.clone(),
            signal,
        };
        debug!(topic = %self.topic, event = message.signal.event(), "publish signal");
        self.publisher.publish(message.to_frame()?).await
    }

    pub async fn close(&self) {
        self.publisher.close().await;
    }
}

pub struct SignalReceiver {
    me: ParticipantId,
    inbound: mpsc::UnboundedReceiver<BroadcastFrame>,
}

impl SignalReceiver {
    /// Следующее сообщение собеседника. Свои и нечитаемые кадры пропускаются.
    /// `None` после закрытия канала.
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        while let Some(frame) = self.inbound.recv().await {
            match SignalingMessage::from_frame(&frame) {
                Ok(message) if message.from == self.me => {
                    debug!(event = %frame.event, "skipping self-originated signal");
                }
                Ok(message) => return Some(message),
                Err(e) => warn!(event = %frame.event, "dropping malformed signal: {e}"),
            }
        }
        None
    }
}
