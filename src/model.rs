use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Новый идентификатор на основе UUID v4
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }
    };
}

string_id!(
    /// Стабильный идентификатор участника (выдаётся сервисом идентификации)
    ParticipantId
);
string_id!(
    /// Идентификатор записи звонка
    SessionId
);
string_id!(
    /// Идентификатор заявки на подбор
    RequestId
);

/// Сторона консультации
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Requester,
    Provider,
}

impl Role {
    /// Вежливая сторона уступает при встречных offer (glare)
    pub fn is_polite(self) -> bool {
        matches!(self, Role::Provider)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub id: ParticipantId,
    pub display_name: String,
}

impl Requester {
    pub fn new(id: impl Into<ParticipantId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Запись каталога специалистов в том виде, в каком её отдаёт хранилище
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub id: ParticipantId,
    pub display_name: String,
    pub category: Option<String>,
    pub fee_cents: u64,
    pub available: bool,
}

impl Provider {
    pub fn new(id: impl Into<ParticipantId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            category: None,
            fee_cents: 0,
            available: true,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_fee(mut self, fee_cents: u64) -> Self {
        self.fee_cents = fee_cents;
        self
    }

    /// Пустой фильтр подходит всем
    pub fn matches_category(&self, filter: Option<&str>) -> bool {
        match filter {
            None => true,
            Some(wanted) if wanted.is_empty() => true,
            Some(wanted) => self.category.as_deref() == Some(wanted),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    Searching,
    Matched,
    Expired,
    Cancelled,
}

impl MatchStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, MatchStatus::Searching)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRequest {
    pub id: RequestId,
    pub requester_id: ParticipantId,
    pub requester_name: String,
    pub category: Option<String>,
    pub status: MatchStatus,
    pub offered_to: Option<ParticipantId>,
    /// Кандидаты, отказавшиеся или не ответившие вовремя (в порядке отказа)
    pub rejected: Vec<ParticipantId>,
    pub declined_by: Option<ParticipantId>,
    pub session_id: Option<SessionId>,
    pub created_at: DateTime<Utc>,
}

impl MatchRequest {
    pub fn new(requester: &Requester, category: Option<String>) -> Self {
        Self {
            id: RequestId::generate(),
            requester_id: requester.id.clone(),
            requester_name: requester.display_name.clone(),
            category: category.filter(|c| !c.is_empty()),
            status: MatchStatus::Searching,
            offered_to: None,
            rejected: Vec::new(),
            declined_by: None,
            session_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_searching(&self) -> bool {
        self.status == MatchStatus::Searching
    }

    pub fn is_offered_to(&self, candidate: &ParticipantId) -> bool {
        self.is_searching() && self.offered_to.as_ref() == Some(candidate)
    }

    /// Делает `candidate` единственным адресатом предложения. После терминального статуса ничего не делает.
    pub fn offer_to(&mut self, candidate: &ParticipantId) -> bool {
        if !self.is_searching() || self.rejected.contains(candidate) {
            return false;
        }
        self.offered_to = Some(candidate.clone());
        self.declined_by = None;
        true
    }

    /// Переносит текущего кандидата в список отказавших.
    /// Срабатывает только пока предложение всё ещё у `candidate`.
    pub fn withdraw(&mut self, candidate: &ParticipantId) -> bool {
        if !self.is_offered_to(candidate) {
            return false;
        }
        if !self.rejected.contains(candidate) {
            self.rejected.push(candidate.clone());
        }
        self.offered_to = None;
        self.declined_by = None;
        true
    }

    /// Терминальный переход; false, если заявка уже вышла из `searching`
    pub fn finish(&mut self, status: MatchStatus) -> bool {
        if !self.is_searching() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.offered_to = None;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Pending,
    Accepted,
    PaymentPending,
    PaymentConfirmed,
    InCall,
    Completed,
    Cancelled,
    Rejected,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Cancelled | SessionStatus::Rejected
        )
    }

    pub fn is_callable(self) -> bool {
        matches!(
            self,
            SessionStatus::Accepted | SessionStatus::PaymentConfirmed | SessionStatus::InCall
        )
    }

    /// Сессия, которая ещё занимает специалиста
    pub fn is_active(self) -> bool {
        !self.is_terminal() && self != SessionStatus::Pending
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub requester_id: ParticipantId,
    pub provider_id: ParticipantId,
    pub status: SessionStatus,
    pub fee_cents: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(requester_id: ParticipantId, provider: &Provider, status: SessionStatus) -> Self {
        Self {
            id: SessionId::generate(),
            requester_id,
            provider_id: provider.id.clone(),
            status,
            fee_cents: provider.fee_cents,
            started_at: None,
            ended_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn role_of(&self, participant: &ParticipantId) -> Option<Role> {
        if &self.requester_id == participant {
            Some(Role::Requester)
        } else if &self.provider_id == participant {
            Some(Role::Provider)
        } else {
            None
        }
    }

    pub fn peer_of(&self, participant: &ParticipantId) -> Option<&ParticipantId> {
        match self.role_of(participant)? {
            Role::Requester => Some(&self.provider_id),
            Role::Provider => Some(&self.requester_id),
        }
    }

    /// Меняет статус. Терминальная сессия принимает только свой же статус
    /// (идемпотентно), всё остальное отклоняется.
    pub fn apply(&mut self, next: SessionStatus) -> Result<bool, SessionStatus> {
        if self.status == next {
            return Ok(false);
        }
        if self.status.is_terminal() {
            return Err(self.status);
        }
        self.status = next;
        if next.is_terminal() && self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
        Ok(true)
    }
}

/// Уведомление участнику. Отдельный вариант на каждый источник,
/// получатель декодирует его явно.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    MatchOffer {
        request_id: RequestId,
        requester_id: ParticipantId,
        requester_name: String,
        category: Option<String>,
    },
    SessionRequested {
        session_id: SessionId,
        requester_id: ParticipantId,
        requester_name: String,
    },
}

impl Notification {
    pub fn decode(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}
