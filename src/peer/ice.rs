use std::collections::VecDeque;

use tracing::{info, warn};

use crate::peer::types::IceCandidate;

/// Кандидаты, полученные до установки remote description.
///
/// Порядок поступления сохраняется; очередь сливается целиком один раз,
/// сразу после появления remote description.
#[derive(Debug, Default)]
pub struct PendingCandidates {
    queue: VecDeque<IceCandidate>,
}

impl PendingCandidates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: IceCandidate) {
        self.queue.push_back(candidate);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Забирает все кандидаты в порядке поступления
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.queue.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// Разбивка собранных локальных кандидатов по типам
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateTally {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

impl CandidateTally {
    pub fn record(&mut self, candidate: &str) {
        if candidate.contains("typ host") {
            self.host += 1;
        } else if candidate.contains("typ srflx") {
            self.srflx += 1;
        } else if candidate.contains("typ relay") {
            self.relay += 1;
        }
    }

    pub fn analyze<'a>(candidates: impl IntoIterator<Item = &'a str>) -> Self {
        let mut tally = Self::default();
        for candidate in candidates {
            tally.record(candidate);
        }
        tally
    }

    pub fn log(&self) {
        info!(
            host = self.host,
            srflx = self.srflx,
            relay = self.relay,
            "candidate analysis"
        );
        if self.relay == 0 {
            warn!("no TURN relay candidates found, connection through NAT may fail");
        }
    }
}
