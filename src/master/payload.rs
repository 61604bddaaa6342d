use serde::Serialize;

use crate::tickets::TicketSet;

/// What one servant holds (or should hold).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServantPayload {
    /// Network address of the servant, `host:port`.
    pub servant_id: String,
    pub tickets: TicketSet,
    /// Freeform status blob reported by the servant, if any.
    pub system_stats: Option<Vec<u8>>,
}

impl ServantPayload {
    pub fn new(servant_id: impl Into<String>, tickets: TicketSet) -> Self {
        Self {
            servant_id: servant_id.into(),
            tickets,
            system_stats: None,
        }
    }

    pub fn with_stats(mut self, stats: Option<Vec<u8>>) -> Self {
        self.system_stats = stats;
        self
    }
}

/// Assignment observed at the start of a dispatch cycle, one payload per
/// discovered servant in discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CurrentDispatch {
    pub servant_payloads: Vec<ServantPayload>,
}

impl CurrentDispatch {
    pub fn new(servant_payloads: Vec<ServantPayload>) -> Self {
        Self { servant_payloads }
    }

    pub fn servant_count(&self) -> usize {
        self.servant_payloads.len()
    }

    pub fn get(&self, servant_id: &str) -> Option<&ServantPayload> {
        self.servant_payloads
            .iter()
            .find(|p| p.servant_id == servant_id)
    }
}

/// Desired assignment produced by a dispatch policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewDispatch {
    /// Push every servant even if its set did not change.
    pub force_flush: bool,
    pub servant_payloads: Vec<ServantPayload>,
}

impl NewDispatch {
    pub fn new(servant_payloads: Vec<ServantPayload>) -> Self {
        Self {
            force_flush: false,
            servant_payloads,
        }
    }

    pub fn forced(servant_payloads: Vec<ServantPayload>) -> Self {
        Self {
            force_flush: true,
            servant_payloads,
        }
    }

    pub fn get(&self, servant_id: &str) -> Option<&ServantPayload> {
        self.servant_payloads
            .iter()
            .find(|p| p.servant_id == servant_id)
    }
}

/// Serializable per-servant view used in reports.
#[derive(Debug, Clone, Serialize)]
pub struct PayloadSummary {
    pub servant_id: String,
    pub ticket_count: usize,
    pub ticket_ids: Vec<String>,
}

impl From<&ServantPayload> for PayloadSummary {
    fn from(payload: &ServantPayload) -> Self {
        Self {
            servant_id: payload.servant_id.clone(),
            ticket_count: payload.tickets.len(),
            ticket_ids: payload.tickets.ids().into_iter().map(String::from).collect(),
        }
    }
}
