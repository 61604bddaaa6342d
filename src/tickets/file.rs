use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::tickets::ticket::{Ticket, TicketSet, TicketType};

/// On-disk form of a ticket: content is kept as text for hand editing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketRecord {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: TicketType,
    #[serde(default)]
    pub content: String,
}

impl From<TicketRecord> for Ticket {
    fn from(record: TicketRecord) -> Self {
        Ticket::new(record.id, record.kind, record.content.into_bytes())
    }
}

impl From<&Ticket> for TicketRecord {
    fn from(ticket: &Ticket) -> Self {
        Self {
            id: ticket.id.clone(),
            kind: ticket.kind,
            content: String::from_utf8_lossy(&ticket.content).into_owned(),
        }
    }
}

/// Parse a JSON array of ticket records.
pub fn parse_tickets(json: &str) -> Result<TicketSet> {
    let records: Vec<TicketRecord> = serde_json::from_str(json)?;
    TicketSet::try_from_tickets(records.into_iter().map(Ticket::from).collect())
}

/// Load tickets from a JSON file.
pub async fn load_ticket_file(path: impl AsRef<Path>) -> Result<TicketSet> {
    let raw = tokio::fs::read_to_string(path.as_ref()).await?;
    parse_tickets(&raw)
}
