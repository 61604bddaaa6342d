use serde::{Deserialize, Serialize};

use crate::error::ClusterError;

/// Recycling policy of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketType {
    /// Consumed once, never recycled.
    #[default]
    Ephemeral,
    /// Recycled back into the live stream while its revision is current.
    Persistent,
}

impl std::fmt::Display for TicketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TicketType::Ephemeral => write!(f, "ephemeral"),
            TicketType::Persistent => write!(f, "persistent"),
        }
    }
}

impl From<TicketType> for i32 {
    fn from(kind: TicketType) -> Self {
        match kind {
            TicketType::Ephemeral => 0,
            TicketType::Persistent => 1,
        }
    }
}

impl TryFrom<i32> for TicketType {
    type Error = ClusterError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TicketType::Ephemeral),
            1 => Ok(TicketType::Persistent),
            other => Err(ClusterError::InvalidTicket(format!(
                "unknown ticket type {}",
                other
            ))),
        }
    }
}

/// A unit of work. The revision is stamped by the queue that accepted it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub id: String,
    pub content: Vec<u8>,
    pub kind: TicketType,
    revision: u64,
}

impl Ticket {
    pub fn new(id: impl Into<String>, kind: TicketType, content: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            kind,
            revision: 0,
        }
    }

    pub fn ephemeral(id: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self::new(id, TicketType::Ephemeral, content)
    }

    pub fn persistent(id: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self::new(id, TicketType::Persistent, content)
    }

    /// Generation stamp assigned by the owning queue; 0 if never queued.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub(crate) fn stamp(&mut self, revision: u64) {
        self.revision = revision;
    }
}

/// Collection of tickets, unique by ID. Order is kept as given so that
/// dispatch policies can preserve what a servant already holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TicketSet {
    tickets: Vec<Ticket>,
}

impl TicketSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set, rejecting duplicate IDs.
    pub fn try_from_tickets(tickets: Vec<Ticket>) -> crate::error::Result<Self> {
        let mut seen = std::collections::HashSet::with_capacity(tickets.len());
        for ticket in &tickets {
            if !seen.insert(ticket.id.as_str()) {
                return Err(ClusterError::InvalidTicket(format!(
                    "duplicate ticket id {}",
                    ticket.id
                )));
            }
        }
        Ok(Self { tickets })
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Ticket> {
        self.tickets.iter()
    }

    pub fn get(&self, id: &str) -> Option<&Ticket> {
        self.tickets.iter().find(|t| t.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn push(&mut self, ticket: Ticket) {
        self.tickets.push(ticket);
    }

    /// Remove a ticket by ID, returning it if present.
    pub fn remove(&mut self, id: &str) -> Option<Ticket> {
        let pos = self.tickets.iter().position(|t| t.id == id)?;
        Some(self.tickets.remove(pos))
    }

    pub fn ids(&self) -> Vec<&str> {
        self.tickets.iter().map(|t| t.id.as_str()).collect()
    }

    /// True iff both sets hold the same multiset of IDs. Content, type and
    /// order are ignored.
    pub fn equals(&self, other: &TicketSet) -> bool {
        if self.len() != other.len() {
            return false;
        }
        let mut left = self.ids();
        let mut right = other.ids();
        left.sort_unstable();
        right.sort_unstable();
        left == right
    }

    /// Short rendering for logs: long IDs are cut to 8 characters plus `...`.
    pub fn summary(&self) -> String {
        let ids: Vec<String> = self
            .tickets
            .iter()
            .map(|t| {
                if t.id.chars().count() > 11 {
                    let head: String = t.id.chars().take(8).collect();
                    format!("{}...", head)
                } else {
                    t.id.clone()
                }
            })
            .collect();
        format!("[{}]", ids.join(","))
    }
}

impl From<Vec<Ticket>> for TicketSet {
    fn from(tickets: Vec<Ticket>) -> Self {
        Self { tickets }
    }
}

impl FromIterator<Ticket> for TicketSet {
    fn from_iter<I: IntoIterator<Item = Ticket>>(iter: I) -> Self {
        Self {
            tickets: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for TicketSet {
    type Item = Ticket;
    type IntoIter = std::vec::IntoIter<Ticket>;

    fn into_iter(self) -> Self::IntoIter {
        self.tickets.into_iter()
    }
}

impl<'a> IntoIterator for &'a TicketSet {
    type Item = &'a Ticket;
    type IntoIter = std::slice::Iter<'a, Ticket>;

    fn into_iter(self) -> Self::IntoIter {
        self.tickets.iter()
    }
}

impl Extend<Ticket> for TicketSet {
    fn extend<I: IntoIterator<Item = Ticket>>(&mut self, iter: I) {
        self.tickets.extend(iter);
    }
}
