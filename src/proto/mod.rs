//! Wire types of the servant RPC surface.
//!
//! ```text
//! service TicketDispatcher {
//!   rpc GetTickets(Empty) returns (TicketsInfo);
//!   rpc SetTickets(TicketsInfo) returns (Empty);
//! }
//! ```

use crate::error::ClusterError;
use crate::tickets::{Ticket, TicketSet, TicketType};

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Empty {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TicketInfo {
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(int32, tag = "2")]
    pub r#type: i32,
    #[prost(bytes = "vec", tag = "3")]
    pub content: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SystemInfo {
    #[prost(bytes = "vec", tag = "1")]
    pub stats: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TicketsInfo {
    #[prost(message, repeated, tag = "1")]
    pub tickets_info: ::prost::alloc::vec::Vec<TicketInfo>,
    #[prost(message, optional, tag = "2")]
    pub sys_info: ::core::option::Option<SystemInfo>,
}

include!(concat!(env!("OUT_DIR"), "/servant_cluster.TicketDispatcher.rs"));

impl From<&Ticket> for TicketInfo {
    fn from(ticket: &Ticket) -> Self {
        Self {
            id: ticket.id.clone(),
            r#type: ticket.kind.into(),
            content: ticket.content.clone(),
        }
    }
}

impl TryFrom<TicketInfo> for Ticket {
    type Error = ClusterError;

    fn try_from(info: TicketInfo) -> Result<Self, Self::Error> {
        let kind = TicketType::try_from(info.r#type)?;
        Ok(Ticket::new(info.id, kind, info.content))
    }
}

impl TicketsInfo {
    pub fn from_tickets(tickets: &TicketSet) -> Self {
        Self {
            tickets_info: tickets.iter().map(TicketInfo::from).collect(),
            sys_info: None,
        }
    }

    /// Decode into a ticket set, rejecting unknown types and duplicate IDs.
    pub fn to_ticket_set(&self) -> Result<TicketSet, ClusterError> {
        let tickets = self
            .tickets_info
            .iter()
            .cloned()
            .map(Ticket::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        TicketSet::try_from_tickets(tickets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_conversion_keeps_fields() {
        let ticket = Ticket::persistent("t-1", b"payload".to_vec());
        let info = TicketInfo::from(&ticket);
        assert_eq!(info.r#type, 1);

        let back = Ticket::try_from(info).unwrap();
        assert_eq!(back.id, "t-1");
        assert_eq!(back.kind, TicketType::Persistent);
        assert_eq!(back.content, b"payload".to_vec());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let info = TicketsInfo {
            tickets_info: vec![TicketInfo {
                id: "x".to_string(),
                r#type: 9,
                content: Vec::new(),
            }],
            sys_info: None,
        };
        assert!(matches!(
            info.to_ticket_set(),
            Err(ClusterError::InvalidTicket(_))
        ));
    }
}
