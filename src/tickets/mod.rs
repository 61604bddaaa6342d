//! Tickets and the per-servant ticket queue.
//!
//! - [`Ticket`] / [`TicketSet`]: the unit of work and its ID-keyed collection
//! - [`TicketQueue`]: revision-stamped recycling relay feeding local workers
//! - [`load_ticket_file`]: JSON loader for an authoritative ticket list

pub mod file;
pub mod queue;
pub mod ticket;

pub use file::{load_ticket_file, parse_tickets, TicketRecord};
pub use queue::TicketQueue;
pub use ticket::{Ticket, TicketSet, TicketType};
