//! Coordination namespace and master election.
//!
//! The rest of the crate only talks to the [`Namespace`] and [`Election`]
//! traits; [`MemoryNamespace`] and [`LeaseElection`] are the bundled
//! implementations used by the binary and the tests.

pub mod election;
pub mod keys;
pub mod namespace;

pub use election::{Election, LeaseElection, Role};
pub use namespace::{
    connect, LeaseId, MemoryNamespace, Namespace, WatchEvent, WatchStream, MEMORY_SCHEME,
};
