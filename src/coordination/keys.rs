//! Key layout inside the coordination namespace.
//!
//! ```text
//! <prefix>/master                           election key
//! <prefix>/servants/<lease-hex>/<address>   one entry per running servant
//! ```

use crate::coordination::namespace::LeaseId;

pub fn master_key(prefix: &str) -> String {
    format!("{}/master", prefix)
}

pub fn servants_key(prefix: &str) -> String {
    format!("{}/servants", prefix)
}

pub fn servant_entry_key(prefix: &str, lease: LeaseId, address: &str) -> String {
    format!("{}/{:x}/{}", servants_key(prefix), lease, address)
}

/// Trailing path segment of a registration key, i.e. the servant address.
pub fn servant_address_from_key(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}
