//! DDNS Server Core
//!
//! This module holds the record table and everything that reads or writes
//! it:
//!
//! * `protocol` - DNS protocol definitions and packet handling
//! * `buffer` - low-level packet buffer operations
//! * `signer` - canonical signing of update requests
//! * `store` - the concurrent DDNS record table with lazy TTL expiry
//! * `update` - admission of signed update requests
//! * `server` - UDP and TCP DNS server implementations
//! * `context` - server configuration and shared state

/// Low-level buffer operations for DNS packet handling
pub mod buffer;

/// Server configuration and shared context
pub mod context;

/// DNS protocol definitions and packet structures
pub mod protocol;

/// UDP and TCP DNS server implementations
pub mod server;

/// Canonical signing of update request parameters
pub mod signer;

/// The concurrent DDNS record table
pub mod store;

/// Admission of signed update requests
pub mod update;
