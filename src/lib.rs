//! Beacon DDNS Server
//!
//! A lightweight dynamic DNS server. An authenticated client periodically
//! reports its current IPv4/IPv6 address over a small HTTP API; the server
//! keeps the mapping in memory and answers standard DNS queries for it over
//! UDP and TCP.
//!
//! # Architecture
//!
//! The server is divided into two main modules:
//! * `dns` - record store, update admission and the DNS responder
//! * `web` - the HTTP update API

/// DNS server implementation, record store and update admission
pub mod dns;

/// HTTP update API
pub mod web;
