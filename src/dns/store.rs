//! The DDNS record table
//!
//! This module provides the thread-safe, TTL-aware table of records pushed
//! by clients. Expiry is lazy: every lookup gives the table a chance to
//! drop expired records, throttled so that a busy query path does not scan
//! on every request.
//!
//! # Table structure
//!
//! There is at most one live record per owner name; an accepted update
//! replaces whatever was stored for that name. Alongside the records the
//! table carries the smallest live ttl and the time of the last completed
//! flush, from which the next flush-eligible instant is derived.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Local};
use derive_more::Display;

use crate::dns::protocol::{DnsRecord, QueryType};

#[derive(Debug, Display)]
pub enum StoreError {
    #[display(fmt = "update timestamp is not newer than the stored record")]
    Stale,
    #[display(fmt = "record table lock was poisoned")]
    PoisonedLock,
}

impl std::error::Error for StoreError {}

type Result<T> = std::result::Result<T, StoreError>;

/// Current unix time in seconds.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Address payload of a record
///
/// The variant fixes both the answer type and the RDATA encoding: 4 bytes
/// for A, 16 bytes for AAAA.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
}

impl RecordData {
    /// Parse the textual address of an update against its declared type.
    pub fn parse(qtype: QueryType, value: &str) -> Option<RecordData> {
        match qtype {
            QueryType::A => value.parse().ok().map(RecordData::A),
            QueryType::Aaaa => value.parse().ok().map(RecordData::Aaaa),
            QueryType::Unknown(_) => None,
        }
    }

    pub fn query_type(&self) -> QueryType {
        match *self {
            RecordData::A(_) => QueryType::A,
            RecordData::Aaaa(_) => QueryType::Aaaa,
        }
    }

    /// Build the answer resource record served for this payload.
    pub fn to_answer(&self, domain: &str, ttl: u32) -> DnsRecord {
        match *self {
            RecordData::A(addr) => DnsRecord::A {
                domain: domain.to_string(),
                addr,
                ttl,
            },
            RecordData::Aaaa(addr) => DnsRecord::Aaaa {
                domain: domain.to_string(),
                addr,
                ttl,
            },
        }
    }
}

impl fmt::Display for RecordData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            RecordData::A(addr) => write!(f, "{}", addr),
            RecordData::Aaaa(addr) => write!(f, "{}", addr),
        }
    }
}

/// A single live DDNS record
#[derive(Clone, Debug)]
pub struct DdnsRecord {
    /// Owner name, without trailing root dot
    pub name: String,
    pub data: RecordData,
    /// Client-supplied ttl, served verbatim in answers
    pub ttl: u32,
    /// Client-supplied unix seconds; replay protection and age computation
    pub update_timestamp: u64,
    /// Server-local capture time, informational only
    pub update_time: DateTime<Local>,
}

struct RecordTable {
    records: BTreeMap<String, DdnsRecord>,
    min_ttl: Option<u32>,
    last_flush: Option<u64>,
    next_flush: Option<u64>,
    expire_time: u64,
    poll_period: u64,
}

impl RecordTable {
    fn new(expire_time: u64, poll_period: u64) -> RecordTable {
        RecordTable {
            records: BTreeMap::new(),
            min_ttl: None,
            last_flush: None,
            next_flush: None,
            expire_time,
            poll_period,
        }
    }

    /// Replace the record stored for a name.
    ///
    /// The timestamp of the incoming record must advance strictly past the
    /// stored one; the check and the replacement happen under the same
    /// borrow, so two near-simultaneous updates cannot both pass it.
    fn upsert(&mut self, record: DdnsRecord, now: u64) -> Result<()> {
        if let Some(existing) = self.records.get(&record.name) {
            if record.update_timestamp <= existing.update_timestamp {
                return Err(StoreError::Stale);
            }
        }

        self.records.insert(record.name.clone(), record);

        self.min_ttl = self.records.values().map(|r| r.ttl).min();
        if self.last_flush.is_none() {
            self.last_flush = Some(now);
        }
        self.schedule_next_flush();

        Ok(())
    }

    /// Find the live record matching a name and query type.
    ///
    /// The read path drives expiry: the table is flushed before scanning.
    fn lookup(&mut self, name: &str, qtype: QueryType, now: u64) -> Option<(u32, RecordData)> {
        self.flush(now);

        self.records
            .get(name)
            .filter(|r| r.data.query_type() == qtype)
            .map(|r| (r.ttl, r.data.clone()))
    }

    fn stored_timestamp(&self, name: &str) -> Option<u64> {
        self.records.get(name).map(|r| r.update_timestamp)
    }

    /// Drop expired records if the table is due for a scan.
    ///
    /// A record expires once its age outgrows its own ttl or the global
    /// expiry ceiling. Scans are throttled to at most one per
    /// `min(min_ttl, poll_period)` seconds, bounding the worst case
    /// staleness a query can observe without a timer thread.
    fn flush(&mut self, now: u64) {
        match self.next_flush {
            Some(at) if now >= at => {}
            _ => return,
        }

        let expire_time = self.expire_time;
        self.records.retain(|name, record| {
            let age = now.saturating_sub(record.update_timestamp);
            let live = age <= u64::from(record.ttl) && age <= expire_time;
            if !live {
                log::info!("record for `{}` expired after {}s, removing", name, age);
            }
            live
        });

        self.min_ttl = self.records.values().map(|r| r.ttl).min();
        self.last_flush = Some(now);
        self.schedule_next_flush();
    }

    fn schedule_next_flush(&mut self) {
        self.next_flush = match (self.min_ttl, self.last_flush) {
            (Some(min_ttl), Some(last)) => Some(last + u64::from(min_ttl).min(self.poll_period)),
            _ => None,
        };
    }
}

/// Shared handle to the record table
///
/// Every operation, scans included, takes the one table lock for its full
/// duration, and the lock is never held across network I/O.
pub struct RecordStore {
    table: Mutex<RecordTable>,
}

impl RecordStore {
    pub fn new(expire_time: u64, poll_period: u64) -> RecordStore {
        RecordStore {
            table: Mutex::new(RecordTable::new(expire_time, poll_period)),
        }
    }

    pub fn upsert(&self, record: DdnsRecord) -> Result<()> {
        let mut table = self.table.lock().map_err(|_| StoreError::PoisonedLock)?;

        table.upsert(record, current_timestamp())
    }

    pub fn lookup(&self, name: &str, qtype: QueryType) -> Option<(u32, RecordData)> {
        let mut table = match self.table.lock() {
            Ok(x) => x,
            Err(_) => return None,
        };

        table.lookup(name, qtype, current_timestamp())
    }

    pub fn stored_timestamp(&self, name: &str) -> Option<u64> {
        let table = match self.table.lock() {
            Ok(x) => x,
            Err(_) => return None,
        };

        table.stored_timestamp(name)
    }

    pub fn len(&self) -> usize {
        self.table.lock().map(|t| t.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
