//! Admission of signed update requests
//!
//! An update arrives as an HTTP body, URL-encoded form or JSON, carrying
//! the fields `name`, `value`, `type`, `ttl`, `timestamp` and the
//! signature field `identify`. Admission runs a fixed sequence of gates -
//! body decoding, allow-list, replay, signature - and only a request that
//! clears all of them reaches the record store. This is the sole write
//! path into the store.

use std::collections::BTreeMap;

use chrono::Local;
use derive_more::Display;
use serde_json::Value;

use crate::dns::context::ServerContext;
use crate::dns::protocol::QueryType;
use crate::dns::signer;
use crate::dns::store::{DdnsRecord, RecordData, StoreError};

#[derive(Debug, Display)]
pub enum UpdateError {
    #[display(fmt = "request body is not a well-formed update")]
    MalformedBody,
    #[display(fmt = "name is not in the allow-list")]
    NotAllowed,
    #[display(fmt = "update timestamp is not newer than the stored record")]
    Stale,
    #[display(fmt = "signature mismatch")]
    BadSignature,
    Store(StoreError),
}

impl std::error::Error for UpdateError {}

type Result<T> = std::result::Result<T, UpdateError>;

/// A decoded update request
///
/// `signed_fields` keeps every field as it arrived on the wire (minus
/// `identify`), since the signature covers the raw field set rather than
/// the parsed values.
pub struct UpdateRequest {
    pub name: String,
    pub data: RecordData,
    pub ttl: u32,
    pub timestamp: u64,
    identify: String,
    signed_fields: BTreeMap<String, String>,
}

impl UpdateRequest {
    /// Decode a request body, trying URL-encoded form fields first and
    /// falling back to a JSON object, like the reporting client produces.
    pub fn from_body(body: &[u8]) -> Result<UpdateRequest> {
        let mut fields = parse_form(body);
        if fields.is_empty() {
            fields = parse_json(body)?;
        }

        UpdateRequest::from_fields(fields)
    }

    fn from_fields(mut fields: BTreeMap<String, String>) -> Result<UpdateRequest> {
        let identify = fields.remove("identify").ok_or(UpdateError::MalformedBody)?;

        let name = required(&fields, "name")?;
        let value = required(&fields, "value")?;
        let qtype = match required(&fields, "type")?.as_str() {
            "A" => QueryType::A,
            "AAAA" => QueryType::Aaaa,
            _ => return Err(UpdateError::MalformedBody),
        };
        let ttl = required(&fields, "ttl")?
            .parse()
            .map_err(|_| UpdateError::MalformedBody)?;
        let timestamp = required(&fields, "timestamp")?
            .parse()
            .map_err(|_| UpdateError::MalformedBody)?;

        // validate the address text against the declared type up front, so
        // the responder can never fail to encode a stored record
        let data = RecordData::parse(qtype, &value).ok_or(UpdateError::MalformedBody)?;

        Ok(UpdateRequest {
            name,
            data,
            ttl,
            timestamp,
            identify,
            signed_fields: fields,
        })
    }
}

fn required(fields: &BTreeMap<String, String>, name: &str) -> Result<String> {
    fields.get(name).cloned().ok_or(UpdateError::MalformedBody)
}

fn parse_form(body: &[u8]) -> BTreeMap<String, String> {
    let raw = match std::str::from_utf8(body) {
        Ok(x) => x,
        Err(_) => return BTreeMap::new(),
    };

    let mut fields = BTreeMap::new();
    for pair in raw.split('&') {
        let mut parts = pair.splitn(2, '=');
        if let (Some(key), Some(value)) = (parts.next(), parts.next()) {
            if let (Some(key), Some(value)) = (url_decode(key), url_decode(value)) {
                fields.insert(key, value);
            }
        }
    }

    fields
}

fn parse_json(body: &[u8]) -> Result<BTreeMap<String, String>> {
    let value: Value = serde_json::from_slice(body).map_err(|_| UpdateError::MalformedBody)?;
    let object = value.as_object().ok_or(UpdateError::MalformedBody)?;

    let mut fields = BTreeMap::new();
    for (key, value) in object {
        // numbers are admitted by their decimal form so that signing
        // matches what the client computed over its own field values
        let text = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return Err(UpdateError::MalformedBody),
        };
        fields.insert(key.clone(), text);
    }

    Ok(fields)
}

fn url_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());

    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let hi = bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16))?;
                let lo = bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16))?;
                out.push((hi * 16 + lo) as u8);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8(out).ok()
}

/// Validate an incoming update and apply it to the record store.
///
/// Gates run in a fixed order and the first failing gate aborts with its
/// reason, before any mutation. The replay gate is checked up front for
/// its rejection reason and enforced again inside the store's upsert,
/// where it is atomic with the replacement.
pub fn admit(context: &ServerContext, body: &[u8]) -> Result<DdnsRecord> {
    let request = UpdateRequest::from_body(body)?;

    if !context.allowed_names.iter().any(|n| n == &request.name) {
        return Err(UpdateError::NotAllowed);
    }

    if let Some(stored) = context.store.stored_timestamp(&request.name) {
        if request.timestamp <= stored {
            return Err(UpdateError::Stale);
        }
    }

    let expected = signer::sign(&request.signed_fields, &context.secret);
    if expected != request.identify {
        return Err(UpdateError::BadSignature);
    }

    let record = DdnsRecord {
        name: request.name,
        data: request.data,
        ttl: request.ttl,
        update_timestamp: request.timestamp,
        update_time: Local::now(),
    };

    context.store.upsert(record.clone()).map_err(|err| match err {
        StoreError::Stale => UpdateError::Stale,
        other => UpdateError::Store(other),
    })?;

    log::info!(
        "applied update: name `{}` value `{}` type {:?} ttl {} at {}",
        record.name,
        record.data,
        record.data.query_type(),
        record.ttl,
        record.update_time.format("%Y/%m/%d %H:%M:%S")
    );

    Ok(record)
}
