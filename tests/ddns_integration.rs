//! Integration tests for the Beacon DDNS server
//!
//! These drive the full path an update and a query take - admission into
//! the record store, then a wire-format DNS query answered from it -
//! without binding sockets.

use std::collections::BTreeMap;
use std::sync::Arc;

use beacon::dns::buffer::{BytePacketBuffer, PacketBuffer, VectorPacketBuffer};
use beacon::dns::context::{ServerConfig, ServerContext};
use beacon::dns::protocol::{DnsPacket, DnsQuestion, DnsRecord, QueryType, ResultCode};
use beacon::dns::server::execute_query;
use beacon::dns::signer;
use beacon::dns::store::current_timestamp;
use beacon::dns::update;

fn test_context() -> Arc<ServerContext> {
    let raw = r#"
secret: "s3cr3t"
addresses:
  - "host.example"
  - "ipv4.example"
listening:
  http_api: { host: "127.0.0.1", port: 8080 }
  dns:
    udp: { host: "127.0.0.1", port: 2053 }
    tcp: { host: "127.0.0.1", port: 2053 }
record:
  expire_time_seconds: 86400
  poll_period_seconds: 0
"#;

    let config: ServerConfig = serde_yaml::from_str(raw).expect("config should parse");
    Arc::new(ServerContext::from_config(config))
}

fn signed_body(fields: &[(&str, &str)], secret: &str) -> Vec<u8> {
    let map: BTreeMap<String, String> = fields
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let identify = signer::sign(&map, secret);

    let mut object = serde_json::Map::new();
    for (key, value) in map {
        object.insert(key, serde_json::Value::String(value));
    }
    object.insert("identify".to_string(), serde_json::Value::String(identify));

    serde_json::to_vec(&serde_json::Value::Object(object)).unwrap()
}

/// Round-trip a query through the wire format, the way a transport
/// listener would: serialize the request, parse it back, execute it, and
/// parse the serialized response.
fn query_over_wire(context: &ServerContext, qname: &str, qtype: QueryType) -> DnsPacket {
    let mut query = DnsPacket::new();
    query.header.id = 0xBEEF;
    query.questions.push(DnsQuestion::new(qname.into(), qtype));

    let mut wire = VectorPacketBuffer::new();
    query.write(&mut wire, 512).unwrap();

    let mut req_buffer = BytePacketBuffer::new();
    let raw = wire.get_range(0, wire.pos()).unwrap();
    req_buffer.buf[..raw.len()].copy_from_slice(raw);

    let request = DnsPacket::from_buffer(&mut req_buffer).unwrap();
    let mut response = execute_query(context, &request);

    let mut res_wire = VectorPacketBuffer::new();
    response.write(&mut res_wire, 512).unwrap();
    res_wire.seek(0).unwrap();

    DnsPacket::from_buffer(&mut res_wire).unwrap()
}

#[test]
fn test_update_then_query() {
    let context = test_context();
    let now = current_timestamp().to_string();

    let body = signed_body(
        &[
            ("name", "host.example"),
            ("value", "2001:db8::1"),
            ("type", "AAAA"),
            ("ttl", "5"),
            ("timestamp", &now),
        ],
        "s3cr3t",
    );
    update::admit(&context, &body).expect("update should be admitted");

    let response = query_over_wire(&context, "host.example", QueryType::Aaaa);

    assert_eq!(0xBEEF, response.header.id);
    assert!(response.header.response);
    assert_eq!(ResultCode::NOERROR, response.header.rescode);
    assert_eq!(1, response.answers.len());
    assert_eq!(QueryType::Aaaa, response.answers[0].get_querytype());

    match response.answers[0] {
        DnsRecord::Aaaa {
            ref domain,
            ref addr,
            ttl,
        } => {
            assert_eq!("host.example", domain);
            assert_eq!("2001:db8::1".parse::<std::net::Ipv6Addr>().unwrap(), *addr);
            assert_eq!(5, ttl);
        }
        _ => panic!("expected an AAAA answer"),
    }
}

#[test]
fn test_update_replaces_previous_address() {
    let context = test_context();
    let now = current_timestamp();

    let first = signed_body(
        &[
            ("name", "ipv4.example"),
            ("value", "203.0.113.7"),
            ("type", "A"),
            ("ttl", "60"),
            ("timestamp", &now.to_string()),
        ],
        "s3cr3t",
    );
    update::admit(&context, &first).unwrap();

    let second = signed_body(
        &[
            ("name", "ipv4.example"),
            ("value", "203.0.113.8"),
            ("type", "A"),
            ("ttl", "60"),
            ("timestamp", &(now + 1).to_string()),
        ],
        "s3cr3t",
    );
    update::admit(&context, &second).unwrap();

    let response = query_over_wire(&context, "ipv4.example", QueryType::A);
    assert_eq!(1, response.answers.len());

    match response.answers[0] {
        DnsRecord::A { ref addr, .. } => {
            assert_eq!("203.0.113.8".parse::<std::net::Ipv4Addr>().unwrap(), *addr);
        }
        _ => panic!("expected an A answer"),
    }
}

#[test]
fn test_replayed_update_leaves_store_unchanged() {
    let context = test_context();
    let now = current_timestamp();

    let first = signed_body(
        &[
            ("name", "host.example"),
            ("value", "2001:db8::1"),
            ("type", "AAAA"),
            ("ttl", "5"),
            ("timestamp", &now.to_string()),
        ],
        "s3cr3t",
    );
    update::admit(&context, &first).unwrap();

    let replay = signed_body(
        &[
            ("name", "host.example"),
            ("value", "2001:db8::bad"),
            ("type", "AAAA"),
            ("ttl", "5"),
            ("timestamp", &(now - 1).to_string()),
        ],
        "s3cr3t",
    );
    assert!(update::admit(&context, &replay).is_err());

    let response = query_over_wire(&context, "host.example", QueryType::Aaaa);
    match response.answers[0] {
        DnsRecord::Aaaa { ref addr, .. } => {
            assert_eq!("2001:db8::1".parse::<std::net::Ipv6Addr>().unwrap(), *addr);
        }
        _ => panic!("expected an AAAA answer"),
    }
}

#[test]
fn test_unknown_name_gets_nxdomain_on_the_wire() {
    let context = test_context();

    let response = query_over_wire(&context, "missing.example", QueryType::Aaaa);

    assert_eq!(0xBEEF, response.header.id);
    assert_eq!(ResultCode::NXDOMAIN, response.header.rescode);
    assert_eq!(0, response.answers.len());
    assert_eq!(1, response.questions.len());
}

#[test]
fn test_disallowed_update_is_never_served() {
    let context = test_context();
    let now = current_timestamp().to_string();

    // valid signature, but the name is not allow-listed
    let body = signed_body(
        &[
            ("name", "evil.example"),
            ("value", "2001:db8::666"),
            ("type", "AAAA"),
            ("ttl", "5"),
            ("timestamp", &now),
        ],
        "s3cr3t",
    );
    assert!(update::admit(&context, &body).is_err());

    let response = query_over_wire(&context, "evil.example", QueryType::Aaaa);
    assert_eq!(ResultCode::NXDOMAIN, response.header.rescode);
}
