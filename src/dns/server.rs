//! UDP and TCP server implementations for DNS

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::net::{Shutdown, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::Builder;
use std::time::Duration;

use derive_more::{Display, Error, From};
use rand::random;

use crate::dns::buffer::{BytePacketBuffer, PacketBuffer, VectorPacketBuffer};
use crate::dns::context::ServerContext;
use crate::dns::protocol::{DnsPacket, QueryType, ResultCode};

/// Maximum DNS message size without EDNS0; bounds both transports.
const MAX_MESSAGE_SIZE: usize = 512;

/// How long a TCP client may sit silent before its connection is dropped.
const TCP_READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Display, From, Error)]
pub enum ServerError {
    Io(std::io::Error),
}

type Result<T> = std::result::Result<T, ServerError>;

macro_rules! return_or_report {
    ( $x:expr, $message:expr ) => {
        match $x {
            Ok(res) => res,
            Err(_) => {
                log::info!($message);
                return;
            }
        }
    };
}

macro_rules! ignore_or_report {
    ( $x:expr, $message:expr ) => {
        match $x {
            Ok(_) => {}
            Err(_) => {
                log::info!($message);
                return;
            }
        };
    };
}

/// Common trait for DNS servers
pub trait DnsServer {
    /// Initialize the server and start listenening
    ///
    /// This method should _NOT_ block. Rather, servers are expected to spawn a new
    /// thread to handle requests and return immediately.
    fn run_server(self) -> Result<()>;
}

/// Build the response skeleton: echo the transaction id and reply flags.
fn build_response_packet(request: &DnsPacket) -> DnsPacket {
    let mut packet = DnsPacket::new();
    packet.header.id = request.header.id;
    packet.header.recursion_desired = request.header.recursion_desired;
    packet.header.authoritative_answer = true;
    packet.header.response = true;
    packet
}

/// Answer a single parsed query from the record store.
///
/// This function always returns a packet once the request parsed, since we
/// still want to send something back to the client. Only the first
/// question is honored; a lookup miss or an unsupported query type yields
/// NXDOMAIN with an empty answer section.
pub fn execute_query(context: &ServerContext, request: &DnsPacket) -> DnsPacket {
    let mut packet = build_response_packet(request);

    let question = match request.questions.first() {
        Some(x) => x,
        None => {
            packet.header.rescode = ResultCode::FORMERR;
            return packet;
        }
    };
    packet.questions.push(question.clone());

    let qname = question.name.trim_end_matches('.');

    let result = match question.qtype {
        QueryType::A | QueryType::Aaaa => context.store.lookup(qname, question.qtype),
        QueryType::Unknown(_) => None,
    };

    match result {
        Some((ttl, data)) => {
            log::info!("result for `{}` is `{}`", qname, data);
            packet.answers.push(data.to_answer(qname, ttl));
        }
        None => {
            log::info!(
                "query name `{}` with type {:?} does not exist",
                qname,
                question.qtype
            );
            packet.header.rescode = ResultCode::NXDOMAIN;
        }
    }

    packet
}

fn log_query(src: &SocketAddr, request: &DnsPacket) {
    if let Some(question) = request.questions.first() {
        log::info!(
            "host `{}` standard query name `{}` with type {:?}",
            src,
            question.name,
            question.qtype
        );
    }
}

/// The UDP server
///
/// Accepts DNS queries through UDP, and answers them from the shared
/// record store. Packets are read on a single thread, and parsed requests
/// are handed over a condvar-signalled queue to a fixed pool of responder
/// threads.
pub struct DnsUdpServer {
    context: Arc<ServerContext>,
    request_queue: Arc<Mutex<VecDeque<(SocketAddr, DnsPacket)>>>,
    request_cond: Arc<Condvar>,
    thread_count: usize,
}

impl DnsUdpServer {
    pub fn new(context: Arc<ServerContext>, thread_count: usize) -> DnsUdpServer {
        DnsUdpServer {
            context,
            request_queue: Arc::new(Mutex::new(VecDeque::new())),
            request_cond: Arc::new(Condvar::new()),
            thread_count,
        }
    }

    /// Process a single DNS request and send the response
    fn process_request(
        socket: &UdpSocket,
        context: &ServerContext,
        src: SocketAddr,
        request: &DnsPacket,
    ) {
        let mut res_buffer = VectorPacketBuffer::new();

        let mut packet = execute_query(context, request);
        ignore_or_report!(
            packet.write(&mut res_buffer, MAX_MESSAGE_SIZE),
            "Failed to write response packet to buffer"
        );

        let len = res_buffer.pos();
        let data = return_or_report!(res_buffer.get_range(0, len), "Failed to get buffer data");
        ignore_or_report!(socket.send_to(data, src), "Failed to send response packet");
    }

    /// Spawn a responder thread draining the request queue
    fn spawn_request_handler(&self, thread_id: usize, socket: UdpSocket) -> std::io::Result<()> {
        let context = self.context.clone();
        let request_cond = self.request_cond.clone();
        let request_queue = self.request_queue.clone();

        let name = format!("DnsUdpServer-request-{}", thread_id);

        Builder::new().name(name).spawn(move || loop {
            let (src, request) = {
                let mut queue = match request_queue.lock() {
                    Ok(x) => x,
                    Err(_) => return,
                };

                loop {
                    if let Some(entry) = queue.pop_front() {
                        break entry;
                    }

                    queue = match request_cond.wait(queue) {
                        Ok(x) => x,
                        Err(_) => return,
                    };
                }
            };

            Self::process_request(&socket, &context, src, &request);
        })?;

        Ok(())
    }

    /// Spawn the main incoming request handler thread
    fn spawn_incoming_handler(self, socket: UdpSocket) -> std::io::Result<()> {
        Builder::new()
            .name("DnsUdpServer-incoming".into())
            .spawn(move || {
                loop {
                    // Read a query packet
                    let mut req_buffer = BytePacketBuffer::new();
                    let (_, src) = match socket.recv_from(&mut req_buffer.buf) {
                        Ok(x) => x,
                        Err(e) => {
                            log::warn!("Failed to read from UDP socket: {:?}", e);
                            continue;
                        }
                    };

                    // Parse it; malformed datagrams are dropped without a
                    // response
                    let request = match DnsPacket::from_buffer(&mut req_buffer) {
                        Ok(x) => x,
                        Err(e) => {
                            log::info!("Failed to parse UDP query packet from {}: {:?}", src, e);
                            continue;
                        }
                    };

                    log_query(&src, &request);
                    self.context
                        .statistics
                        .udp_query_count
                        .fetch_add(1, Ordering::Release);

                    // Add request to queue and notify a waiting thread
                    self.enqueue_request(src, request);
                }
            })?;

        Ok(())
    }

    /// Add a request to the queue and notify waiting threads
    fn enqueue_request(&self, src: SocketAddr, request: DnsPacket) {
        match self.request_queue.lock() {
            Ok(mut queue) => {
                queue.push_back((src, request));
                self.request_cond.notify_one();
            }
            Err(e) => {
                log::warn!("Failed to send UDP request for processing: {}", e);
            }
        }
    }
}

impl DnsServer for DnsUdpServer {
    /// Launch the server
    ///
    /// This method takes ownership of the server, preventing the method from
    /// being called multiple times.
    fn run_server(self) -> Result<()> {
        let socket = UdpSocket::bind((self.context.dns_udp.host.as_str(), self.context.dns_udp.port))?;

        log::info!("DNS UDP server listening on `{}`", self.context.dns_udp);

        // Spawn threads for handling requests
        for thread_id in 0..self.thread_count {
            let socket_clone = match socket.try_clone() {
                Ok(x) => x,
                Err(e) => {
                    log::warn!("Failed to clone socket when starting UDP server: {:?}", e);
                    continue;
                }
            };

            self.spawn_request_handler(thread_id, socket_clone)?;
        }

        // Start servicing incoming requests
        self.spawn_incoming_handler(socket)?;

        Ok(())
    }
}

/// TCP DNS server
///
/// Each accepted connection carries a single query: one bounded read, one
/// response, then the connection is closed. No length prefix is used on
/// either side, matching the client's UDP-style message semantics over the
/// stream.
pub struct DnsTcpServer {
    context: Arc<ServerContext>,
    senders: Vec<Sender<TcpStream>>,
    thread_count: usize,
}

impl DnsTcpServer {
    pub fn new(context: Arc<ServerContext>, thread_count: usize) -> DnsTcpServer {
        DnsTcpServer {
            context,
            senders: Vec::new(),
            thread_count,
        }
    }

    /// Serve a single connection; any failure closes it without a response
    /// and leaves the worker ready for the next one.
    fn handle_connection(context: &ServerContext, mut stream: TcpStream) {
        ignore_or_report!(
            stream.set_read_timeout(Some(TCP_READ_TIMEOUT)),
            "Failed to set read timeout on TCP stream"
        );

        let src = return_or_report!(stream.peer_addr(), "Failed to get TCP peer address");

        let mut req_buffer = BytePacketBuffer::new();
        let bytes_read = return_or_report!(
            stream.read(&mut req_buffer.buf),
            "Failed to read query from TCP stream"
        );
        if bytes_read == 0 {
            return;
        }

        let request = match DnsPacket::from_buffer(&mut req_buffer) {
            Ok(x) => x,
            Err(e) => {
                log::info!("Failed to parse TCP query packet from {}: {:?}", src, e);
                return;
            }
        };

        log_query(&src, &request);
        context
            .statistics
            .tcp_query_count
            .fetch_add(1, Ordering::Release);

        let mut res_buffer = VectorPacketBuffer::new();
        let mut packet = execute_query(context, &request);
        ignore_or_report!(
            packet.write(&mut res_buffer, MAX_MESSAGE_SIZE),
            "Failed to write response packet to buffer"
        );

        let len = res_buffer.pos();
        let data = return_or_report!(res_buffer.get_range(0, len), "Failed to get buffer data");

        ignore_or_report!(stream.write_all(data), "Failed to write response packet");
        ignore_or_report!(stream.shutdown(Shutdown::Both), "Failed to shutdown socket");
    }
}

impl DnsServer for DnsTcpServer {
    fn run_server(mut self) -> Result<()> {
        let socket =
            TcpListener::bind((self.context.dns_tcp.host.as_str(), self.context.dns_tcp.port))?;

        log::info!("DNS TCP server listening on `{}`", self.context.dns_tcp);

        // Spawn threads for handling requests, and create the channels
        for thread_id in 0..self.thread_count {
            let (tx, rx) = channel();
            self.senders.push(tx);

            let context = self.context.clone();

            let name = format!("DnsTcpServer-request-{}", thread_id);
            Builder::new().name(name).spawn(move || loop {
                let stream = match rx.recv() {
                    Ok(x) => x,
                    Err(_) => return,
                };

                Self::handle_connection(&context, stream);
            })?;
        }

        Builder::new()
            .name("DnsTcpServer-incoming".into())
            .spawn(move || {
                for wrap_stream in socket.incoming() {
                    let stream = match wrap_stream {
                        Ok(stream) => stream,
                        Err(err) => {
                            log::warn!("Failed to accept TCP connection: {:?}", err);
                            continue;
                        }
                    };

                    // Hand it off to a worker thread
                    let thread_no = random::<usize>() % self.thread_count;
                    match self.senders[thread_no].send(stream) {
                        Ok(_) => {}
                        Err(e) => {
                            log::warn!(
                                "Failed to send TCP request for processing on thread {}: {}",
                                thread_no,
                                e
                            );
                        }
                    }
                }
            })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use chrono::Local;

    use crate::dns::context::tests::create_test_context;
    use crate::dns::protocol::{DnsQuestion, DnsRecord};
    use crate::dns::store::{current_timestamp, DdnsRecord, RecordData};

    fn build_query(qname: &str, qtype: QueryType) -> DnsPacket {
        let mut query_packet = DnsPacket::new();
        query_packet.header.id = 1337;
        query_packet.header.recursion_desired = true;

        query_packet
            .questions
            .push(DnsQuestion::new(qname.into(), qtype));

        query_packet
    }

    fn seed(context: &ServerContext, name: &str, value: &str, qtype: QueryType, ttl: u32) {
        context
            .store
            .upsert(DdnsRecord {
                name: name.to_string(),
                data: RecordData::parse(qtype, value).unwrap(),
                ttl,
                update_timestamp: current_timestamp(),
                update_time: Local::now(),
            })
            .unwrap();
    }

    #[test]
    fn test_answers_stored_aaaa_record() {
        let context = create_test_context(&["host.example"]);
        seed(&context, "host.example", "2001:db8::1", QueryType::Aaaa, 5);

        let res = execute_query(&context, &build_query("host.example", QueryType::Aaaa));

        assert_eq!(1337, res.header.id);
        assert!(res.header.response);
        assert!(res.header.authoritative_answer);
        assert_eq!(ResultCode::NOERROR, res.header.rescode);
        assert_eq!(1, res.answers.len());

        match res.answers[0] {
            DnsRecord::Aaaa {
                ref domain,
                ref addr,
                ttl,
            } => {
                assert_eq!("host.example", domain);
                assert_eq!("2001:db8::1".parse::<std::net::Ipv6Addr>().unwrap(), *addr);
                assert_eq!(5, ttl);
            }
            _ => panic!(),
        }
    }

    #[test]
    fn test_answers_stored_a_record() {
        let context = create_test_context(&["ipv4.example"]);
        seed(&context, "ipv4.example", "203.0.113.7", QueryType::A, 60);

        let res = execute_query(&context, &build_query("ipv4.example", QueryType::A));

        assert_eq!(1, res.answers.len());
        match res.answers[0] {
            DnsRecord::A { ref addr, ttl, .. } => {
                assert_eq!("203.0.113.7".parse::<std::net::Ipv4Addr>().unwrap(), *addr);
                assert_eq!(60, ttl);
            }
            _ => panic!(),
        }
    }

    #[test]
    fn test_trailing_root_dot_is_stripped() {
        let context = create_test_context(&["host.example"]);
        seed(&context, "host.example", "2001:db8::1", QueryType::Aaaa, 5);

        let res = execute_query(&context, &build_query("host.example.", QueryType::Aaaa));

        assert_eq!(ResultCode::NOERROR, res.header.rescode);
        assert_eq!(1, res.answers.len());
    }

    #[test]
    fn test_unknown_name_yields_nxdomain() {
        let context = create_test_context(&["host.example"]);

        let res = execute_query(&context, &build_query("missing.example", QueryType::Aaaa));

        assert_eq!(ResultCode::NXDOMAIN, res.header.rescode);
        assert_eq!(0, res.answers.len());
        // the response still mirrors the question and transaction id
        assert_eq!(1337, res.header.id);
        assert_eq!(1, res.questions.len());
    }

    #[test]
    fn test_type_mismatch_yields_nxdomain() {
        let context = create_test_context(&["host.example"]);
        seed(&context, "host.example", "2001:db8::1", QueryType::Aaaa, 5);

        let res = execute_query(&context, &build_query("host.example", QueryType::A));

        assert_eq!(ResultCode::NXDOMAIN, res.header.rescode);
        assert_eq!(0, res.answers.len());
    }

    #[test]
    fn test_unsupported_query_type_yields_nxdomain() {
        let context = create_test_context(&["host.example"]);
        seed(&context, "host.example", "2001:db8::1", QueryType::Aaaa, 5);

        // TXT is type 16
        let res = execute_query(
            &context,
            &build_query("host.example", QueryType::Unknown(16)),
        );

        assert_eq!(ResultCode::NXDOMAIN, res.header.rescode);
        assert_eq!(0, res.answers.len());
    }

    #[test]
    fn test_query_without_question_yields_formerr() {
        let context = create_test_context(&["host.example"]);

        let res = execute_query(&context, &DnsPacket::new());

        assert_eq!(ResultCode::FORMERR, res.header.rescode);
        assert_eq!(0, res.answers.len());
    }

    #[test]
    fn test_only_first_question_is_honored() {
        let context = create_test_context(&["host.example", "other.example"]);
        seed(&context, "host.example", "2001:db8::1", QueryType::Aaaa, 5);
        seed(&context, "other.example", "2001:db8::2", QueryType::Aaaa, 5);

        let mut query = build_query("host.example", QueryType::Aaaa);
        query
            .questions
            .push(DnsQuestion::new("other.example".into(), QueryType::Aaaa));

        let res = execute_query(&context, &query);

        assert_eq!(1, res.questions.len());
        assert_eq!("host.example", res.questions[0].name);
        assert_eq!(1, res.answers.len());
    }

    #[test]
    fn test_expired_record_yields_nxdomain() {
        let context = create_test_context(&["host.example"]);

        // aged record: the lookup-driven flush removes it before scanning
        context
            .store
            .upsert(DdnsRecord {
                name: "host.example".to_string(),
                data: RecordData::parse(QueryType::Aaaa, "2001:db8::1").unwrap(),
                ttl: 1,
                update_timestamp: current_timestamp() - 10,
                update_time: Local::now(),
            })
            .unwrap();

        let res = execute_query(&context, &build_query("host.example", QueryType::Aaaa));

        assert_eq!(ResultCode::NXDOMAIN, res.header.rescode);
        assert!(context.store.is_empty());
    }
}
