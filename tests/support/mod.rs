#![allow(dead_code)]

//! Shared helpers for the integration tests: a single-threaded runtime
//! harness, a mock UDP name server, and small socket utilities.

use std::collections::HashMap;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::LocalSet;

use spliced::{ProxyConfig, ResolverBackend};

/// Runs `fut` on a fresh current-thread runtime inside a `LocalSet`, the
/// same way the daemon runs.
pub fn run_local<F: Future>(fut: F) -> F::Output {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let local = LocalSet::new();
    local.block_on(&runtime, fut)
}

/// How the mock name server treats queries.
pub enum DnsMode {
    /// Answer from the record map; unknown names get NXDOMAIN.
    Answer,
    /// Swallow every query. Lookups only finish by timing out.
    Silent,
}

/// Spawns a mock name server on the local reactor and returns its address.
pub async fn spawn_dns(records: HashMap<String, Vec<Ipv4Addr>>, mode: DnsMode) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::task::spawn_local(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let (n, peer) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(_) => return,
            };
            if let DnsMode::Silent = mode {
                continue;
            }
            let query = match Message::from_vec(&buf[..n]) {
                Ok(query) => query,
                Err(_) => continue,
            };
            let question = match query.queries().first() {
                Some(question) => question.clone(),
                None => continue,
            };
            let mut response = Message::new();
            response
                .set_id(query.id())
                .set_message_type(MessageType::Response)
                .set_recursion_desired(true)
                .set_recursion_available(true)
                .add_query(question.clone());
            let key = question.name().to_utf8();
            match records.get(key.trim_end_matches('.')) {
                Some(addrs) => {
                    for &ip in addrs {
                        response.add_answer(Record::from_rdata(
                            question.name().clone(),
                            60,
                            RData::A(A(ip)),
                        ));
                    }
                }
                None => {
                    response.set_response_code(ResponseCode::NXDomain);
                }
            }
            let wire = response.to_vec().unwrap();
            let _ = socket.send_to(&wire, peer).await;
        }
    });
    addr
}

/// A proxy configuration pointing at the given stub name server, with one
/// ephemeral listener and test-friendly timeouts.
pub fn stub_config(name_server: SocketAddr) -> ProxyConfig {
    ProxyConfig {
        listen: vec!["127.0.0.1:0".parse().unwrap()],
        name_server: Some(name_server),
        resolver: ResolverBackend::Stub,
        receive_timeout: std::time::Duration::from_secs(5),
        ..ProxyConfig::default()
    }
}

/// Reads from `stream` until the head terminator, returning everything
/// received so far.
pub async fn read_head(stream: &mut TcpStream) -> Vec<u8> {
    let mut received = Vec::new();
    let mut byte = [0u8; 1];
    while !received.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        if n == 0 {
            break;
        }
        received.push(byte[0]);
    }
    received
}

/// Reads until EOF.
pub async fn read_to_end(stream: &mut TcpStream) -> Vec<u8> {
    let mut received = Vec::new();
    stream.read_to_end(&mut received).await.unwrap();
    received
}
