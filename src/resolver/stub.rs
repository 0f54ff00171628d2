//! The stub backend: a hand-driven UDP DNS client.
//!
//! All in-flight queries share one socket connected to the configured name
//! server. Replies are matched back to queries by DNS message id; queries
//! that stay unanswered past their deadline are retransmitted a bounded
//! number of times and then failed.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

use super::{Answer, Command};
use crate::config::ProxyConfig;

const QUERY_TIMEOUT: Duration = Duration::from_secs(4);
const QUERY_RETRIES: u8 = 2;
const MAX_DATAGRAM: usize = 4096;

/// One in-flight query, keyed by its DNS message id.
struct Pending {
    id: u64,
    host: Box<str>,
    tx: oneshot::Sender<Answer>,
    wire: Vec<u8>,
    deadline: Instant,
    retries_left: u8,
}

pub(super) struct Stub {
    socket: UdpSocket,
    pending: HashMap<u16, Pending>,
    next_query_id: u16,
}

impl Stub {
    pub(super) async fn bind(config: &ProxyConfig) -> crate::Result<Stub> {
        let name_server = config
            .name_server
            .ok_or_else(|| crate::Error::new_config("stub backend requires name_server"))?;
        let local = config
            .outbound_dns
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        let socket = UdpSocket::bind(local)
            .await
            .map_err(crate::Error::new_listen)?;
        socket
            .connect(name_server)
            .await
            .map_err(crate::Error::new_listen)?;
        debug!("stub resolver querying {}", name_server);
        Ok(Stub {
            socket,
            pending: HashMap::new(),
            next_query_id: 1,
        })
    }

    pub(super) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let deadline = self.pending.values().map(|p| p.deadline).min();
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(Command::Submit { id, host, tx }) => self.submit(id, host, tx).await,
                    Some(Command::Cancel { id }) => self.cancel(id),
                    None => break,
                },
                received = self.socket.recv(&mut buf) => {
                    match received {
                        Ok(n) => self.handle_datagram(&buf[..n]),
                        Err(err) => warn!("resolver receive error: {}", err),
                    }
                    // drain every reply already queued before sleeping again
                    loop {
                        match self.socket.try_recv(&mut buf) {
                            Ok(n) => self.handle_datagram(&buf[..n]),
                            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                            Err(err) => {
                                warn!("resolver receive error: {}", err);
                                break;
                            }
                        }
                    }
                },
                _ = sleep_until_next(deadline) => self.expire(Instant::now()).await,
            }
        }
    }

    async fn submit(&mut self, id: u64, host: Box<str>, tx: oneshot::Sender<Answer>) {
        let name = match Name::from_utf8(&host) {
            Ok(name) => name,
            Err(err) => {
                let _ = tx.send(Err(crate::Error::new_resolve(err)));
                return;
            }
        };
        let query_id = self.allocate_query_id();
        let mut message = Message::new();
        message
            .set_id(query_id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(name, RecordType::A));
        let wire = match message.to_vec() {
            Ok(wire) => wire,
            Err(err) => {
                let _ = tx.send(Err(crate::Error::new_resolve(err)));
                return;
            }
        };
        if let Err(err) = self.socket.send(&wire).await {
            let _ = tx.send(Err(crate::Error::new_resolve(err)));
            return;
        }
        trace!(id, query_id, host = &*host, "query sent");
        self.pending.insert(
            query_id,
            Pending {
                id,
                host,
                tx,
                wire,
                deadline: Instant::now() + QUERY_TIMEOUT,
                retries_left: QUERY_RETRIES,
            },
        );
    }

    fn cancel(&mut self, id: u64) {
        let query_id = self
            .pending
            .iter()
            .find(|(_, p)| p.id == id)
            .map(|(query_id, _)| *query_id);
        if let Some(query_id) = query_id {
            if let Some(pending) = self.pending.remove(&query_id) {
                trace!(id, query_id, "lookup canceled");
                let _ = pending.tx.send(Err(crate::Error::new_canceled()));
            }
        }
    }

    fn handle_datagram(&mut self, datagram: &[u8]) {
        let message = match Message::from_vec(datagram) {
            Ok(message) => message,
            Err(err) => {
                debug!("undecodable datagram: {}", err);
                return;
            }
        };
        let query_id = message.id();
        let pending = match self.pending.remove(&query_id) {
            Some(pending) => pending,
            // a late reply to a retransmitted or canceled query
            None => {
                trace!(query_id, "reply without a pending query");
                return;
            }
        };
        let answer = normalize(&message);
        trace!(id = pending.id, host = &*pending.host, "lookup completed");
        let _ = pending.tx.send(answer);
    }

    async fn expire(&mut self, now: Instant) {
        let expired: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(query_id, _)| *query_id)
            .collect();
        for query_id in expired {
            let mut pending = match self.pending.remove(&query_id) {
                Some(pending) => pending,
                None => continue,
            };
            if pending.retries_left > 0 {
                pending.retries_left -= 1;
                pending.deadline = now + QUERY_TIMEOUT;
                trace!(id = pending.id, query_id, "retransmitting query");
                match self.socket.send(&pending.wire).await {
                    Ok(_) => {
                        self.pending.insert(query_id, pending);
                    }
                    Err(err) => {
                        let _ = pending.tx.send(Err(crate::Error::new_resolve(err)));
                    }
                }
            } else {
                debug!(id = pending.id, host = &*pending.host, "query timed out");
                let _ = pending.tx.send(Err(crate::Error::new_resolve(io::Error::from(
                    io::ErrorKind::TimedOut,
                ))));
            }
        }
    }

    fn allocate_query_id(&mut self) -> u16 {
        loop {
            let id = self.next_query_id;
            self.next_query_id = self.next_query_id.wrapping_add(1);
            if id != 0 && !self.pending.contains_key(&id) {
                return id;
            }
        }
    }
}

fn normalize(message: &Message) -> Answer {
    match message.response_code() {
        ResponseCode::NoError => {
            let addrs: Vec<Ipv4Addr> = message
                .answers()
                .iter()
                .filter_map(|record| match record.data() {
                    Some(RData::A(a)) => Some(a.0),
                    _ => None,
                })
                .collect();
            if addrs.is_empty() {
                Err(crate::Error::new_resolve_empty())
            } else {
                Ok(addrs)
            }
        }
        code => Err(crate::Error::new_resolve(format!("server answered {}", code))),
    }
}

async fn sleep_until_next(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
