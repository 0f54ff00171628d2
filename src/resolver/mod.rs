//! Asynchronous hostname resolution.
//!
//! The proxy resolves every request host to a list of IPv4 addresses. Many
//! lookups are in flight at once; each can be canceled while outstanding.
//! Two interchangeable backends exist: a stub client that multiplexes UDP
//! queries to a configured name server over a single socket the proxy owns
//! and drives, and a self-contained validating resolver library that owns
//! its sockets and timers. Both normalize completions into the same answer
//! shape and deliver each answer exactly once.

mod stub;
mod validating;

use std::cell::Cell;
use std::fmt;
use std::net::Ipv4Addr;
use std::rc::Rc;

use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::config::{ProxyConfig, ResolverBackend};
use crate::stats::Counters;

/// The normalized completion payload: addresses on success, one error
/// otherwise. Success always carries at least one address.
pub(crate) type Answer = crate::Result<Vec<Ipv4Addr>>;

pub(crate) enum Command {
    Submit {
        id: u64,
        host: Box<str>,
        tx: oneshot::Sender<Answer>,
    },
    Cancel {
        id: u64,
    },
}

/// Handle to the resolver backend task.
#[derive(Clone)]
pub struct Resolver {
    inner: Rc<Inner>,
}

struct Inner {
    tx: mpsc::UnboundedSender<Command>,
    next_id: Cell<u64>,
    counters: Counters,
}

/// One outstanding lookup. Await `complete` for the answer; the id can be
/// handed to [`Resolver::cancel`] while the lookup is still pending.
pub(crate) struct Lookup {
    id: u64,
    rx: oneshot::Receiver<Answer>,
}

impl Resolver {
    /// Starts the configured backend task on the current reactor.
    pub(crate) async fn start(config: &ProxyConfig, counters: Counters) -> crate::Result<Resolver> {
        let (tx, rx) = mpsc::unbounded_channel();
        match config.resolver {
            ResolverBackend::Stub => {
                let backend = stub::Stub::bind(config).await?;
                tokio::task::spawn_local(backend.run(rx));
            }
            ResolverBackend::Validating => {
                let backend = validating::Validating::new(config)?;
                tokio::task::spawn_local(backend.run(rx));
            }
        }
        Ok(Resolver {
            inner: Rc::new(Inner {
                tx,
                next_id: Cell::new(0),
                counters,
            }),
        })
    }

    /// Begins resolving the A records of `host`.
    pub(crate) fn submit(&self, host: &str) -> Lookup {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        self.inner.counters.increment("resolves");
        trace!(id, host, "submitting lookup");
        let (tx, rx) = oneshot::channel();
        // a send error means the backend task died; the dropped sender then
        // surfaces as a cancellation when the lookup is awaited
        let _ = self.inner.tx.send(Command::Submit {
            id,
            host: host.into(),
            tx,
        });
        Lookup { id, rx }
    }

    /// Best-effort cancel. The lookup's completion may still fire, carrying
    /// a cancellation error.
    pub(crate) fn cancel(&self, id: u64) {
        trace!(id, "canceling lookup");
        let _ = self.inner.tx.send(Command::Cancel { id });
    }
}

#[cfg(test)]
impl Resolver {
    /// A resolver with no backend task; every lookup completes with a
    /// cancellation error.
    pub(crate) fn disconnected() -> Resolver {
        let (tx, _) = mpsc::unbounded_channel();
        Resolver {
            inner: Rc::new(Inner {
                tx,
                next_id: Cell::new(0),
                counters: Counters::new(),
            }),
        }
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Resolver")
    }
}

impl Lookup {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the answer. Fires exactly once per submit; a lookup whose
    /// backend vanished or was canceled yields a cancellation error.
    pub(crate) async fn complete(self) -> Answer {
        match self.rx.await {
            Ok(answer) => answer,
            Err(_) => Err(crate::Error::new_canceled()),
        }
    }
}

impl fmt::Debug for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lookup").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::net::SocketAddr;
    use std::time::Duration;

    use hickory_proto::op::{Message, MessageType};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{RData, Record};
    use tokio::net::UdpSocket;
    use tokio::task::LocalSet;
    use tokio::time;

    fn run_local<F: Future>(fut: F) -> F::Output {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        LocalSet::new().block_on(&runtime, fut)
    }

    /// A name server that answers every A query with `addr`, optionally
    /// after a delay.
    async fn mock_server(addr: Ipv4Addr, delay: Option<Duration>) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = socket.local_addr().unwrap();
        tokio::task::spawn_local(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let (n, peer) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(_) => return,
                };
                if let Some(delay) = delay {
                    time::sleep(delay).await;
                }
                let query = Message::from_vec(&buf[..n]).unwrap();
                let question = query.queries()[0].clone();
                let mut response = Message::new();
                response
                    .set_id(query.id())
                    .set_message_type(MessageType::Response)
                    .add_query(question.clone())
                    .add_answer(Record::from_rdata(
                        question.name().clone(),
                        60,
                        RData::A(A(addr)),
                    ));
                let _ = socket.send_to(&response.to_vec().unwrap(), peer).await;
            }
        });
        local
    }

    async fn stub_resolver(name_server: SocketAddr) -> Resolver {
        let config = ProxyConfig {
            name_server: Some(name_server),
            resolver: ResolverBackend::Stub,
            ..ProxyConfig::default()
        };
        Resolver::start(&config, Counters::new()).await.unwrap()
    }

    #[test]
    fn stub_lookup_completes() {
        run_local(async {
            let server = mock_server(Ipv4Addr::new(10, 0, 0, 7), None).await;
            let resolver = stub_resolver(server).await;

            let answer = resolver.submit("origin.test").complete().await.unwrap();
            assert_eq!(answer, vec![Ipv4Addr::new(10, 0, 0, 7)]);
        });
    }

    #[test]
    fn many_lookups_interleave_over_one_socket() {
        run_local(async {
            let server = mock_server(Ipv4Addr::new(10, 0, 0, 9), None).await;
            let resolver = stub_resolver(server).await;

            let lookups: Vec<Lookup> = (0..8)
                .map(|i| resolver.submit(&format!("host-{}.test", i)))
                .collect();
            for lookup in lookups {
                let answer = lookup.complete().await.unwrap();
                assert_eq!(answer, vec![Ipv4Addr::new(10, 0, 0, 9)]);
            }
        });
    }

    #[test]
    fn cancel_yields_exactly_one_cancellation() {
        run_local(async {
            let server = mock_server(Ipv4Addr::new(10, 0, 0, 7), Some(Duration::from_millis(100))).await;
            let resolver = stub_resolver(server).await;

            let lookup = resolver.submit("slow.test");
            resolver.cancel(lookup.id());
            let answer = lookup.complete().await;
            assert!(answer.unwrap_err().is_canceled());

            // the backend keeps serving later submissions
            let answer = resolver.submit("after.test").complete().await.unwrap();
            assert_eq!(answer, vec![Ipv4Addr::new(10, 0, 0, 7)]);
        });
    }

    #[test]
    fn cancel_after_completion_is_harmless() {
        run_local(async {
            let server = mock_server(Ipv4Addr::new(10, 0, 0, 7), None).await;
            let resolver = stub_resolver(server).await;

            let lookup = resolver.submit("origin.test");
            let id = lookup.id();
            let answer = lookup.complete().await;
            assert!(answer.is_ok());
            resolver.cancel(id);
            time::sleep(Duration::from_millis(10)).await;
        });
    }

    #[test]
    fn disconnected_backend_surfaces_cancellation() {
        run_local(async {
            let resolver = Resolver::disconnected();
            let answer = resolver.submit("anything.test").complete().await;
            assert!(answer.unwrap_err().is_canceled());
        });
    }
}
