//! Statistics: a process-wide counter registry and the Unix-domain debug
//! socket that dumps it together with the per-session channel states.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::rc::Rc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::UnixListener;
use tracing::{debug, warn};

use crate::proxy::Shared;

/// Named monotonic counters, shared by handle across the whole daemon.
#[derive(Clone, Default)]
pub struct Counters {
    inner: Rc<RefCell<BTreeMap<&'static str, u64>>>,
}

impl Counters {
    pub fn new() -> Counters {
        Counters::default()
    }

    pub fn increment(&self, name: &'static str) {
        self.add(name, 1);
    }

    pub fn add(&self, name: &'static str, delta: u64) {
        *self.inner.borrow_mut().entry(name).or_insert(0) += delta;
    }

    pub fn get(&self, name: &str) -> u64 {
        self.inner.borrow().get(name).copied().unwrap_or(0)
    }

    pub(crate) fn render(&self) -> String {
        let mut out = String::new();
        for (name, value) in self.inner.borrow().iter() {
            let _ = writeln!(out, "{}: {}", name, value);
        }
        out
    }
}

impl std::fmt::Debug for Counters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.inner.borrow().iter()).finish()
    }
}

/// Serves the statistics socket: each accepted connection receives the
/// counter snapshot followed by one line per live session, then is closed.
pub(crate) async fn serve(listener: UnixListener, shared: Rc<Shared>) {
    loop {
        match listener.accept().await {
            Ok((mut stream, _)) => {
                shared.counters().increment("stat_dumps");
                let mut report = shared.counters().render();
                report.push_str(&shared.dump());
                if let Err(err) = stream.write_all(report.as_bytes()).await {
                    debug!("statistics write failed: {}", err);
                }
            }
            Err(err) => {
                warn!("statistics accept error: {}", err);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
