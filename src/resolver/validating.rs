//! The validating backend: a resolver library with DNSSEC validation that
//! owns its sockets and timers. The proxy only submits lookups and aborts
//! them on cancel.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};

use hickory_resolver::config::{
    LookupIpStrategy, NameServerConfig, Protocol, ResolverConfig, ResolverOpts,
};
use hickory_resolver::TokioAsyncResolver;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use super::{Answer, Command};
use crate::config::ProxyConfig;

pub(super) struct Validating {
    resolver: TokioAsyncResolver,
    lookups: HashMap<u64, JoinHandle<()>>,
}

impl Validating {
    pub(super) fn new(config: &ProxyConfig) -> crate::Result<Validating> {
        let (resolver_config, mut opts) = match config.name_server {
            Some(addr) => {
                let mut resolver_config = ResolverConfig::new();
                resolver_config.add_name_server(NameServerConfig::new(addr, Protocol::Udp));
                (resolver_config, ResolverOpts::default())
            }
            None => hickory_resolver::system_conf::read_system_conf()
                .map_err(crate::Error::new_config)?,
        };
        opts.validate = true;
        opts.ip_strategy = LookupIpStrategy::Ipv4Only;
        Ok(Validating {
            resolver: TokioAsyncResolver::tokio(resolver_config, opts),
            lookups: HashMap::new(),
        })
    }

    pub(super) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            self.lookups.retain(|_, task| !task.is_finished());
            match cmd {
                Command::Submit { id, host, tx } => {
                    let resolver = self.resolver.clone();
                    let task = tokio::task::spawn_local(async move {
                        let answer = lookup(&resolver, &host).await;
                        trace!(id, host = &*host, "lookup completed");
                        let _ = tx.send(answer);
                    });
                    self.lookups.insert(id, task);
                }
                Command::Cancel { id } => {
                    // aborting drops the completion sender, which surfaces
                    // as a cancellation error on the waiting side
                    if let Some(task) = self.lookups.remove(&id) {
                        task.abort();
                        trace!(id, "lookup canceled");
                    }
                }
            }
        }
    }
}

async fn lookup(resolver: &TokioAsyncResolver, host: &str) -> Answer {
    match resolver.lookup_ip(host).await {
        Ok(found) => {
            let addrs: Vec<Ipv4Addr> = found
                .iter()
                .filter_map(|ip| match ip {
                    IpAddr::V4(v4) => Some(v4),
                    IpAddr::V6(_) => None,
                })
                .collect();
            if addrs.is_empty() {
                Err(crate::Error::new_resolve_empty())
            } else {
                Ok(addrs)
            }
        }
        Err(err) => Err(crate::Error::new_resolve(err)),
    }
}
