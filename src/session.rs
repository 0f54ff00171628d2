//! One proxied connection, from accept to teardown.
//!
//! A session walks through five phases: parse the request head, resolve the
//! request host, connect to the origin, forward the rewritten head, then
//! relay bytes in both directions until the peers are done. Any failure
//! before the relay starts may answer the client with a canned error page;
//! failures afterwards close the connection silently.

use std::cmp::Ordering;
use std::io;
use std::net::{Ipv4Addr, Shutdown, SocketAddr};
use std::pin::pin;
use std::rc::Rc;
use std::str;

use bytes::{Bytes, BytesMut};
use futures_util::future::{self, Either};
use http::Uri;
use socket2::SockRef;
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::{self, Instant};
use tracing::{debug, trace};

use crate::channel::Channel;
use crate::error::Parse;
use crate::headers::{self, Disposition};
use crate::proxy::{SessionEntry, Shared};

/// Initial request-buffer allocation.
const INIT_HEAD_SIZE: usize = 8192;
/// Ceiling for the request head; beyond this the request is rejected.
const MAX_HEAD_SIZE: usize = INIT_HEAD_SIZE + 4096 * MAX_HEADERS;
const MAX_HEADERS: usize = 100;

pub(crate) struct Session {
    id: u64,
    shared: Rc<Shared>,
    client: Rc<TcpStream>,
    entry: SessionEntry,
    relay_started: bool,
}

/// The parsed request head. Header names and values are index pairs into
/// the frozen head buffer; `body` holds any bytes that were read past the
/// blank line.
struct RequestHead {
    head: Bytes,
    method: (usize, usize),
    target: (usize, usize),
    minor: u8,
    headers: Vec<HeaderIndices>,
    body: Bytes,
}

#[derive(Clone, Copy)]
struct HeaderIndices {
    name: (usize, usize),
    value: (usize, usize),
}

/// Where this request is going, and the request-target to emit.
struct Target {
    host: Box<str>,
    port: u16,
    origin_form: Box<str>,
}

impl Session {
    pub(crate) fn new(
        id: u64,
        shared: Rc<Shared>,
        client: TcpStream,
        entry: SessionEntry,
    ) -> Session {
        Session {
            id,
            shared,
            client: Rc::new(client),
            entry,
            relay_started: false,
        }
    }

    pub(crate) async fn run(mut self) {
        trace!(id = self.id, "session started");
        match self.drive().await {
            Ok(()) => debug!(id = self.id, "session finished"),
            Err(err) => {
                debug!(id = self.id, "session failed: {}", err);
                if !self.relay_started {
                    self.emit_error_page(&err).await;
                }
            }
        }
        self.shared.remove_session(self.id);
    }

    async fn drive(&mut self) -> crate::Result<()> {
        let head = self.read_head().await?;
        let target = parse_target(&head)?;
        debug!(
            id = self.id,
            host = &*target.host,
            port = target.port,
            "request parsed"
        );
        let addrs = self.resolve(&target).await?;
        let origin = Rc::new(self.connect(&addrs, target.port).await?);
        self.forward_head(&origin, &head, &target).await?;
        self.relay(origin).await
    }

    /// Reads from the client until the head is complete, the ceiling is
    /// hit, or the client goes away.
    async fn read_head(&mut self) -> crate::Result<RequestHead> {
        let mut buf = BytesMut::with_capacity(INIT_HEAD_SIZE);
        loop {
            if let Some(head) = parse_head(&mut buf)? {
                return Ok(head);
            }
            if buf.len() >= MAX_HEAD_SIZE {
                return Err(crate::Error::new_too_large());
            }
            let n = read_some(&self.client, &mut buf, self.shared.receive_timeout()).await?;
            if n == 0 {
                return Err(crate::Error::new_incomplete());
            }
        }
    }

    /// Resolves the target host, with the resolve timeout enforced here
    /// rather than inside the backend. An IP-literal host skips DNS.
    async fn resolve(&mut self, target: &Target) -> crate::Result<Vec<Ipv4Addr>> {
        if let Ok(ip) = target.host.parse::<Ipv4Addr>() {
            return Ok(vec![ip]);
        }
        let lookup = self.shared.resolver().submit(&target.host);
        let lookup_id = lookup.id();
        match time::timeout(self.shared.resolve_timeout(), lookup.complete()).await {
            Ok(answer) => answer,
            Err(_) => {
                self.shared.resolver().cancel(lookup_id);
                debug!(id = self.id, host = &*target.host, "resolve timed out");
                Err(crate::Error::new_resolve_timeout())
            }
        }
    }

    /// Tries each candidate address in turn, each attempt bounded by the
    /// connect timeout, keeping the last error for the verdict.
    async fn connect(&self, addrs: &[Ipv4Addr], port: u16) -> crate::Result<TcpStream> {
        let mut last_err = None;
        for &ip in addrs {
            let addr = SocketAddr::from((ip, port));
            trace!(id = self.id, %addr, "connecting");
            match self.connect_one(addr).await {
                Ok(stream) => {
                    debug!(id = self.id, %addr, "connected");
                    return Ok(stream);
                }
                Err(err) => {
                    trace!(id = self.id, %addr, "connect error: {}", err);
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            crate::Error::new_connect(io::Error::from(io::ErrorKind::AddrNotAvailable))
        }))
    }

    async fn connect_one(&self, addr: SocketAddr) -> crate::Result<TcpStream> {
        let socket = TcpSocket::new_v4().map_err(crate::Error::new_connect)?;
        if let Some(local) = self.shared.outbound_endpoint() {
            socket.set_reuseaddr(true).map_err(crate::Error::new_connect)?;
            socket.bind(local).map_err(crate::Error::new_connect)?;
        }
        match time::timeout(self.shared.connect_timeout(), socket.connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(err)) => Err(crate::Error::new_connect(err)),
            Err(_) => Err(crate::Error::new_connect_timeout()),
        }
    }

    /// Emits the rewritten request line and the sieved headers, then any
    /// body bytes that were already buffered while reading the head.
    async fn forward_head(
        &self,
        origin: &TcpStream,
        head: &RequestHead,
        target: &Target,
    ) -> crate::Result<()> {
        let out = self.render_head(head, target);
        write_all(origin, &out)
            .await
            .map_err(crate::Error::new_connect)?;
        if !head.body.is_empty() {
            trace!(id = self.id, "forwarding {} buffered body bytes", head.body.len());
            write_all(origin, &head.body)
                .await
                .map_err(crate::Error::new_connect)?;
        }
        Ok(())
    }

    fn render_head(&self, head: &RequestHead, target: &Target) -> BytesMut {
        let mut out = BytesMut::with_capacity(head.head.len() + 32);
        out.extend_from_slice(head.method());
        out.extend_from_slice(b" ");
        out.extend_from_slice(target.origin_form.as_bytes());
        out.extend_from_slice(if head.minor == 0 {
            b" HTTP/1.0\r\n"
        } else {
            b" HTTP/1.1\r\n"
        });
        let mut dropped = 0usize;
        for (name, value) in head.headers() {
            match self.shared.sieve().disposition(name) {
                Disposition::Drop => {
                    dropped += 1;
                    continue;
                }
                Disposition::Forward => out.extend_from_slice(name),
                Disposition::Rename(replacement) => out.extend_from_slice(replacement),
            }
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        if dropped > 0 {
            trace!(id = self.id, dropped, "headers dropped by sieve");
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    /// Runs the request and response channels until both finish. The first
    /// error tears both sockets down so the sibling drains promptly.
    async fn relay(&mut self, origin: Rc<TcpStream>) -> crate::Result<()> {
        self.relay_started = true;
        let request = Channel::new(
            self.client.clone(),
            origin.clone(),
            self.shared.receive_timeout(),
            self.entry.request_state.clone(),
            self.shared.counters().clone(),
            true,
        )?;
        let response = Channel::new(
            origin.clone(),
            self.client.clone(),
            self.shared.receive_timeout(),
            self.entry.response_state.clone(),
            self.shared.counters().clone(),
            false,
        )?;
        self.entry.opened.set(2);

        let request = pin!(request.run());
        let response = pin!(response.run());
        match future::select(request, response).await {
            Either::Left((first, sibling)) => {
                trace!(id = self.id, "request channel finished");
                self.entry.opened.set(1);
                if first.is_err() {
                    self.teardown(&origin);
                }
                let second = sibling.await;
                self.entry.opened.set(0);
                first.and(second)
            }
            Either::Right((first, sibling)) => {
                trace!(id = self.id, "response channel finished");
                self.entry.opened.set(1);
                if first.is_err() {
                    self.teardown(&origin);
                }
                let second = sibling.await;
                self.entry.opened.set(0);
                first.and(second)
            }
        }
    }

    fn teardown(&self, origin: &TcpStream) {
        trace!(id = self.id, "tearing down both directions");
        let _ = SockRef::from(&*self.client).shutdown(Shutdown::Both);
        let _ = SockRef::from(origin).shutdown(Shutdown::Both);
    }

    /// Answers the client with the canned page for this error, when one is
    /// configured and nothing has been relayed yet.
    async fn emit_error_page(&self, err: &crate::Error) {
        let status = match err.canned_status() {
            Some(status) => status,
            None => return,
        };
        let page = match self.shared.error_page(status) {
            Some(page) => page.clone(),
            None => {
                trace!(id = self.id, %status, "no canned page configured");
                return;
            }
        };
        debug!(id = self.id, %status, "sending canned response");
        self.shared.counters().increment("canned_responses");
        if let Err(err) = write_all(&self.client, &page).await {
            debug!(id = self.id, "canned response write failed: {}", err);
            return;
        }
        let _ = SockRef::from(&*self.client).shutdown(Shutdown::Write);
    }
}

impl RequestHead {
    fn method(&self) -> &[u8] {
        &self.head[self.method.0..self.method.1]
    }

    fn target_str(&self) -> crate::Result<&str> {
        str::from_utf8(&self.head[self.target.0..self.target.1])
            .map_err(|_| crate::Error::new_parse(Parse::Uri))
    }

    fn headers(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.headers.iter().map(move |indices| {
            (
                &self.head[indices.name.0..indices.name.1],
                &self.head[indices.value.0..indices.value.1],
            )
        })
    }

    fn header_value(&self, name: &[u8]) -> Option<&[u8]> {
        self.headers()
            .find(|(candidate, _)| headers::name_cmp(candidate, name) == Ordering::Equal)
            .map(|(_, value)| value)
    }
}

/// Attempts one parse of the buffered bytes. `None` means the head is not
/// complete yet.
fn parse_head(buf: &mut BytesMut) -> crate::Result<Option<RequestHead>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let (len, method, target, minor, header_indices) = match req.parse(buf)? {
        httparse::Status::Complete(len) => {
            let base = buf.as_ref().as_ptr() as usize;
            let method = span(base, req.method.ok_or_else(|| crate::Error::new_parse(Parse::Method))?.as_bytes());
            let target = span(base, req.path.ok_or_else(|| crate::Error::new_parse(Parse::Uri))?.as_bytes());
            let minor = req.version.ok_or_else(|| crate::Error::new_parse(Parse::Version))? as u8;
            let mut header_indices = Vec::with_capacity(req.headers.len());
            for header in req.headers.iter() {
                header_indices.push(HeaderIndices {
                    name: span(base, header.name.as_bytes()),
                    value: span(base, header.value),
                });
            }
            (len, method, target, minor, header_indices)
        }
        httparse::Status::Partial => return Ok(None),
    };
    let head = buf.split_to(len).freeze();
    let body = buf.split().freeze();
    Ok(Some(RequestHead {
        head,
        method,
        target,
        minor,
        headers: header_indices,
        body,
    }))
}

fn span(base: usize, slice: &[u8]) -> (usize, usize) {
    let start = slice.as_ptr() as usize - base;
    (start, start + slice.len())
}

/// Extracts host, port and the origin-form request-target. Absolute-form
/// targets carry their own authority; origin-form requests need a `Host`
/// header. The port defaults to 80.
fn parse_target(head: &RequestHead) -> crate::Result<Target> {
    let raw = head.target_str()?;
    if raw.starts_with('/') {
        let host_value = head
            .header_value(b"Host")
            .ok_or_else(|| crate::Error::new_parse(Parse::Uri))?;
        let (host, port) = split_host_port(host_value)?;
        return Ok(Target {
            host,
            port,
            origin_form: raw.into(),
        });
    }

    let uri: Uri = raw
        .parse()
        .map_err(|_| crate::Error::new_parse(Parse::Uri))?;
    if uri.scheme_str() != Some("http") {
        return Err(crate::Error::new_parse(Parse::Uri));
    }
    let host = uri.host().ok_or_else(|| crate::Error::new_parse(Parse::Uri))?;
    let port = uri.port_u16().unwrap_or(80);
    let origin_form = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Ok(Target {
        host: host.into(),
        port,
        origin_form: origin_form.into(),
    })
}

fn split_host_port(value: &[u8]) -> crate::Result<(Box<str>, u16)> {
    let value = str::from_utf8(value)
        .map_err(|_| crate::Error::new_parse(Parse::Header))?
        .trim();
    match value.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| crate::Error::new_parse(Parse::Header))?;
            if host.is_empty() {
                return Err(crate::Error::new_parse(Parse::Header));
            }
            Ok((host.into(), port))
        }
        None => {
            if value.is_empty() {
                return Err(crate::Error::new_parse(Parse::Header));
            }
            Ok((value.into(), 80))
        }
    }
}

/// One readiness-guarded read into `buf`, bounded by `timeout`.
async fn read_some(
    stream: &TcpStream,
    buf: &mut BytesMut,
    timeout: std::time::Duration,
) -> crate::Result<usize> {
    let deadline = Instant::now() + timeout;
    loop {
        match time::timeout_at(deadline, stream.readable()).await {
            Ok(ready) => ready.map_err(crate::Error::new_relay)?,
            Err(_) => return Err(crate::Error::new_idle_timeout()),
        }
        match stream.try_read_buf(buf) {
            Ok(n) => return Ok(n),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(crate::Error::new_relay(err)),
        }
    }
}

/// Writes all of `data` through a shared socket handle.
async fn write_all(stream: &TcpStream, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        stream.writable().await?;
        match stream.try_write(data) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}
