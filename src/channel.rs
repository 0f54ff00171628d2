//! One direction of a relay: a pump that moves bytes from an input socket
//! to an output socket through a kernel pipe, without copying them into
//! user space.
//!
//! The only buffer is the pipe itself. While the output is slow the input
//! is simply not re-armed, so backpressure propagates to the TCP peer. An
//! idle timer covers the input side only: a peer may take as long as it
//! likes to accept our writes, but must keep sending within the configured
//! receive timeout.

use std::cell::Cell;
use std::fmt;
use std::io;
use std::net::Shutdown;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::rc::Rc;
use std::time::Duration;

use socket2::SockRef;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

use crate::stats::Counters;

/// Upper bound for one splice call; matches the default pipe capacity.
const SPLICE_CHUNK: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    Created,
    WaitingInput,
    WaitingOutput,
    SplicingInput,
    SplicingOutput,
    Finished,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Created => "created",
            State::WaitingInput => "waiting_input",
            State::WaitingOutput => "waiting_output",
            State::SplicingInput => "splicing_input",
            State::SplicingOutput => "splicing_output",
            State::Finished => "finished",
        })
    }
}

/// The kernel pipe used as the bounce buffer. Dropping it closes both ends,
/// which happens exactly once, when the channel finishes.
struct Pipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl Pipe {
    fn new() -> io::Result<Pipe> {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Pipe {
            read: unsafe { OwnedFd::from_raw_fd(fds[0]) },
            write: unsafe { OwnedFd::from_raw_fd(fds[1]) },
        })
    }
}

/// One non-blocking splice between a socket and a pipe end.
fn splice(from: libc::c_int, to: libc::c_int, len: usize) -> io::Result<usize> {
    let n = unsafe {
        libc::splice(
            from,
            std::ptr::null_mut(),
            to,
            std::ptr::null_mut(),
            len,
            libc::SPLICE_F_MOVE | libc::SPLICE_F_NONBLOCK,
        )
    };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

pub(crate) struct Channel {
    input: Rc<TcpStream>,
    output: Rc<TcpStream>,
    pipe: Pipe,
    idle_timeout: Duration,
    state: Rc<Cell<State>>,
    counters: Counters,
    /// Bytes currently parked in the pipe.
    pipe_size: usize,
    splices: u64,
    bytes: u64,
    started: Instant,
    first_input_stat: bool,
    saw_input: bool,
}

impl Channel {
    /// `first_input_stat` records the delay until the first input byte into
    /// the counter registry; the request direction uses it to measure how
    /// long the client took to follow up its head.
    pub(crate) fn new(
        input: Rc<TcpStream>,
        output: Rc<TcpStream>,
        idle_timeout: Duration,
        state: Rc<Cell<State>>,
        counters: Counters,
        first_input_stat: bool,
    ) -> crate::Result<Channel> {
        let pipe = Pipe::new().map_err(crate::Error::new_relay)?;
        state.set(State::Created);
        Ok(Channel {
            input,
            output,
            pipe,
            idle_timeout,
            state,
            counters,
            pipe_size: 0,
            splices: 0,
            bytes: 0,
            started: Instant::now(),
            first_input_stat,
            saw_input: false,
        })
    }

    /// Pumps until EOF on input (`Ok`), a socket error, or idle timeout.
    pub(crate) async fn run(mut self) -> crate::Result<()> {
        let mut deadline = Instant::now() + self.idle_timeout;
        loop {
            // the idle deadline only moves when input bytes actually
            // arrive; spurious readiness does not re-arm it
            self.set_state(State::WaitingInput);
            match time::timeout_at(deadline, self.input.ready(Interest::READABLE)).await {
                Ok(ready) => {
                    if let Err(err) = ready {
                        return self.finish(Err(crate::Error::new_relay(err)));
                    }
                }
                Err(_) => {
                    debug!("no input for {:?}", self.idle_timeout);
                    return self.finish(Err(crate::Error::new_idle_timeout()));
                }
            }

            self.set_state(State::SplicingInput);
            match self.splice_in() {
                Ok(Some(0)) => {
                    trace!("input eof after {} bytes", self.bytes);
                    return self.finish(Ok(()));
                }
                Ok(Some(n)) => {
                    if !self.saw_input {
                        self.saw_input = true;
                        if self.first_input_stat {
                            self.counters
                                .add("first_input_time", self.started.elapsed().as_millis() as u64);
                        }
                    }
                    self.pipe_size += n;
                    self.splices += 1;
                    self.bytes += n as u64;
                    deadline = Instant::now() + self.idle_timeout;
                }
                Ok(None) => continue,
                Err(err) => return self.finish(Err(err)),
            }

            while self.pipe_size > 0 {
                self.set_state(State::WaitingOutput);
                if let Err(err) = self.output.ready(Interest::WRITABLE).await {
                    return self.finish(Err(crate::Error::new_relay(err)));
                }
                self.set_state(State::SplicingOutput);
                match self.splice_out() {
                    Ok(Some(0)) => {
                        return self
                            .finish(Err(crate::Error::new_relay(io::ErrorKind::WriteZero.into())));
                    }
                    Ok(Some(n)) => {
                        debug_assert!(n <= self.pipe_size);
                        self.pipe_size -= n;
                        self.splices += 1;
                    }
                    Ok(None) => continue,
                    Err(err) => return self.finish(Err(err)),
                }
            }
        }
    }

    /// Moves as many bytes as the kernel yields from the input socket into
    /// the pipe. `Ok(Some(0))` is clean EOF; `Ok(None)` means the socket
    /// was not actually readable.
    fn splice_in(&self) -> crate::Result<Option<usize>> {
        let from = self.input.as_raw_fd();
        let to = self.pipe.write.as_raw_fd();
        match self.input.try_io(Interest::READABLE, || splice(from, to, SPLICE_CHUNK)) {
            Ok(n) => Ok(Some(n)),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(crate::Error::new_relay(err)),
        }
    }

    /// Drains up to `pipe_size` bytes from the pipe into the output socket.
    fn splice_out(&self) -> crate::Result<Option<usize>> {
        let from = self.pipe.read.as_raw_fd();
        let to = self.output.as_raw_fd();
        let len = self.pipe_size.min(SPLICE_CHUNK);
        match self.output.try_io(Interest::WRITABLE, || splice(from, to, len)) {
            Ok(n) => Ok(Some(n)),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(crate::Error::new_relay(err)),
        }
    }

    /// Terminal transition: publishes the final state, flushes the
    /// statistics, propagates a clean half-close, and closes the pipe by
    /// consuming it.
    fn finish(self, result: crate::Result<()>) -> crate::Result<()> {
        self.set_state(State::Finished);
        self.counters.add("splices", self.splices);
        self.counters.add("relayed_bytes", self.bytes);
        if result.is_ok() {
            // the peer half-closed; let the other end see EOF once the
            // pipe has drained
            if let Err(err) = SockRef::from(&*self.output).shutdown(Shutdown::Write) {
                trace!("shutdown after eof: {}", err);
            }
        }
        result
    }

    fn set_state(&self, state: State) {
        trace!(%state, "channel");
        self.state.set(state);
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("state", &self.state.get())
            .field("pipe_size", &self.pipe_size)
            .field("bytes", &self.bytes)
            .finish()
    }
}
