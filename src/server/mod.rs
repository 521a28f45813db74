//! Blocking TCP server: bounded worker pool, one request per connection,
//! multi-round list sessions with an idle timeout.
//!
//! The accept loop runs non-blocking with a short backoff so it can notice
//! the shutdown flag without waking per connection. When every worker slot
//! is taken the server still accepts the socket, answers `VMGR_RC` with
//! `EVMGRNACT` and closes; clients treat that code as "retry later".

mod handlers;

pub use handlers::{HandlerSet, ListCursor, Reply, RequestContext};

use crate::config::ServerConfig;
use crate::error::HandlerError;
use crate::privilege::PrivilegeChecker;
use crate::protocol::{
    codes, read_request, write_err_text, write_irc, write_rc, write_reply, FrameError, RepType,
    LIST_CONTINUE, LIST_END, VMGR_MAGIC,
};
use crate::store::VolumeStore;
use crate::wire::WireReader;
use log::{error, info, warn};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(25);
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Counting semaphore over the worker slots.
struct WorkerLimiter {
    active: AtomicUsize,
    limit: usize,
}

impl WorkerLimiter {
    fn new(limit: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            limit,
        }
    }

    fn try_acquire(self: &Arc<Self>) -> Option<WorkerPermit> {
        loop {
            let value = self.active.load(Ordering::Relaxed);
            if value >= self.limit {
                return None;
            }
            if self
                .active
                .compare_exchange(value, value + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(WorkerPermit {
                    limiter: self.clone(),
                });
            }
        }
    }
}

struct WorkerPermit {
    limiter: Arc<WorkerLimiter>,
}

impl Drop for WorkerPermit {
    fn drop(&mut self) {
        self.limiter.active.fetch_sub(1, Ordering::Release);
    }
}

#[derive(Default)]
struct ConnectionTracker {
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ConnectionTracker {
    fn track(&self, handle: thread::JoinHandle<()>) {
        self.handles.lock().unwrap_or_else(|e| e.into_inner()).push(handle);
    }

    fn join_all(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Running server. Dropping the handle initiates shutdown and joins every
/// worker.
pub struct ServerHandle {
    shutdown: Arc<AtomicBool>,
    accept_join: Option<thread::JoinHandle<()>>,
    connections: Arc<ConnectionTracker>,
    local_addr: SocketAddr,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn initiate_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Blocks until a shutdown is requested (by a remote `SHUTDOWN` request
    /// or [`initiate_shutdown`](Self::initiate_shutdown)), then drains.
    pub fn wait(mut self) {
        while !self.shutdown_requested() {
            thread::sleep(SHUTDOWN_POLL);
        }
        self.drain();
    }

    fn drain(&mut self) {
        self.initiate_shutdown();
        if let Some(handle) = self.accept_join.take() {
            if handle.join().is_err() {
                warn!("event=accept_loop_panic");
            }
        }
        self.connections.join_all();
        info!("event=server_stopped");
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.drain();
    }
}

/// Binds the listen socket and spawns the accept loop.
pub fn serve(
    config: &ServerConfig,
    store: Arc<VolumeStore>,
    privileges: Arc<dyn PrivilegeChecker>,
) -> io::Result<ServerHandle> {
    let listener = TcpListener::bind(&config.bind)?;
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;
    info!(
        "event=server_started addr={} workers={}",
        local_addr, config.workers
    );

    let handlers = Arc::new(HandlerSet::new(store, privileges));
    let limiter = Arc::new(WorkerLimiter::new(config.workers));
    let shutdown = Arc::new(AtomicBool::new(false));
    let tracker = Arc::new(ConnectionTracker::default());
    let idle_timeout = config.list_idle_timeout();

    let accept_shutdown = shutdown.clone();
    let accept_tracker = tracker.clone();
    let accept_join = thread::spawn(move || {
        loop {
            if accept_shutdown.load(Ordering::SeqCst) {
                break;
            }
            match listener.accept() {
                Ok((stream, addr)) => {
                    let Some(permit) = limiter.try_acquire() else {
                        warn!("event=connection_rejected addr={} reason=no_worker", addr);
                        let mut stream = stream;
                        let _ = write_rc(&mut stream, VMGR_MAGIC, codes::EVMGRNACT);
                        continue;
                    };
                    let handlers = handlers.clone();
                    let shutdown = accept_shutdown.clone();
                    let connection = thread::spawn(move || {
                        let _permit = permit;
                        if let Err(err) =
                            serve_connection(stream, addr, &handlers, &shutdown, idle_timeout)
                        {
                            warn!("event=connection_error addr={} error={}", addr, err);
                        }
                    });
                    accept_tracker.track(connection);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_BACKOFF);
                }
                Err(err) => {
                    error!("event=accept_error error={}", err);
                    break;
                }
            }
        }
    });

    Ok(ServerHandle {
        shutdown,
        accept_join: Some(accept_join),
        connections: tracker,
        local_addr,
    })
}

/// Handles one connection: a single request followed by its reply sequence.
/// List requests keep the connection open for further rounds.
fn serve_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    handlers: &HandlerSet,
    shutdown: &AtomicBool,
    idle_timeout: Duration,
) -> io::Result<()> {
    let frame = match read_request(&mut stream) {
        Ok(frame) => frame,
        Err(FrameError::Io(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
            return Ok(());
        }
        Err(FrameError::Io(err)) => return Err(err),
        Err(err) => {
            warn!("event=bad_frame addr={} error={:?}", addr, err);
            return write_rc(&mut stream, VMGR_MAGIC, codes::EINVAL);
        }
    };

    // While draining, every request is told to come back later.
    if shutdown.load(Ordering::SeqCst) {
        return write_rc(&mut stream, frame.magic, codes::EVMGRNACT);
    }

    let ctx = RequestContext {
        client_host: addr.ip().to_string(),
        magic: frame.magic,
    };

    let outcome = catch_unwind(AssertUnwindSafe(|| handlers.handle(&ctx, &frame)));
    let reply = match outcome {
        Ok(reply) => reply,
        Err(_) => {
            error!("event=handler_panic op={} addr={}", frame.req_type.name(), addr);
            return write_rc(&mut stream, frame.magic, codes::SEINTERNAL);
        }
    };

    match reply {
        Ok(Reply::Ok) => write_rc(&mut stream, frame.magic, 0),
        Ok(Reply::Data(payload)) => {
            write_reply(&mut stream, frame.magic, RepType::MsgData, &payload)?;
            write_rc(&mut stream, frame.magic, 0)
        }
        Ok(Reply::Shutdown) => {
            shutdown.store(true, Ordering::SeqCst);
            write_rc(&mut stream, frame.magic, 0)
        }
        Ok(Reply::List(cursor)) => serve_list(&mut stream, frame.magic, cursor, idle_timeout),
        Err(HandlerError { code, message }) => {
            if let Some(text) = message {
                write_err_text(&mut stream, frame.magic, &text)?;
            }
            write_rc(&mut stream, frame.magic, code)
        }
    }
}

/// Drives the multi-round list exchange. Each round sends one `MSG_DATA`
/// batch (carrying the end-of-list marker) followed by `VMGR_IRC`, then
/// waits (bounded by the idle timeout) for the client's next round:
/// `LIST_CONTINUE` for another batch or `LIST_END` to close the cursor
/// with the final `VMGR_RC`.
fn serve_list(
    stream: &mut TcpStream,
    magic: u32,
    mut cursor: ListCursor,
    idle_timeout: Duration,
) -> io::Result<()> {
    loop {
        let (batch, _eol) = cursor.next_batch();
        write_reply(stream, magic, RepType::MsgData, &batch)?;
        write_irc(stream, magic, 0)?;

        stream.set_read_timeout(Some(idle_timeout))?;
        let round = read_request(stream);
        stream.set_read_timeout(None)?;
        let frame = match round {
            Ok(frame) => frame,
            Err(FrameError::Io(err))
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                warn!("event=list_idle_timeout");
                return write_rc(stream, magic, codes::SETIMEDOUT);
            }
            Err(FrameError::Io(err)) => return Err(err),
            Err(_) => return write_rc(stream, magic, codes::EINVAL),
        };

        // Round bodies carry credentials then the flag.
        let mut r = WireReader::new(&frame.body);
        let _ = r.get_u32();
        let _ = r.get_u32();
        match r.get_u16() {
            Ok(LIST_CONTINUE) => continue,
            Ok(LIST_END) => return write_rc(stream, magic, 0),
            _ => return write_rc(stream, magic, codes::EINVAL),
        }
    }
}
