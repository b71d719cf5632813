//! The unprivileged side of the pipe.
//!
//! The client re-executes the binary as the privileged server, drops
//! its own privileges, and demultiplexes the server's replies into per
//! connection queues. Connection handles are weak references into the
//! client by identifier; once the close reply arrives the identifier is
//! dead and further sends fail.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::backend::{BackendKind, ProbeConnection};
use crate::err::{FrameError, ProbeError};
use crate::packet::ProbePacket;
use crate::transport::IpVersion;

use super::{drop_privileges, Message, SERVER_SENTINEL};

/// Capacity of one connection's reply queue.
const CONN_QUEUE: usize = 64;

struct Shared {
    writer: mpsc::Sender<Message>,
    conns: Mutex<HashMap<u32, mpsc::Sender<(ProbePacket, IpAddr)>>>,
    /// Open replies carry no request correlation; the server assigns
    /// ids in request order, so a FIFO of waiters suffices.
    pending_opens: Mutex<VecDeque<oneshot::Sender<u32>>>,
    pending_closes: Mutex<HashMap<u32, oneshot::Sender<()>>>,
    shutting_down: AtomicBool,
    /// Whether losing the server should terminate the process (the
    /// spawned production client) or merely poison the handles (in
    /// process wiring, tests).
    exit_on_fatal: bool,
}

/// Handle to the privileged subprocess.
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Re-executes this binary as the privileged server and drops the
    /// calling process's privileges.
    pub async fn spawn_privileged() -> Result<Client, ProbeError> {
        let exe = std::env::current_exe()
            .map_err(|err| ProbeError::Privsep(format!("locating own binary: {}", err)))?;
        // cleared environment: the privileged child must not inherit
        // unrelated variables
        let mut child = Command::new(exe)
            .arg(SERVER_SENTINEL)
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| ProbeError::Privsep(format!("spawning the server: {}", err)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProbeError::Privsep("server stdin not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProbeError::Privsep("server stdout not piped".to_string()))?;

        // the child holds the privilege now; this process does not
        // need it anymore
        drop_privileges()?;

        let client = Client::from_io_inner(stdin, stdout, true);
        let shared = Arc::downgrade(&client.shared);
        tokio::spawn(async move {
            let status = child.wait().await;
            let expected = shared
                .upgrade()
                .map(|s| s.shutting_down.load(Ordering::Acquire))
                .unwrap_or(true);
            if !expected {
                // a crashing server indicates a bug, not a condition
                // to recover from
                error!(?status, "privileged server exited unexpectedly");
                std::process::exit(1);
            }
        });
        Ok(client)
    }

    /// Builds a client over arbitrary streams without the exit-on-loss
    /// policy of the spawned production client: losing the peer merely
    /// poisons the handles. Used for in-process wiring and tests.
    pub fn from_io<W, R>(write: W, read: R) -> Client
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        Client::from_io_inner(write, read, false)
    }

    fn from_io_inner<W, R>(write: W, read: R, exit_on_fatal: bool) -> Client
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (writer_tx, mut writer_rx) = mpsc::channel::<Message>(64);
        tokio::spawn(async move {
            let mut write = write;
            while let Some(message) = writer_rx.recv().await {
                if message.write_to(&mut write).await.is_err() {
                    break;
                }
            }
        });
        let shared = Arc::new(Shared {
            writer: writer_tx,
            conns: Mutex::new(HashMap::new()),
            pending_opens: Mutex::new(VecDeque::new()),
            pending_closes: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            exit_on_fatal,
        });
        tokio::spawn(demux(shared.clone(), read));
        Client { shared }
    }

    /// Opens a connection on the server and returns its handle.
    pub async fn open(
        &self,
        version: IpVersion,
        backend: BackendKind,
    ) -> Result<ClientConn, ProbeError> {
        let (tx, rx) = oneshot::channel();
        self.shared.pending_opens.lock().push_back(tx);
        self.shared
            .writer
            .send(Message::OpenConnection { version, backend })
            .await
            .map_err(|_| ProbeError::Closed)?;
        let conn_id = rx.await.map_err(|_| ProbeError::Closed)?;
        let (packet_tx, packet_rx) = mpsc::channel(CONN_QUEUE);
        self.shared.conns.lock().insert(conn_id, packet_tx);
        Ok(ClientConn {
            conn_id,
            shared: Arc::downgrade(&self.shared),
            packets: tokio::sync::Mutex::new(packet_rx),
            closed: AtomicBool::new(false),
        })
    }

    /// Tells the server to drop its privileges permanently.
    pub async fn privilege_drop(&self) -> Result<(), ProbeError> {
        self.shared
            .writer
            .send(Message::PrivilegeDrop)
            .await
            .map_err(|_| ProbeError::Closed)
    }

    /// Asks the server to exit normally.
    pub async fn shutdown(&self) -> Result<(), ProbeError> {
        self.shared.shutting_down.store(true, Ordering::Release);
        self.shared
            .writer
            .send(Message::Shutdown)
            .await
            .map_err(|_| ProbeError::Closed)
    }
}

/// Routes every inbound message to its connection queue or waiter.
async fn demux<R>(shared: Arc<Shared>, mut read: R)
where
    R: AsyncRead + Unpin,
{
    loop {
        match Message::read_from(&mut read).await {
            Ok(Some(message)) => dispatch(&shared, message),
            Ok(None) => {
                if shared.shutting_down.load(Ordering::Acquire) {
                    break;
                }
                fatal(&shared, "privileged server closed the pipe");
                break;
            }
            // a well-formed envelope with a bad schema is skippable on
            // the unprivileged side; losing framing is not
            Err(ProbeError::Frame(FrameError::UnexpectedEof)) => {
                fatal(&shared, "privsep stream ended mid-message");
                break;
            }
            Err(ProbeError::Frame(err)) => {
                warn!(%err, "skipping malformed privsep message");
            }
            Err(err) => {
                fatal(&shared, &format!("privsep pipe failed: {}", err));
                break;
            }
        }
    }
    // poison every handle: receivers see Closed, waiters see a dropped
    // oneshot
    shared.conns.lock().clear();
    shared.pending_opens.lock().clear();
    shared.pending_closes.lock().clear();
}

/// The server is a tightly coupled subprocess; losing it means a bug,
/// not a condition to recover from.
fn fatal(shared: &Shared, reason: &str) {
    error!("{}", reason);
    if shared.exit_on_fatal {
        std::process::exit(1);
    }
}

fn dispatch(shared: &Shared, message: Message) {
    match message {
        Message::PingReply {
            conn_id,
            packet,
            peer,
        } => {
            let sender = shared.conns.lock().get(&conn_id).cloned();
            match sender {
                Some(tx) => {
                    if tx.try_send((packet, peer)).is_err() {
                        warn!(conn_id, "reply queue full, dropping packet");
                    }
                }
                None => debug!(conn_id, "reply for unknown connection"),
            }
        }
        Message::OpenConnectionReply { conn_id } => {
            match shared.pending_opens.lock().pop_front() {
                Some(tx) => {
                    let _ = tx.send(conn_id);
                }
                None => warn!(conn_id, "unsolicited open reply"),
            }
        }
        Message::CloseConnectionReply { conn_id } => {
            shared.conns.lock().remove(&conn_id);
            if let Some(tx) = shared.pending_closes.lock().remove(&conn_id) {
                let _ = tx.send(());
            }
        }
        Message::Log(text) => info!(target: "pingtop::privsep::server", "{}", text),
        other => warn!(?other, "unexpected client-bound message"),
    }
}

/// One open connection inside the privileged server.
///
/// Weak reference into the client: if the client is gone the handle is
/// dead and every operation reports [`ProbeError::Closed`].
pub struct ClientConn {
    conn_id: u32,
    shared: Weak<Shared>,
    packets: tokio::sync::Mutex<mpsc::Receiver<(ProbePacket, IpAddr)>>,
    closed: AtomicBool,
}

impl ClientConn {
    pub fn conn_id(&self) -> u32 {
        self.conn_id
    }

    fn shared(&self) -> Result<Arc<Shared>, ProbeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProbeError::Closed);
        }
        self.shared.upgrade().ok_or(ProbeError::Closed)
    }
}

impl ProbeConnection for ClientConn {
    async fn send(
        &self,
        packet: &ProbePacket,
        dest: IpAddr,
        ttl: Option<u8>,
    ) -> Result<(), ProbeError> {
        let shared = self.shared()?;
        shared
            .writer
            .send(Message::SendPing {
                conn_id: self.conn_id,
                packet: packet.clone(),
                dest,
                ttl: ttl.map(u32::from).unwrap_or(0),
            })
            .await
            .map_err(|_| ProbeError::Closed)
    }

    async fn recv(&self, timeout: Duration) -> Result<(ProbePacket, IpAddr), ProbeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProbeError::Closed);
        }
        let mut packets = self.packets.lock().await;
        match tokio::time::timeout(timeout, packets.recv()).await {
            Err(_elapsed) => Err(ProbeError::Timeout),
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(ProbeError::Closed),
        }
    }

    async fn close(&self) -> Result<(), ProbeError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let Some(shared) = self.shared.upgrade() else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        shared.pending_closes.lock().insert(self.conn_id, tx);
        shared
            .writer
            .send(Message::CloseConnection {
                conn_id: self.conn_id,
            })
            .await
            .map_err(|_| ProbeError::Closed)?;
        rx.await.map_err(|_| ProbeError::Closed)
    }
}
