//! The privileged side of the pipe.
//!
//! A small, long-lived loop: read a message from standard input, act,
//! answer on standard output. Each open connection gets a reader task
//! pumping replies back as [`Message::PingReply`]. Decoding is strict:
//! the first malformed message terminates the server (Postel's law is
//! deliberately inverted on the privileged side).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backend::{self, Conn, ProbeConnection};
use crate::err::ProbeError;
use crate::packet::ProbePacket;
use crate::privsep::{drop_privileges, Message};

/// Poll interval of the per-connection reader tasks; only bounds how
/// fast they notice a close.
const READ_POLL: Duration = Duration::from_secs(10);

struct ServerConn {
    conn: Arc<Conn>,
    reader: JoinHandle<()>,
}

/// Runs the server over the process's standard streams. The returned
/// result decides the process exit code.
pub async fn run() -> Result<(), ProbeError> {
    let reader = BufReader::new(tokio::io::stdin());
    let writer = tokio::io::stdout();
    serve(reader, writer).await
}

/// Protocol loop over arbitrary streams (separated from [`run`] so
/// tests can drive it over an in-memory duplex).
pub async fn serve<R, W>(mut reader: R, writer: W) -> Result<(), ProbeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (reply_tx, mut reply_rx) = mpsc::channel::<Message>(64);
    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(message) = reply_rx.recv().await {
            if message.write_to(&mut writer).await.is_err() {
                break;
            }
        }
    });

    let mut conns: HashMap<u32, ServerConn> = HashMap::new();
    let mut next_conn_id: u32 = 1;

    let result = loop {
        let message = match Message::read_from(&mut reader).await {
            Ok(Some(message)) => message,
            // client went away; nothing left to serve
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        };
        match message {
            Message::Shutdown => break Ok(()),
            Message::PrivilegeDrop => {
                if let Err(err) = drop_privileges() {
                    break Err(err);
                }
            }
            Message::OpenConnection { version, backend } => {
                let conn = match backend::open(backend, version) {
                    Ok(conn) => Arc::new(conn),
                    // failing to open a transport at the client's
                    // request is an initialization error, not
                    // something to limp past
                    Err(err) => break Err(err),
                };
                let conn_id = next_conn_id;
                next_conn_id = next_conn_id.wrapping_add(1);
                let reader_task =
                    tokio::spawn(pump_replies(conn_id, conn.clone(), reply_tx.clone()));
                conns.insert(
                    conn_id,
                    ServerConn {
                        conn,
                        reader: reader_task,
                    },
                );
                if reply_tx
                    .send(Message::OpenConnectionReply { conn_id })
                    .await
                    .is_err()
                {
                    break Ok(());
                }
            }
            Message::SendPing {
                conn_id,
                packet,
                dest,
                ttl,
            } => {
                send_ping(&conns, &reply_tx, conn_id, packet, dest, ttl).await;
            }
            Message::CloseConnection { conn_id } => {
                if let Some(entry) = conns.remove(&conn_id) {
                    // the reader absorbs the resulting Closed error
                    let _ = entry.conn.close().await;
                    entry.reader.abort();
                }
                if reply_tx
                    .send(Message::CloseConnectionReply { conn_id })
                    .await
                    .is_err()
                {
                    break Ok(());
                }
            }
            // server-bound stream must not carry reply kinds
            other => {
                break Err(ProbeError::Privsep(format!(
                    "client sent a server-bound message: {:?}",
                    other
                )))
            }
        }
    };

    for (_, entry) in conns.drain() {
        let _ = entry.conn.close().await;
        entry.reader.abort();
    }
    drop(reply_tx);
    let _ = writer_task.await;
    result
}

async fn send_ping(
    conns: &HashMap<u32, ServerConn>,
    reply_tx: &mpsc::Sender<Message>,
    conn_id: u32,
    packet: ProbePacket,
    dest: IpAddr,
    ttl: u32,
) {
    let Some(entry) = conns.get(&conn_id) else {
        let _ = reply_tx
            .send(Message::Log(format!(
                "send on unknown connection {}",
                conn_id
            )))
            .await;
        return;
    };
    let ttl = if ttl == 0 { None } else { Some(ttl.min(255) as u8) };
    if let Err(err) = entry.conn.send(&packet, dest, ttl).await {
        let _ = reply_tx
            .send(Message::Log(format!(
                "send failed on connection {}: {}",
                conn_id, err
            )))
            .await;
    }
}

/// Reader task of one connection: every received packet becomes a
/// [`Message::PingReply`] tagged with the connection id.
async fn pump_replies(conn_id: u32, conn: Arc<Conn>, reply_tx: mpsc::Sender<Message>) {
    loop {
        match conn.recv(READ_POLL).await {
            Ok((packet, peer)) => {
                let reply = Message::PingReply {
                    conn_id,
                    packet,
                    peer,
                };
                if reply_tx.send(reply).await.is_err() {
                    break;
                }
            }
            Err(err) if err.is_timeout() => continue,
            Err(ProbeError::Closed) => break,
            Err(err) => {
                let _ = reply_tx
                    .send(Message::Log(format!(
                        "receive failed on connection {}: {}",
                        conn_id, err
                    )))
                    .await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::err::FrameError;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn shutdown_ends_the_loop() {
        let (mut client_out, server_in) = tokio::io::duplex(1024);
        let (server_out, _client_in) = tokio::io::duplex(1024);
        let server = tokio::spawn(serve(server_in, server_out));
        Message::Shutdown.write_to(&mut client_out).await.unwrap();
        assert!(server.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn closed_pipe_ends_the_loop() {
        let (client_out, server_in) = tokio::io::duplex(1024);
        let (server_out, _client_in) = tokio::io::duplex(1024);
        let server = tokio::spawn(serve(server_in, server_out));
        drop(client_out);
        assert!(server.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn malformed_message_is_fatal() {
        let (mut client_out, server_in) = tokio::io::duplex(1024);
        let (server_out, _client_in) = tokio::io::duplex(1024);
        let server = tokio::spawn(serve(server_in, server_out));
        // unknown message type 0xff with zero args
        client_out.write_all(&[0xff, 0]).await.unwrap();
        client_out.flush().await.unwrap();
        match server.await.unwrap() {
            Err(ProbeError::Frame(FrameError::UnknownMessageType(0xff))) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn reply_kind_from_client_is_fatal() {
        let (mut client_out, server_in) = tokio::io::duplex(1024);
        let (server_out, _client_in) = tokio::io::duplex(1024);
        let server = tokio::spawn(serve(server_in, server_out));
        Message::OpenConnectionReply { conn_id: 1 }
            .write_to(&mut client_out)
            .await
            .unwrap();
        match server.await.unwrap() {
            Err(ProbeError::Privsep(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn privilege_drop_acks_nothing_and_continues() {
        let (mut client_out, server_in) = tokio::io::duplex(1024);
        let (server_out, _client_in) = tokio::io::duplex(1024);
        let server = tokio::spawn(serve(server_in, server_out));
        Message::PrivilegeDrop.write_to(&mut client_out).await.unwrap();
        Message::Shutdown.write_to(&mut client_out).await.unwrap();
        assert!(server.await.unwrap().is_ok());
    }
}
