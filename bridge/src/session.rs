//! Control connection handling and the bridge's event loop.
//!
//! Everything that mutates [`Bridge`] runs inside [`serve`]: inbound
//! messages, status notifications and fired shutoff timers are all branches
//! of one `select!`, so each is handled to completion before the next. The
//! `select!` is biased: a status notification already queued is applied before
//! the next inbound message is dispatched.

use std::{future::Future, io, net::SocketAddr, pin::Pin, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::Sleep,
};
use tracing::{debug, info, warn};

use volcano_common::{framing::MAX_MESSAGE_LEN, Framing, LineFramer};

use crate::{
    bridge::{Bridge, Outcome},
    peripheral::Notifications,
    shutoff::ShutoffDue,
};

/// Why [`serve`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Disconnect,
    LifetimeElapsed,
    Interrupted,
}

/// One accepted client. In datagram mode every read is one message; in lines
/// mode reads are reassembled into newline-terminated messages.
pub struct ControlConnection {
    stream: TcpStream,
    peer: SocketAddr,
    framing: Framing,
    framer: LineFramer,
    buffer: Vec<u8>,
}

impl ControlConnection {
    pub fn new(stream: TcpStream, peer: SocketAddr, framing: Framing) -> Self {
        Self {
            stream,
            peer,
            framing,
            framer: LineFramer::new(),
            buffer: vec![0; MAX_MESSAGE_LEN],
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Next complete message, or `None` once the peer has closed. Cancel safe:
    /// bytes are only consumed from the socket together with being buffered.
    pub async fn next_message(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            if self.framing == Framing::Lines {
                if let Some(message) = self.framer.next_message() {
                    return Ok(Some(message));
                }
            }

            let read = self.stream.read(&mut self.buffer).await?;
            if read == 0 {
                if self.framer.pending() > 0 {
                    debug!(
                        "{} closed with {} unterminated bytes",
                        self.peer,
                        self.framer.pending()
                    );
                }
                return Ok(None);
            }

            let chunk = &self.buffer[..read];
            match self.framing {
                Framing::Datagram => return Ok(Some(chunk.to_vec())),
                Framing::Lines => {
                    if let Err(oversized) = self.framer.push(chunk) {
                        warn!(
                            "{} sent an oversized line, dropped {} bytes",
                            self.peer, oversized.dropped
                        );
                    }
                }
            }
        }
    }

    pub async fn reply(&mut self, message: &[u8]) -> io::Result<()> {
        self.stream.write_all(message).await?;
        if self.framing == Framing::Lines {
            self.stream.write_all(b"\n").await?;
        }
        self.stream.flush().await
    }
}

/// Serves control connections one at a time until `Disconnect`, the lifetime
/// deadline or `shutdown` completes. A peripheral failure ends the current
/// connection only, and a failed accept is skipped.
pub async fn serve<F>(
    listener: TcpListener,
    bridge: &mut Bridge,
    mut notifications: Option<Notifications>,
    mut shutoff_due: mpsc::UnboundedReceiver<ShutoffDue>,
    framing: Framing,
    lifetime: Option<Duration>,
    shutdown: F,
) -> Exit
where
    F: Future<Output = ()>,
{
    let mut deadline = lifetime.map(|lifetime| Box::pin(tokio::time::sleep(lifetime)));
    let mut connection: Option<ControlConnection> = None;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("interrupted");
                return Exit::Interrupted;
            }
            _ = until(&mut deadline) => {
                info!("maximum lifetime reached");
                return Exit::LifetimeElapsed;
            }
            Some(due) = shutoff_due.recv() => {
                if let Err(err) = bridge.on_shutoff_due(due).await {
                    warn!("fan shutoff failed: {err}");
                    close(&mut connection);
                }
            }
            raw = next_notification(&mut notifications) => match raw {
                Some(raw) => bridge.apply_notification(&raw),
                None => {
                    warn!("status notifications ended");
                    notifications = None;
                }
            },
            accepted = listener.accept(), if connection.is_none() => {
                connection = admit(accepted, framing);
            }
            message = next_message(&mut connection) => {
                let message = match message {
                    Ok(Some(message)) => message,
                    Ok(None) => {
                        close(&mut connection);
                        continue;
                    }
                    Err(err) => {
                        warn!("control connection read failed: {err}");
                        close(&mut connection);
                        continue;
                    }
                };
                let Some(client) = connection.as_mut() else {
                    continue;
                };

                match bridge.handle_message(&message).await {
                    Ok(Outcome::Reply(reply)) => {
                        if let Err(err) = client.reply(&reply).await {
                            warn!("reply to {} failed: {err}", client.peer());
                            close(&mut connection);
                        }
                    }
                    Ok(Outcome::Disconnect) => {
                        info!("disconnect requested by {}", client.peer());
                        return Exit::Disconnect;
                    }
                    Err(err) => {
                        warn!("peripheral error, ending session with {}: {err}", client.peer());
                        close(&mut connection);
                    }
                }
            }
        }
    }
}

fn admit(
    accepted: io::Result<(TcpStream, SocketAddr)>,
    framing: Framing,
) -> Option<ControlConnection> {
    match accepted {
        Ok((stream, peer)) => {
            info!("connected by {peer}");
            Some(ControlConnection::new(stream, peer, framing))
        }
        Err(err) => {
            warn!("accept failed: {err}");
            None
        }
    }
}

fn close(connection: &mut Option<ControlConnection>) {
    if let Some(client) = connection.take() {
        info!("closing connection to {}", client.peer());
    }
}

async fn until(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn next_notification(notifications: &mut Option<Notifications>) -> Option<Vec<u8>> {
    match notifications {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_message(
    connection: &mut Option<ControlConnection>,
) -> io::Result<Option<Vec<u8>>> {
    match connection {
        Some(client) => client.next_message().await,
        None => std::future::pending().await,
    }
}
