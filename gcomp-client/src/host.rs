//! Line protocol with the host process over the client's standard I/O.

use crate::session::{SessionEvent, SessionHandle};
use gcomp_common::{ClientMessage, HostCommand, to_line};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

#[derive(Debug)]
pub enum HostOutput {
    Message(ClientMessage),
    /// Acknowledged once every earlier message is written.
    Flush(oneshot::Sender<()>),
}

/// Sends messages to the host. Cheap to clone.
#[derive(Debug, Clone)]
pub struct HostSender {
    tx: mpsc::UnboundedSender<HostOutput>,
}

impl HostSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<HostOutput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, message: ClientMessage) {
        debug!(action = message.action(), "to host");
        if self.tx.send(HostOutput::Message(message)).is_err() {
            warn!("host writer is gone, dropping message");
        }
    }

    /// Wait until everything sent so far has been written.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(HostOutput::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

/// Write host messages as JSON lines.
pub fn spawn_host_writer<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<HostOutput>) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(output) = rx.recv().await {
            match output {
                HostOutput::Message(message) => {
                    let line = match to_line(&message) {
                        Ok(line) => line,
                        Err(e) => {
                            error!(error = %e, "failed to encode host message");
                            continue;
                        }
                    };
                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                        error!(error = %e, "failed to write to host");
                        break;
                    }
                    let _ = writer.flush().await;
                }
                HostOutput::Flush(ack) => {
                    let _ = writer.flush().await;
                    let _ = ack.send(());
                }
            }
        }
    })
}

/// Read host commands and post them to the session.
pub fn spawn_host_reader<R>(reader: R, session: SessionHandle) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<HostCommand>(&line) {
                        Ok(command) => session.post(SessionEvent::Host(command)),
                        Err(e) => {
                            warn!(error = %e, "unparsable host message");
                            session.post(SessionEvent::HostProtocolError(e.to_string()));
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "failed to read from host");
                    break;
                }
            }
        }
        session.post(SessionEvent::HostClosed);
    })
}
