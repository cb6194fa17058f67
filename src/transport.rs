//! Owns the three ZeroMQ sockets this crate speaks to a kernel over, and the
//! background task that drains the iopub broadcast channel.
//!
//! See <https://jupyter-client.readthedocs.io/en/stable/messaging.html> for
//! the channel roles. Heartbeat and stdin are part of the full Jupyter wire
//! protocol but are not used by this crate.

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use zeromq::{Socket, SocketRecv, SocketSend, ZmqMessage};

use crate::codec::{Codec, Message};
use crate::connection::ConnectionInfo;
use crate::{Error, Result};

fn frames_to_zmq(frames: Vec<Bytes>) -> Result<ZmqMessage> {
    ZmqMessage::try_from(frames).map_err(|err| Error::Transport(err.to_string()))
}

fn zmq_to_frames(msg: ZmqMessage) -> Vec<Bytes> {
    msg.into_vec()
}

/// The shell and control request/reply sockets.
///
/// Each is a `DealerSocket`: the `zeromq` crate assigns every socket its own
/// routing identity on connect, which is how the kernel tells concurrent
/// clients apart.
pub struct RequestSockets {
    shell: Mutex<zeromq::DealerSocket>,
    control: Mutex<zeromq::DealerSocket>,
}

impl RequestSockets {
    /// Connect the shell and control dealer sockets described by `info`.
    pub async fn connect(info: &ConnectionInfo) -> Result<Self> {
        let mut shell = zeromq::DealerSocket::new();
        shell.connect(&info.endpoint(info.shell_port)).await?;

        let mut control = zeromq::DealerSocket::new();
        control.connect(&info.endpoint(info.control_port)).await?;

        Ok(RequestSockets {
            shell: Mutex::new(shell),
            control: Mutex::new(control),
        })
    }

    /// Send a message on the shell channel and wait for exactly one reply.
    ///
    /// Callers are responsible for serializing concurrent calls: this only
    /// guards the socket itself against concurrent misuse, it does not order
    /// multiple logical requests against each other.
    pub async fn call_shell(&self, codec: &Codec, msg: &Message) -> Result<Message> {
        let mut sock = self.shell.lock().await;
        call(&mut sock, codec, msg).await
    }

    /// Send a message on the control channel and wait for exactly one reply.
    /// Control requests are never serialized against shell requests.
    pub async fn call_control(&self, codec: &Codec, msg: &Message) -> Result<Message> {
        let mut sock = self.control.lock().await;
        call(&mut sock, codec, msg).await
    }
}

async fn call(sock: &mut zeromq::DealerSocket, codec: &Codec, msg: &Message) -> Result<Message> {
    let frames = codec.serialize(msg)?;
    sock.send(frames_to_zmq(frames)?)
        .await
        .map_err(|err| Error::Transport(err.to_string()))?;
    let reply = sock
        .recv()
        .await
        .map_err(|err| Error::Transport(err.to_string()))?;
    codec.parse(&zmq_to_frames(reply))
}

/// Handle to the background task draining the iopub channel. Dropping this
/// (or calling [`IopubListener::stop`]) cancels the task.
pub struct IopubListener {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl IopubListener {
    /// Connect a `SubSocket` to the iopub endpoint, subscribe to every
    /// topic, and spawn a task that parses inbound frames and forwards
    /// successfully decoded messages on `tx`.
    ///
    /// Frames that fail signature verification or JSON decoding are logged
    /// and dropped; this is deliberate so a single corrupt broadcast cannot
    /// tear down the session.
    pub async fn spawn(
        info: &ConnectionInfo,
        codec: Codec,
        tx: mpsc::UnboundedSender<Message>,
    ) -> Result<Self> {
        let mut iopub = zeromq::SubSocket::new();
        iopub.connect(&info.endpoint(info.iopub_port)).await?;
        iopub.subscribe("").await?;

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    received = iopub.recv() => {
                        match received {
                            Ok(payload) => match codec.parse(&zmq_to_frames(payload)) {
                                Ok(msg) => {
                                    if tx.send(msg).is_err() {
                                        break;
                                    }
                                }
                                Err(err) => warn!("dropping malformed iopub message: {err}"),
                            },
                            Err(err) => {
                                if !task_cancel.is_cancelled() {
                                    warn!("iopub socket read failed: {err}");
                                }
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(IopubListener { cancel, handle })
    }

    /// Cancel the listener task and wait for it to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}
