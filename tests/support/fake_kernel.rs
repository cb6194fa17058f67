//! A minimal Jupyter-protocol kernel used only by this crate's integration
//! tests. Binds the shell/control/iopub endpoints itself and writes the
//! connection file at the path given by `-f`, mirroring how a real `ipykernel`
//! process behaves when launched the way `Session::start` launches it.
//!
//! Not part of the library's public surface: built as a `[[bin]]` target so
//! integration tests can spawn it via `env!("CARGO_BIN_EXE_fake-kernel")`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, Ordering};

use bytes::Bytes;
use kernel_client_core::codec::{
    Codec, Content, ExecuteReply, Header, InterruptReply, KernelInfoReply, KernelStatus,
    LanguageInfo, Message, Reply, Status, Stream,
};
use tokio::net::TcpListener;
use zeromq::{Socket, SocketRecv, SocketSend, ZmqMessage};

async fn available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .await
        .expect("could not bind an ephemeral port")
        .local_addr()
        .expect("bound listener has a local address")
        .port()
}

fn frames_to_zmq(frames: Vec<Bytes>) -> ZmqMessage {
    ZmqMessage::try_from(frames).expect("non-empty frame list")
}

fn zmq_to_frames(msg: ZmqMessage) -> Vec<Bytes> {
    msg.into_vec()
}

fn delimiter_index(frames: &[Bytes]) -> usize {
    frames
        .iter()
        .position(|f| f.as_ref() == kernel_client_core::codec::DELIMITER)
        .expect("fake kernel only receives frames this crate produced")
}

fn header_for(msg_type: kernel_client_core::codec::MessageType, msg: &Message) -> Header {
    Header {
        msg_id: uuid::Uuid::new_v4().to_string(),
        session: msg.header.session.clone(),
        username: "fake-kernel".to_string(),
        date: time::OffsetDateTime::now_utc(),
        msg_type,
        version: kernel_client_core::codec::PROTOCOL_VERSION.to_string(),
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let connection_file = args
        .iter()
        .position(|a| a == "-f")
        .and_then(|i| args.get(i + 1))
        .expect("fake-kernel requires -f <connection_file>")
        .clone();

    let shell_port = available_port().await;
    let control_port = available_port().await;
    let iopub_port = available_port().await;
    let stdin_port = available_port().await;
    let hb_port = available_port().await;
    let key = uuid::Uuid::new_v4().to_string();

    let connection_json = serde_json::json!({
        "transport": "tcp",
        "ip": "127.0.0.1",
        "shell_port": shell_port,
        "iopub_port": iopub_port,
        "control_port": control_port,
        "stdin_port": stdin_port,
        "hb_port": hb_port,
        "key": key,
        "signature_scheme": "hmac-sha256",
    });
    tokio::fs::write(&connection_file, connection_json.to_string())
        .await
        .expect("could not write connection file");

    let mut shell = zeromq::RouterSocket::new();
    shell
        .bind(&format!("tcp://127.0.0.1:{shell_port}"))
        .await
        .expect("could not bind shell socket");
    let mut control = zeromq::RouterSocket::new();
    control
        .bind(&format!("tcp://127.0.0.1:{control_port}"))
        .await
        .expect("could not bind control socket");
    let mut iopub = zeromq::PubSocket::new();
    iopub
        .bind(&format!("tcp://127.0.0.1:{iopub_port}"))
        .await
        .expect("could not bind iopub socket");

    let codec = Codec::new(&key);
    let execution_count = AtomicI32::new(0);

    let control_fut = async {
        loop {
            let Ok(received) = control.recv().await else { break };
            let frames = zmq_to_frames(received);
            let idx = delimiter_index(&frames);
            let identity = frames[..idx].to_vec();
            let Ok(request) = codec.parse(&frames) else { continue };

            if let Content::InterruptRequest(_) = request.content {
                let reply = Message {
                    header: header_for(kernel_client_core::codec::MessageType::InterruptReply, &request),
                    parent_header: Some(request.header.clone()),
                    metadata: BTreeMap::new(),
                    content: Content::InterruptReply(Reply::Ok(InterruptReply {})),
                    buffers: Vec::new(),
                };
                let Ok(out_frames) = codec.serialize(&reply) else { continue };
                let mut out = identity.clone();
                out.extend(out_frames);
                let _ = control.send(frames_to_zmq(out)).await;
            }
        }
    };

    let shell_fut = async {
        loop {
            let Ok(received) = shell.recv().await else { break };
            let frames = zmq_to_frames(received);
            let idx = delimiter_index(&frames);
            let identity = frames[..idx].to_vec();
            let Ok(request) = codec.parse(&frames) else { continue };

            match request.content {
                Content::KernelInfoRequest(_) => {
                    let reply = Message {
                        header: header_for(kernel_client_core::codec::MessageType::KernelInfoReply, &request),
                        parent_header: Some(request.header.clone()),
                        metadata: BTreeMap::new(),
                        content: Content::KernelInfoReply(Reply::Ok(KernelInfoReply {
                            protocol_version: kernel_client_core::codec::PROTOCOL_VERSION
                                .to_string(),
                            implementation: "fake-kernel".to_string(),
                            implementation_version: "0.1.0".to_string(),
                            language_info: LanguageInfo {
                                name: "python".to_string(),
                                version: "3.11.0".to_string(),
                                mimetype: "text/x-python".to_string(),
                                file_extension: ".py".to_string(),
                            },
                            banner: "fake kernel for integration tests".to_string(),
                            debugger: false,
                        })),
                        buffers: Vec::new(),
                    };
                    if let Ok(out_frames) = codec.serialize(&reply) {
                        let mut out = identity;
                        out.extend(out_frames);
                        let _ = shell.send(frames_to_zmq(out)).await;
                    }
                }
                Content::ExecuteRequest(exec) => {
                    let busy = Message {
                        header: header_for(kernel_client_core::codec::MessageType::Status, &request),
                        parent_header: Some(request.header.clone()),
                        metadata: BTreeMap::new(),
                        content: Content::Status(Status {
                            execution_state: KernelStatus::Busy,
                        }),
                        buffers: Vec::new(),
                    };
                    if let Ok(f) = codec.serialize(&busy) {
                        let _ = iopub.send(frames_to_zmq(f)).await;
                    }

                    if exec.code.contains("raise") {
                        let error = Message {
                            header: header_for(kernel_client_core::codec::MessageType::Error, &request),
                            parent_header: Some(request.header.clone()),
                            metadata: BTreeMap::new(),
                            content: Content::Error(kernel_client_core::codec::ErrorContent {
                                ename: "RuntimeError".to_string(),
                                evalue: "boom".to_string(),
                                traceback: vec!["Traceback (most recent call last)".to_string()],
                            }),
                            buffers: Vec::new(),
                        };
                        if let Ok(f) = codec.serialize(&error) {
                            let _ = iopub.send(frames_to_zmq(f)).await;
                        }
                    } else {
                        let stream = Message {
                            header: header_for(kernel_client_core::codec::MessageType::Stream, &request),
                            parent_header: Some(request.header.clone()),
                            metadata: BTreeMap::new(),
                            content: Content::Stream(Stream {
                                name: "stdout".to_string(),
                                text: format!("{}\n", exec.code),
                            }),
                            buffers: Vec::new(),
                        };
                        if let Ok(f) = codec.serialize(&stream) {
                            let _ = iopub.send(frames_to_zmq(f)).await;
                        }
                    }

                    let count = execution_count.fetch_add(1, Ordering::SeqCst) + 1;
                    let reply = Message {
                        header: header_for(kernel_client_core::codec::MessageType::ExecuteReply, &request),
                        parent_header: Some(request.header.clone()),
                        metadata: BTreeMap::new(),
                        content: Content::ExecuteReply(Reply::Ok(ExecuteReply {
                            execution_count: count,
                            user_expressions: BTreeMap::new(),
                        })),
                        buffers: Vec::new(),
                    };
                    if let Ok(out_frames) = codec.serialize(&reply) {
                        let mut out = identity;
                        out.extend(out_frames);
                        let _ = shell.send(frames_to_zmq(out)).await;
                    }

                    let idle = Message {
                        header: header_for(kernel_client_core::codec::MessageType::Status, &request),
                        parent_header: Some(request.header.clone()),
                        metadata: BTreeMap::new(),
                        content: Content::Status(Status {
                            execution_state: KernelStatus::Idle,
                        }),
                        buffers: Vec::new(),
                    };
                    if let Ok(f) = codec.serialize(&idle) {
                        let _ = iopub.send(frames_to_zmq(f)).await;
                    }
                }
                _ => {}
            }
        }
    };

    tokio::join!(shell_fut, control_fut);
}
