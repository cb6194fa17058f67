//! Jupyter wire protocol framing: message shapes, JSON encoding, and HMAC
//! signing/verification.
//!
//! See the [Messaging in Jupyter](https://jupyter-client.readthedocs.io/en/stable/messaging.html)
//! page for the on-the-wire layout this module implements. A signed message
//! is a list of frames:
//!
//! ```text
//! [zero or more routing identities]
//! <IDS|MSG>
//! signature
//! header
//! parent_header
//! metadata
//! content
//! [buffers...]
//! ```

use std::collections::BTreeMap;

use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{Error, Result};

/// The delimiter frame that separates routing identities from the signed part
/// of the message.
pub const DELIMITER: &[u8] = b"<IDS|MSG>";

/// Protocol version stamped on every outbound header.
pub const PROTOCOL_VERSION: &str = "5.3";

type HmacSha256 = Hmac<Sha256>;

/// Type of a message, dispatched on the `msg_type` header field.
///
/// On the wire this is always a plain JSON string (the literal `msg_type`
/// value), never a tagged object, so this has a hand-written `Serialize`/
/// `Deserialize` rather than a derive: an unrecognized string round-trips
/// through [`MessageType::Other`] instead of failing to decode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageType {
    /// Request for kernel implementation/language metadata.
    KernelInfoRequest,
    /// Reply to a `kernel_info_request`.
    KernelInfoReply,
    /// Execute a block of code.
    ExecuteRequest,
    /// Reply to an `execute_request`.
    ExecuteReply,
    /// Interrupt the kernel's current operation.
    InterruptRequest,
    /// Reply to an `interrupt_request`.
    InterruptReply,
    /// Request kernel shutdown, possibly to prepare for a restart.
    ShutdownRequest,
    /// Reply to a `shutdown_request`.
    ShutdownReply,
    /// Broadcast kernel state transition (starting/idle/busy).
    Status,
    /// Broadcast stream output (stdout/stderr).
    Stream,
    /// Broadcast rich display data.
    DisplayData,
    /// Broadcast the result of an execution.
    ExecuteResult,
    /// Broadcast an error raised during execution.
    Error,
    /// Any other message type this crate does not otherwise recognize.
    Other(String),
}

impl MessageType {
    fn as_wire_str(&self) -> &str {
        match self {
            MessageType::KernelInfoRequest => "kernel_info_request",
            MessageType::KernelInfoReply => "kernel_info_reply",
            MessageType::ExecuteRequest => "execute_request",
            MessageType::ExecuteReply => "execute_reply",
            MessageType::InterruptRequest => "interrupt_request",
            MessageType::InterruptReply => "interrupt_reply",
            MessageType::ShutdownRequest => "shutdown_request",
            MessageType::ShutdownReply => "shutdown_reply",
            MessageType::Status => "status",
            MessageType::Stream => "stream",
            MessageType::DisplayData => "display_data",
            MessageType::ExecuteResult => "execute_result",
            MessageType::Error => "error",
            MessageType::Other(s) => s,
        }
    }

    fn from_wire_str(s: &str) -> Self {
        match s {
            "kernel_info_request" => MessageType::KernelInfoRequest,
            "kernel_info_reply" => MessageType::KernelInfoReply,
            "execute_request" => MessageType::ExecuteRequest,
            "execute_reply" => MessageType::ExecuteReply,
            "interrupt_request" => MessageType::InterruptRequest,
            "interrupt_reply" => MessageType::InterruptReply,
            "shutdown_request" => MessageType::ShutdownRequest,
            "shutdown_reply" => MessageType::ShutdownReply,
            "status" => MessageType::Status,
            "stream" => MessageType::Stream,
            "display_data" => MessageType::DisplayData,
            "execute_result" => MessageType::ExecuteResult,
            "error" => MessageType::Error,
            other => MessageType::Other(other.to_string()),
        }
    }
}

impl Serialize for MessageType {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_wire_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(MessageType::from_wire_str(&s))
    }
}

/// The header present on every message and, when applicable, copied as the
/// `parent_header` of any message sent in response to it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Unique identifier of this message.
    pub msg_id: String,
    /// Identifier shared by every message in one client session.
    pub session: String,
    /// Username of the sender. Not authenticated; informational only.
    pub username: String,
    /// ISO-8601 creation timestamp.
    #[serde(with = "time::serde::iso8601")]
    pub date: OffsetDateTime,
    /// The message type.
    pub msg_type: MessageType,
    /// Messaging protocol version.
    pub version: String,
}

/// A message sent to or received from a kernel.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// This message's own header.
    pub header: Header,
    /// The header of the request this message responds to, if any.
    pub parent_header: Option<Header>,
    /// Free-form metadata, empty unless a caller populates it.
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Type-specific payload.
    pub content: Content,
    /// Additional binary buffers, used by display-data extensions.
    pub buffers: Vec<Bytes>,
}

impl Message {
    /// Build a new message of the given type, stamping a fresh id, the
    /// session, the current time, and the protocol version.
    ///
    /// If `parent` is given, its header is copied into `parent_header` for
    /// correlation.
    pub fn build(session: &str, content: Content, parent: Option<&Header>) -> Self {
        Message {
            header: Header {
                msg_id: Uuid::new_v4().to_string(),
                session: session.to_string(),
                username: "kernel-client".to_string(),
                date: OffsetDateTime::now_utc(),
                msg_type: content.message_type(),
                version: PROTOCOL_VERSION.to_string(),
            },
            parent_header: parent.cloned(),
            metadata: BTreeMap::new(),
            content,
            buffers: Vec::new(),
        }
    }
}

/// Type-specific content of a message, dispatched on the header's `msg_type`.
///
/// [`Content::Other`] is the forward-compatibility catch-all for message
/// types this crate does not otherwise need to interpret.
#[derive(Clone, Debug, PartialEq)]
pub enum Content {
    /// See [`KernelInfoRequest`].
    KernelInfoRequest(KernelInfoRequest),
    /// See [`KernelInfoReply`].
    KernelInfoReply(Reply<KernelInfoReply>),
    /// See [`ExecuteRequest`].
    ExecuteRequest(ExecuteRequest),
    /// See [`ExecuteReply`].
    ExecuteReply(Reply<ExecuteReply>),
    /// See [`InterruptRequest`].
    InterruptRequest(InterruptRequest),
    /// See [`InterruptReply`].
    InterruptReply(Reply<InterruptReply>),
    /// See [`ShutdownRequest`].
    ShutdownRequest(ShutdownRequest),
    /// See [`ShutdownReply`].
    ShutdownReply(Reply<ShutdownReply>),
    /// See [`Status`].
    Status(Status),
    /// See [`Stream`].
    Stream(Stream),
    /// See [`DisplayData`].
    DisplayData(DisplayData),
    /// See [`ExecuteResult`].
    ExecuteResult(ExecuteResult),
    /// See [`ErrorContent`].
    Error(ErrorContent),
    /// A message type this crate does not decode, kept as raw JSON.
    Other(serde_json::Value),
}

impl Content {
    fn message_type(&self) -> MessageType {
        match self {
            Content::KernelInfoRequest(_) => MessageType::KernelInfoRequest,
            Content::KernelInfoReply(_) => MessageType::KernelInfoReply,
            Content::ExecuteRequest(_) => MessageType::ExecuteRequest,
            Content::ExecuteReply(_) => MessageType::ExecuteReply,
            Content::InterruptRequest(_) => MessageType::InterruptRequest,
            Content::InterruptReply(_) => MessageType::InterruptReply,
            Content::ShutdownRequest(_) => MessageType::ShutdownRequest,
            Content::ShutdownReply(_) => MessageType::ShutdownReply,
            Content::Status(_) => MessageType::Status,
            Content::Stream(_) => MessageType::Stream,
            Content::DisplayData(_) => MessageType::DisplayData,
            Content::ExecuteResult(_) => MessageType::ExecuteResult,
            Content::Error(_) => MessageType::Error,
            Content::Other(_) => MessageType::Other(String::new()),
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            Content::KernelInfoRequest(c) => serde_json::to_value(c),
            Content::KernelInfoReply(c) => serde_json::to_value(c),
            Content::ExecuteRequest(c) => serde_json::to_value(c),
            Content::ExecuteReply(c) => serde_json::to_value(c),
            Content::InterruptRequest(c) => serde_json::to_value(c),
            Content::InterruptReply(c) => serde_json::to_value(c),
            Content::ShutdownRequest(c) => serde_json::to_value(c),
            Content::ShutdownReply(c) => serde_json::to_value(c),
            Content::Status(c) => serde_json::to_value(c),
            Content::Stream(c) => serde_json::to_value(c),
            Content::DisplayData(c) => serde_json::to_value(c),
            Content::ExecuteResult(c) => serde_json::to_value(c),
            Content::Error(c) => serde_json::to_value(c),
            Content::Other(v) => Ok(v.clone()),
        }
        .expect("content types in this module always serialize")
    }

    fn from_json(msg_type: &MessageType, value: serde_json::Value) -> Result<Self> {
        let decode = |v| serde_json::from_value(v).map_err(|err| Error::Decode(err.to_string()));
        Ok(match msg_type {
            MessageType::KernelInfoRequest => Content::KernelInfoRequest(decode(value)?),
            MessageType::KernelInfoReply => Content::KernelInfoReply(decode(value)?),
            MessageType::ExecuteRequest => Content::ExecuteRequest(decode(value)?),
            MessageType::ExecuteReply => Content::ExecuteReply(decode(value)?),
            MessageType::InterruptRequest => Content::InterruptRequest(decode(value)?),
            MessageType::InterruptReply => Content::InterruptReply(decode(value)?),
            MessageType::ShutdownRequest => Content::ShutdownRequest(decode(value)?),
            MessageType::ShutdownReply => Content::ShutdownReply(decode(value)?),
            MessageType::Status => Content::Status(decode(value)?),
            MessageType::Stream => Content::Stream(decode(value)?),
            MessageType::DisplayData => Content::DisplayData(decode(value)?),
            MessageType::ExecuteResult => Content::ExecuteResult(decode(value)?),
            MessageType::Error => Content::Error(decode(value)?),
            MessageType::Other(_) => Content::Other(value),
        })
    }
}

/// The outcome of a request, wrapping the successful content for a given
/// message type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply<T> {
    /// The request was processed successfully.
    Ok(T),
    /// The request failed with an error.
    Error(ErrorReply),
    /// The kernel aborted the request without further detail. Some kernels
    /// report this as `status: "aborted"` instead of `"abort"`.
    #[serde(alias = "aborted")]
    Abort,
}

/// Error detail carried by a failed reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Exception type name, e.g. `"ValueError"`.
    pub ename: String,
    /// Exception message.
    pub evalue: String,
    /// Traceback frames, usually ANSI-colored for terminal display.
    #[serde(default)]
    pub traceback: Vec<String>,
}

/// Request kernel implementation and language metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelInfoRequest {}

/// Reply to a `kernel_info_request`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelInfoReply {
    /// Version of the Jupyter messaging protocol implemented by the kernel.
    pub protocol_version: String,
    /// Name of the kernel implementation, e.g. `"ipython"`.
    pub implementation: String,
    /// Version of the kernel implementation.
    pub implementation_version: String,
    /// Details about the kernel's programming language.
    pub language_info: LanguageInfo,
    /// Banner text to display when the kernel starts.
    pub banner: String,
    /// Whether the kernel supports the debug adapter protocol.
    #[serde(default)]
    pub debugger: bool,
}

/// Details about the programming language a kernel executes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageInfo {
    /// Name of the language, e.g. `"python"`.
    pub name: String,
    /// Version of the language.
    pub version: String,
    /// MIME type for source files.
    pub mimetype: String,
    /// File extension for source files, including the leading dot.
    pub file_extension: String,
}

/// Execute a block of code on behalf of the user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Source code to run, one or more lines.
    pub code: String,
    /// Execute as quietly as possible: no broadcasts, no history.
    pub silent: bool,
    /// Whether to store the code in the kernel's execution history.
    pub store_history: bool,
    /// Expressions to evaluate in the user's namespace after execution.
    #[serde(default)]
    pub user_expressions: BTreeMap<String, String>,
    /// Whether the kernel may prompt the client for stdin input.
    pub allow_stdin: bool,
    /// Whether to abort any further queued requests if this one errors.
    pub stop_on_error: bool,
}

impl ExecuteRequest {
    /// Build the standard request this crate sends: not silent, stores
    /// history, does not allow stdin, and aborts the queue on error.
    pub fn new(code: impl Into<String>) -> Self {
        ExecuteRequest {
            code: code.into(),
            silent: false,
            store_history: true,
            user_expressions: BTreeMap::new(),
            allow_stdin: false,
            stop_on_error: true,
        }
    }
}

/// Successful reply to an `execute_request`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteReply {
    /// Execution counter, incremented for every request that stores history.
    pub execution_count: i32,
    /// Results of any `user_expressions` in the request.
    #[serde(default)]
    pub user_expressions: BTreeMap<String, serde_json::Value>,
}

/// Request to interrupt the kernel's current operation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptRequest {}

/// Reply to an `interrupt_request`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptReply {}

/// Request to shut down the kernel, possibly to prepare for a restart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownRequest {
    /// Whether this shutdown precedes an immediate restart.
    pub restart: bool,
}

/// Reply to a `shutdown_request`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReply {
    /// Echoes the `restart` flag from the request.
    pub restart: bool,
}

/// Broadcast of a kernel state transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// The state the kernel has entered.
    pub execution_state: KernelStatus,
}

/// States a kernel reports over iopub. Distinct from [`crate::KernelState`],
/// which also tracks states (`starting`, `dead`) the kernel itself never
/// broadcasts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelStatus {
    /// The kernel process has just started.
    Starting,
    /// The kernel is idle and ready for the next request.
    Idle,
    /// The kernel is processing a request.
    Busy,
}

/// Stream output from the kernel, such as stdout or stderr.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stream {
    /// The stream name, `"stdout"` or `"stderr"`.
    pub name: String,
    /// The text written to the stream.
    pub text: String,
}

/// Rich, multi-representation output to be displayed in a frontend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayData {
    /// Map from MIME type to that representation's payload.
    pub data: BTreeMap<String, serde_json::Value>,
    /// Metadata associated with the data, may be empty.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Result of a code execution, such as the value of the last expression.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResult {
    /// Execution counter this result belongs to.
    pub execution_count: i32,
    /// Map from MIME type to that representation's payload.
    pub data: BTreeMap<String, serde_json::Value>,
    /// Metadata associated with the data, may be empty.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// An error raised while executing code, broadcast over iopub.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContent {
    /// Exception type name, e.g. `"ValueError"`.
    pub ename: String,
    /// Exception message.
    pub evalue: String,
    /// Traceback frames.
    #[serde(default)]
    pub traceback: Vec<String>,
}

/// Signs and verifies frame lists, and converts between [`Message`] and the
/// raw frame list that goes over the wire.
///
/// Holds only a signing key; everything else about framing is stateless.
#[derive(Clone)]
pub struct Codec {
    key: Vec<u8>,
    signing_enabled: bool,
}

impl Codec {
    /// Build a codec for the given signing key. An empty key disables
    /// signing: outbound signatures are empty strings and inbound signatures
    /// are not checked, matching how kernels configured this way behave.
    pub fn new(key: &str) -> Self {
        Codec {
            key: key.as_bytes().to_vec(),
            signing_enabled: !key.is_empty(),
        }
    }

    fn sign(&self, parts: &[&[u8]]) -> String {
        if !self.signing_enabled {
            return String::new();
        }
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts keys of any length");
        for part in parts {
            mac.update(part);
        }
        hex::encode(mac.finalize().into_bytes())
    }

    fn verify(&self, parts: &[&[u8]], signature: &str) -> bool {
        if !self.signing_enabled {
            return true;
        }
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts keys of any length");
        for part in parts {
            mac.update(part);
        }
        // `verify_slice` does a constant-time comparison internally.
        mac.verify_slice(&expected).is_ok()
    }

    /// Serialize a message into the ordered frame list sent on the wire,
    /// with no routing-identity frames prepended.
    pub fn serialize(&self, msg: &Message) -> Result<Vec<Bytes>> {
        let header = serde_json::to_vec(&msg.header)
            .map_err(|err| Error::Decode(format!("header: {err}")))?;
        let parent_header = serde_json::to_vec(&msg.parent_header)
            .map_err(|err| Error::Decode(format!("parent_header: {err}")))?;
        let metadata = serde_json::to_vec(&msg.metadata)
            .map_err(|err| Error::Decode(format!("metadata: {err}")))?;
        let content = serde_json::to_vec(&msg.content.to_json())
            .map_err(|err| Error::Decode(format!("content: {err}")))?;

        let signature = self.sign(&[&header, &parent_header, &metadata, &content]);

        let mut frames = vec![
            Bytes::from_static(DELIMITER),
            Bytes::from(signature.into_bytes()),
            Bytes::from(header),
            Bytes::from(parent_header),
            Bytes::from(metadata),
            Bytes::from(content),
        ];
        frames.extend(msg.buffers.iter().cloned());
        Ok(frames)
    }

    /// Parse an inbound frame list into a [`Message`].
    ///
    /// Strips any routing-identity frames up to and including the delimiter,
    /// then verifies the signature over the next four frames before
    /// JSON-decoding each. Rejects on a missing delimiter, a short frame
    /// list, or a signature mismatch.
    pub fn parse(&self, frames: &[Bytes]) -> Result<Message> {
        let delim_idx = frames
            .iter()
            .position(|f| f.as_ref() == DELIMITER)
            .ok_or_else(|| Error::Framing("missing <IDS|MSG> delimiter".to_string()))?;

        let parts = &frames[delim_idx + 1..];
        if parts.len() < 5 {
            return Err(Error::Framing(format!(
                "expected at least 5 frames after delimiter, got {}",
                parts.len()
            )));
        }

        let signature = std::str::from_utf8(&parts[0])
            .map_err(|err| Error::Decode(format!("signature: {err}")))?;
        let header_bytes = &parts[1];
        let parent_header_bytes = &parts[2];
        let metadata_bytes = &parts[3];
        let content_bytes = &parts[4];
        let buffers = parts[5..].to_vec();

        if !self.verify(
            &[header_bytes, parent_header_bytes, metadata_bytes, content_bytes],
            signature,
        ) {
            return Err(Error::SignatureMismatch);
        }

        let header: Header = serde_json::from_slice(header_bytes)
            .map_err(|err| Error::Decode(format!("header: {err}")))?;
        let parent_header: Option<Header> = serde_json::from_slice(parent_header_bytes)
            .map_err(|err| Error::Decode(format!("parent_header: {err}")))?;
        let metadata: BTreeMap<String, serde_json::Value> =
            serde_json::from_slice(metadata_bytes)
                .map_err(|err| Error::Decode(format!("metadata: {err}")))?;
        let content_json: serde_json::Value = serde_json::from_slice(content_bytes)
            .map_err(|err| Error::Decode(format!("content: {err}")))?;
        let content = Content::from_json(&header.msg_type, content_json)?;

        Ok(Message {
            header,
            parent_header,
            metadata,
            content,
            buffers,
        })
    }
}
