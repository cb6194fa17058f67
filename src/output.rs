//! Kernel outputs, normalized from the various iopub broadcast messages into
//! a single tagged type.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::codec::{DisplayData, ErrorContent, ExecuteResult, Stream};

/// MIME types considered for a display-data payload, richest first. The
/// first one present in the payload's `data` map wins.
const MIME_PRIORITY: &[&str] = &[
    "image/png",
    "image/jpeg",
    "text/html",
    "application/json",
    "text/plain",
];

/// A single piece of output produced by a kernel while executing code.
#[derive(Clone, Debug, PartialEq)]
pub enum Output {
    /// Text written to the kernel's stdout.
    Stdout(String),
    /// Text written to the kernel's stderr.
    Stderr(String),
    /// The value of the last expression in an executed cell.
    Result {
        /// The MIME type of `data`.
        mime: String,
        /// The representation in that MIME type.
        data: Value,
    },
    /// Rich display data, such as an image or an HTML snippet.
    Display {
        /// The MIME type of `data`.
        mime: String,
        /// The representation in that MIME type.
        data: Value,
    },
    /// An exception raised while executing code.
    Error {
        /// Exception type name, e.g. `"ValueError"`.
        ename: String,
        /// Exception message.
        evalue: String,
        /// Traceback frames.
        traceback: Vec<String>,
    },
}

/// Pick the richest available representation from a display-data payload,
/// in the MIME priority order documented on [`MIME_PRIORITY`].
fn select_representation(data: &BTreeMap<String, Value>) -> Option<(String, Value)> {
    MIME_PRIORITY
        .iter()
        .find_map(|mime| data.get(*mime).map(|v| (mime.to_string(), v.clone())))
}

impl Output {
    /// Build the output for a `stream` message.
    pub fn from_stream(stream: Stream) -> Self {
        if stream.name == "stderr" {
            Output::Stderr(stream.text)
        } else {
            Output::Stdout(stream.text)
        }
    }

    /// Build the output for an `execute_result` message. Returns `None` when
    /// the payload has no representation this crate recognizes.
    pub fn from_execute_result(result: ExecuteResult) -> Option<Self> {
        let (mime, data) = select_representation(&result.data)?;
        Some(Output::Result { mime, data })
    }

    /// Build the output for a `display_data` message. A plain-text-only
    /// payload degrades to [`Output::Result`], matching how such payloads
    /// render as the value of an expression rather than as rich media.
    /// Returns `None` when the payload has no recognized representation.
    pub fn from_display_data(display: DisplayData) -> Option<Self> {
        let (mime, data) = select_representation(&display.data)?;
        if mime == "text/plain" {
            Some(Output::Result { mime, data })
        } else {
            Some(Output::Display { mime, data })
        }
    }

    /// Build the output for an `error` message.
    pub fn from_error(error: ErrorContent) -> Self {
        Output::Error {
            ename: error.ename,
            evalue: error.evalue,
            traceback: error.traceback,
        }
    }
}
