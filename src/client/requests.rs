//! Typed request builders and reply views.
//!
//! The wire layer carries content as an opaque JSON tree; these helpers are
//! the typed boundary for the standard message types. Builders produce
//! `(msg_type, content)` pairs; views decode the fields a caller actually
//! needs and leave the rest in place.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::session::Message;
use crate::types::{Error, Result};

/// Options for an `execute_request`.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub silent: bool,
    pub store_history: bool,
    pub user_expressions: Value,
    pub allow_stdin: bool,
    pub stop_on_error: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            silent: false,
            store_history: true,
            user_expressions: json!({}),
            allow_stdin: true,
            stop_on_error: true,
        }
    }
}

pub fn execute_request(code: &str, opts: &ExecuteOptions) -> (&'static str, Value) {
    (
        "execute_request",
        json!({
            "code": code,
            "silent": opts.silent,
            "store_history": opts.store_history,
            "user_expressions": opts.user_expressions,
            "allow_stdin": opts.allow_stdin,
            "stop_on_error": opts.stop_on_error,
        }),
    )
}

pub fn inspect_request(code: &str, cursor_pos: usize, detail_level: u8) -> (&'static str, Value) {
    (
        "inspect_request",
        json!({
            "code": code,
            "cursor_pos": cursor_pos,
            "detail_level": detail_level,
        }),
    )
}

pub fn complete_request(code: &str, cursor_pos: usize) -> (&'static str, Value) {
    (
        "complete_request",
        json!({ "code": code, "cursor_pos": cursor_pos }),
    )
}

pub fn history_request(n: usize, raw: bool, output: bool) -> (&'static str, Value) {
    (
        "history_request",
        json!({
            "hist_access_type": "tail",
            "n": n,
            "raw": raw,
            "output": output,
        }),
    )
}

pub fn kernel_info_request() -> (&'static str, Value) {
    ("kernel_info_request", json!({}))
}

pub fn comm_info_request(target_name: Option<&str>) -> (&'static str, Value) {
    let content = match target_name {
        Some(name) => json!({ "target_name": name }),
        None => json!({}),
    };
    ("comm_info_request", content)
}

pub fn is_complete_request(code: &str) -> (&'static str, Value) {
    ("is_complete_request", json!({ "code": code }))
}

pub fn shutdown_request(restart: bool) -> (&'static str, Value) {
    ("shutdown_request", json!({ "restart": restart }))
}

pub fn interrupt_request() -> (&'static str, Value) {
    ("interrupt_request", json!({}))
}

pub fn debug_request(content: Value) -> (&'static str, Value) {
    ("debug_request", content)
}

pub fn input_reply(value: &str) -> (&'static str, Value) {
    ("input_reply", json!({ "value": value }))
}

/// An `input_reply` telling the kernel no input is coming.
pub fn input_abort_reply() -> (&'static str, Value) {
    ("input_reply", json!({ "status": "abort", "value": "" }))
}

// ── Reply views ──────────────────────────────────────────────────────────

fn view<T: serde::de::DeserializeOwned>(msg: &Message, expected_type: &str) -> Result<T> {
    if msg.msg_type() != expected_type {
        return Err(Error::validation(format!(
            "expected {} but got {}",
            expected_type,
            msg.msg_type()
        )));
    }
    serde_json::from_value::<T>(msg.content.clone()).map_err(Error::from)
}

/// Decoded `kernel_info_reply`.
#[derive(Debug, Clone, Deserialize)]
pub struct KernelInfoReply {
    pub protocol_version: String,
    #[serde(default)]
    pub implementation: String,
    #[serde(default)]
    pub implementation_version: String,
    #[serde(default)]
    pub banner: String,
    #[serde(default)]
    pub language_info: Value,
}

impl KernelInfoReply {
    pub fn from_message(msg: &Message) -> Result<Self> {
        view(msg, "kernel_info_reply")
    }
}

/// Decoded `execute_reply`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteReply {
    pub status: String,
    #[serde(default)]
    pub execution_count: Option<i64>,
    #[serde(default)]
    pub ename: Option<String>,
    #[serde(default)]
    pub evalue: Option<String>,
}

impl ExecuteReply {
    pub fn from_message(msg: &Message) -> Result<Self> {
        view(msg, "execute_reply")
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Decoded `input_request` content.
#[derive(Debug, Clone, Deserialize)]
pub struct InputRequestContent {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub password: bool,
}

/// Decoded `shutdown_reply`.
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownReply {
    pub restart: bool,
}

impl ShutdownReply {
    pub fn from_message(msg: &Message) -> Result<Self> {
        view(msg, "shutdown_reply")
    }
}
