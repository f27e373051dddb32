//! The data types flowing through the pipeline.

use serde::{Deserialize, Serialize};

use crate::context::Ctx;

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A leveled, structured log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: Level,
    pub msg: String,

    /// Structured payload attached at the call site.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Ctx>,

    /// Captured error, shaped by [`crate::encoding::error_value`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<serde_json::Value>,
}

/// A named product/analytics event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub props: Option<Ctx>,
}

/// Either kind of record. The `kind` tag is part of the wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Record {
    Log(LogRecord),
    Event(EventRecord),
}

impl Record {
    pub fn log(level: Level, msg: impl Into<String>, data: Option<Ctx>) -> Self {
        Record::Log(LogRecord {
            level,
            msg: msg.into(),
            data,
            err: None,
        })
    }

    pub fn event(name: impl Into<String>, props: Option<Ctx>) -> Self {
        Record::Event(EventRecord {
            name: name.into(),
            props,
        })
    }

    /// The level of a log record, if this is one.
    pub fn level(&self) -> Option<Level> {
        match self {
            Record::Log(log) => Some(log.level),
            Record::Event(_) => None,
        }
    }

    /// The name of an event record, if this is one.
    pub fn event_name(&self) -> Option<&str> {
        match self {
            Record::Log(_) => None,
            Record::Event(event) => Some(&event.name),
        }
    }
}

/// The unit of work flowing through the pipeline: a creation timestamp, a
/// context snapshot, and a record.
///
/// Envelopes are mutable by design. Middlewares rewrite `ctx`, replace
/// sub-trees, or augment record fields in place. The timestamp is fixed at
/// creation and exposes no mutator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    ts: i64,
    pub ctx: Ctx,
    pub record: Record,
}

impl Envelope {
    pub fn new(ts: i64, ctx: Ctx, record: Record) -> Self {
        Self { ts, ctx, record }
    }

    /// Creation time in epoch milliseconds.
    pub fn ts(&self) -> i64 {
        self.ts
    }
}
