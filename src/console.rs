//! Terminal output sink.

use std::io::Write;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::encoding::to_single_line;
use crate::envelope::{Envelope, Level, Record};
use crate::pipeline::Sink;
use crate::Result;

/// Level-routed terminal output.
///
/// Debug and info lines go to stdout, warn and error lines to stderr. Event
/// records serialize the entire envelope as one line of JSON. Write failures
/// are swallowed; a closed pipe must not take telemetry down.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleSink;

impl ConsoleSink {
    pub fn new() -> Self {
        Self
    }

    fn render_log(&self, envelope: &Envelope) -> Option<(Level, String)> {
        let Record::Log(log) = &envelope.record else {
            return None;
        };

        let mut line = format!(
            "{} {:<5} {}",
            format_ts(envelope.ts()),
            log.level.as_str().to_uppercase(),
            log.msg
        );
        if let Some(data) = &log.data {
            line.push(' ');
            line.push_str(&to_single_line(&Value::Object(data.clone())));
        }
        if let Some(err) = &log.err {
            line.push_str(" err=");
            line.push_str(&to_single_line(err));
        }
        if !envelope.ctx.is_empty() {
            line.push_str(" ctx=");
            line.push_str(&to_single_line(&Value::Object(envelope.ctx.clone())));
        }
        Some((log.level, line))
    }
}

fn format_ts(ts_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ts_ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| ts_ms.to_string())
}

#[async_trait]
impl Sink for ConsoleSink {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn deliver(&self, envelope: &Envelope) -> Result<()> {
        match &envelope.record {
            Record::Log(_) => {
                if let Some((level, line)) = self.render_log(envelope) {
                    match level {
                        Level::Debug | Level::Info => {
                            let _ = writeln!(std::io::stdout(), "{line}");
                        }
                        Level::Warn | Level::Error => {
                            let _ = writeln!(std::io::stderr(), "{line}");
                        }
                    }
                }
            }
            Record::Event(_) => {
                let line = serde_json::to_value(envelope)
                    .map(|value| to_single_line(&value))
                    .unwrap_or_default();
                let _ = writeln!(std::io::stdout(), "{line}");
            }
        }
        Ok(())
    }
}
