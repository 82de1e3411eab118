//! Subscriber setup: logfmt-style lines or JSON, info to stdout, warnings to stderr.

use crate::config::LogFormat;
use crate::error::Result;
use chrono::{SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::{DefaultFields, Writer};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

const SERVICE_NAME: &str = "syntised";
const DEFAULT_FILTER: &str = "syntised=info,info";

pub fn init_tracing(format: LogFormat) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let writer = std::io::stdout
        .with_max_level(tracing::Level::INFO)
        .or_else(std::io::stderr.with_min_level(tracing::Level::WARN));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .with_writer(writer);

    let installed = match format {
        LogFormat::Text => builder
            .event_format(LogfmtFormatter {
                service: SERVICE_NAME,
            })
            .fmt_fields(DefaultFields::new())
            .try_init(),
        LogFormat::Json => builder
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .try_init(),
    };

    installed.map_err(|err| crate::err!("failed to initialise tracing subscriber: {err}"))
}

/// `ts=.. level=.. service=.. component=.. msg=.. <fields sorted by name>`
struct LogfmtFormatter {
    service: &'static str,
}

impl<S, N> FormatEvent<S, N> for LogfmtFormatter
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let mut fields = CollectedFields::default();
        event.record(&mut fields);

        let mut line = String::with_capacity(160);
        push_field(
            &mut line,
            "ts",
            &Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        push_field(&mut line, "level", metadata.level().as_str());
        push_field(&mut line, "service", self.service);
        push_field(
            &mut line,
            "component",
            metadata
                .target()
                .strip_prefix("syntised::")
                .unwrap_or(metadata.target()),
        );
        push_field(
            &mut line,
            "msg",
            fields.message.as_deref().unwrap_or(metadata.name()),
        );
        for (key, value) in &fields.values {
            push_field(&mut line, key, value);
        }

        writeln!(writer, "{line}")
    }
}

#[derive(Default)]
struct CollectedFields {
    message: Option<String>,
    values: BTreeMap<&'static str, String>,
}

impl CollectedFields {
    fn insert(&mut self, field: &Field, value: String) {
        match field.name() {
            "" => {}
            "message" => self.message = Some(value),
            name => {
                self.values.insert(name, value);
            }
        }
    }
}

impl Visit for CollectedFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, value.to_string());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, format!("{value:?}"));
    }
}

fn push_field(buffer: &mut String, key: &str, value: &str) {
    if !buffer.is_empty() {
        buffer.push(' ');
    }
    buffer.push_str(key);
    buffer.push('=');
    encode_value(buffer, value);
}

fn encode_value(buffer: &mut String, value: &str) {
    let quoted = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '"' | '\\' | '='));
    if !quoted {
        buffer.push_str(value);
        return;
    }

    buffer.push('"');
    for ch in value.chars() {
        match ch {
            '"' => buffer.push_str("\\\""),
            '\\' => buffer.push_str("\\\\"),
            '\n' => buffer.push_str("\\n"),
            '\r' => buffer.push_str("\\r"),
            '\t' => buffer.push_str("\\t"),
            _ => buffer.push(ch),
        }
    }
    buffer.push('"');
}
