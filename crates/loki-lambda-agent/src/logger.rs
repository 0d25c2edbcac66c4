//! Tracing setup for the extension's own diagnostics.
//!
//! Every diagnostic line serves two audiences:
//!
//! 1. **CloudWatch** — the line goes to stdout with a fixed
//!    `LOKI_EXTENSION | LEVEL | message` shape so it is easy to filter
//!    alongside function output.
//! 2. **Loki** — the same line is mirrored straight into the shared
//!    [`LogBuffer`], because the Telemetry API does not deliver an
//!    extension's own stdout back to that extension.
//!
//! The `LOKI_EXTENSION | ` prefix doubles as the self-dedup marker: the
//! telemetry receiver drops any `extension` event whose message contains it,
//! so lines mirrored here are never double-counted if the platform echoes
//! them. Keeping the marker and the formatter in one module is what keeps
//! producer and consumer in lockstep.
//!
//! The buffer is attached once, after construction ([`attach_buffer`]);
//! events emitted before that only reach stdout.

use std::fmt;
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use tracing_core::field::{Field, Visit};
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::buffer::{EntryKind, LogBuffer, LogEntry};

/// Marker identifying the agent's own diagnostic lines.
///
/// Written by [`Formatter`] and [`BufferMirrorLayer`], matched by the
/// telemetry receiver's self-dedup check.
pub const SELF_LOG_MARKER: &str = "LOKI_EXTENSION | ";

static LOG_BUFFER: OnceLock<Arc<LogBuffer>> = OnceLock::new();

/// Attaches the shared buffer that diagnostic lines are mirrored into.
/// Later calls are ignored; the buffer is attached once per process.
pub fn attach_buffer(buffer: Arc<LogBuffer>) {
    let _ = LOG_BUFFER.set(buffer);
}

/// Installs the global subscriber: env-filtered, stdout-formatted, mirrored.
///
/// `log_level` is a tracing directive (usually just a level name). HTTP
/// internals are filtered out so the agent's own request traffic does not
/// feed back into the pipeline at debug level.
pub fn init(log_level: &str) {
    let env_filter = format!("h2=off,hyper=off,rustls=off,{log_level}");
    let filter = EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().event_format(Formatter))
        .with(BufferMirrorLayer);

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Stdout formatter producing `LOKI_EXTENSION | LEVEL | message` lines.
#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(
            &mut writer,
            "{}{} | ",
            SELF_LOG_MARKER,
            event.metadata().level()
        )?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Layer that mirrors each emitted diagnostic into the attached buffer.
pub struct BufferMirrorLayer;

impl<S: Subscriber> Layer<S> for BufferMirrorLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let Some(buffer) = LOG_BUFFER.get() else {
            return;
        };

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        buffer.add(LogEntry {
            timestamp: Utc::now().timestamp_millis(),
            message: mirror_line(
                event.metadata().level().as_str(),
                &visitor.message,
                &visitor.fields,
            ),
            kind: EntryKind::Extension,
            request_id: String::new(),
        });
        buffer.signal_ready();
    }
}

fn mirror_line(level: &str, message: &str, fields: &str) -> String {
    format!("{SELF_LOG_MARKER}{level} | {message}{fields}")
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        use fmt::Write;
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        use fmt::Write;
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}
