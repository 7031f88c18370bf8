//! Line formatter and subscriber setup for agent diagnostics.
//!
//! Every line the agent emits carries an `APM_AGENT` prefix so agent output
//! stays identifiable when it shares a stream with host application logs:
//!
//! ```text
//! APM_AGENT | LEVEL | [span_name{span_fields}:] message {event_fields}
//! ```
//!
//! ```text
//! APM_AGENT | INFO | harvest cycle started report_period=60s
//! APM_AGENT | DEBUG | harvest{kind=span}: flushed events retained=102
//! ```
//!
//! [`install`] wires the formatter into a global `tracing` subscriber at the
//! configured level, with `RUST_LOG` taking precedence when set. Hosts that
//! already own a subscriber can mount [`Formatter`] on their own stack via
//! `event_format` instead:
//!
//! ```rust,ignore
//! apm_agent_core::logger::install(config.log_level)?;
//! ```

use std::fmt;

use tracing::subscriber::SetGlobalDefaultError;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::{FmtContext, FormattedFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::config::log_level::LogLevel;

/// Event formatter that marks each line with the `APM_AGENT` prefix.
///
/// Spans enclosing the event are printed from the outermost inward, each
/// with its fields in braces, so nested operations keep their context.
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
        write!(writer, "APM_AGENT | {} | ", event.metadata().level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;

                // The fmt layer renders span fields once at span creation
                // and parks the result in the span's extensions.
                let extensions = span.extensions();
                if let Some(fields) = extensions.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                writer.write_str(": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Installs a global subscriber that renders through [`Formatter`].
///
/// `level` sets the default verbosity; a `RUST_LOG` value in the environment
/// overrides it. Fails if a global subscriber has already been set, so hosts
/// with their own logging keep it.
pub fn install(level: LogLevel) -> Result<(), SetGlobalDefaultError> {
    let filter = EnvFilter::builder()
        .with_default_directive(level.as_level_filter().into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .event_format(Formatter)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
}
