use std::path::Path;

use ansi_term::{Colour, Style};
use snafu::{ResultExt, Snafu};

use tracing_core::{event::Event, Metadata};
use tracing_log::{LogTracer, NormalizeEvent};
use tracing_subscriber::{
    fmt::{
        format::{FmtSpan, FormatEvent, FormatFields, Writer},
        FmtContext,
        FormattedFields,
    },
    registry::LookupSpan,
    EnvFilter,
};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LoggerError {
    #[snafu(display("Failed to install the log bridge: {}", source))]
    Bridge { source: log::SetLoggerError },
    #[snafu(display("Failed to install the subscriber: {}", source))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
}

// Custom struct used to format the log/trace LEVEL
struct FormatLevel<'a> {
    level: &'a tracing::Level,
    ansi: bool,
}

impl<'a> FormatLevel<'a> {
    fn new(level: &'a tracing::Level, ansi: bool) -> Self {
        Self {
            level,
            ansi,
        }
    }
}

// Display trace LEVEL.
impl std::fmt::Display for FormatLevel<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const TRACE: &str = "TRACE";
        const DEBUG: &str = "DEBUG";
        const INFO: &str = " INFO";
        const WARN: &str = " WARN";
        const ERROR: &str = "ERROR";

        if self.ansi {
            match *self.level {
                tracing::Level::TRACE => {
                    write!(f, "{}", Colour::Purple.paint(TRACE))
                }
                tracing::Level::DEBUG => {
                    write!(f, "{}", Colour::Blue.paint(DEBUG))
                }
                tracing::Level::INFO => {
                    write!(f, "{}", Colour::Green.paint(INFO))
                }
                tracing::Level::WARN => {
                    write!(f, "{}", Colour::Yellow.paint(WARN))
                }
                tracing::Level::ERROR => {
                    write!(f, "{}", Colour::Red.paint(ERROR))
                }
            }
        } else {
            match *self.level {
                tracing::Level::TRACE => f.pad(TRACE),
                tracing::Level::DEBUG => f.pad(DEBUG),
                tracing::Level::INFO => f.pad(INFO),
                tracing::Level::WARN => f.pad(WARN),
                tracing::Level::ERROR => f.pad(ERROR),
            }
        }
    }
}

// Span context of an event, e.g. the recall or the file it is logged for.
struct SpanContext<'a, S, N>
where
    S: tracing_core::subscriber::Subscriber + for<'s> LookupSpan<'s>,
    N: for<'w> FormatFields<'w> + 'static,
{
    context: &'a FmtContext<'a, S, N>,
    span: Option<&'a tracing_core::span::Id>,
    ansi: bool,
}

impl<'a, S, N> SpanContext<'a, S, N>
where
    S: tracing_core::subscriber::Subscriber + for<'s> LookupSpan<'s>,
    N: for<'w> FormatFields<'w> + 'static,
{
    fn new(
        context: &'a FmtContext<'a, S, N>,
        span: Option<&'a tracing_core::span::Id>,
        ansi: bool,
    ) -> Self {
        Self {
            context,
            span,
            ansi,
        }
    }
}

impl<'a, S, N> std::fmt::Display for SpanContext<'a, S, N>
where
    S: tracing_core::subscriber::Subscriber + for<'s> LookupSpan<'s>,
    N: for<'w> FormatFields<'w> + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bold = if self.ansi {
            Style::new().bold()
        } else {
            Style::new()
        };
        let scope = self
            .span
            .and_then(|id| self.context.span(id))
            .or_else(|| self.context.lookup_current())
            .into_iter()
            .flat_map(|span| span.scope().from_root());

        for span in scope {
            write!(f, ":{}", bold.paint(span.metadata().name()))?;

            let extensions = span.extensions();
            if let Some(fields) = extensions.get::<FormattedFields<N>>() {
                if !fields.is_empty() {
                    write!(f, "{}{}{}", bold.paint("{"), fields, bold.paint("}"))?;
                }
            }
        }

        Ok(())
    }
}

fn basename(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(path)
}

// Callsite location (filename and line number)
struct Location<'a> {
    meta: &'a Metadata<'a>,
}

impl<'a> Location<'a> {
    fn new(meta: &'a Metadata<'a>) -> Self {
        Self {
            meta,
        }
    }
}

impl std::fmt::Display for Location<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let (Some(file), Some(line)) = (self.meta.file(), self.meta.line()) {
            write!(f, ":{}:{}", basename(file), line)?;
        }
        Ok(())
    }
}

struct EngineFormat {
    ansi: bool,
}

impl<S, N> FormatEvent<S, N> for EngineFormat
where
    S: tracing_core::subscriber::Subscriber + for<'s> LookupSpan<'s>,
    N: for<'w> FormatFields<'w> + 'static,
{
    fn format_event(
        &self,
        context: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let normalized = event.normalized_metadata();
        let meta = normalized.as_ref().unwrap_or_else(|| event.metadata());

        write!(
            writer,
            "[{} {} {}{}{}] ",
            chrono::Local::now().format("%FT%T%.9f%Z"),
            FormatLevel::new(meta.level(), self.ansi),
            meta.target(),
            SpanContext::new(context, event.parent(), self.ansi),
            Location::new(meta)
        )?;

        context.format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Configures the logging format. The level given is used unless `RUST_LOG`
/// is set, i.e `RUST_LOG=pnfs_engine=trace` prints every trace!() of the
/// crate.
///
/// Records sent through the `log` facade by third party crates are turned
/// into trace events. Fails if a logger or subscriber is already installed.
pub fn init(level: &str) -> Result<(), LoggerError> {
    LogTracer::init().context(BridgeSnafu)?;

    let format = EngineFormat {
        ansi: atty::is(atty::Stream::Stdout),
    };

    let builder = tracing_subscriber::fmt::Subscriber::builder()
        .with_span_events(FmtSpan::CLOSE)
        .event_format(format);

    let subscriber = match EnvFilter::try_from_default_env() {
        Ok(filter) => builder.with_env_filter(filter).finish(),
        Err(_) => builder.with_env_filter(level).finish(),
    };

    tracing::subscriber::set_global_default(subscriber).context(SubscriberSnafu)
}
