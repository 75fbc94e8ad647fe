//! Log formatting for the cache engine
//!
//! The engine runs work on three kinds of threads (callers, the management
//! thread and the I/O thread), so every line carries the thread name next
//! to the hostname, timestamp and span hierarchy. No ANSI colors are
//! emitted so the output can go straight to a file.

use std::fmt;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

use crate::config::CacheConfig;

/// Event formatter with hostname and thread name prefix
pub struct HostnameFormatter {
    hostname: String,
}

impl HostnameFormatter {
    pub fn new() -> Self {
        let hostname = gethostname::gethostname()
            .to_str()
            .unwrap_or("unknown")
            .to_string();
        Self { hostname }
    }
}

impl Default for HostnameFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, N> FormatEvent<S, N> for HostnameFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();
        let datetime: chrono::DateTime<chrono::Utc> = std::time::SystemTime::now().into();
        let thread = std::thread::current();

        write!(
            writer,
            "[{}] {} {:5} [{}] ",
            self.hostname,
            datetime.format("%Y-%m-%dT%H:%M:%S%.6fZ"),
            meta.level(),
            thread.name().unwrap_or("-")
        )?;

        // Spans are flattened into a single `outer:inner{fields}` path
        if let Some(scope) = ctx.event_scope() {
            for (depth, span) in scope.from_root().enumerate() {
                if depth > 0 {
                    write!(writer, ":")?;
                }
                write!(writer, "{}", span.name())?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<tracing_subscriber::fmt::FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{}}}", fields)?;
                    }
                }
            }
            write!(writer, " ")?;
        }

        write!(writer, "{}", meta.target())?;
        if let (Some(file), Some(line)) = (meta.file(), meta.line()) {
            write!(writer, " {}:{}", file, line)?;
        }

        write!(writer, ": ")?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Initialize tracing with the hostname formatter
///
/// `RUST_LOG` takes precedence over `level` when set. Calling this more
/// than once is harmless: only the first subscriber is installed.
pub fn init_with_hostname(level: &str) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let fmt_layer = fmt::layer()
        .event_format(HostnameFormatter::new())
        .with_writer(std::io::stderr);

    if tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .is_ok()
    {
        tracing::info!("Logging initialized at level {}", level);
    }
}

/// Initialize tracing from the `[logging]` section of a configuration
pub fn init_from_config(config: &CacheConfig) {
    init_with_hostname(&config.logging.log_level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init_with_hostname("debug");
        init_with_hostname("info");
        tracing::debug!("still logging");
    }

    #[test]
    fn test_formatter_has_hostname() {
        let formatter = HostnameFormatter::new();
        assert!(!formatter.hostname.is_empty());
    }
}
