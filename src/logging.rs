use std::{
    fmt::Write as _,
    io::Write as _,
    path::PathBuf,
    sync::Mutex,
};

use chrono::{SecondsFormat, Utc};
use tracing::field::{Field, Visit};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::error::Result;

/// Initialize tracing. Everything goes to stderr so stdout stays a clean
/// JSON-RPC channel; with `--debug` the default level drops to `debug` and
/// a trace is appended to the fingerprint's debug log file.
pub fn init(debug: bool, debug_log_path: Option<PathBuf>) -> Result<()> {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false);

    let file_layer = match debug_log_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            Some(DebugFileLayer {
                file: Mutex::new(file),
            })
        }
        None => None,
    };

    // try_init so tests that initialize twice stay quiet.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
    Ok(())
}

/// Appends one line per event: ISO timestamp, pid, level, target, message.
struct DebugFileLayer {
    file: Mutex<std::fs::File>,
}

impl<S: tracing::Subscriber> Layer<S> for DebugFileLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let line = format!(
            "{} [{}] {} {}: {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            std::process::id(),
            event.metadata().level(),
            event.metadata().target(),
            visitor.rendered
        );
        if let Ok(mut file) = self.file.lock() {
            let _ = file.write_all(line.as_bytes());
        }
    }
}

#[derive(Default)]
struct MessageVisitor {
    rendered: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            if !self.rendered.is_empty() {
                self.rendered.insert(0, ' ');
            }
            let mut message = String::new();
            let _ = write!(message, "{value:?}");
            self.rendered.insert_str(0, &message);
        } else {
            let _ = write!(self.rendered, " {}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.rendered.insert_str(0, value);
        } else {
            let _ = write!(self.rendered, " {}={value}", field.name());
        }
    }
}
