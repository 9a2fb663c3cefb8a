//! Broker log sink.
//!
//! When the runtime configuration has a `Log` entry, [`BrokerLogLayer`]
//! mirrors every tracing event into broker lists:
//!
//! ```text
//! on_event ──try_send──▶ [bounded queue] ──▶ writer task ──▶ SADD all_logs <list>
//!                                                            LPUSH <list> <line>
//!                                                            LTRIM <list> 0 length-1
//! ```
//!
//! `<list>` is `<name>_<level>` and a line reads
//! `<rfc3339 timestamp> - <pid> - <message> key=value ...`. Emitting never
//! blocks: when the queue is full the line is dropped.

use std::fmt::{self, Write as _};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::broker::{Broker, Command, RedisBroker};
use crate::clock::rfc3339_now;
use crate::config::RuntimeConfig;
use crate::error::BrokerError;
use crate::keys::ALL_LOGS;

/// Lines buffered between emitters and the writer task.
const QUEUE_CAPACITY: usize = 1024;

/// Events from the broker adapters are not mirrored, so the writer's own
/// broker calls cannot feed back into the sink.
const SKIPPED_TARGET: &str = "pipequeue::broker";

#[derive(Debug, Clone, PartialEq, Eq)]
struct LogLine {
    list: String,
    text: String,
}

/// `tracing` layer that forwards events to broker lists.
pub struct BrokerLogLayer {
    name: String,
    pid: u32,
    sender: mpsc::Sender<LogLine>,
}

impl BrokerLogLayer {
    /// Creates the layer and spawns its writer task.
    ///
    /// # Arguments
    ///
    /// * `name` - Prefix of the log lists, usually the process role
    /// * `broker` - Broker holding the log lists
    /// * `length` - Maximum entries kept per list
    pub fn spawn(
        name: impl Into<String>,
        broker: Arc<dyn Broker>,
        length: usize,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let writer = tokio::spawn(write_lines(broker, length, receiver));
        let layer = Self {
            name: name.into(),
            pid: std::process::id(),
            sender,
        };
        (layer, writer)
    }

    /// Connects to the `Log` entry of the runtime configuration, if any.
    pub async fn from_runtime(
        name: impl Into<String>,
        runtime: &RuntimeConfig,
    ) -> Result<Option<(Self, JoinHandle<()>)>, BrokerError> {
        let Some(log) = runtime.log() else {
            return Ok(None);
        };
        let broker: Arc<dyn Broker> = Arc::new(RedisBroker::from_params(&log.connection).await?);
        Ok(Some(Self::spawn(name, broker, log.length)))
    }

    fn format(&self, level: &Level, fields: &LineVisitor) -> LogLine {
        LogLine {
            list: format!("{}_{}", self.name, level_name(level)),
            text: format!("{} - {} - {}", rfc3339_now(), self.pid, fields.line()),
        }
    }
}

impl<S: Subscriber> Layer<S> for BrokerLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if metadata.target().starts_with(SKIPPED_TARGET) {
            return;
        }

        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        // full or closed queue: the line is lost, the emitter is not slowed down
        let _ = self.sender.try_send(self.format(metadata.level(), &visitor));
    }
}

fn level_name(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "error",
        Level::WARN => "warning",
        Level::INFO => "info",
        Level::DEBUG => "debug",
        _ => "trace",
    }
}

async fn write_lines(broker: Arc<dyn Broker>, length: usize, mut receiver: mpsc::Receiver<LogLine>) {
    let stop = length.max(1) as isize - 1;
    while let Some(line) = receiver.recv().await {
        let commands = vec![
            Command::sadd(ALL_LOGS, line.list.as_str()),
            Command::lpush(line.list.as_str(), line.text),
            Command::ltrim(line.list, 0, stop),
        ];
        if let Err(e) = broker.exec_atomic(commands).await {
            // tracing here would loop back into this sink
            eprintln!("broker log sink: {}", e);
        }
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl LineVisitor {
    fn line(&self) -> String {
        if self.fields.is_empty() {
            self.message.clone()
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}
