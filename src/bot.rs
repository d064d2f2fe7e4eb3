use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono_tz::Tz;
use tracing::{debug, error, info, warn};

use crate::telemetry::{CommandPublisher, OutboundMessage, TelemetryRecord, TelemetrySource};

pub const WELCOME_REPLY: &str = "Welcome in the _MDC SmartHub_ telegram Bot.\n\n\
    With this bot you can get information about your subscriptions to our service.\n\n\
    You can always type /help to see what you can do.";

pub const HELP_REPLY: &str = "Possible commands are:\n\
    - /ledwall: write the latest speed test on the ledwall (or `/ledwall <text>` to write your own text)\n\
    - /lastdata: show the latest speed test";

pub const FALLBACK_REPLY: &str = "I appreciate you sending a message to me...\n\
    I do not know how to handle it though, as I only know how to respond to commands. \
    Try /help to see what you can do.";

pub const REFUSAL_REPLY: &str = "Sorry, you are not authorized to use this bot.";

pub const NO_DATA_REPLY: &str = "No data available at the moment, please try again later.";

pub const LEDWALL_FAILED_REPLY: &str = "I could not reach the ledwall right now.";

const TIMESTAMP_FORMAT: &str = "%d/%m/%Y@%H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Ledwall,
    Lastdata,
}

impl Command {
    pub const ALL: [Command; 4] = [
        Command::Start,
        Command::Help,
        Command::Ledwall,
        Command::Lastdata,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Help => "help",
            Command::Ledwall => "ledwall",
            Command::Lastdata => "lastdata",
        }
    }
}

/// Routes chat commands from authorized senders to their handlers.
///
/// The allow-list and command table are fixed at construction. Handlers
/// only see the publisher, the reader and the display timezone.
pub struct Router {
    allow_list: HashSet<String>,
    commands: HashMap<&'static str, Command>,
    publisher: Arc<dyn CommandPublisher>,
    reader: Arc<dyn TelemetrySource>,
    timezone: Tz,
}

impl Router {
    pub fn new(
        allowed_chat_ids: impl IntoIterator<Item = String>,
        publisher: Arc<dyn CommandPublisher>,
        reader: Arc<dyn TelemetrySource>,
        timezone: Tz,
    ) -> Self {
        let commands = Command::ALL.iter().map(|c| (c.name(), *c)).collect();
        Self {
            allow_list: allowed_chat_ids.into_iter().collect(),
            commands,
            publisher,
            reader,
            timezone,
        }
    }

    pub fn is_authorized(&self, sender_id: &str) -> bool {
        self.allow_list.contains(sender_id)
    }

    /// Handle one inbound message and return the Markdown reply.
    /// `command` is `None` for free text.
    pub async fn handle(&self, sender_id: &str, command: Option<&str>, args: &str) -> String {
        if !self.is_authorized(sender_id) {
            warn!("Refusing message from unauthorized chat {}", sender_id);
            return REFUSAL_REPLY.to_string();
        }

        let Some(command) = command.and_then(|name| self.commands.get(name)) else {
            debug!("generic");
            return FALLBACK_REPLY.to_string();
        };

        debug!("{}", command.name());
        match command {
            Command::Start => WELCOME_REPLY.to_string(),
            Command::Help => HELP_REPLY.to_string(),
            Command::Ledwall => self.ledwall(args).await,
            Command::Lastdata => self.lastdata().await,
        }
    }

    async fn latest_record(&self) -> Option<TelemetryRecord> {
        match self.reader.latest().await {
            Ok(Some(record)) => Some(record),
            Ok(None) => {
                info!("No telemetry in the query window");
                None
            }
            Err(e) => {
                error!("Failed to read telemetry: {}", e);
                None
            }
        }
    }

    async fn ledwall(&self, args: &str) -> String {
        let (text, message) = if args.is_empty() {
            let Some(record) = self.latest_record().await else {
                return NO_DATA_REPLY.to_string();
            };
            let text = ledwall_text(&record);
            let message = OutboundMessage::new()
                .with("command", "ledwall")
                .with("text", text.as_str())
                .with("download", record.download_bandwidth)
                .with("upload", record.upload_bandwidth)
                .with("ping", record.ping_latency);
            (text, message)
        } else {
            let message = OutboundMessage::new()
                .with("command", "ledwall")
                .with("text", args);
            (args.to_string(), message)
        };

        // The reply goes out only after the publish attempt has finished
        match self.publisher.publish(&message).await {
            Ok(()) => format!("Sent to ledwall: {}", escape_markdown(&text)),
            Err(e) => {
                error!("Failed to publish ledwall message: {}", e);
                LEDWALL_FAILED_REPLY.to_string()
            }
        }
    }

    async fn lastdata(&self) -> String {
        match self.latest_record().await {
            Some(record) => lastdata_report(&record, self.timezone),
            None => NO_DATA_REPLY.to_string(),
        }
    }
}

/// Short form shown on the ledwall, e.g. `D:93.75 U:20.5 P:12.3`.
pub fn ledwall_text(record: &TelemetryRecord) -> String {
    format!(
        "D:{} U:{} P:{}",
        record.download_bandwidth, record.upload_bandwidth, record.ping_latency
    )
}

pub fn lastdata_report(record: &TelemetryRecord, timezone: Tz) -> String {
    let local = record.timestamp.with_timezone(&timezone);
    format!(
        "*Last data* ({})\n\n\
         - Download: {} Mbps\n\
         - Upload: {} Mbps\n\
         - Ping: {} ms",
        local.format(TIMESTAMP_FORMAT),
        record.download_bandwidth,
        record.upload_bandwidth,
        record.ping_latency
    )
}

/// Escape the characters legacy Telegram Markdown treats as markup.
fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '_' | '*' | '`' | '[') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
