use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use serde_json::{json, Value};
use shared::{ControlMessage, Deduplicator, MessageChannel, MessageType, SessionStore};
pub use shared::{EXIT_OK, EXIT_REPORTED};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use trader_engine::config::SessionConfig;
use trader_engine::error::ErrorKind;
use trader_engine::execution::{build_handler, ExecutionEvent, ExecutionHandler, HandlerRequest};

/// Crash whose error could not be published; the supervisor reports it instead
pub const EXIT_UNREPORTED: i32 = 1;

const DEDUP_CAPACITY: usize = 256;

fn kind_label(kind: ErrorKind) -> String {
    serde_json::to_value(kind)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{:?}", kind))
}

/// Status and error messages a handler event turns into, in publish order
pub fn event_messages(user_id: &str, event: &ExecutionEvent) -> Vec<ControlMessage> {
    match event {
        ExecutionEvent::StateChanged { .. } => Vec::new(),
        ExecutionEvent::OrderUpdate(order) => vec![ControlMessage::status(
            user_id,
            "order",
            serde_json::to_value(order).unwrap_or(Value::Null),
        )],
        ExecutionEvent::StrategyError {
            strategy,
            symbol,
            message,
        } => vec![ControlMessage::error(
            user_id,
            &kind_label(ErrorKind::Strategy),
            format!("{} on {}: {}", strategy, symbol, message),
        )],
        ExecutionEvent::DataError { kind, message } => {
            vec![ControlMessage::error(user_id, &kind_label(*kind), message.clone())]
        }
        ExecutionEvent::Snapshot { at, account } => vec![ControlMessage::status(
            user_id,
            "snapshot",
            json!({ "at": at, "account": account }),
        )],
        ExecutionEvent::Finished(summary) => {
            let mut messages = Vec::with_capacity(2);
            if let Some(report) = &summary.report {
                messages.push(ControlMessage::status(
                    user_id,
                    "report",
                    json!({ "text": report.format(), "report": report }),
                ));
            }
            messages.push(ControlMessage::status(
                user_id,
                "finished",
                json!({
                    "state": summary.state,
                    "ticks": summary.ticks,
                    "balance": summary.account.balance,
                    "equity": summary.account.equity,
                    "orders": summary.orders.len(),
                    "fills": summary.fills.len(),
                }),
            ));
            messages
        }
        ExecutionEvent::Crashed { kind, message } => {
            vec![ControlMessage::error(user_id, &kind_label(*kind), message.clone())]
        }
    }
}

/// Runs one user's handler against that user's channel
pub struct WorkerSession {
    user_id: String,
    channel: MessageChannel,
    store: Option<Arc<SessionStore>>,
}

impl WorkerSession {
    pub fn new(user_id: impl Into<String>, channel: MessageChannel) -> Self {
        Self {
            user_id: user_id.into(),
            channel,
            store: None,
        }
    }

    pub fn with_store(mut self, store: SessionStore) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Build the handler from `config` and run it. Returns the process exit code.
    pub async fn run(self, config: SessionConfig) -> i32 {
        match build_handler(&config) {
            Ok(handler) => self.run_handler(handler).await,
            Err(e) => {
                error!(user_id = %self.user_id, error = %e, "Session could not be built");
                let message = ControlMessage::error(&self.user_id, &kind_label(e.kind()), e.to_string());
                match self.channel.publish_status(&message).await {
                    Ok(()) => EXIT_REPORTED,
                    Err(publish_err) => {
                        error!(error = %publish_err, "Failed to report startup error");
                        EXIT_UNREPORTED
                    }
                }
            }
        }
    }

    pub async fn run_handler(self, handler: ExecutionHandler) -> i32 {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut handler = handler.with_events(events_tx).with_requests(requests_rx);

        let started = ControlMessage::status(
            &self.user_id,
            "started",
            json!({ "mode": handler.mode(), "at": Utc::now() }),
        );
        if let Err(e) = self.channel.publish_status(&started).await {
            warn!(user_id = %self.user_id, error = %e, "Failed to publish started status");
        }

        let commands = tokio::spawn(command_loop(
            self.user_id.clone(),
            self.channel.clone(),
            cancel_tx,
            requests_tx,
        ));
        let forwarder = tokio::spawn(forward_events(
            self.user_id.clone(),
            self.channel.clone(),
            self.store.clone(),
            events_rx,
        ));

        let outcome = handler.run(cancel_rx).await;
        // closes the event channel so the forwarder drains and exits
        drop(handler);
        commands.abort();
        if let Err(e) = forwarder.await {
            error!(user_id = %self.user_id, error = %e, "Event forwarder failed");
        }

        match outcome {
            Ok(summary) => {
                info!(user_id = %self.user_id, ticks = summary.ticks, equity = summary.account.equity, "Session finished");
                EXIT_OK
            }
            Err(e) => {
                // the forwarder has published the crash event
                error!(user_id = %self.user_id, error = %e, "Session crashed");
                EXIT_REPORTED
            }
        }
    }
}

async fn command_loop(
    user_id: String,
    channel: MessageChannel,
    cancel: watch::Sender<bool>,
    requests: mpsc::UnboundedSender<HandlerRequest>,
) {
    let mut dedup = Deduplicator::new(DEDUP_CAPACITY);
    let mut commands = channel.consume_commands();

    while let Some(item) = commands.next().await {
        let message = match item {
            Ok(message) => message,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Dropping malformed command");
                reply(&channel, ControlMessage::error(&user_id, "invalid_command", e.to_string())).await;
                continue;
            }
        };
        if message.user_id != user_id {
            warn!(user_id = %user_id, sender = %message.user_id, "Ignoring command addressed to another user");
            continue;
        }
        if dedup.is_duplicate(&message) {
            debug!(user_id = %user_id, dedup_id = ?message.dedup_id, "Duplicate command ignored");
            continue;
        }

        match (message.kind, message.command_name()) {
            (MessageType::Stop, _) | (MessageType::Command, Some("stop")) => {
                info!(user_id = %user_id, "Stop requested");
                // the handler may already be gone
                let _ = cancel.send(true);
            }
            (MessageType::Command, Some("status")) => {
                let _ = requests.send(HandlerRequest::Snapshot);
            }
            (MessageType::Start, _) => {
                reply(
                    &channel,
                    ControlMessage::error(&user_id, "session_already_active", "a session is already running"),
                )
                .await;
            }
            (MessageType::Command, other) => {
                let name = other.map(str::to_string).unwrap_or_else(|| message.payload.to_string());
                warn!(user_id = %user_id, command = %name, "Unknown command");
                reply(
                    &channel,
                    ControlMessage::error(&user_id, "unknown_command", format!("unknown command: {}", name)),
                )
                .await;
            }
            (MessageType::Status | MessageType::Error, _) => {
                debug!(user_id = %user_id, kind = ?message.kind, "Ignoring non-command message");
            }
        }
    }
}

async fn forward_events(
    user_id: String,
    channel: MessageChannel,
    store: Option<Arc<SessionStore>>,
    mut events: mpsc::UnboundedReceiver<ExecutionEvent>,
) {
    while let Some(event) = events.recv().await {
        if let ExecutionEvent::StateChanged { from, to } = &event {
            debug!(user_id = %user_id, ?from, ?to, "Handler state changed");
        }
        for message in event_messages(&user_id, &event) {
            reply(&channel, message).await;
        }
        if let Some(store) = &store {
            persist(store, &event).await;
        }
    }
}

async fn persist(store: &SessionStore, event: &ExecutionEvent) {
    let result = match event {
        ExecutionEvent::OrderUpdate(order) => store.record_order(order).await,
        ExecutionEvent::Snapshot { at, account } => store.save_snapshot(*at, account).await,
        ExecutionEvent::Finished(summary) => store.save_snapshot(Utc::now(), &summary.account).await,
        _ => Ok(()),
    };
    if let Err(e) = result {
        warn!(user_id = %store.user_id(), error = %e, "Failed to persist session state");
    }
}

async fn reply(channel: &MessageChannel, message: ControlMessage) {
    if let Err(e) = channel.publish_status(&message).await {
        error!(user_id = %message.user_id, error = %e, "Failed to publish status");
    }
}
