//! Fire-and-forget notifications.
//!
//! The engine only ever publishes [`BotEvent`]s on a channel; a dispatcher
//! task forwards them to a [`NotificationSink`] so a slow or failing sink
//! never holds up trading.

use crate::model::{Spread, TradeRecord};
use crate::ports::secrets::SecretStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use std::env;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq)]
pub enum BotEvent {
    Opened(Spread),
    Closed(TradeRecord),
    Error(String),
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify_opened(&self, spread: &Spread) -> Result<()>;
    async fn notify_closed(&self, trade: &TradeRecord) -> Result<()>;
    async fn notify_error(&self, message: &str) -> Result<()>;
}

/// Sending half handed to the engine. A publisher without a channel drops
/// events silently.
#[derive(Debug, Clone, Default)]
pub struct EventPublisher {
    tx: Option<UnboundedSender<BotEvent>>,
}

impl EventPublisher {
    pub fn channel() -> (Self, UnboundedReceiver<BotEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn publish(&self, event: BotEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                log::debug!("[NOTIFY] dispatcher gone, event dropped");
            }
        }
    }
}

/// Drains `rx` into `sink` until every publisher is dropped.
pub fn spawn_dispatcher(
    mut rx: UnboundedReceiver<BotEvent>,
    sink: Arc<dyn NotificationSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let result = match &event {
                BotEvent::Opened(spread) => sink.notify_opened(spread).await,
                BotEvent::Closed(trade) => sink.notify_closed(trade).await,
                BotEvent::Error(message) => sink.notify_error(message).await,
            };
            if let Err(e) = result {
                log::warn!("[NOTIFY] delivery failed: {:?}", e);
            }
        }
    })
}

fn opened_text(spread: &Spread) -> (String, String) {
    let subject = format!("[spreadbot] OPEN {} {}", spread.signal, spread.pair_id);
    let body = format!(
        "Opened {} {} ({} mode)\nsize: {} USD\nentry ratio: {:.6}\nentry z: {:.2}\n{} {:?} {} @ {}\n{} {:?} {} @ {}",
        spread.signal,
        spread.pair_id,
        spread.mode.label(),
        spread.size_usd,
        spread.entry_ratio,
        spread.entry_z_score,
        spread.coin_a,
        spread.leg_a.side,
        spread.leg_a.size,
        spread.leg_a.entry_price,
        spread.coin_b,
        spread.leg_b.side,
        spread.leg_b.size,
        spread.leg_b.entry_price,
    );
    (subject, body)
}

fn closed_text(trade: &TradeRecord) -> (String, String) {
    let p = &trade.position;
    let subject = format!(
        "[spreadbot] CLOSE {} pnl {} ({})",
        p.pair_id,
        trade.final_pnl.round_dp(2),
        trade.exit_reason
    );
    let body = format!(
        "Closed {} {} after {}h\nreason: {}\nentry ratio: {:.6} exit ratio: {:.6}\nexit prices: {} / {}\nfinal pnl: {} USD",
        p.signal,
        p.pair_id,
        trade
            .exit_time
            .signed_duration_since(p.entry_time)
            .num_hours(),
        trade.exit_reason,
        p.entry_ratio,
        trade.exit_ratio,
        trade.exit_price_a,
        trade.exit_price_b,
        trade.final_pnl,
    );
    (subject, body)
}

/// Writes notifications to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify_opened(&self, spread: &Spread) -> Result<()> {
        let (subject, _) = opened_text(spread);
        log::info!("[NOTIFY] {}", subject);
        Ok(())
    }

    async fn notify_closed(&self, trade: &TradeRecord) -> Result<()> {
        let (subject, _) = closed_text(trade);
        log::info!("[NOTIFY] {}", subject);
        Ok(())
    }

    async fn notify_error(&self, message: &str) -> Result<()> {
        log::warn!("[NOTIFY] error: {}", message);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub username: String,
    /// Ciphertext as produced by the configured [`SecretStore`].
    pub password: String,
    pub from: String,
    pub to: String,
}

impl EmailConfig {
    /// Reads `SMTP_HOST`, `SMTP_USERNAME`, `SMTP_PASSWORD`, `MAIL_FROM` and
    /// `MAIL_TO`. Returns `None` when the host or recipient is not set.
    pub fn from_env() -> Option<Self> {
        let smtp_host = env::var("SMTP_HOST").ok().filter(|v| !v.trim().is_empty())?;
        let to = env::var("MAIL_TO").ok().filter(|v| !v.trim().is_empty())?;
        let username = env::var("SMTP_USERNAME").unwrap_or_default();
        Some(Self {
            smtp_host,
            password: env::var("SMTP_PASSWORD").unwrap_or_default(),
            from: env::var("MAIL_FROM").unwrap_or_else(|_| username.clone()),
            username,
            to,
        })
    }
}

pub struct EmailNotifier {
    transport: SmtpTransport,
    from: Mailbox,
    to: Mailbox,
}

impl EmailNotifier {
    pub fn new(config: &EmailConfig, secrets: &dyn SecretStore) -> Result<Self> {
        let password = secrets
            .decrypt(&config.password)
            .context("failed to decrypt SMTP password")?;
        let transport = SmtpTransport::relay(&config.smtp_host)
            .with_context(|| format!("invalid SMTP relay {}", config.smtp_host))?
            .credentials(Credentials::new(config.username.clone(), password))
            .build();
        Ok(Self {
            transport,
            from: config.from.parse().context("invalid MAIL_FROM")?,
            to: config.to.parse().context("invalid MAIL_TO")?,
        })
    }

    async fn send(&self, subject: String, body: String) -> Result<()> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body)
            .context("failed to build e-mail")?;
        let transport = self.transport.clone();
        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .context("e-mail task panicked")?
            .context("SMTP send failed")?;
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for EmailNotifier {
    async fn notify_opened(&self, spread: &Spread) -> Result<()> {
        let (subject, body) = opened_text(spread);
        self.send(subject, body).await
    }

    async fn notify_closed(&self, trade: &TradeRecord) -> Result<()> {
        let (subject, body) = closed_text(trade);
        self.send(subject, body).await
    }

    async fn notify_error(&self, message: &str) -> Result<()> {
        self.send(
            "[spreadbot] error".to_string(),
            message.to_string(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn notify_opened(&self, spread: &Spread) -> Result<()> {
            self.seen.lock().unwrap().push(format!("open {}", spread.pair_id));
            Ok(())
        }

        async fn notify_closed(&self, trade: &TradeRecord) -> Result<()> {
            self.seen
                .lock()
                .unwrap()
                .push(format!("close {}", trade.position.pair_id));
            Ok(())
        }

        async fn notify_error(&self, message: &str) -> Result<()> {
            self.seen.lock().unwrap().push(format!("error {}", message));
            if self.fail {
                anyhow::bail!("smtp down");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatcher_forwards_in_order_and_survives_failures() {
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let (publisher, rx) = EventPublisher::channel();
        let handle = spawn_dispatcher(rx, sink.clone());

        publisher.publish(BotEvent::Error("first".to_string()));
        publisher.publish(BotEvent::Error("second".to_string()));
        drop(publisher);
        handle.await.unwrap();

        let seen = sink.seen.lock().unwrap().clone();
        assert_eq!(seen, vec!["error first", "error second"]);
    }

    #[test]
    fn disabled_publisher_drops_events() {
        EventPublisher::disabled().publish(BotEvent::Error("ignored".to_string()));
    }

    #[test]
    fn passthrough_secret_round_trip() {
        use crate::ports::secrets::PassthroughSecretStore;
        let store = PassthroughSecretStore;
        let blob = store.encrypt("hunter2").unwrap();
        assert_eq!(store.decrypt(&blob).unwrap(), "hunter2");
    }
}
