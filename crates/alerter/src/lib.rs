use async_trait::async_trait;
use configuration::TelegramConfig;
use core_types::{FailureKind, Market, OrderSide};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
pub mod error;

pub use error::AlerterError;

/// A notable event worth telling a human about.
#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    Started { markets: usize },
    Filled {
        market: Market,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
    },
    OrderFailed {
        market: Market,
        side: OrderSide,
        kind: FailureKind,
    },
    WorkerHalted { market: Market, reason: String },
    Stopped,
}

impl Alert {
    /// Renders the alert for Telegram's MarkdownV2 parse mode.
    pub fn to_markdown(&self) -> String {
        match self {
            Alert::Started { markets } => format!("✅ *Conductor Started* with {} markets", markets),
            Alert::Filled {
                market,
                side,
                price,
                quantity,
            } => {
                let icon = match side {
                    OrderSide::Buy => "📈",
                    OrderSide::Sell => "📉",
                };
                format!(
                    "{} *{} {}* `@{}`\n`{}` units",
                    icon,
                    side.as_str().to_uppercase(),
                    escape_markdown(&market.to_string()),
                    price,
                    quantity
                )
            }
            Alert::OrderFailed { market, side, kind } => format!(
                "⚠️ *ERROR*: {} order on {} failed: {}",
                side.as_str().to_uppercase(),
                escape_markdown(&market.to_string()),
                escape_markdown(kind.as_str())
            ),
            Alert::WorkerHalted { market, reason } => format!(
                "🚨 *CRITICAL*: worker {} halted: {}",
                escape_markdown(&market.to_string()),
                escape_markdown(reason)
            ),
            Alert::Stopped => "🛑 *Conductor Stopped*".to_string(),
        }
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Alert::Started { markets } => write!(f, "started with {} markets", markets),
            Alert::Filled {
                market,
                side,
                price,
                quantity,
            } => write!(f, "{} {} {} @ {}", side, quantity, market, price),
            Alert::OrderFailed { market, side, kind } => {
                write!(f, "{} order on {} failed: {}", side, market, kind.as_str())
            }
            Alert::WorkerHalted { market, reason } => {
                write!(f, "worker {} halted: {}", market, reason)
            }
            Alert::Stopped => write!(f, "stopped"),
        }
    }
}

/// Delivers alerts to some channel outside the process.
#[async_trait]
pub trait Alerter: Send + Sync {
    async fn send(&self, alert: &Alert) -> Result<(), AlerterError>;
}

/// Writes alerts to the log. Used when Telegram is not configured.
#[derive(Debug, Default, Clone)]
pub struct LogAlerter;

#[async_trait]
impl Alerter for LogAlerter {
    async fn send(&self, alert: &Alert) -> Result<(), AlerterError> {
        match alert {
            Alert::WorkerHalted { .. } => tracing::error!(%alert, "ALERT"),
            Alert::OrderFailed { .. } => tracing::warn!(%alert, "ALERT"),
            _ => tracing::info!(%alert, "ALERT"),
        }
        Ok(())
    }
}

/// The JSON payload for the Telegram `sendMessage` endpoint.
#[derive(Debug, Serialize)]
struct SendMessagePayload<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str, // To allow for formatting like bold, italics etc.
}

/// A client for sending messages to the Telegram Bot API.
pub struct TelegramAlerter {
    client: Client,
    token: String,
    chat_id: String,
}

impl TelegramAlerter {
    /// Creates a new `TelegramAlerter`.
    ///
    /// Returns `None` if the token or chat_id is missing from the configuration,
    /// allowing the system to fall back to log-only alerts.
    pub fn new(config: &TelegramConfig) -> Option<Self> {
        if config.token.is_empty() || config.chat_id.is_empty() {
            tracing::warn!("Telegram alerter is not configured (missing token or chat_id).");
            return None;
        }
        Some(Self {
            client: Client::new(),
            token: config.token.clone(),
            chat_id: config.chat_id.clone(),
        })
    }

    /// Sends a text message to the configured Telegram chat.
    pub async fn send_message(&self, message: &str) -> Result<(), AlerterError> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);

        let payload = SendMessagePayload {
            chat_id: &self.chat_id,
            text: message,
            parse_mode: "MarkdownV2", // Use Markdown for rich formatting
        };

        let response = self.client.post(&url).json(&payload).send().await?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to decode error response".to_string());
            return Err(AlerterError::ApiError(error_text));
        }

        Ok(())
    }
}

#[async_trait]
impl Alerter for TelegramAlerter {
    async fn send(&self, alert: &Alert) -> Result<(), AlerterError> {
        self.send_message(&alert.to_markdown()).await
    }
}

/// Picks Telegram when it is configured, the log otherwise.
pub fn from_config(config: &TelegramConfig) -> Arc<dyn Alerter> {
    match TelegramAlerter::new(config) {
        Some(telegram) => Arc::new(telegram),
        None => Arc::new(LogAlerter),
    }
}

/// A long-running service that drains a broadcast channel of `Alert`s into an
/// `Alerter`, so senders never wait on slow deliveries.
pub async fn run_alerter_service(alerter: Arc<dyn Alerter>, mut alert_rx: broadcast::Receiver<Alert>) {
    tracing::info!("Alerter service started. Listening for alerts.");

    loop {
        match alert_rx.recv().await {
            Ok(alert) => {
                if let Err(e) = alerter.send(&alert).await {
                    tracing::error!(error = ?e, %alert, "Failed to deliver alert.");
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Alerter service lagged, skipped {} alerts.", n);
            }
            Err(broadcast::error::RecvError::Closed) => {
                tracing::info!("Alert channel closed. Alerter service shutting down.");
                break;
            }
        }
    }
}

/// A helper function to escape characters that have special meaning in Telegram's MarkdownV2.
fn escape_markdown(text: &str) -> String {
    let special_chars = r"_*[]()~`>#+-=|{}.!";
    special_chars
        .chars()
        .fold(text.to_string(), |s, c| s.replace(c, &format!("\\{}", c)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording(Mutex<Vec<Alert>>);

    #[async_trait]
    impl Alerter for Recording {
        async fn send(&self, alert: &Alert) -> Result<(), AlerterError> {
            self.0.lock().unwrap().push(alert.clone());
            Ok(())
        }
    }

    #[test]
    fn markdown_escapes_reserved_characters() {
        assert_eq!(escape_markdown("a_b.c"), r"a\_b\.c");
        let alert = Alert::WorkerHalted {
            market: "binance:BTCUSDT".parse().unwrap(),
            reason: "sell exceeds holdings".to_string(),
        };
        assert!(alert.to_markdown().contains("CRITICAL"));
    }

    #[test]
    fn fills_render_side_and_market() {
        let alert = Alert::Filled {
            market: "binance:ETHUSDT".parse().unwrap(),
            side: OrderSide::Buy,
            price: dec!(2500),
            quantity: dec!(0.04),
        };
        let text = alert.to_markdown();
        assert!(text.contains("BUY"));
        assert!(text.contains("ETHUSDT"));
    }

    #[tokio::test]
    async fn service_delivers_until_the_channel_closes() {
        let recording = Arc::new(Recording::default());
        let (tx, rx) = broadcast::channel(8);
        let service = tokio::spawn(run_alerter_service(recording.clone(), rx));

        tx.send(Alert::Started { markets: 2 }).unwrap();
        tx.send(Alert::Stopped).unwrap();
        drop(tx);
        service.await.unwrap();

        assert_eq!(
            *recording.0.lock().unwrap(),
            vec![Alert::Started { markets: 2 }, Alert::Stopped]
        );
    }
}
