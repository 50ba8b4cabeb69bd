use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{info, warn};
use reqwest::Client;

use std::time::Duration;

use crate::settlement::{ConfirmationHandler, TransactionEvent};

const MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Posts each event as JSON to a webhook, or only logs it when none is set
pub struct EventNotifier {
    client: Client,
    webhook_url: Option<String>,
    retry_delay: Duration,
}

impl EventNotifier {
    pub fn new(webhook_url: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(EventNotifier {
            client,
            webhook_url,
            retry_delay: RETRY_DELAY,
        })
    }

    async fn deliver(&self, event: &TransactionEvent) -> Result<()> {
        let amount = event.amount.as_ref().map(|a| a.to_string()).unwrap_or_default();
        info!(
            "{:?} {:?} {}: {} raw from {:?} to {:?}",
            event.status,
            event.action,
            event.id,
            amount,
            event.sending.as_ref().map(|a| &a.user_id),
            event.receiving.as_ref().map(|a| &a.user_id),
        );

        let Some(url) = &self.webhook_url else {
            return Ok(());
        };

        for attempt in 1..=MAX_ATTEMPTS {
            match self.client.post(url).json(event).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => warn!("Webhook attempt {}/{} for {} failed: {}", attempt, MAX_ATTEMPTS, event.id, resp.status()),
                Err(e) => warn!("Webhook attempt {}/{} for {} failed: {}", attempt, MAX_ATTEMPTS, event.id, e),
            }

            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Err(anyhow!("webhook {} unreachable after {} attempts", url, MAX_ATTEMPTS))
    }
}

#[async_trait]
impl ConfirmationHandler for EventNotifier {
    async fn on_tip(&self, event: &TransactionEvent) -> Result<()> {
        self.deliver(event).await
    }

    async fn on_withdraw(&self, event: &TransactionEvent) -> Result<()> {
        self.deliver(event).await
    }

    async fn on_top_up(&self, event: &TransactionEvent) -> Result<()> {
        self.deliver(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::{TxAction, TxStatus};

    fn event() -> TransactionEvent {
        TransactionEvent {
            action: TxAction::TopUp,
            status: TxStatus::Confirmed,
            id: "AB".to_string(),
            source_hash: "CD".to_string(),
            amount: Some(1_000u128.into()),
            sending: None,
            receiving: None,
            pending_tx: None,
        }
    }

    #[test]
    fn test_payload_shape() {
        let json = serde_json::to_value(event()).unwrap();

        assert_eq!(json["action"], "topup");
        assert_eq!(json["status"], "confirmed");
        assert_eq!(json["source_hash"], "CD");
        assert_eq!(json["amount"], "1000");
    }

    #[tokio::test]
    async fn test_without_webhook_only_logs() {
        let notifier = EventNotifier::new(None, Duration::from_secs(1)).unwrap();
        assert!(notifier.on_top_up(&event()).await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_webhook_fails_after_retries() {
        let mut notifier = EventNotifier::new(Some("http://127.0.0.1:9/events".to_string()), Duration::from_secs(1)).unwrap();
        notifier.retry_delay = Duration::from_millis(1);

        assert!(notifier.on_tip(&event()).await.is_err());
    }
}
