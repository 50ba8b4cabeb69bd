use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use std::time::Duration;

use super::amount::Raw;
use super::block::Block;

const CONFIRMATION_TOPIC: &str = "confirmation";
const CHANNEL_CAPACITY: usize = 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("No websocket URL configured for the confirmation stream")]
    MissingUrl,

    #[error("Websocket error: {0}")]
    Websocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// A confirmed block as announced by the node
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Confirmation {
    pub hash: String,

    #[serde(default)]
    pub amount: Option<Raw>,

    pub block: Block,
}

#[derive(Debug, Deserialize)]
struct TopicMessage {
    topic: Option<String>,
    message: Option<Value>,
}

/// Delay between reconnection attempts: 10ms doubling up to 2s, retried forever
pub fn reconnect_backoff() -> ExponentialBackoff {
    let initial_interval = Duration::from_millis(10);
    ExponentialBackoff {
        current_interval: initial_interval,
        initial_interval,
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_interval: Duration::from_secs(2),
        max_elapsed_time: None,
        ..Default::default()
    }
}

/// Extracts a confirmation from a raw websocket text frame
///
/// Acknowledgements and other topics yield `None`, as do messages that
/// cannot be decoded.
pub fn parse_confirmation(text: &str) -> Option<Confirmation> {
    let envelope: TopicMessage = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!("Ignoring undecodable websocket message: {}", err);
            return None;
        }
    };

    if envelope.topic.as_deref() != Some(CONFIRMATION_TOPIC) {
        debug!("Ignoring websocket message: {}", text);
        return None;
    }

    match serde_json::from_value(envelope.message?) {
        Ok(confirmation) => Some(confirmation),
        Err(err) => {
            warn!("Ignoring malformed confirmation: {}", err);
            None
        }
    }
}

/// Opens the confirmation stream
///
/// # Arguments
///
/// * `url` - The node's websocket URL; a missing URL is an error
///
/// # Returns
///
/// A receiver yielding every confirmation seen while connected
pub fn subscribe_to_confirmations(url: Option<&str>) -> Result<mpsc::Receiver<Confirmation>, StreamError> {
    subscribe_with_backoff(url, reconnect_backoff())
}

pub fn subscribe_with_backoff(url: Option<&str>, backoff: ExponentialBackoff) -> Result<mpsc::Receiver<Confirmation>, StreamError> {
    let url = url.filter(|u| !u.is_empty()).ok_or(StreamError::MissingUrl)?.to_string();
    let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);

    tokio::spawn(run(url, sender, backoff));
    Ok(receiver)
}

async fn run(url: String, sender: mpsc::Sender<Confirmation>, mut backoff: ExponentialBackoff) {
    loop {
        match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str())).await {
            Ok(Ok((socket, _))) => {
                info!("Connected to websocket {}", url);
                backoff.reset();

                match listen(socket, &sender).await {
                    Ok(()) => info!("Websocket {} closed", url),
                    Err(err) => warn!("Websocket {} failed: {}", url, err),
                }
            }
            Ok(Err(err)) => warn!("Unable to connect to websocket {}: {}", url, err),
            Err(_) => warn!("Connecting to websocket {} timed out after {:?}", url, CONNECT_TIMEOUT),
        }

        if sender.is_closed() {
            info!("Confirmation receiver dropped, leaving {}", url);
            return;
        }

        // Never exhausted without a max elapsed time
        let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
        tokio::time::sleep(delay).await;
    }
}

async fn listen<S>(socket: S, sender: &mpsc::Sender<Confirmation>) -> Result<(), StreamError>
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut write, mut read) = socket.split();

    let subscribe = json!({ "action": "subscribe", "topic": CONFIRMATION_TOPIC });
    write.send(Message::Text(subscribe.to_string())).await?;
    info!("Listening to confirmations...");

    while let Some(message) = read.next().await {
        match message? {
            Message::Text(text) => {
                if let Some(confirmation) = parse_confirmation(&text) {
                    if sender.send(confirmation).await.is_err() {
                        return Ok(());
                    }
                }
            }
            Message::Close(_) => return Ok(()),
            _ => {}
        }
    }

    Ok(())
}
