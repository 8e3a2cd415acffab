//! # Live API Client
//!
//! WebSocket transport for the upstream live API. The socket is split into
//! a writer task fed by an unbounded channel and a stream of decoded JSON
//! messages, the shapes [`run_conversation`](super::run_conversation) takes.

use crate::error::{BridgeError, BridgeResult};
use futures_util::stream::BoxStream;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Default host of the live API.
pub const DEFAULT_HOST: &str = "generativelanguage.googleapis.com";

const BIDI_PATH: &str = "/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Messages received from the live API, in order. Ends when the socket closes.
pub type UpstreamStream = BoxStream<'static, BridgeResult<Value>>;

/// WebSocket URL for `host`, authenticated with `api_key`.
pub fn endpoint_url(host: &str, api_key: &str) -> String {
    format!("wss://{}{}?key={}", host, BIDI_PATH, api_key)
}

/// Open the live API socket on `host`.
///
/// ## Returns:
/// A sender for outgoing JSON messages and the stream of incoming ones.
/// Dropping every sender closes the socket.
pub async fn connect(
    host: &str,
    api_key: &str,
) -> BridgeResult<(mpsc::UnboundedSender<Value>, UpstreamStream)> {
    info!(host = %host, "connecting to live API");
    connect_url(&endpoint_url(host, api_key)).await
}

pub(crate) async fn connect_url(
    url: &str,
) -> BridgeResult<(mpsc::UnboundedSender<Value>, UpstreamStream)> {
    let (socket, response) = connect_async(url).await?;
    debug!(status = %response.status(), "websocket handshake complete");

    let (mut sink, source) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Value>();

    tokio::spawn(async move {
        let mut outgoing = UnboundedReceiverStream::new(rx);
        while let Some(message) = outgoing.next().await {
            if let Err(e) = sink.send(Message::text(message.to_string())).await {
                warn!(error = %e, "live API send failed");
                return;
            }
        }
        if let Err(e) = sink.close().await {
            debug!(error = %e, "live API close failed");
        }
        debug!("live API writer stopped");
    });

    let incoming = source
        .filter_map(|frame| async move { decode_frame(frame) })
        .boxed();
    Ok((tx, incoming))
}

/// JSON payload of one websocket frame; `None` for control frames.
fn decode_frame(
    frame: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<BridgeResult<Value>> {
    match frame {
        Ok(Message::Text(text)) => Some(serde_json::from_str(&text).map_err(BridgeError::from)),
        // The live API sends JSON in binary frames too.
        Ok(Message::Binary(data)) => Some(serde_json::from_slice(&data).map_err(BridgeError::from)),
        Ok(Message::Close(reason)) => {
            info!(reason = ?reason, "live API closed the connection");
            None
        }
        Ok(_) => None,
        Err(e) => Some(Err(e.into())),
    }
}
