use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use url::Url;

use crate::api::events::Envelope;
use crate::error::SyncError;

/// An open realtime link: frames out, frames in. The inbound side closing
/// means the connection is gone. `tasks` are the I/O tasks behind the link,
/// aborted by whoever ends up owning it.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Envelope>,
    pub inbound: mpsc::UnboundedReceiver<Envelope>,
    pub tasks: Vec<JoinHandle<()>>,
}

/// Opens realtime links. Swappable so the sync core can run without a server.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url, token: &str) -> Result<Link, SyncError>;
}

/// WebSocket connector speaking JSON text frames.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url, token: &str) -> Result<Link, SyncError> {
        let mut request = url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| SyncError::Config(e.to_string()))?;
        request.headers_mut().insert("Authorization", bearer);

        let (ws_stream, _) = connect_async(request).await?;
        log::info!("WebSocket connected to {}", url);
        let (mut sink, mut stream) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Envelope>();

        let writer = tokio::spawn(async move {
            while let Some(envelope) = out_rx.recv().await {
                let text = match serde_json::to_string(&envelope) {
                    Ok(text) => text,
                    Err(e) => {
                        log::warn!("dropping unencodable {} frame: {}", envelope.event, e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(WsMessage::Text(text)).await {
                    log::warn!("WebSocket write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<Envelope>(&text) {
                        Ok(envelope) => {
                            if in_tx.send(envelope).is_err() {
                                break;
                            }
                        }
                        Err(e) => log::debug!("ignoring malformed frame: {}", e),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("WebSocket read failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
            tasks: vec![writer, reader],
        })
    }
}
