//! WebSocket transport.
//!
//! Opens the socket and translates transport-level events into
//! [`TransportSignal`]s. Knows nothing about tasks or authentication.

use crate::classify::{classify, TransportSignal};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::tls;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async_tls_with_config, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// A connected WebSocket.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens the WebSocket to the configured endpoint.
///
/// Failures are classified before they are returned.
pub async fn open(config: &ClientConfig) -> Result<WsStream, ClientError> {
    let connector = if config.endpoint.starts_with("wss://") {
        Some(tls::create_connector(&config.tls)?)
    } else {
        None
    };

    debug!(endpoint = %config.endpoint, "Opening WebSocket");

    let (ws, response) =
        connect_async_tls_with_config(config.endpoint.as_str(), None, true, connector)
            .await
            .map_err(|e| {
                debug!(error = %e, "WebSocket open failed");
                ClientError::from(classify(&signal_from_error(&e)))
            })?;

    debug!(status = %response.status(), "WebSocket open");
    Ok(ws)
}

/// Converts a transport error into a classification signal.
pub fn signal_from_error(error: &WsError) -> TransportSignal {
    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportSignal::Closed {
            code: None,
            reason: String::new(),
        },
        WsError::Http(response) => TransportSignal::Failure {
            message: format!("HTTP error: {}", response.status()),
        },
        other => TransportSignal::Failure {
            message: other.to_string(),
        },
    }
}

/// Converts a received close frame into a classification signal.
pub fn signal_from_close(frame: Option<&CloseFrame<'_>>) -> TransportSignal {
    match frame {
        Some(frame) => TransportSignal::Closed {
            code: Some(u16::from(frame.code)),
            reason: frame.reason.to_string(),
        },
        // Close frame without a payload: status 1005 (no status received).
        None => TransportSignal::Closed {
            code: Some(1005),
            reason: String::new(),
        },
    }
}
