use std::pin::Pin;
use std::time::Duration;

use futures::{Sink, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, USER_AGENT};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::error::{AgentError, Result};
use crate::identity::AgentIdentity;

/// Write half of a push channel.
pub type FrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
/// Read half of a push channel.
pub type FrameStream = Pin<Box<dyn Stream<Item = std::result::Result<Message, WsError>> + Send>>;

/// An established push channel, already split into halves.
pub struct PushChannel {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl PushChannel {
    pub fn new<S, R>(sink: S, stream: R) -> Self
    where
        S: Sink<Message, Error = WsError> + Send + 'static,
        R: Stream<Item = std::result::Result<Message, WsError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

impl std::fmt::Debug for PushChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushChannel").finish_non_exhaustive()
    }
}

fn header(value: &str, what: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| AgentError::Config(format!("invalid {}: {}", what, e)))
}

/// Open the WebSocket to `url`, authenticating with the agent's token and id.
pub async fn connect(url: &str, identity: &AgentIdentity, timeout: Duration) -> Result<PushChannel> {
    let mut request = url.into_client_request()?;
    let headers = request.headers_mut();
    let mut auth = header(&identity.bearer(), "controller token")?;
    auth.set_sensitive(true);
    headers.insert(AUTHORIZATION, auth);
    headers.insert("x-agent-id", header(&identity.agent_id, "agent id")?);
    headers.insert(USER_AGENT, header(&identity.user_agent(), "user agent")?);

    let (ws, response) = tokio::time::timeout(timeout, connect_async(request))
        .await
        .map_err(|_| AgentError::Transport(format!("handshake with {} timed out", url)))??;

    tracing::debug!(url = %url, status = %response.status(), "WebSocket handshake complete");

    let (sink, stream) = ws.split();
    Ok(PushChannel::new(sink, stream))
}
