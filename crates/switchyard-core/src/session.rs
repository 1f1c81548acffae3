//! Connection handshake.
//!
//! A new connection must open with an `IDENTIFY` frame carrying a bearer
//! token. Only once the token verifies is a client registered and its loops
//! started. Any handshake failure closes the connection without a reply.

use std::sync::Arc;
use std::time::Duration;

use switchyard_protocol::{codec, tags, ClientEvent, Event, ProtocolError, ReadyData};
use switchyard_transport::{FrameReader, FrameWriter, Inbound, TransportError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::auth::{AuthError, Authenticator, Identity};
use crate::client::{Client, ClientConfig, Termination};
use crate::directory::MemberDirectory;
use crate::hub::Hub;

/// Handshake errors.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// No frame arrived in time.
    #[error("No IDENTIFY received within {0:?}")]
    Timeout(Duration),

    /// The peer went away before identifying.
    #[error("Connection closed before IDENTIFY")]
    Closed,

    /// The transport failed while waiting for the first frame.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The first frame was something other than `IDENTIFY`.
    #[error("Expected IDENTIFY, got {0}")]
    UnexpectedFrame(String),

    /// The first frame could not be decoded.
    #[error("Malformed IDENTIFY: {0}")]
    Protocol(#[from] ProtocolError),

    /// The token did not verify.
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),
}

impl HandshakeError {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Closed => "closed",
            Self::Transport(_) => "transport",
            Self::UnexpectedFrame(_) => "unexpected_frame",
            Self::Protocol(_) => "malformed",
            Self::Auth(_) => "auth",
        }
    }
}

/// Everything a connection needs besides its transport.
#[derive(Clone)]
pub struct SessionContext {
    pub hub: Arc<Hub>,
    pub authenticator: Arc<dyn Authenticator>,
    pub directory: Option<Arc<dyn MemberDirectory>>,
    pub config: ClientConfig,
}

impl SessionContext {
    #[must_use]
    pub fn new(hub: Arc<Hub>, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            hub,
            authenticator,
            directory: None,
            config: ClientConfig::default(),
        }
    }

    #[must_use]
    pub fn with_directory(mut self, directory: Arc<dyn MemberDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }
}

/// Wait for the `IDENTIFY` frame and verify its token.
///
/// # Errors
///
/// Returns an error if the first frame is missing, late, malformed, not an
/// `IDENTIFY`, or carries a token that does not verify.
pub async fn identify<R: FrameReader>(
    reader: &mut R,
    ctx: &SessionContext,
) -> Result<Identity, HandshakeError> {
    let limit = ctx.config.identify_timeout;
    let text = tokio::time::timeout(limit, first_text(reader))
        .await
        .map_err(|_| HandshakeError::Timeout(limit))??;

    let event = codec::decode_with_limit(&text, ctx.config.max_frame_size)?;
    let Some(ClientEvent::Identify(data)) = ClientEvent::from_event(&event)? else {
        return Err(HandshakeError::UnexpectedFrame(event.kind));
    };

    Ok(ctx.authenticator.verify(&data.token).await?)
}

/// The first data frame, skipping keepalives.
async fn first_text<R: FrameReader>(reader: &mut R) -> Result<String, HandshakeError> {
    loop {
        match reader.recv().await?.ok_or(HandshakeError::Closed)? {
            Inbound::Text(text) => return Ok(text),
            Inbound::Binary(_) => return Err(HandshakeError::UnexpectedFrame("binary".into())),
            Inbound::Ping | Inbound::Pong => {}
        }
    }
}

/// Run a connection from handshake to close.
///
/// On success the client is registered, receives `READY`, and the call
/// returns when the connection ends.
///
/// # Errors
///
/// Returns the handshake error if the connection never identified. The
/// transport is closed before returning.
pub async fn accept<R, W>(
    mut reader: R,
    mut writer: W,
    ctx: &SessionContext,
) -> Result<Termination, HandshakeError>
where
    R: FrameReader,
    W: FrameWriter + 'static,
{
    let identity = match identify(&mut reader, ctx).await {
        Ok(identity) => identity,
        Err(e) => {
            debug!(remote = ?reader.remote_addr(), error = %e, "Handshake failed");
            let _ = writer.close(None).await;
            return Err(e);
        }
    };

    info!(
        user = %identity.user_id,
        username = %identity.username,
        remote = ?reader.remote_addr(),
        "Authenticated"
    );

    let handle = ctx.hub.create_handle(identity);
    ctx.hub.register(handle.clone());

    let ready = ReadyData {
        user_id: handle.user_id(),
        username: handle.username(),
        online_user_ids: ctx.hub.online_users(),
    };
    match Event::new(tags::READY, ready).and_then(|event| codec::encode_shared(&event)) {
        Ok(frame) => {
            handle.queue().try_push(frame);
        }
        Err(e) => warn!(error = %e, "Failed to build READY"),
    }

    let client = Client::new(handle, ctx.clone());
    Ok(client.run(reader, writer).await)
}
