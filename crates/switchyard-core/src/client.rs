//! Per-connection read and write loops.
//!
//! A [`Client`] owns one registered connection. Its read loop decodes
//! inbound frames and dispatches them; its write loop drains the outbound
//! queue and keeps the connection alive with pings. Whichever loop ends
//! first, the client is unregistered and the other loop follows.

use std::time::Duration;

use switchyard_protocol::{
    codec, tags, ClientEvent, DmCallAcceptData, DmCallData, DmCallEndData, DmCallRingData, Event,
    PresenceData, PresenceUpdateData, SessionExpiredData, TokenRefreshData, TypingData,
    TypingStartData, VoiceChannelData, MAX_FRAME_SIZE,
};
use switchyard_transport::{CloseReason, FrameReader, FrameWriter, Inbound, TransportError};
use tokio::time::{timeout, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::broadcast::broadcast_to_members;
use crate::handle::ClientHandle;
use crate::presence::{announce_presence, announce_voice};
use crate::session::SessionContext;
use crate::voice::VoiceState;

/// Floor applied to [`ClientConfig::ping_period`].
const MIN_PING_PERIOD: Duration = Duration::from_millis(1);

/// Connection timing and size limits.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Largest accepted inbound frame in bytes.
    pub max_frame_size: usize,
    /// How long the connection may stay silent before it is dropped.
    pub pong_wait: Duration,
    /// Interval between keepalive pings. Must be non-zero and shorter than
    /// `pong_wait`.
    pub ping_period: Duration,
    /// Deadline for a single outbound write.
    pub write_wait: Duration,
    /// Deadline for the first frame (`IDENTIFY`).
    pub identify_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            pong_wait: Duration::from_secs(45),
            ping_period: Duration::from_secs(30),
            write_wait: Duration::from_secs(10),
            identify_timeout: Duration::from_secs(10),
        }
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The peer closed the connection.
    PeerClosed,
    /// Nothing was received within the liveness window.
    Timeout,
    /// An inbound frame exceeded the size limit.
    FrameTooLarge,
    /// Reading from the transport failed.
    ReadFailed,
    /// Writing to the transport failed or timed out.
    WriteFailed,
    /// The outbound queue was closed (session replaced or expired).
    QueueClosed,
}

impl Termination {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::Timeout => "timeout",
            Self::FrameTooLarge => "frame_too_large",
            Self::ReadFailed => "read_failed",
            Self::WriteFailed => "write_failed",
            Self::QueueClosed => "queue_closed",
        }
    }
}

enum WriterExit {
    QueueClosed,
    Failed,
}

/// A registered connection and the context it needs to handle events.
pub struct Client {
    handle: ClientHandle,
    ctx: SessionContext,
}

impl Client {
    #[must_use]
    pub fn new(handle: ClientHandle, ctx: SessionContext) -> Self {
        Self { handle, ctx }
    }

    #[must_use]
    pub fn handle(&self) -> &ClientHandle {
        &self.handle
    }

    /// Run both loops until the connection ends, then unregister.
    pub async fn run<R, W>(self, reader: R, writer: W) -> Termination
    where
        R: FrameReader,
        W: FrameWriter + 'static,
    {
        let mut writer_task = tokio::spawn(write_loop(
            self.handle.clone(),
            writer,
            self.ctx.config.clone(),
        ));

        let (termination, writer_done) = tokio::select! {
            termination = self.read_loop(reader) => (termination, false),
            exit = &mut writer_task => {
                let termination = match exit {
                    Ok(WriterExit::QueueClosed) => Termination::QueueClosed,
                    Ok(WriterExit::Failed) | Err(_) => Termination::WriteFailed,
                };
                (termination, true)
            }
        };

        self.ctx.hub.unregister(&self.handle);

        if !writer_done && timeout(self.ctx.config.write_wait, &mut writer_task).await.is_err() {
            warn!(connection = %self.handle.connection_id(), "Writer did not finish, aborting");
            writer_task.abort();
        }

        debug!(
            user = %self.handle.user_id(),
            connection = %self.handle.connection_id(),
            termination = ?termination,
            "Connection closed"
        );
        termination
    }

    async fn read_loop<R: FrameReader>(&self, mut reader: R) -> Termination {
        let queue = self.handle.queue();
        let mut deadline = Instant::now() + self.ctx.config.pong_wait;

        loop {
            let received = tokio::select! {
                () = queue.closed() => return Termination::QueueClosed,
                received = timeout_at(deadline, reader.recv()) => received,
            };

            let frame = match received {
                Err(_) => {
                    debug!(connection = %self.handle.connection_id(), "Liveness deadline expired");
                    return Termination::Timeout;
                }
                Ok(Ok(Some(frame))) => frame,
                Ok(Ok(None)) => return Termination::PeerClosed,
                Ok(Err(TransportError::FrameTooLarge { size, max })) => {
                    debug!(size, max, "Inbound frame too large");
                    return Termination::FrameTooLarge;
                }
                Ok(Err(e)) => {
                    debug!(connection = %self.handle.connection_id(), error = %e, "Read failed");
                    return Termination::ReadFailed;
                }
            };
            deadline = Instant::now() + self.ctx.config.pong_wait;

            match frame {
                Inbound::Ping | Inbound::Pong => {}
                Inbound::Binary(data) => {
                    trace!(len = data.len(), "Ignoring binary frame");
                }
                Inbound::Text(text) => {
                    if text.len() > self.ctx.config.max_frame_size {
                        debug!(size = text.len(), "Inbound frame too large");
                        return Termination::FrameTooLarge;
                    }
                    match codec::decode_client(&text, self.ctx.config.max_frame_size) {
                        Ok(Some(event)) => self.handle_event(event).await,
                        Ok(None) => trace!("Ignoring non-client event"),
                        Err(e) => debug!(error = %e, "Dropping malformed frame"),
                    }
                }
            }
        }
    }

    async fn handle_event(&self, event: ClientEvent) {
        trace!(user = %self.handle.user_id(), kind = event.kind(), "Inbound event");

        match event {
            ClientEvent::Heartbeat => self.reply(&Event::empty(tags::HEARTBEAT_ACK)),
            ClientEvent::Identify(_) => trace!("Ignoring repeated IDENTIFY"),
            ClientEvent::Subscribe(data) => {
                if let Err(e) = self.ctx.hub.subscribe(&self.handle, &data.channel_id) {
                    debug!(channel = %data.channel_id, error = %e, "Subscribe rejected");
                }
            }
            ClientEvent::Unsubscribe(data) => {
                self.ctx.hub.unsubscribe(&self.handle, &data.channel_id);
            }
            ClientEvent::TypingStart(data) => self.typing(data).await,
            ClientEvent::PresenceUpdate(data) => self.presence(data).await,
            ClientEvent::TokenRefresh(data) => self.token_refresh(data).await,
            ClientEvent::VoiceJoin(data) => self.voice_join(data).await,
            ClientEvent::VoiceLeave(data) => self.voice_leave(data).await,
            ClientEvent::DmCallStart(data) => {
                let payload = DmCallRingData {
                    conversation_id: data.conversation_id,
                    caller_id: self.handle.user_id(),
                    caller_username: self.handle.username(),
                };
                self.dm_call(data, tags::DM_CALL_RING, payload).await;
            }
            ClientEvent::DmCallAccept(data) => {
                let payload = DmCallAcceptData {
                    conversation_id: data.conversation_id,
                    user_id: self.handle.user_id(),
                    username: self.handle.username(),
                };
                self.dm_call(data, tags::DM_CALL_ACCEPT, payload).await;
            }
            ClientEvent::DmCallEnd(data) => {
                let payload = DmCallEndData {
                    conversation_id: data.conversation_id,
                    user_id: self.handle.user_id(),
                };
                self.dm_call(data, tags::DM_CALL_END, payload).await;
            }
        }
    }

    /// Write an event straight to this connection's own queue.
    fn reply(&self, event: &Event) {
        match codec::encode_shared(event) {
            Ok(frame) => {
                if !self.handle.queue().try_push(frame).is_delivered() {
                    trace!(kind = %event.kind, "Reply dropped");
                }
            }
            Err(e) => warn!(kind = %event.kind, error = %e, "Failed to encode reply"),
        }
    }

    async fn typing(&self, inbound: TypingStartData) {
        let data = TypingData {
            channel_id: inbound.channel_id,
            user_id: self.handle.user_id(),
            username: self.handle.username(),
        };

        match Event::new(tags::TYPING_START, &data) {
            Ok(event) => {
                self.ctx
                    .hub
                    .broadcast_to_channel(&data.channel_id, &event, Some(self.handle.user_id()))
                    .await;
            }
            Err(e) => warn!(error = %e, "Failed to build typing event"),
        }
    }

    async fn presence(&self, data: PresenceUpdateData) {
        let Some(directory) = &self.ctx.directory else {
            return;
        };
        let presence = PresenceData {
            user_id: self.handle.user_id(),
            username: self.handle.username(),
            status: data.status,
        };
        announce_presence(&self.ctx.hub, directory.as_ref(), &presence).await;
    }

    async fn token_refresh(&self, data: TokenRefreshData) {
        match self.ctx.authenticator.verify(&data.token).await {
            Ok(identity) if identity.user_id == self.handle.user_id() => {
                info!(
                    user = %identity.user_id,
                    username = %identity.username,
                    "Token refreshed"
                );
                self.handle.set_username(identity.username);
            }
            outcome => {
                match outcome {
                    Ok(identity) => debug!(
                        user = %self.handle.user_id(),
                        token_user = %identity.user_id,
                        "Refreshed token belongs to another user"
                    ),
                    Err(e) => debug!(user = %self.handle.user_id(), error = %e, "Token refresh failed"),
                }
                let expired = SessionExpiredData {
                    reason: "invalid_token".into(),
                };
                match Event::new(tags::SESSION_EXPIRED, expired) {
                    Ok(event) => self.reply(&event),
                    Err(e) => warn!(error = %e, "Failed to build session expired event"),
                }
                self.handle.close(CloseReason::session_expired());
            }
        }
    }

    async fn voice_join(&self, data: VoiceChannelData) {
        let state = VoiceState {
            user_id: self.handle.user_id(),
            username: self.handle.username(),
            channel_id: data.channel_id,
            server_id: data.server_id,
            muted: false,
            deafened: false,
        };
        let previous = self.ctx.hub.join_voice(state.clone());

        if let Some(directory) = &self.ctx.directory {
            if let Some(previous) = previous {
                announce_voice(&self.ctx.hub, directory.as_ref(), &previous, false).await;
            }
            announce_voice(&self.ctx.hub, directory.as_ref(), &state, true).await;
        }
    }

    async fn voice_leave(&self, data: VoiceChannelData) {
        let Some(left) = self
            .ctx
            .hub
            .leave_voice(self.handle.user_id(), &data.channel_id)
        else {
            return;
        };
        if let Some(directory) = &self.ctx.directory {
            announce_voice(&self.ctx.hub, directory.as_ref(), &left, false).await;
        }
    }

    async fn dm_call<T: serde::Serialize>(&self, data: DmCallData, kind: &str, payload: T) {
        let Some(directory) = &self.ctx.directory else {
            return;
        };
        let participants = match directory.dm_participant_ids(data.conversation_id).await {
            Ok(ids) => ids,
            Err(e) => {
                debug!(conversation = %data.conversation_id, error = %e, "DM participants lookup failed");
                return;
            }
        };
        let user_id = self.handle.user_id();
        if !participants.contains(&user_id) {
            debug!(conversation = %data.conversation_id, user = %user_id, "Not a participant");
            return;
        }

        match Event::new(kind, payload) {
            Ok(event) => {
                broadcast_to_members(&self.ctx.hub, &participants, &event, Some(user_id)).await;
            }
            Err(e) => warn!(kind, error = %e, "Failed to build call event"),
        }
    }
}

/// Drain the outbound queue to the transport and send keepalive pings.
async fn write_loop<W: FrameWriter>(
    handle: ClientHandle,
    mut writer: W,
    config: ClientConfig,
) -> WriterExit {
    let queue = handle.queue();
    // interval_at panics on a zero period.
    let period = config.ping_period.max(MIN_PING_PERIOD);
    let mut ping = tokio::time::interval_at(Instant::now() + period, period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = queue.pop() => {
                let Some(frame) = frame else {
                    let reason = queue.close_reason();
                    if let Ok(Err(e)) = timeout(config.write_wait, writer.close(reason)).await {
                        trace!(error = %e, "Close frame not sent");
                    }
                    return WriterExit::QueueClosed;
                };
                match timeout(config.write_wait, writer.send_text(&frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(connection = %handle.connection_id(), error = %e, "Write failed");
                        return WriterExit::Failed;
                    }
                    Err(_) => {
                        debug!(connection = %handle.connection_id(), "Write timed out");
                        return WriterExit::Failed;
                    }
                }
            }
            _ = ping.tick() => {
                if !matches!(timeout(config.write_wait, writer.send_ping()).await, Ok(Ok(()))) {
                    debug!(connection = %handle.connection_id(), "Ping failed");
                    return WriterExit::Failed;
                }
            }
        }
    }
}
