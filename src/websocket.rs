//! # Twilio Media Stream WebSocket
//!
//! Twilio connects to `/twilio` once per call and streams JSON events (`connected`, `start`,
//! `media`, `stop`). This module upgrades the request, runs the socket as an actix actor, and
//! hands the call to a `CallSession` running on its own task.
//!
//! ## Actor ↔ Session Wiring:
//! - **Inbound**: every text or binary frame is forwarded into an unbounded channel that the
//!   session reads as a `Stream`. Closing the socket drops the sender, which ends that stream.
//! - **Outbound**: the session writes through a `ChannelSink`. The actor consumes its commands
//!   as a message stream, sending text frames and closing the socket on `Close`.
//!
//! ## Connection Health:
//! The actor pings every 30 seconds and stops if nothing (not even a pong) arrived for 60.

use crate::agent::client::AgentClient;
use crate::agent::protocol::AgentSettings;
use crate::bridge::session::{CallSession, SessionOptions};
use crate::bridge::socket::{ChannelSink, Frame, SocketCommand};
use crate::error::{BridgeError, Peer};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use futures_util::future::ready;
use futures_util::stream::{self, StreamExt};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

type InboundSender = mpsc::UnboundedSender<Result<Frame, BridgeError>>;

/// One Twilio media stream connection.
pub struct TwilioMediaSocket {
    /// Feeds the session's telephony reader. `None` once the socket is closing.
    inbound: Option<InboundSender>,

    /// Taken in `started` and turned into a message stream.
    commands: Option<mpsc::UnboundedReceiver<SocketCommand>>,

    last_heartbeat: Instant,

    /// Set when the close handshake has been started, so it happens only once.
    closing: bool,
}

/// A write or close request from the session.
#[derive(Message)]
#[rtype(result = "()")]
struct TelephonyCommand(SocketCommand);

impl TwilioMediaSocket {
    fn new(inbound: InboundSender, commands: mpsc::UnboundedReceiver<SocketCommand>) -> Self {
        Self {
            inbound: Some(inbound),
            commands: Some(commands),
            last_heartbeat: Instant::now(),
            closing: false,
        }
    }

    fn forward(&mut self, frame: Frame) {
        if let Some(inbound) = &self.inbound {
            if inbound.send(Ok(frame)).is_err() {
                debug!("Call session already finished, dropping telephony frame");
                self.inbound = None;
            }
        }
    }

    fn close(&mut self, ctx: &mut ws::WebsocketContext<Self>, reason: Option<ws::CloseReason>) {
        self.inbound = None;
        if !self.closing {
            self.closing = true;
            ctx.close(reason);
        }
        ctx.stop();
    }
}

impl Actor for TwilioMediaSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        debug!("Twilio media socket started");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("Twilio heartbeat timeout, closing connection");
                act.close(ctx, Some(ws::CloseCode::Away.into()));
            } else {
                ctx.ping(b"");
            }
        });

        // A dropped sink closes the socket just like an explicit close
        if let Some(commands) = self.commands.take() {
            let commands = UnboundedReceiverStream::new(commands)
                .chain(stream::once(ready(SocketCommand::Close)))
                .map(TelephonyCommand);
            ctx.add_message_stream(commands);
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.inbound = None;
        debug!("Twilio media socket stopped");
    }
}

impl Handler<TelephonyCommand> for TwilioMediaSocket {
    type Result = ();

    fn handle(&mut self, msg: TelephonyCommand, ctx: &mut Self::Context) {
        match msg.0 {
            SocketCommand::Send(_) if self.closing => {}
            SocketCommand::Send(Frame::Text(text)) => ctx.text(text),
            SocketCommand::Send(Frame::Binary(data)) => ctx.binary(data),
            SocketCommand::Close => self.close(ctx, Some(ws::CloseCode::Normal.into())),
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for TwilioMediaSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.forward(Frame::Text(text.to_string()));
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.forward(Frame::Binary(data.to_vec()));
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(reason = ?reason, "Twilio closed the media socket");
                self.close(ctx, reason);
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Unexpected continuation frame from Twilio");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(error = %err, "Twilio WebSocket protocol error");
                self.close(ctx, Some(ws::CloseCode::Protocol.into()));
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        self.inbound = None;
        ctx.stop();
    }
}

/// `GET /twilio`: upgrade a Twilio media stream and start bridging the call.
///
/// Answers 503 without upgrading when `max_concurrent_sessions` calls are already running.
pub async fn twilio_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let peer = req.connection_info().peer_addr().map(str::to_string);
    let slot = state.try_begin_session().map_err(|err| {
        warn!(peer = ?peer, error = %err, "Rejecting Twilio media stream");
        err
    })?;

    let config = state.get_config();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (telephony_writer, commands) = ChannelSink::new(Peer::Telephony);

    let response = ws::start(TwilioMediaSocket::new(inbound_tx, commands), &req, stream)?;
    state.record_session_accepted();

    let session = CallSession::new(
        SessionOptions::from_config(&config),
        AgentSettings::from_config(&config.audio, &config.session),
    );
    let connector = AgentClient::new(&config.agent);
    info!(session_id = %session.id(), peer = ?peer, "Accepted Twilio media stream");

    let state = state.clone();
    actix_web::rt::spawn(async move {
        let report = session
            .run(UnboundedReceiverStream::new(inbound_rx), telephony_writer, &connector)
            .await;
        state.record_report(&report);
        drop(slot);
    });

    Ok(response)
}
