use crate::error::AppError;
use crate::middleware::error_handling;
use crate::middleware::guards::{bearer_token, client_ip};
use crate::services::rate_limiter::Dimension;
use crate::services::session_manager::Session;
use crate::state::AppState;
use crate::websocket::message_types::{WsInboundEvent, WsOutboundEvent};
use crate::websocket::{CloseReason, Frame, SessionChannels};
use actix::{
    Actor, ActorContext, AsyncContext, Handler, Message as ActixMessage, StreamHandler,
};
use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};

/// Upper bound on draining queued frames after an overflow close.
const OVERFLOW_DRAIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

// Message type for sending text to WebSocket
#[derive(ActixMessage)]
#[rtype(result = "()")]
struct TextMessage(String);

// WebSocket Actor
struct WsSession {
    session: Option<Session>,
    channels: Option<SessionChannels>,
    state: AppState,
    hb: Instant,
    close_reason: CloseReason,
}

impl WsSession {
    fn new(session: Session, channels: SessionChannels, state: AppState) -> Self {
        Self {
            session: Some(session),
            channels: Some(channels),
            state,
            hb: Instant::now(),
            close_reason: CloseReason::ClientClosed,
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let interval = self.state.config.heartbeat_interval;
        let timeout = self.state.config.heartbeat_timeout;
        ctx.run_interval(interval, move |act, ctx| {
            if Instant::now().duration_since(act.hb) > timeout {
                tracing::warn!(
                    session_id = ?act.session.as_ref().map(|s| s.session_id),
                    "WebSocket heartbeat failed, disconnecting"
                );
                act.close_reason = CloseReason::HeartbeatTimeout;
                ctx.stop();
                return;
            }
            ctx.ping(b"");

            let Some(session) = act.session.clone() else {
                return;
            };
            let sessions = act.state.sessions.clone();
            actix::spawn(async move {
                if let Err(e) = sessions.heartbeat(&session).await {
                    tracing::warn!(session_id = %session.session_id, error = %e, "presence refresh failed");
                }
            });
        });
    }

    fn send_error(ctx: &mut ws::WebsocketContext<Self>, err: &AppError) {
        let event = WsOutboundEvent::Error {
            code: err.error_code().to_string(),
            message: err.to_string(),
        };
        if let Ok(text) = event.to_json() {
            ctx.text(text);
        }
    }

    fn handle_event(&mut self, evt: WsInboundEvent, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(session) = self.session.clone() else {
            return;
        };
        if let Err(e) = self
            .state
            .limiter
            .check(Dimension::Connection, &session.session_id.to_string())
        {
            Self::send_error(ctx, &e);
            return;
        }

        let addr = ctx.address();
        match evt {
            WsInboundEvent::Heartbeat => {
                self.hb = Instant::now();
            }
            WsInboundEvent::RejoinRooms => {
                let sessions = self.state.sessions.clone();
                actix::spawn(async move {
                    if let Err(e) = sessions.rejoin_rooms(&session).await {
                        tracing::warn!(session_id = %session.session_id, error = %e, "rejoin failed");
                        addr.do_send(TextMessage(error_text(&e)));
                    }
                });
            }
            WsInboundEvent::MarkRead { msg_id } => {
                let chat = self.state.chat.clone();
                actix::spawn(async move {
                    if let Err(e) = chat.mark_read(msg_id, session.user_id).await {
                        tracing::debug!(msg_id = %msg_id, error = %e, "mark_read refused");
                        addr.do_send(TextMessage(error_text(&e)));
                    }
                });
            }
        }
    }
}

fn error_text(err: &AppError) -> String {
    WsOutboundEvent::Error {
        code: err.error_code().to_string(),
        message: err.to_string(),
    }
    .to_json()
    .unwrap_or_default()
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        if let Some(session) = &self.session {
            tracing::info!(
                session_id = %session.session_id,
                user_id = %session.user_id,
                device_id = %session.device_id,
                "WebSocket session started"
            );
        }

        self.hb(ctx);

        if let Some(channels) = self.channels.take() {
            ctx.add_stream(ReceiverStream::new(channels.outbound));
            ctx.add_stream(UnboundedReceiverStream::new(channels.control));
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        let Some(session) = self.session.take() else {
            return;
        };
        let sessions = self.state.sessions.clone();
        let reason = self.close_reason.clone();
        actix::spawn(async move {
            sessions.disconnect(session, &reason).await;
        });
    }
}

// Handle text messages
impl Handler<TextMessage> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: TextMessage, ctx: &mut Self::Context) {
        if !msg.0.is_empty() {
            ctx.text(msg.0);
        }
    }
}

// Outbound events queued by the connection registry. The stream ends once
// the session is unregistered and its senders are gone.
impl StreamHandler<Frame> for WsSession {
    fn handle(&mut self, frame: Frame, ctx: &mut Self::Context) {
        ctx.text(frame.text.to_string());
    }
}

impl StreamHandler<CloseReason> for WsSession {
    fn handle(&mut self, reason: CloseReason, ctx: &mut Self::Context) {
        match &reason {
            CloseReason::Evicted => {
                let event = WsOutboundEvent::SessionEvicted {
                    reason: "device connected elsewhere".to_string(),
                };
                if let Ok(text) = event.to_json() {
                    ctx.text(text);
                }
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Policy,
                    description: Some("session evicted".to_string()),
                }));
                self.close_reason = reason;
                ctx.stop();
            }
            CloseReason::Overflow { .. } => {
                // Flush what is already queued; the outbound stream finishing
                // stops the actor.
                self.close_reason = reason;
                ctx.run_later(OVERFLOW_DRAIN_GRACE, |_, ctx| ctx.stop());
            }
            CloseReason::HeartbeatTimeout | CloseReason::ClientClosed => {
                self.close_reason = reason;
                ctx.stop();
            }
        }
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

// Handle WebSocket protocol messages
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<WsInboundEvent>(&text) {
                Ok(evt) => self.handle_event(evt, ctx),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to parse WS message");
                    Self::send_error(ctx, &AppError::BadRequest(format!("invalid frame: {e}")));
                }
            },
            Ok(ws::Message::Binary(_)) => {
                tracing::warn!("binary WebSocket messages not supported");
            }
            Ok(ws::Message::Close(reason)) => {
                tracing::debug!(?reason, "WebSocket close message received");
                self.close_reason = CloseReason::ClientClosed;
                ctx.close(reason);
                ctx.stop();
            }
            Err(e) => {
                tracing::warn!(error = %e, "WebSocket protocol error");
                ctx.stop();
            }
            _ => {}
        }
    }
}

/// GET /ws?token=...
#[get("/ws")]
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    query: web::Query<WsParams>,
) -> Result<HttpResponse, Error> {
    let token = query
        .into_inner()
        .token
        .or_else(|| bearer_token(&req).map(str::to_string));
    let Some(token) = token else {
        tracing::debug!("WebSocket connection rejected: no token");
        return Ok(error_handling::into_response(&AppError::Unauthorized));
    };

    let (session, channels) = match state.sessions.connect(&token, &client_ip(&req)).await {
        Ok(connected) => connected,
        Err(e) => {
            tracing::debug!(error = %e, "WebSocket connection rejected");
            return Ok(error_handling::into_response(&e));
        }
    };

    let actor = WsSession::new(session.clone(), channels, state.get_ref().clone());
    match ws::start(actor, &req, stream) {
        Ok(resp) => Ok(resp),
        Err(e) => {
            // The handshake failed after presence was installed; undo it.
            state
                .sessions
                .disconnect(session, &CloseReason::ClientClosed)
                .await;
            Err(e)
        }
    }
}
