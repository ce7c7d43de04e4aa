//! Chat socket actor.
//!
//! One actor per socket. Outbound frames arrive through the connection's
//! bounded registry buffer; inbound frames are handled in order by a
//! per-session worker so a slow store call never blocks pushes.

use actix::{Actor, ActorContext, Addr, AsyncContext, Handler, Message as ActixMessage, StreamHandler};
use actix_web_actors::ws;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::message_types::{is_user_activity, ClientCommand, ClientFrame, ServerFrame};
use crate::error::AppError;
use crate::presence::PresenceLease;
use crate::registry::{channel, CloseReason as RegistryCloseReason, ConnectionId, Outbound};
use crate::state::AppState;
use crate::topic::Topic;

/// Inbound frames waiting for the worker before new ones are refused.
const INBOUND_QUEUE: usize = 32;

#[derive(ActixMessage)]
#[rtype(result = "()")]
struct Reply(ServerFrame);

pub struct ChatSession {
    chat_id: Uuid,
    user_id: Uuid,
    /// Other active participants whose presence this socket follows
    watched_users: Vec<Uuid>,
    state: AppState,
    connection_ids: Vec<ConnectionId>,
    inbound: Option<mpsc::Sender<String>>,
    presence: Option<PresenceLease>,
    hb: Instant,
}

impl ChatSession {
    pub fn new(chat_id: Uuid, user_id: Uuid, participants: Vec<Uuid>, state: AppState) -> Self {
        let watched_users = participants.into_iter().filter(|p| *p != user_id).collect();
        Self {
            chat_id,
            user_id,
            watched_users,
            state,
            connection_ids: Vec::new(),
            inbound: None,
            presence: None,
            hb: Instant::now(),
        }
    }

    fn register(&mut self, ctx: &mut ws::WebsocketContext<Self>) -> Result<(), AppError> {
        let (handle, rx) = channel(self.state.config.registry.outbound_buffer);
        let registry = &self.state.registry;

        let topics = std::iter::once(Topic::Chat(self.chat_id))
            .chain(self.watched_users.iter().map(|u| Topic::Presence(*u)));
        for topic in topics {
            let id = registry.register(self.user_id, topic, handle.clone())?;
            self.connection_ids.push(id);
        }

        ctx.add_stream(rx.into_stream());
        self.presence = Some(self.state.presence.connect(self.user_id));
        Ok(())
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let interval = self.state.config.presence.heartbeat_interval;
        let hard_timeout = self.state.config.presence.hard_timeout;
        ctx.run_interval(interval, move |act, ctx| {
            if Instant::now().duration_since(act.hb) > hard_timeout {
                tracing::warn!(
                    user_id = %act.user_id,
                    chat_id = %act.chat_id,
                    "websocket heartbeat missed, disconnecting"
                );
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    /// Note a sign of life. `activity` marks the user active as well.
    fn alive(&mut self, activity: bool) {
        self.hb = Instant::now();
        for id in &self.connection_ids {
            self.state.registry.touch(*id);
        }
        if let Some(lease) = &mut self.presence {
            if activity {
                self.state.presence.activity(lease);
            } else {
                self.state.presence.heartbeat(lease);
            }
        }
    }

    fn start_worker(&mut self, addr: Addr<Self>) {
        let (tx, mut rx) = mpsc::channel::<String>(INBOUND_QUEUE);
        self.inbound = Some(tx);

        let state = self.state.clone();
        let (chat_id, user_id) = (self.chat_id, self.user_id);
        actix::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Some(reply) = handle_frame(&state, chat_id, user_id, &text).await {
                    addr.do_send(Reply(reply));
                }
            }
        });
    }
}

enum Outcome {
    Silent,
    Pong,
    Ack(serde_json::Value),
}

/// Process one client frame. Errors become ERROR frames; the socket stays
/// open.
pub async fn handle_frame(
    state: &AppState,
    chat_id: Uuid,
    user_id: Uuid,
    text: &str,
) -> Option<ServerFrame> {
    let mut request_id = None;
    match process(state, chat_id, user_id, text, &mut request_id).await {
        Ok(Outcome::Silent) => None,
        Ok(Outcome::Pong) => Some(ServerFrame::Pong),
        Ok(Outcome::Ack(data)) => Some(ServerFrame::Ack { request_id, data }),
        Err(err) => {
            tracing::debug!(user_id = %user_id, chat_id = %chat_id, error = %err, "socket frame rejected");
            Some(ServerFrame::error(&err, request_id))
        }
    }
}

async fn process(
    state: &AppState,
    chat_id: Uuid,
    user_id: Uuid,
    text: &str,
    request_id: &mut Option<String>,
) -> Result<Outcome, AppError> {
    state.rate_limiter.check(user_id, "socket").await?;
    let frame = ClientFrame::parse(text)?;
    *request_id = frame.request_id.clone();

    match frame.command(chat_id)? {
        ClientCommand::SendMessage { content } => {
            let message = state.messages.send_message(chat_id, user_id, &content).await?;
            Ok(Outcome::Ack(json!({
                "messageId": message.id,
                "createdAt": message.created_at,
            })))
        }
        ClientCommand::MarkRead { message_ids } => {
            let receipt = state.messages.mark_read(chat_id, user_id, &message_ids).await?;
            Ok(Outcome::Ack(json!({
                "messageIds": receipt.message_ids,
                "lastReadAt": receipt.last_read_at,
            })))
        }
        ClientCommand::Typing => {
            state.messages.typing(chat_id, user_id).await?;
            Ok(Outcome::Silent)
        }
        ClientCommand::CallStart => {
            let status = state.presence.call_start(user_id)?;
            Ok(Outcome::Ack(json!({ "status": status })))
        }
        ClientCommand::CallEnd => {
            let status = state.presence.call_end(user_id);
            Ok(Outcome::Ack(json!({ "status": status })))
        }
        ClientCommand::Ping => Ok(Outcome::Pong),
    }
}

impl Actor for ChatSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        if let Err(e) = self.register(ctx) {
            tracing::warn!(user_id = %self.user_id, chat_id = %self.chat_id, error = %e, "socket registration failed");
            ctx.close(Some(ws::CloseReason {
                code: ws::CloseCode::Error,
                description: Some(e.to_string()),
            }));
            ctx.stop();
            return;
        }

        self.hb(ctx);
        self.start_worker(ctx.address());
        tracing::info!(user_id = %self.user_id, chat_id = %self.chat_id, "websocket session started");
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        for id in self.connection_ids.drain(..) {
            self.state.registry.unregister(id);
        }
        if let Some(lease) = self.presence.take() {
            self.state.presence.disconnect(lease);
        }
        self.inbound = None;
        tracing::info!(user_id = %self.user_id, chat_id = %self.chat_id, "websocket session stopped");
    }
}

impl Handler<Reply> for ChatSession {
    type Result = ();

    fn handle(&mut self, msg: Reply, ctx: &mut Self::Context) {
        if let Some(frame) = msg.0.encode() {
            ctx.text(frame.to_string());
        }
    }
}

/// Frames and close signals from the registry.
impl StreamHandler<Outbound> for ChatSession {
    fn handle(&mut self, item: Outbound, ctx: &mut Self::Context) {
        match item {
            Outbound::Frame(frame) => ctx.text(frame.to_string()),
            Outbound::Closed(reason) => {
                let code = match reason {
                    Some(RegistryCloseReason::SlowConsumer) => ws::CloseCode::Policy,
                    Some(RegistryCloseReason::Shutdown) => ws::CloseCode::Restart,
                    Some(RegistryCloseReason::IdleTimeout) | None => ws::CloseCode::Away,
                };
                ctx.close(Some(ws::CloseReason {
                    code,
                    description: reason.map(|r| r.description().to_string()),
                }));
                ctx.stop();
            }
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ChatSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.alive(false);
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.alive(false);
            }
            Ok(ws::Message::Text(text)) => {
                self.alive(is_user_activity(&text, self.chat_id));
                let Some(inbound) = &self.inbound else {
                    return;
                };
                if inbound.try_send(text.to_string()).is_err() {
                    let err = AppError::RateLimited {
                        retry_after_secs: 1,
                    };
                    if let Some(frame) = ServerFrame::error(&err, None).encode() {
                        ctx.text(frame.to_string());
                    }
                }
            }
            Ok(ws::Message::Binary(_)) => {
                let err = AppError::InvalidFrame("binary frames are not supported".into());
                if let Some(frame) = ServerFrame::error(&err, None).encode() {
                    ctx.text(frame.to_string());
                }
            }
            Ok(ws::Message::Close(reason)) => {
                tracing::debug!(user_id = %self.user_id, ?reason, "client closed websocket");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(e) => {
                tracing::warn!(user_id = %self.user_id, error = %e, "websocket protocol error");
                ctx.stop();
            }
        }
    }
}
