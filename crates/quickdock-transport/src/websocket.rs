//! WebSocket transport for the state feed and exec terminals.

use axum::{
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, close_code},
    },
    response::IntoResponse,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use quickdock_core::{EngineError, TermSize};
use quickdock_session::{
    ExecBridge, ExecOutput, ExecSession, ExecWriter, HubError, SessionError, Subscription,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
    protocol::{EventMessage, ExecClientMessage, ExecServerMessage},
    state::AppState,
};

/// Incoming half of a socket.
pub trait ClientStream: Stream<Item = Result<Message, axum::Error>> + Unpin + Send {}
impl<T> ClientStream for T where T: Stream<Item = Result<Message, axum::Error>> + Unpin + Send {}

/// Outgoing half of a socket.
pub trait ClientSink: Sink<Message> + Unpin + Send {}
impl<T> ClientSink for T where T: Sink<Message> + Unpin + Send {}

fn text<T: Serialize>(msg: &T) -> Option<Message> {
    match serde_json::to_string(msg) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            tracing::error!("Failed to serialize message: {e}");
            None
        }
    }
}

fn close(code: u16, reason: impl Into<String>) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into().into(),
    }))
}

/// `GET /api/ws/events`
pub async fn events_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let subscription = state.hub.subscribe();
        let (sink, stream) = socket.split();
        forward_events(subscription, sink, stream).await;
    })
}

/// Push every snapshot of `subscription` to the client until either side
/// goes away.
pub async fn forward_events<W, R>(mut subscription: Subscription, mut sink: W, mut stream: R)
where
    W: ClientSink,
    R: ClientStream,
{
    tracing::debug!(subscriber_id = subscription.id(), "Events client connected");
    loop {
        tokio::select! {
            snapshot = subscription.recv() => match snapshot {
                Ok(snapshot) => {
                    let Some(msg) = text(&EventMessage::State(&snapshot)) else { continue };
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(HubError::SubscriberOverloaded) => {
                    tracing::warn!(subscriber_id = subscription.id(), "Events client overloaded");
                    if let Some(msg) = text(&EventMessage::Overloaded) {
                        let _ = sink.send(msg).await;
                    }
                    let _ = sink.send(close(close_code::AGAIN, "overloaded")).await;
                    break;
                }
                Err(HubError::Closed) => {
                    let _ = sink.send(close(close_code::AWAY, "shutting down")).await;
                    break;
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    tracing::debug!(subscriber_id = subscription.id(), "Events client disconnected");
    subscription.close();
}

/// Initial terminal size requested by the exec client.
#[derive(Debug, Default, Deserialize)]
pub struct ExecQuery {
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

impl ExecQuery {
    fn size(&self) -> TermSize {
        let default = TermSize::default();
        TermSize::new(
            self.cols.filter(|c| *c > 0).unwrap_or(default.cols),
            self.rows.filter(|r| *r > 0).unwrap_or(default.rows),
        )
    }
}

/// `GET /api/ws/exec/{container_id}`
pub async fn exec_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(container_id): Path<String>,
    Query(query): Query<ExecQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        bridge_exec(&state.exec, &container_id, query.size(), sink, stream).await;
    })
}

/// Open an exec session and shuttle bytes between it and the client.
///
/// Binary frames are raw keystrokes; text frames are control messages when
/// they parse as [`ExecClientMessage`] and keystrokes otherwise.
pub async fn bridge_exec<W, R>(
    bridge: &ExecBridge,
    container_id: &str,
    size: TermSize,
    mut sink: W,
    stream: R,
) where
    W: ClientSink,
    R: ClientStream,
{
    let mut session = match bridge.open(container_id, size).await {
        Ok(session) => session,
        Err(e) => {
            let code = match &e {
                SessionError::Engine(
                    EngineError::ContainerNotFound(_) | EngineError::ContainerNotRunning(_),
                ) => close_code::POLICY,
                _ => close_code::ERROR,
            };
            tracing::info!(container_id, error = %e, "Exec open refused");
            let _ = sink.send(close(code, e.to_string())).await;
            return;
        }
    };

    let writer = session.writer();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    let client_left = tokio::select! {
        () = pump_client(&writer, stream, reply_tx) => true,
        () = pump_session(&mut session, sink, reply_rx) => false,
    };
    tracing::debug!(
        session_id = %session.id(),
        container_id,
        client_left,
        "Exec socket finished"
    );
    if client_left {
        session.disconnect();
    } else {
        session.close();
    }
}

async fn pump_client<R>(
    writer: &ExecWriter,
    mut stream: R,
    replies: mpsc::UnboundedSender<ExecServerMessage>,
) where
    R: ClientStream,
{
    while let Some(msg) = stream.next().await {
        let sent = match msg {
            Ok(Message::Binary(data)) => writer.send(data).await,
            Ok(Message::Text(text)) => match serde_json::from_str::<ExecClientMessage>(&text) {
                Ok(ExecClientMessage::Resize { cols, rows }) => {
                    writer.resize(TermSize::new(cols, rows)).await
                }
                Ok(msg @ ExecClientMessage::Input { .. }) => match msg.decode_input() {
                    Some(data) => writer.send(data).await,
                    None => {
                        let _ = replies.send(ExecServerMessage::Error {
                            message: "Invalid base64 input".to_string(),
                        });
                        Ok(())
                    }
                },
                Ok(ExecClientMessage::Ping) => {
                    let _ = replies.send(ExecServerMessage::Pong);
                    Ok(())
                }
                Err(_) => writer.send(text.as_bytes().to_vec()).await,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::debug!("WebSocket error: {e}");
                break;
            }
        };
        // The session ended on its own; its final notice is on the way.
        if sent.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn pump_session<W>(
    session: &mut ExecSession,
    mut sink: W,
    mut replies: mpsc::UnboundedReceiver<ExecServerMessage>,
) where
    W: ClientSink,
{
    loop {
        let msg = tokio::select! {
            out = session.recv() => match out {
                Some(ExecOutput::Data(data)) => Message::Binary(data),
                Some(ExecOutput::Ended(end)) => {
                    if let Some(msg) = text(&ExecServerMessage::from(&end)) {
                        let _ = sink.send(msg).await;
                    }
                    let _ = sink.send(close(close_code::NORMAL, "session ended")).await;
                    return;
                }
                None => return,
            },
            Some(reply) = replies.recv() => match text(&reply) {
                Some(msg) => msg,
                None => continue,
            },
        };
        if sink.send(msg).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use bytes::Bytes;
    use futures::channel::mpsc as chan;
    use quickdock_core::{
        ContainerStatus, SnapshotBuilder,
        testing::{ScriptedEngine, container_view},
    };
    use quickdock_session::{BroadcastHub, ExecConfig, HubConfig};

    use super::*;

    type Inbound = chan::UnboundedSender<Result<Message, axum::Error>>;
    type Outbound = chan::UnboundedReceiver<Message>;

    fn engine() -> Arc<ScriptedEngine> {
        ScriptedEngine::new(vec![
            container_view("web", ContainerStatus::Running, Some("shop")),
            container_view("old", ContainerStatus::Exited, Some("shop")),
        ])
    }

    fn spawn_exec(engine: &Arc<ScriptedEngine>, container_id: &str) -> (Inbound, Outbound) {
        let bridge = ExecBridge::new(engine.clone(), ExecConfig::default());
        let (in_tx, in_rx) = chan::unbounded();
        let (out_tx, out_rx) = chan::unbounded();
        let container_id = container_id.to_string();
        tokio::spawn(async move {
            bridge_exec(&bridge, &container_id, TermSize::new(80, 24), out_tx, in_rx).await;
        });
        (in_tx, out_rx)
    }

    async fn next(out: &mut Outbound) -> Message {
        tokio::time::timeout(Duration::from_secs(1), out.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
    }

    fn json(msg: &Message) -> serde_json::Value {
        match msg {
            Message::Text(text) => serde_json::from_str(text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    fn close_code_of(msg: &Message) -> u16 {
        match msg {
            Message::Close(Some(frame)) => frame.code,
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exec_refused_for_stopped_container() {
        let engine = engine();
        let (_in, mut out) = spawn_exec(&engine, "old");
        assert_eq!(close_code_of(&next(&mut out).await), close_code::POLICY);

        let (_in, mut out) = spawn_exec(&engine, "missing");
        assert_eq!(close_code_of(&next(&mut out).await), close_code::POLICY);

        engine.set_unavailable(true);
        let (_in, mut out) = spawn_exec(&engine, "web");
        assert_eq!(close_code_of(&next(&mut out).await), close_code::ERROR);
    }

    #[tokio::test]
    async fn test_resize_control_precedes_keystrokes() {
        let engine = engine();
        let (input, mut out) = spawn_exec(&engine, "web");

        let resize = r#"{"kind":"resize","cols":120,"rows":40}"#;
        input.unbounded_send(Ok(Message::Text(resize.into()))).unwrap();
        input
            .unbounded_send(Ok(Message::Binary(Bytes::from_static(b"ls\n"))))
            .unwrap();

        assert_eq!(
            next(&mut out).await,
            Message::Binary(Bytes::from_static(b"[120x40] ls\n"))
        );
    }

    #[tokio::test]
    async fn test_plain_text_and_base64_are_keystrokes() {
        let engine = engine();
        let (input, mut out) = spawn_exec(&engine, "web");

        input.unbounded_send(Ok(Message::Text("pwd\n".into()))).unwrap();
        assert_eq!(
            next(&mut out).await,
            Message::Binary(Bytes::from_static(b"[80x24] pwd\n"))
        );

        let encoded = serde_json::to_string(&ExecClientMessage::input(b"id\n")).unwrap();
        input.unbounded_send(Ok(Message::Text(encoded.into()))).unwrap();
        assert_eq!(
            next(&mut out).await,
            Message::Binary(Bytes::from_static(b"[80x24] id\n"))
        );
    }

    #[tokio::test]
    async fn test_ping_gets_pong() {
        let engine = engine();
        let (input, mut out) = spawn_exec(&engine, "web");
        tokio_test::assert_ok!(input.unbounded_send(Ok(Message::Text(r#"{"kind":"ping"}"#.into()))));
        assert_eq!(json(&next(&mut out).await)["kind"], "pong");
    }

    #[tokio::test]
    async fn test_process_exit_sends_notice_then_close() {
        let engine = engine();
        let (input, mut out) = spawn_exec(&engine, "web");
        input
            .unbounded_send(Ok(Message::Binary(Bytes::from_static(b"exit\n"))))
            .unwrap();

        let notice = json(&next(&mut out).await);
        assert_eq!(notice["kind"], "exit");
        assert_eq!(notice["reason"], "process_exited");
        assert_eq!(notice["exit_code"], 0);
        assert_eq!(close_code_of(&next(&mut out).await), close_code::NORMAL);
    }

    #[tokio::test]
    async fn test_client_disconnect_releases_exec() {
        let engine = engine();
        let (input, _out) = spawn_exec(&engine, "web");
        tokio::time::timeout(Duration::from_secs(1), async {
            while engine.live_execs() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        drop(input);
        tokio::time::timeout(Duration::from_secs(1), async {
            while engine.live_execs() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn hub(engine: &Arc<ScriptedEngine>, subscriber_buffer: usize) -> Arc<BroadcastHub> {
        BroadcastHub::new(
            SnapshotBuilder::new(engine.clone()),
            HubConfig {
                subscriber_buffer,
                ..HubConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_events_forward_state_envelopes() {
        let engine = engine();
        let hub = hub(&engine, 8);
        hub.tick().await.unwrap();

        let (_in_tx, in_rx) = chan::unbounded::<Result<Message, axum::Error>>();
        let (out_tx, mut out) = chan::unbounded();
        tokio::spawn(forward_events(hub.subscribe(), out_tx, in_rx));

        let first = json(&next(&mut out).await);
        assert_eq!(first["kind"], "state");
        assert_eq!(first["payload"]["seq"], 1);
        assert_eq!(first["payload"]["projects"][0]["name"], "shop");

        hub.tick().await.unwrap();
        assert_eq!(json(&next(&mut out).await)["payload"]["seq"], 2);
    }

    #[tokio::test]
    async fn test_overloaded_events_client_is_told_and_closed() {
        let engine = engine();
        let hub = hub(&engine, 1);
        let subscription = hub.subscribe();
        hub.tick().await.unwrap();
        hub.tick().await.unwrap();
        assert_eq!(hub.subscriber_count(), 0);

        let (_in_tx, in_rx) = chan::unbounded::<Result<Message, axum::Error>>();
        let (out_tx, mut out) = chan::unbounded();
        tokio::spawn(forward_events(subscription, out_tx, in_rx));

        assert_eq!(json(&next(&mut out).await)["payload"]["seq"], 1);
        assert_eq!(json(&next(&mut out).await)["kind"], "overloaded");
        assert_eq!(close_code_of(&next(&mut out).await), close_code::AGAIN);
    }

    #[tokio::test]
    async fn test_events_client_close_unsubscribes() {
        let engine = engine();
        let hub = hub(&engine, 8);
        let (in_tx, in_rx) = chan::unbounded::<Result<Message, axum::Error>>();
        let (out_tx, _out) = chan::unbounded();
        let task = tokio::spawn(forward_events(hub.subscribe(), out_tx, in_rx));
        assert_eq!(hub.subscriber_count(), 1);

        in_tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hub.subscriber_count(), 0);
    }
}
