//! NIP-01 WebSocket endpoint: message dispatch, per-connection state, and
//! the AUTH handshake.
//!
//! Each connection runs a reader loop plus a writer task draining the
//! bounded outbound queue. Frames on one connection are handled to
//! completion in order; connections run concurrently.

use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Notify, Semaphore};
use tracing::{debug, warn};

use crate::{
    event::Event,
    filter::Filter,
    ingest::{IngestJob, IngestSender},
    storage::{PutOutcome, Store},
    subs::{Registry, OUTBOUND_QUEUE},
    validate::{ClientCtx, Rejection, Validator},
};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide context assembled once at startup and passed by reference
/// into every handler.
pub struct RelayCtx {
    pub store: Store,
    pub registry: Registry,
    pub validator: Validator,
    pub ingest: IngestSender,
    /// Bounds concurrent signature verification to the core count so
    /// socket I/O is never starved by crypto work.
    verify_pool: Arc<Semaphore>,
}

impl RelayCtx {
    pub fn new(
        store: Store,
        registry: Registry,
        validator: Validator,
        ingest: IngestSender,
    ) -> Arc<Self> {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Arc::new(Self {
            store,
            registry,
            validator,
            ingest,
            verify_pool: Arc::new(Semaphore::new(cores)),
        })
    }
}

/// Start the WebSocket server.
pub async fn serve_ws(
    addr: SocketAddr,
    ctx: Arc<RelayCtx>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app(ctx).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

/// Router serving the relay endpoint at `/`.
fn app(ctx: Arc<RelayCtx>) -> Router {
    Router::new().route("/", get(handler)).with_state(ctx)
}

/// Handle the HTTP upgrade and spawn the connection processor.
async fn handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(ctx): State<Arc<RelayCtx>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| process(socket, ctx, remote))
}

/// Per-connection lifecycle: attach the outbound queue, issue the AUTH
/// challenge, dispatch frames in order, and always detach on the way out.
async fn process(socket: WebSocket, ctx: Arc<RelayCtx>, remote: SocketAddr) {
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let (out_tx, out_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    let kick = Arc::new(Notify::new());
    ctx.registry.attach(conn_id, out_tx.clone(), kick.clone());
    debug!(conn_id, %remote, "connection open");

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, out_rx, kick.clone()));

    // One-time challenge for the optional AUTH flow.
    let challenge = hex::encode(rand::random::<[u8; 16]>());
    let _ = send(&out_tx, json!(["AUTH", challenge])).await;

    let mut authed: Option<String> = None;
    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(txt) => {
                let done = handle_frame(
                    &ctx,
                    conn_id,
                    &remote,
                    &mut authed,
                    &challenge,
                    &txt,
                    &out_tx,
                )
                .await;
                if done.is_err() {
                    // Outbound side is gone; no point reading further.
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Teardown is unconditional: future broadcasts must not see this
    // connection's subscriptions.
    ctx.registry.detach(conn_id);
    kick.notify_one();
    let _ = writer.await;
    debug!(conn_id, "connection closed");
}

/// Drain the outbound queue into the socket until the queue closes, a send
/// fails, or the connection is kicked for falling behind.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<String>,
    kick: Arc<Notify>,
) {
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = kick.notified() => break,
        }
    }
    let _ = sink.close().await;
}

/// Dispatch one client frame. `Err` means the outbound queue is closed and
/// the reader should stop.
async fn handle_frame(
    ctx: &Arc<RelayCtx>,
    conn_id: u64,
    remote: &SocketAddr,
    authed: &mut Option<String>,
    challenge: &str,
    txt: &str,
    out: &mpsc::Sender<String>,
) -> Result<(), ()> {
    let Ok(val) = serde_json::from_str::<Value>(txt) else {
        return notice(out, "could not parse message").await;
    };
    let Some(arr) = val.as_array() else {
        return notice(out, "message is not a JSON array").await;
    };
    match arr.first().and_then(|v| v.as_str()) {
        Some("EVENT") => handle_event(ctx, conn_id, remote, authed, arr, out).await,
        Some("REQ") => handle_req(ctx, conn_id, arr, out).await,
        Some("CLOSE") => {
            match arr.get(1).and_then(|v| v.as_str()) {
                Some(sub_id) => ctx.registry.unregister(conn_id, sub_id),
                None => return notice(out, "CLOSE requires a subscription id").await,
            }
            Ok(())
        }
        Some("COUNT") => handle_count(ctx, arr, out).await,
        Some("AUTH") => handle_auth(ctx, authed, challenge, arr, out).await,
        _ => notice(out, "unknown message type").await,
    }
}

/// EVENT: validate on the bounded worker pool, then hand the event to the
/// ingester and relay its acknowledgment.
async fn handle_event(
    ctx: &Arc<RelayCtx>,
    conn_id: u64,
    remote: &SocketAddr,
    authed: &Option<String>,
    arr: &[Value],
    out: &mpsc::Sender<String>,
) -> Result<(), ()> {
    let Some(raw) = arr.get(1) else {
        return notice(out, "EVENT requires a payload").await;
    };
    let ev: Event = match serde_json::from_value(raw.clone()) {
        Ok(ev) => ev,
        Err(_) => {
            // If the payload at least names an id we can answer with the
            // OK form clients branch on; otherwise it is a protocol error.
            return match raw.get("id").and_then(|v| v.as_str()) {
                Some(id) => send_ok(out, id, false, "invalid: malformed event").await,
                None => notice(out, "could not parse event").await,
            };
        }
    };
    let client = ClientCtx {
        conn_id,
        remote: remote.ip().to_string(),
        authed_pubkey: authed.clone(),
    };
    let permit = ctx.verify_pool.clone().acquire_owned().await.ok();
    let task_ctx = ctx.clone();
    let task_ev = ev.clone();
    let verdict = tokio::task::spawn_blocking(move || {
        let verdict = task_ctx.validator.admit(&task_ev, &client);
        drop(permit);
        verdict
    })
    .await
    .unwrap_or_else(|_| Err(Rejection::Error("verification task failed".into())));

    match verdict {
        Err(rejection) => send_ok(out, &ev.id, false, &rejection.to_string()).await,
        Ok(()) => {
            let (ack, ack_rx) = oneshot::channel();
            let id = ev.id.clone();
            if ctx.ingest.send(IngestJob { event: ev, ack }).await.is_err() {
                return send_ok(out, &id, false, "error: relay is shutting down").await;
            }
            match ack_rx.await {
                Ok(Ok(PutOutcome::Stored)) => send_ok(out, &id, true, "").await,
                Ok(Ok(_)) => {
                    send_ok(out, &id, true, "duplicate: already have this event").await
                }
                Ok(Err(rejection)) => send_ok(out, &id, false, &rejection.to_string()).await,
                Err(_) => send_ok(out, &id, false, "error: storage unavailable").await,
            }
        }
    }
}

/// REQ: register the subscription first so no concurrently admitted event
/// is missed, then replay history and mark its end with EOSE.
async fn handle_req(
    ctx: &Arc<RelayCtx>,
    conn_id: u64,
    arr: &[Value],
    out: &mpsc::Sender<String>,
) -> Result<(), ()> {
    let Some(sub_id) = arr.get(1).and_then(|v| v.as_str()) else {
        return notice(out, "REQ requires a subscription id").await;
    };
    if arr.len() < 3 {
        return notice(out, "REQ requires at least one filter").await;
    }
    let mut filters = Vec::with_capacity(arr.len() - 2);
    for raw in &arr[2..] {
        match Filter::from_value(raw) {
            Ok(filter) => filters.push(filter),
            Err(e) => return notice(out, &format!("invalid filter: {e}")).await,
        }
    }
    ctx.registry.register(conn_id, sub_id, filters.clone());
    match ctx.store.query(&filters) {
        Ok(events) => {
            for ev in events {
                send(out, json!(["EVENT", sub_id, ev])).await?;
            }
        }
        Err(e) => {
            warn!(conn_id, sub_id, error = %e, "historical query failed");
            notice(out, "error: could not run query").await?;
        }
    }
    send(out, json!(["EOSE", sub_id])).await
}

/// COUNT: answer with the cardinality of the filter union, no rows.
async fn handle_count(
    ctx: &Arc<RelayCtx>,
    arr: &[Value],
    out: &mpsc::Sender<String>,
) -> Result<(), ()> {
    let Some(sub_id) = arr.get(1).and_then(|v| v.as_str()) else {
        return notice(out, "COUNT requires a subscription id").await;
    };
    if arr.len() < 3 {
        return notice(out, "COUNT requires at least one filter").await;
    }
    let mut filters = Vec::with_capacity(arr.len() - 2);
    for raw in &arr[2..] {
        match Filter::from_value(raw) {
            Ok(filter) => filters.push(filter),
            Err(e) => return notice(out, &format!("invalid filter: {e}")).await,
        }
    }
    match ctx.store.count(&filters) {
        Ok(count) => send(out, json!(["COUNT", sub_id, {"count": count}])).await,
        Err(e) => {
            warn!(sub_id, error = %e, "count query failed");
            notice(out, "error: could not run count").await
        }
    }
}

/// AUTH: check the signed challenge response and record the pubkey.
async fn handle_auth(
    ctx: &Arc<RelayCtx>,
    authed: &mut Option<String>,
    challenge: &str,
    arr: &[Value],
    out: &mpsc::Sender<String>,
) -> Result<(), ()> {
    let Some(raw) = arr.get(1) else {
        return notice(out, "AUTH requires a signed event").await;
    };
    let ev: Event = match serde_json::from_value(raw.clone()) {
        Ok(ev) => ev,
        Err(_) => return notice(out, "could not parse auth event").await,
    };
    match ctx.validator.verify_auth(&ev, challenge) {
        Ok(pubkey) => {
            debug!(pubkey = %pubkey, "connection authenticated");
            *authed = Some(pubkey);
            send_ok(out, &ev.id, true, "").await
        }
        Err(rejection) => send_ok(out, &ev.id, false, &rejection.to_string()).await,
    }
}

async fn send(out: &mpsc::Sender<String>, value: Value) -> Result<(), ()> {
    out.send(value.to_string()).await.map_err(|_| ())
}

async fn notice(out: &mpsc::Sender<String>, msg: &str) -> Result<(), ()> {
    send(out, json!(["NOTICE", msg])).await
}

async fn send_ok(
    out: &mpsc::Sender<String>,
    event_id: &str,
    accepted: bool,
    msg: &str,
) -> Result<(), ()> {
    send(out, json!(["OK", event_id, accepted, msg])).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::Tag,
        ingest,
        storage::DEFAULT_MAX_LIMIT,
        validate::{tests::signed_event, Policy, AUTH_KIND},
    };
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio_tungstenite::{
        tungstenite::protocol::Message as TMsg, MaybeTlsStream, WebSocketStream,
    };

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start_relay(policy: Policy) -> (SocketAddr, Arc<RelayCtx>) {
        let store = Store::in_memory(DEFAULT_MAX_LIMIT).unwrap();
        let registry = Registry::new();
        let ingest = ingest::spawn(store.clone(), registry.clone(), None);
        let ctx = RelayCtx::new(store, registry, Validator::new(policy, None), ingest);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = app(ctx.clone());
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        (addr, ctx)
    }

    /// Connect and consume the AUTH challenge the relay greets with.
    async fn connect(addr: SocketAddr) -> (Client, String) {
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
            .await
            .unwrap();
        let frame = next_frame(&mut ws).await;
        assert_eq!(frame[0], "AUTH");
        let challenge = frame[1].as_str().unwrap().to_string();
        (ws, challenge)
    }

    async fn send_json(ws: &mut Client, value: Value) {
        ws.send(TMsg::Text(value.to_string())).await.unwrap();
    }

    async fn next_frame(ws: &mut Client) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("connection closed")
                .unwrap();
            if let TMsg::Text(txt) = msg {
                return serde_json::from_str(&txt).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn publish_then_replay_with_eose() {
        let (addr, _ctx) = start_relay(Policy::default()).await;
        let (mut ws, _) = connect(addr).await;
        let ev = signed_event(1, 100, vec![], "hello");

        send_json(&mut ws, json!(["EVENT", &ev])).await;
        let ok = next_frame(&mut ws).await;
        assert_eq!(ok, json!(["OK", &ev.id, true, ""]));

        send_json(&mut ws, json!(["REQ", "s1", {"kinds": [1]}])).await;
        let frame = next_frame(&mut ws).await;
        assert_eq!(frame[0], "EVENT");
        assert_eq!(frame[1], "s1");
        assert_eq!(frame[2]["id"], ev.id.as_str());
        assert_eq!(next_frame(&mut ws).await, json!(["EOSE", "s1"]));
    }

    #[tokio::test]
    async fn corrupted_signature_is_rejected_and_not_stored() {
        let (addr, ctx) = start_relay(Policy::default()).await;
        let (mut ws, _) = connect(addr).await;
        let mut ev = signed_event(1, 100, vec![], "hello");
        ev.sig = "00".repeat(64);

        send_json(&mut ws, json!(["EVENT", &ev])).await;
        let ok = next_frame(&mut ws).await;
        assert_eq!(ok[0], "OK");
        assert_eq!(ok[1], ev.id.as_str());
        assert_eq!(ok[2], false);
        assert!(ok[3].as_str().unwrap().starts_with("invalid"));

        send_json(&mut ws, json!(["REQ", "s", {"ids": [&ev.id]}])).await;
        assert_eq!(next_frame(&mut ws).await, json!(["EOSE", "s"]));
        assert!(ctx.store.get(&ev.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn live_fanout_reaches_every_subscriber() {
        let (addr, _ctx) = start_relay(Policy::default()).await;
        let (mut sub1, _) = connect(addr).await;
        let (mut sub2, _) = connect(addr).await;
        for (ws, sub_id) in [(&mut sub1, "a"), (&mut sub2, "b")] {
            send_json(ws, json!(["REQ", sub_id, {"kinds": [1]}])).await;
            assert_eq!(next_frame(ws).await, json!(["EOSE", sub_id]));
        }

        let (mut publisher, _) = connect(addr).await;
        let ev = signed_event(1, 100, vec![], "fanout");
        send_json(&mut publisher, json!(["EVENT", &ev])).await;
        assert_eq!(next_frame(&mut publisher).await[2], true);

        let frame = next_frame(&mut sub1).await;
        assert_eq!(frame[1], "a");
        assert_eq!(frame[2]["id"], ev.id.as_str());
        let frame = next_frame(&mut sub2).await;
        assert_eq!(frame[1], "b");
        assert_eq!(frame[2]["id"], ev.id.as_str());
    }

    #[tokio::test]
    async fn duplicate_publish_acks_duplicate() {
        let (addr, _ctx) = start_relay(Policy::default()).await;
        let (mut ws, _) = connect(addr).await;
        let ev = signed_event(1, 100, vec![], "again");
        send_json(&mut ws, json!(["EVENT", &ev])).await;
        assert_eq!(next_frame(&mut ws).await[2], true);
        send_json(&mut ws, json!(["EVENT", &ev])).await;
        let ok = next_frame(&mut ws).await;
        assert_eq!(ok[2], true);
        assert!(ok[3].as_str().unwrap().starts_with("duplicate"));
    }

    #[tokio::test]
    async fn req_replace_swaps_filters_atomically() {
        let (addr, _ctx) = start_relay(Policy::default()).await;
        let (mut sub, _) = connect(addr).await;
        send_json(&mut sub, json!(["REQ", "s", {"#t": ["old"]}])).await;
        assert_eq!(next_frame(&mut sub).await, json!(["EOSE", "s"]));
        send_json(&mut sub, json!(["REQ", "s", {"#t": ["new"]}])).await;
        assert_eq!(next_frame(&mut sub).await, json!(["EOSE", "s"]));

        let (mut publisher, _) = connect(addr).await;
        let tag = |v: &str| vec![Tag(vec!["t".into(), v.into()])];
        let old_ev = signed_event(1, 100, tag("old"), "");
        let new_ev = signed_event(1, 101, tag("new"), "");
        send_json(&mut publisher, json!(["EVENT", &old_ev])).await;
        assert_eq!(next_frame(&mut publisher).await[2], true);
        send_json(&mut publisher, json!(["EVENT", &new_ev])).await;
        assert_eq!(next_frame(&mut publisher).await[2], true);

        // Only the event matching the replacement filter arrives.
        let frame = next_frame(&mut sub).await;
        assert_eq!(frame[2]["id"], new_ev.id.as_str());
    }

    #[tokio::test]
    async fn close_stops_live_delivery() {
        let (addr, _ctx) = start_relay(Policy::default()).await;
        let (mut sub, _) = connect(addr).await;
        send_json(&mut sub, json!(["REQ", "s1", {"kinds": [1]}])).await;
        assert_eq!(next_frame(&mut sub).await, json!(["EOSE", "s1"]));
        send_json(&mut sub, json!(["CLOSE", "s1"])).await;
        // A COUNT round-trip proves the CLOSE was handled before we publish.
        send_json(&mut sub, json!(["COUNT", "sync", {"kinds": [999]}])).await;
        assert_eq!(next_frame(&mut sub).await[0], "COUNT");

        let (mut publisher, _) = connect(addr).await;
        let ev = signed_event(1, 100, vec![], "after close");
        send_json(&mut publisher, json!(["EVENT", &ev])).await;
        assert_eq!(next_frame(&mut publisher).await[2], true);

        // A replay on a fresh subscription proves the event was admitted
        // and that no s1 frame was queued ahead of it.
        send_json(&mut sub, json!(["REQ", "s2", {"ids": [&ev.id]}])).await;
        let frame = next_frame(&mut sub).await;
        assert_eq!(frame[1], "s2");
        assert_eq!(frame[2]["id"], ev.id.as_str());
        assert_eq!(next_frame(&mut sub).await, json!(["EOSE", "s2"]));
    }

    #[tokio::test]
    async fn count_returns_cardinality() {
        let (addr, _ctx) = start_relay(Policy::default()).await;
        let (mut ws, _) = connect(addr).await;
        for i in 0..3 {
            let ev = signed_event(1, 100 + i, vec![], &format!("n{i}"));
            send_json(&mut ws, json!(["EVENT", &ev])).await;
            assert_eq!(next_frame(&mut ws).await[2], true);
        }
        send_json(&mut ws, json!(["COUNT", "c", {"kinds": [1]}])).await;
        assert_eq!(
            next_frame(&mut ws).await,
            json!(["COUNT", "c", {"count": 3}])
        );
    }

    #[tokio::test]
    async fn auth_flow_unlocks_restricted_publishing() {
        let (addr, _ctx) = start_relay(Policy {
            auth_required: true,
            ..Default::default()
        })
        .await;
        let (mut ws, challenge) = connect(addr).await;

        let ev = signed_event(1, crate::storage::unix_now(), vec![], "locked");
        send_json(&mut ws, json!(["EVENT", &ev])).await;
        let ok = next_frame(&mut ws).await;
        assert_eq!(ok[2], false);
        assert!(ok[3].as_str().unwrap().starts_with("restricted"));

        let auth = signed_event(
            AUTH_KIND,
            crate::storage::unix_now(),
            vec![Tag(vec!["challenge".into(), challenge])],
            "",
        );
        send_json(&mut ws, json!(["AUTH", &auth])).await;
        assert_eq!(next_frame(&mut ws).await[2], true);

        send_json(&mut ws, json!(["EVENT", &ev])).await;
        assert_eq!(next_frame(&mut ws).await[2], true);
    }

    #[tokio::test]
    async fn malformed_frames_get_notice_and_connection_survives() {
        let (addr, _ctx) = start_relay(Policy::default()).await;
        let (mut ws, _) = connect(addr).await;
        for bad in ["not json", "{}", "[\"WAT\"]", "[\"REQ\"]"] {
            ws.send(TMsg::Text(bad.into())).await.unwrap();
            assert_eq!(next_frame(&mut ws).await[0], "NOTICE");
        }
        // Still alive and serving after the noise.
        send_json(&mut ws, json!(["REQ", "s", {"limit": 0}])).await;
        assert_eq!(next_frame(&mut ws).await, json!(["EOSE", "s"]));
    }

    #[tokio::test]
    async fn bad_filter_in_req_gets_notice() {
        let (addr, _ctx) = start_relay(Policy::default()).await;
        let (mut ws, _) = connect(addr).await;
        send_json(&mut ws, json!(["REQ", "s", {"authors": ["NOTHEX"]}])).await;
        let frame = next_frame(&mut ws).await;
        assert_eq!(frame[0], "NOTICE");
        assert!(frame[1].as_str().unwrap().contains("authors[0]"));
    }

    #[tokio::test]
    async fn disconnect_cleans_up_registry() {
        let (addr, ctx) = start_relay(Policy::default()).await;
        let (mut ws, _) = connect(addr).await;
        send_json(&mut ws, json!(["REQ", "s", {"kinds": [1]}])).await;
        assert_eq!(next_frame(&mut ws).await, json!(["EOSE", "s"]));
        assert_eq!(ctx.registry.connections(), 1);
        ws.close(None).await.unwrap();
        // Teardown runs shortly after the close frame is read.
        for _ in 0..50 {
            if ctx.registry.connections() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(ctx.registry.connections(), 0);
    }

    #[tokio::test]
    async fn serve_ws_bind_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let store = Store::in_memory(DEFAULT_MAX_LIMIT).unwrap();
        let registry = Registry::new();
        let ingest = ingest::spawn(store.clone(), registry.clone(), None);
        let ctx = RelayCtx::new(store, registry, Validator::new(Policy::default(), None), ingest);
        assert!(serve_ws(addr, ctx, std::future::pending()).await.is_err());
    }
}
