//! HTTP server implementation using Axum.

use crate::error::Error;
use crate::rtc::RealtimeConnection;
use crate::session;
use crate::signaling::{Outbound, SignalingChannel};
use crate::state::{AppState, HOST_SESSION};
use axum::{
    extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    extract::{Path, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Router,
};
use axum_extra::extract::cookie::CookieJar;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Which pages the server offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Catalog index plus per-session game starts.
    Catalog,
    /// One game started at boot; `/` is the player.
    Host,
}

/// Error response: client errors for bad input, 500 for everything else.
pub struct AppError(Error);

impl From<Error> for AppError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            Error::UnknownGame(_) | Error::NoSession => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(err = %self.0, "request failed");
        } else {
            warn!(err = %self.0, "request rejected");
        }
        (status, self.0.to_string()).into_response()
    }
}

pub fn router(state: AppState, mode: Mode, public: Option<PathBuf>) -> Router {
    let app = match mode {
        Mode::Catalog => Router::new()
            .route("/", get(index))
            .route("/start/:slug", post(start))
            .route("/play", get(play))
            .route("/play/log", get(play_log)),
        Mode::Host => Router::new()
            .route("/", get(host_player))
            .route("/play/log", get(host_log)),
    };

    let app = app
        .route("/signaling", get(signaling))
        .route("/health", get(health));

    let app = match public {
        Some(dir) => app.nest_service("/public", ServeDir::new(dir)),
        None => app,
    };

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Serve `app` on `port` until `shutdown` fires.
pub async fn run_server(port: u16, app: Router, shutdown: CancellationToken) -> crate::error::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::io(format!("bind {addr}"), e))?;
    info!("Starting HTTP server on {}", addr);
    serve(listener, app, shutdown).await
}

async fn serve(listener: TcpListener, app: Router, shutdown: CancellationToken) -> crate::error::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::io("serve http", e))
}

fn found(location: &'static str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

async fn health() -> &'static str {
    "OK"
}

async fn index(State(state): State<AppState>, jar: CookieJar) -> impl IntoResponse {
    let (jar, _) = session::get_or_create(jar);
    let mut cards = String::new();
    for game in state.orchestrator.catalog().games() {
        cards.push_str(&format!(
            r#"<form class="game" method="post" action="/start/{slug}">
  <img src="{thumb}" alt="">
  <button type="submit">{title}</button>
</form>
"#,
            slug = escape(&game.slug),
            thumb = escape(&game.thumbnail),
            title = escape(&game.title),
        ));
    }
    if cards.is_empty() {
        cards.push_str("<p>No games configured.</p>\n");
    }
    (jar, Html(INDEX_PAGE.replace("{{games}}", &cards)))
}

async fn start(
    State(state): State<AppState>,
    jar: CookieJar,
    Path(slug): Path<String>,
) -> Result<Response, AppError> {
    let session = session::require(&jar)?;
    info!(session = %session, game = %slug, "start requested");
    state.orchestrator.start_game(&session, &slug).await?;
    Ok(found("/play"))
}

async fn play(State(state): State<AppState>, jar: CookieJar) -> Response {
    let Ok(session) = session::require(&jar) else {
        return found("/");
    };
    match state.orchestrator.active_game(&session).await {
        Some(game) => Html(player_page(&game.title, true)).into_response(),
        None => found("/"),
    }
}

async fn host_player(State(state): State<AppState>, jar: CookieJar) -> impl IntoResponse {
    let (jar, _) = session::get_or_create(jar);
    let title = state
        .orchestrator
        .catalog()
        .games()
        .first()
        .map(|g| g.title.clone())
        .unwrap_or_default();
    (jar, Html(player_page(&title, false)))
}

async fn play_log(State(state): State<AppState>, jar: CookieJar) -> Result<Response, AppError> {
    let session = session::require(&jar)?;
    Ok(log_response(&state, &session).await)
}

/// The host game belongs to no browser, so no cookie is needed.
async fn host_log(State(state): State<AppState>) -> Response {
    log_response(&state, HOST_SESSION).await
}

async fn log_response(state: &AppState, session: &str) -> Response {
    match state.orchestrator.game_log(session).await {
        Some(log) => ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], log).into_response(),
        None => (StatusCode::NOT_FOUND, "no active game").into_response(),
    }
}

async fn signaling(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    jar: CookieJar,
) -> impl IntoResponse {
    let (jar, session) = session::get_or_create(jar);
    (jar, ws.on_upgrade(move |socket| handle_socket(socket, state, session)))
}

async fn handle_socket(socket: WebSocket, state: AppState, session: String) {
    info!(session = %session, "signaling channel opened");
    let (mut sink, stream) = socket.split();
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let outbound = Outbound::new(tx, cancel.clone());

    let writer = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    text = rx.recv() => {
                        let Some(text) = text else { break };
                        if let Err(e) = sink.send(WsMessage::Text(text)).await {
                            warn!(err = %e, "signaling write failed");
                            cancel.cancel();
                            break;
                        }
                    }
                }
            }
            let _ = sink.close().await;
        }
    });

    let connection =
        match RealtimeConnection::open(&state.rtc, &state.media, outbound.candidate_handler()).await {
            Ok(connection) => Arc::new(connection),
            Err(e) => {
                error!(session = %session, err = %e, "failed to open realtime connection");
                cancel.cancel();
                let _ = writer.await;
                return;
            }
        };
    let id = state.orchestrator.attach(&session, connection.clone()).await;

    let inbound = Box::pin(stream.filter_map(|msg| async move {
        match msg {
            Ok(WsMessage::Text(text)) => Some(Ok(text)),
            Ok(WsMessage::Binary(_)) => Some(Err(Error::Protocol("binary signaling frame".into()))),
            Ok(_) => None,
            Err(e) => Some(Err(Error::Protocol(format!("signaling read failed: {e}")))),
        }
    }));

    let mut channel = SignalingChannel::new(connection, outbound, cancel);
    if let Err(e) = channel.run(inbound).await {
        debug!(session = %session, err = %e, "signaling ended with error");
    }

    state.orchestrator.detach(&session, id).await;
    let _ = writer.await;
    info!(session = %session, state = ?channel.state(), "signaling channel closed");
}

const INDEX_PAGE: &str = r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<title>playhost</title>
<style>
body { font-family: sans-serif; background: #111; color: #eee; }
.game { display: inline-block; margin: 1em; text-align: center; }
.game img { display: block; width: 240px; height: 135px; object-fit: cover; background: #333; }
.game button { margin-top: .5em; width: 100%; }
</style>
</head>
<body>
<h1>Games</h1>
{{games}}
</body>
</html>
"#;

fn player_page(title: &str, with_back_link: bool) -> String {
    let back = if with_back_link {
        r#"<a href="/">back</a> | "#
    } else {
        ""
    };
    PLAYER_PAGE
        .replace("{{title}}", &escape(title))
        .replace("{{back}}", back)
}

const PLAYER_PAGE: &str = r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<title>{{title}}</title>
<style>
body { margin: 0; background: #000; color: #ccc; font-family: sans-serif; }
video { width: 100vw; height: calc(100vh - 2em); background: #000; }
nav { height: 2em; line-height: 2em; padding: 0 1em; }
</style>
</head>
<body>
<nav>{{back}}<a href="/play/log" target="_blank">log</a> | <span id="status">connecting</span></nav>
<video id="screen" autoplay playsinline muted></video>
<script>
const status = document.getElementById("status");
const pc = new RTCPeerConnection({
  iceServers: [{ urls: ["stun:stun1.l.google.com:19302", "stun:stun2.l.google.com:19302"] }],
});
pc.addTransceiver("video", { direction: "recvonly" });
pc.ontrack = (event) => {
  document.getElementById("screen").srcObject = event.streams[0] || new MediaStream([event.track]);
};
pc.onconnectionstatechange = () => { status.textContent = pc.connectionState; };
pc.ondatachannel = (event) => {
  event.channel.onmessage = (msg) => console.log(event.channel.label + ": " + msg.data);
};
const browser = pc.createDataChannel("browser");
browser.onopen = () => browser.send("hello from browser");

const scheme = location.protocol === "https:" ? "wss://" : "ws://";
const ws = new WebSocket(scheme + location.host + "/signaling");
pc.onicecandidate = (event) => {
  if (event.candidate && ws.readyState === WebSocket.OPEN) {
    ws.send(JSON.stringify(Object.assign({ __message_type__: 2 }, event.candidate.toJSON())));
  }
};
ws.onopen = async () => {
  const offer = await pc.createOffer();
  await pc.setLocalDescription(offer);
  ws.send(JSON.stringify({ __message_type__: 1, sdp: offer.sdp, type: offer.type }));
};
ws.onmessage = async (event) => {
  const msg = JSON.parse(event.data);
  if (msg.__message_type__ === 1) {
    await pc.setRemoteDescription({ type: msg.type, sdp: msg.sdp });
  } else if (msg.__message_type__ === 2) {
    await pc.addIceCandidate({
      candidate: msg.candidate,
      sdpMid: msg.sdpMid,
      sdpMLineIndex: msg.sdpMLineIndex,
      usernameFragment: msg.usernameFragment,
    });
  }
};
ws.onclose = () => { status.textContent = "signaling closed"; };
</script>
</body>
</html>
"#;
