//! HTTP front of the browser channel server.
//!
//! [`BrowserChannelServer::new`] builds an [`axum::Router`] serving the
//! `bind` and `test` endpoints; embedders nest it under whatever prefix the
//! client library is configured with. Forward (POST) requests decode map
//! batches into the session's channel, back (GET) requests attach a
//! streaming response the channel writes frames on.

use std::{collections::HashMap, io, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Router,
    body::{Body, Bytes},
    extract::{Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::Response,
    routing::get,
};
use futures::StreamExt;
use regex::Regex;
use tokio::{
    net::TcpListener,
    sync::{RwLock, mpsc},
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::{
    Error,
    back_channel::{self, BackChannel, Framing},
    channel::{self, Channel, Phase, Timeouts},
    map_queue::{MAP_QUEUE_CAPACITY, Map},
    session_id::SessionId,
};

/// The browser channel protocol version implemented by this crate.
pub const SUPPORTED_PROTOCOL_VERSION: &str = "8";

pub const DEFAULT_BIND_PATH: &str = "bind";
pub const DEFAULT_TEST_PATH: &str = "test";

/// Forward-channel bodies larger than this are rejected outright.
const MAX_FORM_BYTES: usize = 10 << 20;

/// Pause between the two phases of the buffering test probe.
const TEST_PHASE_DELAY: Duration = Duration::from_secs(2);

const QUERY_TERMINATE: &str = "terminate";
const QUERY_HTML: &str = "html";

const STATUS_HEADER: HeaderName = HeaderName::from_static("status");

/// Cross-domain settings: which origins get CORS headers and which
/// subdomain prefix is handed to clients in the handshake.
#[derive(Debug, Clone)]
pub struct CrossDomainConfig {
    /// Domain whose origins, including subdomains, may make credentialed
    /// requests.
    pub domain: String,
    /// `hostPrefix` value clients prepend to the host to dodge the browser
    /// per-host connection limit. May be empty.
    pub host_prefix: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub bind_path: String,
    pub test_path: String,
    pub cross_domain: Option<CrossDomainConfig>,
    pub timeouts: Timeouts,
    pub ct: CancellationToken,
}

impl ServerConfig {
    pub fn new(bind: SocketAddr) -> ServerConfig {
        ServerConfig {
            bind,
            bind_path: DEFAULT_BIND_PATH.to_string(),
            test_path: DEFAULT_TEST_PATH.to_string(),
            cross_domain: None,
            timeouts: Timeouts::default(),
            ct: CancellationToken::new(),
        }
    }
}

type ChannelMap = Arc<RwLock<HashMap<SessionId, Channel>>>;

struct CrossDomain {
    origin_matcher: Regex,
    host_prefix: String,
}

#[derive(Clone)]
struct App {
    channels: ChannelMap,
    accept_tx: mpsc::UnboundedSender<Channel>,
    gc_tx: mpsc::UnboundedSender<SessionId>,
    cross_domain: Option<Arc<CrossDomain>>,
    timeouts: Timeouts,
}

impl App {
    fn host_prefix(&self) -> String {
        self.cross_domain
            .as_ref()
            .map(|cd| cd.host_prefix.clone())
            .unwrap_or_default()
    }
}

/// Browser channel endpoint plus the process-wide session registry.
pub struct BrowserChannelServer {
    accept_rx: mpsc::UnboundedReceiver<Channel>,
    pub config: ServerConfig,
}

impl BrowserChannelServer {
    /// Builds the server and the router serving its two endpoints. The
    /// router can be nested or merged into a larger application.
    pub fn new(config: ServerConfig) -> (BrowserChannelServer, Router) {
        let channels: ChannelMap = Arc::new(RwLock::new(HashMap::new()));
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let (gc_tx, gc_rx) = mpsc::unbounded_channel();

        tokio::spawn(remove_closed_sessions(channels.clone(), gc_rx));
        tokio::spawn(close_sessions_on_shutdown(
            config.ct.clone(),
            channels.clone(),
        ));

        let cross_domain = config.cross_domain.as_ref().map(|cd| {
            Arc::new(CrossDomain {
                origin_matcher: make_origin_matcher(&cd.domain),
                host_prefix: cd.host_prefix.clone(),
            })
        });

        let app = App {
            channels,
            accept_tx,
            gc_tx,
            cross_domain,
            timeouts: config.timeouts.clone(),
        };

        let router = Router::new()
            .route(
                &format!("/{}", config.bind_path),
                get(bind_get).post(bind_post),
            )
            .route(&format!("/{}", config.test_path), get(test_get))
            .with_state(app);

        (BrowserChannelServer { accept_rx, config }, router)
    }

    pub async fn serve(bind: SocketAddr) -> io::Result<BrowserChannelServer> {
        Self::serve_with_config(ServerConfig::new(bind)).await
    }

    pub async fn serve_with_config(mut config: ServerConfig) -> io::Result<BrowserChannelServer> {
        let listener = TcpListener::bind(config.bind).await?;
        // Expose the actual bound address, which matters when port is 0.
        config.bind = listener.local_addr()?;
        let (server, router) = Self::new(config);
        let ct = server.config.ct.child_token();
        let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
            ct.cancelled().await;
            tracing::info!("browser channel server cancelled");
        });
        tokio::spawn(async move {
            if let Err(error) = serve.await {
                tracing::error!(%error, "browser channel server shutdown with error");
            }
        });
        Ok(server)
    }

    /// Waits for and returns the next newly created channel. Returns `None`
    /// after shutdown.
    pub async fn accept(&mut self) -> Option<Channel> {
        self.accept_rx.recv().await
    }

    /// Cancels the server: the listener shuts down gracefully and every
    /// live session is closed.
    pub fn cancel(&self) {
        self.config.ct.cancel();
    }
}

/// Reaper for the session registry; channels announce themselves here once
/// they reach the closed state.
async fn remove_closed_sessions(
    channels: ChannelMap,
    mut gc_rx: mpsc::UnboundedReceiver<SessionId>,
) {
    while let Some(sid) = gc_rx.recv().await {
        tracing::debug!(%sid, "removing session from registry");
        if channels.write().await.remove(&sid).is_none() {
            tracing::warn!(%sid, "closed session missing from registry");
        }
    }
}

async fn close_sessions_on_shutdown(ct: CancellationToken, channels: ChannelMap) {
    ct.cancelled().await;
    let live: Vec<Channel> = channels.read().await.values().cloned().collect();
    tracing::info!(sessions = live.len(), "closing sessions on shutdown");
    for channel in live {
        channel.close().await;
    }
}

async fn test_get(
    State(app): State<App>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    tracing::debug!(?params, "test request");
    let cors = cors_origin(&app, &headers);

    if params.get("VER").map(String::as_str) != Some(SUPPORTED_PROTOCOL_VERSION) {
        let mut response = dynamic_response(
            StatusCode::BAD_REQUEST,
            false,
            &cors,
            Body::from("Unsupported protocol version."),
        );
        response.headers_mut().insert(
            STATUS_HEADER,
            HeaderValue::from_static("Unsupported protocol version."),
        );
        return response;
    }

    if params.get("MODE").map(String::as_str) == Some("init") {
        let body = serde_json::to_string(&[app.host_prefix().as_str(), ""]).unwrap_or_default();
        return ok_response(false, &cors, Body::from(body));
    }

    // Network probe: two writes separated by a pause let the client detect
    // buffering intermediaries that would break streaming.
    let html = params.get("TYPE").map(String::as_str) == Some(QUERY_HTML);
    let domain = params.get("DOMAIN").cloned().unwrap_or_default();
    let probe = async_stream::stream! {
        if html {
            let mut first = String::from(back_channel::html_head());
            first.push_str(&back_channel::html_domain_script(&domain));
            first.push_str(&back_channel::html_rpc_script("11111"));
            first.push_str(&back_channel::html_padding());
            yield Ok::<_, io::Error>(Bytes::from(first));
        } else {
            yield Ok(Bytes::from_static(b"11111"));
        }

        tokio::time::sleep(TEST_PHASE_DELAY).await;

        if html {
            let mut second = back_channel::html_rpc_script("2");
            second.push_str(back_channel::html_done());
            yield Ok(Bytes::from(second));
        } else {
            yield Ok(Bytes::from_static(b"2"));
        }
    };
    ok_response(html, &cors, Body::from_stream(probe))
}

async fn bind_post(
    State(app): State<App>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let cors = cors_origin(&app, &headers);

    let values = match read_form(body).await {
        Ok(values) => values,
        Err(_) => return dynamic_response(StatusCode::BAD_REQUEST, false, &cors, Body::empty()),
    };
    let (offset, maps) = match parse_incoming_maps(&values) {
        Ok(parsed) => parsed,
        Err(_) => return dynamic_response(StatusCode::BAD_REQUEST, false, &cors, Body::empty()),
    };

    let channel = match bind_channel(&app, &params, &cors).await {
        Ok(channel) => channel,
        Err(response) => return response,
    };

    tracing::debug!(sid = %channel.session_id(), offset, count = maps.len(), "bind post");
    channel.receive_maps(offset, maps).await;

    let Some(state) = channel.state().await else {
        // Lost a race with session teardown; make the client reconnect.
        return unknown_session_response(&cors);
    };

    if state.phase == Phase::Init {
        // The initial forward request doubles as a single-shot back channel
        // carrying the server configuration array. Streaming is disabled so
        // the handshake goes out immediately; note that the first bind
        // request made by IE < 10 does not carry TYPE=html and therefore
        // receives the same length-prefixed reply as XHR clients.
        let rid = params.get("zx").cloned().unwrap_or_default();
        let (back_channel, frames) = BackChannel::new(rid, Framing::Xhr);
        channel.set_back_channel(back_channel).await;
        return stream_response(false, &cors, frames);
    }

    // On a normal forward request the session status triple goes back:
    // back-channel presence, last sent array id, outstanding data.
    let json = serde_json::to_vec(&state.to_wire()).unwrap_or_default();
    let mut payload = format!("{}\n", json.len()).into_bytes();
    payload.extend_from_slice(&json);
    ok_response(false, &cors, Body::from(payload))
}

async fn bind_get(
    State(app): State<App>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let cors = cors_origin(&app, &headers);

    let channel = match bind_channel(&app, &params, &cors).await {
        Ok(channel) => channel,
        Err(response) => return response,
    };

    let query_type = params.get("TYPE").map(String::as_str).unwrap_or("");
    if query_type == QUERY_TERMINATE {
        tracing::debug!(sid = %channel.session_id(), "client terminate");
        channel.close().await;
        return dynamic_response(StatusCode::OK, false, &cors, Body::empty());
    }

    let html = query_type == QUERY_HTML;
    let rid = params.get("zx").cloned().unwrap_or_default();
    let framing = if html {
        Framing::Html {
            domain: params.get("DOMAIN").cloned().unwrap_or_default(),
            padding_sent: false,
        }
    } else {
        Framing::Xhr
    };
    let (mut back_channel, frames) = BackChannel::new(rid, framing);
    back_channel.set_chunked(params.get("CI").map(String::as_str) == Some("1"));

    tracing::debug!(
        sid = %channel.session_id(),
        chunked = back_channel.is_chunked(),
        html,
        "attaching back channel"
    );
    channel.set_back_channel(back_channel).await;
    stream_response(html, &cors, frames)
}

/// Resolves the session a bind request addresses, creating one when the
/// `SID` parameter is absent, and applies any acknowledgment it carries.
async fn bind_channel(
    app: &App,
    params: &HashMap<String, String>,
    cors: &Option<HeaderValue>,
) -> Result<Channel, Response> {
    let sid: SessionId = match params.get("SID").map(String::as_str).unwrap_or("").parse() {
        Ok(sid) => sid,
        Err(_) => {
            return Err(dynamic_response(
                StatusCode::BAD_REQUEST,
                false,
                cors,
                Body::empty(),
            ));
        }
    };

    let channel = if sid.is_null() {
        None
    } else {
        app.channels.read().await.get(&sid).cloned()
    };

    let channel = match channel {
        Some(channel) => channel,
        None if !sid.is_null() => {
            // The client recognizes this exact token and falls back to a
            // full reconnect.
            tracing::debug!(%sid, "unknown session");
            return Err(unknown_session_response(cors));
        }
        None => {
            let sid = SessionId::random();
            tracing::debug!(%sid, "creating session");
            let version = params.get("VER").cloned().unwrap_or_default();
            let channel = channel::spawn(
                sid,
                version,
                app.host_prefix(),
                app.timeouts.clone(),
                app.gc_tx.clone(),
            );
            app.channels.write().await.insert(sid, channel.clone());
            let _ = app.accept_tx.send(channel.clone());
            channel
        }
    };

    if let Some(aid) = params.get("AID").and_then(|aid| aid.parse::<i64>().ok()) {
        if aid >= 0 {
            channel.acknowledge(aid).await;
        }
    }

    Ok(channel)
}

/// Reads a forward-channel body, bounded, and splits it into form pairs.
async fn read_form(body: Body) -> Result<Vec<(String, String)>, Error> {
    let bytes = axum::body::to_bytes(body, MAX_FORM_BYTES)
        .await
        .map_err(|_| Error::BodyTooLarge)?;
    serde_urlencoded::from_bytes(&bytes).map_err(|_| Error::BadMap)
}

/// Decodes the form representation of a map batch:
///
/// ```text
/// count=2&ofs=3&req0_x=3&req0_y=10&req1_abc=def
/// ```
///
/// becomes offset 3 and the maps `[{x: 3, y: 10}, {abc: def}]`.
fn form_value<'a>(values: &'a [(String, String)], key: &str) -> Option<&'a str> {
    values
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn parse_incoming_maps(values: &[(String, String)]) -> Result<(usize, Vec<Map>), Error> {
    let count: usize = form_value(values, "count")
        .and_then(|count| count.parse().ok())
        .unwrap_or(0);
    if count == 0 {
        return Ok((0, Vec::new()));
    }
    // A few bytes of body must not be able to demand an arbitrarily large
    // allocation; no valid batch exceeds the reorder window anyway.
    if count > MAP_QUEUE_CAPACITY {
        return Err(Error::BadMap);
    }

    let offset: usize = form_value(values, "ofs")
        .and_then(|ofs| ofs.parse().ok())
        .ok_or(Error::BadMap)?;

    let mut maps = vec![Map::new(); count];
    for (key, value) in values {
        parse_map_entry(&mut maps, key, value)?;
    }

    Ok((offset, maps))
}

fn parse_map_entry(maps: &mut [Map], key: &str, value: &str) -> Result<(), Error> {
    if value == "_badmap" {
        return Ok(());
    }

    // Only fields shaped like req<digits>_<key> carry map entries; count,
    // ofs and anything else is skipped.
    let Some(indexed) = key.strip_prefix("req") else {
        return Ok(());
    };
    let Some((index, map_key)) = indexed.split_once('_') else {
        return Ok(());
    };
    let index: usize = index.parse().map_err(|_| Error::BadMap)?;
    let map = maps.get_mut(index).ok_or(Error::BadMap)?;
    map.insert(map_key.to_string(), value.to_string());
    Ok(())
}

/// Matches an origin against the configured domain and all its subdomains,
/// on both schemes.
fn make_origin_matcher(domain: &str) -> Regex {
    let pattern = format!(r"^https?://([[:alnum:]]+\.)*{}$", regex::escape(domain));
    Regex::new(&pattern).expect("escaped domain forms a valid pattern")
}

/// The CORS spec only supports `*`, `null` or one exact origin, so the
/// matching request origin is echoed back.
fn cors_origin(app: &App, headers: &HeaderMap) -> Option<HeaderValue> {
    let cross_domain = app.cross_domain.as_ref()?;
    let origin = headers.get(header::ORIGIN)?;
    let matched = cross_domain.origin_matcher.is_match(origin.to_str().ok()?);
    matched.then(|| origin.clone())
}

fn dynamic_response(
    status: StatusCode,
    html: bool,
    cors: &Option<HeaderValue>,
    body: Body,
) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(if html { "text/html" } else { "text/plain" }),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, max-age=0, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(
        header::EXPIRES,
        HeaderValue::from_static("Fri, 01 Jan 1990 00:00:00 GMT"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    if let Some(origin) = cors {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
    }
    response
}

fn ok_response(html: bool, cors: &Option<HeaderValue>, body: Body) -> Response {
    let mut response = dynamic_response(StatusCode::OK, html, cors, body);
    response
        .headers_mut()
        .insert(STATUS_HEADER, HeaderValue::from_static("OK"));
    response
}

fn unknown_session_response(cors: &Option<HeaderValue>) -> Response {
    let mut response = dynamic_response(
        StatusCode::BAD_REQUEST,
        false,
        cors,
        Body::from("Unknown SID"),
    );
    response
        .headers_mut()
        .insert(STATUS_HEADER, HeaderValue::from_static("Unknown SID"));
    response
}

fn stream_response(
    html: bool,
    cors: &Option<HeaderValue>,
    frames: mpsc::Receiver<Bytes>,
) -> Response {
    let stream = ReceiverStream::new(frames).map(Ok::<_, io::Error>);
    ok_response(html, cors, Body::from_stream(stream))
}
