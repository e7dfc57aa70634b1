//! Per-session bidirectional WebSocket relay: two independent pump loops
//! sharing one token-bucket rate limiter and one shared termination channel.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use governor::{clock::DefaultClock, state::{InMemoryState, NotKeyed}, Quota, RateLimiter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;
use crate::queue::ProxyResult;

type TokenLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;
type BrowserStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TOKEN_INTERVAL: Duration = Duration::from_millis(10);
const BURST: u32 = 10;
const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket close codes treated as a clean shutdown rather than a failure.
const NORMAL_CLOSURE: u16 = 1000;
const GOING_AWAY: u16 = 1001;
const NO_STATUS_RCVD: u16 = 1005;

#[derive(Debug)]
enum Termination {
    Clean,
    Cancelled,
    Error(RelayError),
}

/// Dial the browser's debugger endpoint, then relay `client` against it until
/// either side closes or the session is cancelled. Errors returned here are
/// all pre-relay (dial failures); everything after that is folded into the
/// returned [`ProxyResult`].
pub async fn run(
    client: WebSocket,
    debug_url: &str,
    cancellation: CancellationToken,
) -> ProxyResult {
    let (browser_stream, _response) = match tokio_tungstenite::connect_async(debug_url).await {
        Ok(pair) => pair,
        Err(e) => {
            let err = RelayError::Dial(e.to_string());
            tracing::error!(error = %err, "failed to dial chrome debugger endpoint");
            return ProxyResult::ConnectionError;
        }
    };

    let limiter: Arc<TokenLimiter> = Arc::new(RateLimiter::direct(
        Quota::with_period(TOKEN_INTERVAL)
            .expect("token interval is nonzero")
            .allow_burst(NonZeroU32::new(BURST).expect("burst is nonzero")),
    ));

    let (client_sink, client_stream) = client.split();
    let (browser_sink, browser_stream) = browser_stream.split();

    let (term_tx, mut term_rx) = mpsc::channel::<Termination>(2);

    let client_to_browser = tokio::spawn(pump_client_to_browser(
        client_stream,
        browser_sink,
        limiter.clone(),
        term_tx.clone(),
    ));
    let browser_to_client = tokio::spawn(pump_browser_to_client(
        browser_stream,
        client_sink,
        limiter,
        term_tx.clone(),
    ));
    drop(term_tx);

    let termination = tokio::select! {
        reason = term_rx.recv() => reason.unwrap_or(Termination::Clean),
        _ = cancellation.cancelled() => Termination::Cancelled,
    };

    client_to_browser.abort();
    browser_to_client.abort();

    match termination {
        Termination::Clean => ProxyResult::Succeeded,
        Termination::Cancelled => ProxyResult::SessionTimedOut,
        Termination::Error(_) => ProxyResult::Failed,
    }
}

async fn pump_client_to_browser(
    mut read: futures::stream::SplitStream<WebSocket>,
    mut write: futures::stream::SplitSink<BrowserStream, WsMessage>,
    limiter: Arc<TokenLimiter>,
    term_tx: mpsc::Sender<Termination>,
) {
    loop {
        if let Some(reason) = acquire_token(&limiter).await {
            let _ = term_tx.send(reason).await;
            return;
        }

        match read.next().await {
            None => {
                let _ = term_tx.send(Termination::Clean).await;
                return;
            }
            Some(Ok(AxumMessage::Close(frame))) => {
                let reason = classify_close(frame.as_ref().map(|f| f.code));
                let _ = term_tx.send(reason).await;
                return;
            }
            Some(Ok(msg)) => {
                let Some(forwarded) = axum_to_tungstenite(msg) else {
                    continue;
                };
                if let Err(e) = write.send(forwarded).await {
                    let _ = term_tx
                        .send(Termination::Error(RelayError::Write(e.to_string())))
                        .await;
                    return;
                }
            }
            Some(Err(e)) => {
                let reason = if is_clean_close(&e.to_string()) {
                    Termination::Clean
                } else {
                    Termination::Error(RelayError::Read(e.to_string()))
                };
                let _ = term_tx.send(reason).await;
                return;
            }
        }
    }
}

async fn pump_browser_to_client(
    mut read: futures::stream::SplitStream<BrowserStream>,
    mut write: futures::stream::SplitSink<WebSocket, AxumMessage>,
    limiter: Arc<TokenLimiter>,
    term_tx: mpsc::Sender<Termination>,
) {
    loop {
        if let Some(reason) = acquire_token(&limiter).await {
            let _ = term_tx.send(reason).await;
            return;
        }

        match read.next().await {
            None => {
                let _ = term_tx.send(Termination::Clean).await;
                return;
            }
            Some(Ok(WsMessage::Close(frame))) => {
                let reason = classify_close(frame.as_ref().map(|f| u16::from(f.code)));
                let _ = term_tx.send(reason).await;
                return;
            }
            Some(Ok(msg)) => {
                let Some(forwarded) = tungstenite_to_axum(msg) else {
                    continue;
                };
                if let Err(e) = write.send(forwarded).await {
                    let _ = term_tx
                        .send(Termination::Error(RelayError::Write(e.to_string())))
                        .await;
                    return;
                }
            }
            Some(Err(e)) => {
                let reason = if is_clean_close(&e.to_string()) {
                    Termination::Clean
                } else {
                    Termination::Error(RelayError::Read(e.to_string()))
                };
                let _ = term_tx.send(reason).await;
                return;
            }
        }
    }
}

async fn acquire_token(limiter: &TokenLimiter) -> Option<Termination> {
    match tokio::time::timeout(WAIT_TIMEOUT, limiter.until_ready()).await {
        Ok(()) => None,
        Err(_) => Some(Termination::Error(RelayError::RateLimitTimeout)),
    }
}

fn is_clean_close(message: &str) -> bool {
    message.contains("closed") || message.contains("ConnectionClosed")
}

/// A close frame with no code at all (`None`) is treated the same as a clean
/// EOF. Otherwise only `NormalClosure`/`GoingAway`/`NoStatusRcvd` count as
/// clean — anything else (protocol error, internal error, ...) is a failure.
fn classify_close(code: Option<u16>) -> Termination {
    match code {
        None => Termination::Clean,
        Some(c) if matches!(c, NORMAL_CLOSURE | GOING_AWAY | NO_STATUS_RCVD) => Termination::Clean,
        Some(c) => Termination::Error(RelayError::AbnormalClose(c)),
    }
}

fn axum_to_tungstenite(msg: AxumMessage) -> Option<WsMessage> {
    match msg {
        AxumMessage::Text(t) => Some(WsMessage::Text(t)),
        AxumMessage::Binary(b) => Some(WsMessage::Binary(b)),
        AxumMessage::Ping(b) => Some(WsMessage::Ping(b)),
        AxumMessage::Pong(b) => Some(WsMessage::Pong(b)),
        AxumMessage::Close(_) => None,
    }
}

fn tungstenite_to_axum(msg: WsMessage) -> Option<AxumMessage> {
    match msg {
        WsMessage::Text(t) => Some(AxumMessage::Text(t)),
        WsMessage::Binary(b) => Some(AxumMessage::Binary(b)),
        WsMessage::Ping(b) => Some(AxumMessage::Ping(b)),
        WsMessage::Pong(b) => Some(AxumMessage::Pong(b)),
        WsMessage::Close(_) | WsMessage::Frame(_) => None,
    }
}
