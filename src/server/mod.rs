//! Ingress/egress — the two WebSocket endpoints.
//!
//! The main bus listens on the configured port behind TLS 1.3 and
//! authenticates every connection with a TOTP handshake before any bus
//! traffic flows. The OOB endpoint binds to loopback (TCP or unix socket)
//! and hands every frame to the privileged command handler; replies go
//! back on the socket, never onto the bus.

pub mod auth;

use std::io::BufReader;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::oob::OobCommander;
use crate::organism::{OobConfig, TlsConfig};
use crate::xml::{repair, Element};
use auth::TotpAuthenticator;

/// Main-bus endpoint settings.
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub tls: Option<TlsConfig>,
    /// `None` disables the TOTP check (tests, trusted networks).
    pub totp: Option<TotpAuthenticator>,
}

/// TLS 1.3 only, per the wire contract.
fn build_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor, String> {
    let cert_file = std::fs::File::open(&tls.cert)
        .map_err(|e| format!("cannot open TLS cert {}: {e}", tls.cert.display()))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<_, _>>()
        .map_err(|e| format!("bad TLS cert: {e}"))?;

    let key_file = std::fs::File::open(&tls.key)
        .map_err(|e| format!("cannot open TLS key {}: {e}", tls.key.display()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| format!("bad TLS key: {e}"))?
        .ok_or_else(|| format!("no private key in {}", tls.key.display()))?;

    let config = rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| format!("TLS config: {e}"))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Accept-loop for the main bus. Runs until the listener errors out.
pub async fn run_main_bus(bus: Arc<Bus>, cfg: ServerConfig) -> Result<(), String> {
    let listener = TcpListener::bind((cfg.bind.as_str(), cfg.port))
        .await
        .map_err(|e| format!("cannot bind {}:{}: {e}", cfg.bind, cfg.port))?;
    let acceptor = cfg.tls.as_ref().map(build_acceptor).transpose()?;
    let totp = Arc::new(cfg.totp);

    info!(bind = %cfg.bind, port = cfg.port, tls = acceptor.is_some(), "main bus listening");
    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|e| format!("accept failed: {e}"))?;
        debug!(%peer, "bus connection");

        let bus = bus.clone();
        let totp = totp.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => serve_client(tls_stream, bus, totp).await,
                    Err(e) => warn!(%peer, "TLS handshake failed: {e}"),
                },
                None => serve_client(stream, bus, totp).await,
            }
        });
    }
}

async fn serve_client<S>(stream: S, bus: Arc<Bus>, totp: Arc<Option<TotpAuthenticator>>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("websocket handshake failed: {e}");
            return;
        }
    };

    let Some(identity) = authenticate(&mut ws, totp.as_ref()).await else {
        let _ = ws.close(None).await;
        return;
    };
    info!(client = %identity, "client authenticated");

    let (mut sink, mut stream) = ws.split();
    let (egress_tx, mut egress_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let raw = text.as_str().as_bytes().to_vec();
                    if let Err(e) = bus.inject(raw, &identity, Some(egress_tx.clone())).await {
                        warn!(client = %identity, "ingress rejected: {e}");
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    if let Err(e) = bus
                        .inject(bytes.as_ref().to_vec(), &identity, Some(egress_tx.clone()))
                        .await
                    {
                        warn!(client = %identity, "ingress rejected: {e}");
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // ping/pong handled by the stack
                Some(Err(e)) => {
                    debug!(client = %identity, "websocket error: {e}");
                    break;
                }
            },
            out = egress_rx.recv() => match out {
                Some(bytes) => {
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
    debug!(client = %identity, "client disconnected");
}

/// TOTP handshake: the first frame must be
/// `<auth><name>…</name><totp>nnnnnn</totp></auth>`. Replies with
/// `<auth-ok/>` or `<auth-failed/>`.
async fn authenticate<S>(
    ws: &mut WebSocketStream<S>,
    totp: &Option<TotpAuthenticator>,
) -> Option<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = tokio::time::timeout(Duration::from_secs(10), ws.next())
        .await
        .ok()??;
    let text = match frame {
        Ok(Message::Text(text)) => text.as_str().to_string(),
        _ => return None,
    };

    let parsed = repair::parse(text.as_bytes())?;
    let accepted = parsed.name == "auth" && {
        match totp {
            Some(authenticator) => {
                let code = parsed.child_text("totp").unwrap_or_default();
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                authenticator.verify(&code, now)
            }
            None => true,
        }
    };

    if !accepted {
        warn!(target: "security", "TOTP authentication failed");
        let _ = ws
            .send(Message::Text(element_text(&Element::new("auth-failed")).into()))
            .await;
        return None;
    }

    let identity = parsed
        .child_text("name")
        .filter(|n| !n.is_empty() && n.as_str() != crate::schema::CORE_SENDER)
        .unwrap_or_else(|| "client".to_string());
    let _ = ws
        .send(Message::Text(element_text(&Element::new("auth-ok")).into()))
        .await;
    Some(identity)
}

fn element_text(el: &Element) -> String {
    String::from_utf8_lossy(&crate::xml::canon::to_bytes(el)).into_owned()
}

// ── OOB endpoint ──

/// Accept-loop for the privileged channel. Loopback TCP or unix socket.
pub async fn run_oob(commander: Arc<OobCommander>, cfg: &OobConfig) -> Result<(), String> {
    if let Some(ref socket_path) = cfg.socket {
        let _ = std::fs::remove_file(socket_path);
        let listener = tokio::net::UnixListener::bind(socket_path)
            .map_err(|e| format!("cannot bind {}: {e}", socket_path.display()))?;
        info!(socket = %socket_path.display(), "OOB channel listening");
        loop {
            let (stream, _) = listener
                .accept()
                .await
                .map_err(|e| format!("OOB accept failed: {e}"))?;
            let commander = commander.clone();
            tokio::spawn(async move { serve_oob(stream, commander).await });
        }
    } else if let Some(port) = cfg.port {
        let listener = TcpListener::bind((cfg.bind.as_str(), port))
            .await
            .map_err(|e| format!("cannot bind {}:{port}: {e}", cfg.bind))?;
        info!(bind = %cfg.bind, port, "OOB channel listening");
        loop {
            let (stream, _) = listener
                .accept()
                .await
                .map_err(|e| format!("OOB accept failed: {e}"))?;
            let commander = commander.clone();
            tokio::spawn(async move { serve_oob(stream, commander).await });
        }
    } else {
        Err("OOB enabled but neither port nor socket configured".into())
    }
}

async fn serve_oob<S>(stream: S, commander: Arc<OobCommander>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("OOB websocket handshake failed: {e}");
            return;
        }
    };

    while let Some(frame) = ws.next().await {
        let raw = match frame {
            Ok(Message::Text(text)) => text.as_str().as_bytes().to_vec(),
            Ok(Message::Binary(bytes)) => bytes.as_ref().to_vec(),
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let reply = commander.handle_frame(&raw).await;
        let text = String::from_utf8_lossy(&reply).into_owned();
        if ws.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
}
