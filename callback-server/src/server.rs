//! HTTP server for receiving UPnP event notifications.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::thread::JoinHandle;

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use warp::Filter;

/// A raw, unparsed NOTIFY delivery.
#[derive(Debug, Clone)]
pub struct Notification {
    /// Subscription key from the callback path (`/notify/<key>`),
    /// percent-decoded
    pub subscription_key: String,
    /// The `SID` header, when the player sent one
    pub sid: Option<String>,
    /// Raw XML event body
    pub body: String,
}

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("no available port in range {0}-{1}")]
    NoAvailablePort(u16, u16),

    #[error("failed to detect a routable local IPv4 address")]
    NoLocalIp,

    #[error("listener failed to start: {0}")]
    Startup(String),
}

/// HTTP callback server for receiving UPnP event notifications.
///
/// One instance serves every subscription of the gateway; the subscription
/// key embedded in the callback path tells the consumer which (player,
/// service) pair an event belongs to.
pub struct CallbackServer {
    port: u16,
    base_url: String,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    runtime_thread: Option<JoinHandle<()>>,
}

impl CallbackServer {
    /// Bind a free port in `port_range` on the routable local IPv4 and
    /// start serving. Received notifications are pushed to `sender`; the
    /// consuming side drains them with `blocking_recv` on its own thread.
    pub fn start(
        port_range: (u16, u16),
        sender: UnboundedSender<Notification>,
    ) -> Result<Self, CallbackError> {
        let port = find_available_port(port_range.0, port_range.1)
            .ok_or(CallbackError::NoAvailablePort(port_range.0, port_range.1))?;
        let local_ip = detect_local_ip().ok_or(CallbackError::NoLocalIp)?;
        let base_url = format!("http://{local_ip}:{port}");

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), String>>();

        let runtime_thread = std::thread::Builder::new()
            .name("notify-listener".to_string())
            .spawn(move || {
                run_server(port, sender, shutdown_rx, ready_tx);
            })
            .map_err(|e| CallbackError::Startup(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(message)) => return Err(CallbackError::Startup(message)),
            Err(_) => return Err(CallbackError::Startup("listener thread died".to_string())),
        }

        tracing::info!(%base_url, "callback listener started");
        Ok(Self {
            port,
            base_url,
            shutdown_tx: Some(shutdown_tx),
            runtime_thread: Some(runtime_thread),
        })
    }

    /// Base URL used to build callback URLs, `http://<local_ip>:<port>`.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Full callback URL for a subscription key.
    pub fn notify_url(&self, subscription_key: &str) -> String {
        format!(
            "{}/notify/{}",
            self.base_url,
            urlencoding::encode(subscription_key)
        )
    }

    /// Stop the listener. Idempotent; also runs on drop.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.runtime_thread.take() {
            let _ = handle.join();
            tracing::info!("callback listener stopped");
        }
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_server(
    port: u16,
    sender: UnboundedSender<Notification>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
    ready_tx: std::sync::mpsc::Sender<Result<(), String>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("failed to build runtime: {e}")));
            return;
        }
    };

    runtime.block_on(async move {
        let notify = warp::method()
            .and(warp::path!("notify" / String))
            .and(warp::header::optional::<String>("sid"))
            .and(warp::body::bytes())
            .map(
                move |method: warp::http::Method,
                      key: String,
                      sid: Option<String>,
                      body: bytes::Bytes| {
                    if method.as_str() != "NOTIFY" {
                        return warp::http::StatusCode::METHOD_NOT_ALLOWED;
                    }
                    let subscription_key = urlencoding::decode(&key)
                        .map(|decoded| decoded.into_owned())
                        .unwrap_or(key);
                    let body = String::from_utf8_lossy(&body).into_owned();
                    tracing::trace!(
                        key = %subscription_key,
                        bytes = body.len(),
                        "NOTIFY received"
                    );
                    // Acknowledge regardless of channel state: the sender
                    // side going away must not make players time out.
                    let _ = sender.send(Notification {
                        subscription_key,
                        sid,
                        body,
                    });
                    warp::http::StatusCode::OK
                },
            );

        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        match warp::serve(notify).try_bind_with_graceful_shutdown(addr, async move {
            let _ = shutdown_rx.await;
        }) {
            Ok((_, server)) => {
                let _ = ready_tx.send(Ok(()));
                server.await;
            }
            Err(e) => {
                let _ = ready_tx.send(Err(format!("bind failed: {e}")));
            }
        }
    });
}

/// Find an available port in the given range.
fn find_available_port(start: u16, end: u16) -> Option<u16> {
    (start..=end).find(|&port| is_port_available(port))
}

fn is_port_available(port: u16) -> bool {
    TcpListener::bind(SocketAddr::new(
        IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        port,
    ))
    .is_ok()
}

/// Detect the local IP address used for outbound traffic via a connected
/// UDP socket; no packet is sent.
fn detect_local_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}
