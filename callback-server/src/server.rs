//! HTTP server receiving pushed event notifications.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use warp::http::{Method, StatusCode};
use warp::Filter;

use crate::error::{CallbackError, Result};
use crate::router::{EventRouter, NotificationPayload};

/// First path segment of every notification route.
pub const ROUTE_PREFIX: &str = "event";

/// Largest accepted notification body.
pub const DEFAULT_BODY_LIMIT: u64 = 256 * 1024;

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Inclusive range of ports to try
    /// Default: 3400-3500
    pub port_range: (u16, u16),

    /// Address advertised to devices instead of the detected one
    pub advertise_ip: Option<IpAddr>,

    /// Address the listener binds
    /// Default: 0.0.0.0
    pub bind_ip: IpAddr,

    /// Maximum body size in bytes
    /// Default: 256 KiB
    pub body_limit: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port_range: (3400, 3500),
            advertise_ip: None,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }
}

impl ServerConfig {
    /// Loopback-only listener, for tests
    pub fn loopback(port_range: (u16, u16)) -> Self {
        Self {
            port_range,
            advertise_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..Default::default()
        }
    }

    pub fn with_port_range(mut self, start: u16, end: u16) -> Self {
        self.port_range = (start, end);
        self
    }

    pub fn with_advertise_ip(mut self, ip: IpAddr) -> Self {
        self.advertise_ip = Some(ip);
        self
    }
}

/// HTTP callback server for push subscriptions.
///
/// Devices deliver notifications with `POST` (some use `NOTIFY`) to
/// `<base_url>/event/<route_key>`. Bodies for registered keys are forwarded
/// through the [`EventRouter`] to the channel passed at construction.
///
/// # Example
///
/// ```no_run
/// use tokio::sync::mpsc;
/// use callback_server::{CallbackServer, NotificationPayload, ServerConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let (tx, mut rx) = mpsc::unbounded_channel::<NotificationPayload>();
///
///     let server = CallbackServer::new(ServerConfig::default(), tx)
///         .await
///         .expect("Failed to create callback server");
///
///     server.router().register("cam-1".to_string()).await.unwrap();
///     println!("Subscribe with: {}", server.url_for("cam-1"));
///
///     while let Some(notification) = rx.recv().await {
///         println!("Notification for {}", notification.route_key);
///     }
/// }
/// ```
pub struct CallbackServer {
    port: u16,
    base_url: String,
    event_router: Arc<EventRouter>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    server_handle: Option<tokio::task::JoinHandle<()>>,
}

impl CallbackServer {
    /// Bind a port in the configured range and start serving.
    pub async fn new(
        config: ServerConfig,
        event_sender: mpsc::UnboundedSender<NotificationPayload>,
    ) -> Result<Self> {
        let (start, end) = config.port_range;
        let port = Self::find_available_port(config.bind_ip, start, end)
            .ok_or(CallbackError::NoAvailablePort { start, end })?;

        let advertised = match config.advertise_ip {
            Some(ip) => ip,
            None => Self::detect_local_ip().ok_or(CallbackError::LocalIp)?,
        };
        let base_url = match advertised {
            IpAddr::V4(ip) => format!("http://{ip}:{port}"),
            IpAddr::V6(ip) => format!("http://[{ip}]:{port}"),
        };

        let event_router = Arc::new(EventRouter::new(event_sender));
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let (ready_tx, mut ready_rx) = mpsc::channel::<()>(1);

        let server_handle = Self::start_server(
            SocketAddr::new(config.bind_ip, port),
            config.body_limit,
            event_router.clone(),
            shutdown_rx,
            ready_tx,
        );

        ready_rx
            .recv()
            .await
            .ok_or_else(|| CallbackError::Startup(format!("listener on port {port} did not come up")))?;

        info!(base_url = %base_url, "Callback server listening");
        Ok(Self {
            port,
            base_url,
            event_router,
            shutdown_tx: Some(shutdown_tx),
            server_handle: Some(server_handle),
        })
    }

    /// `http://<advertised ip>:<port>`
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Full notification URL for `route_key`.
    pub fn url_for(&self, route_key: &str) -> String {
        format!("{}/{}/{}", self.base_url, ROUTE_PREFIX, route_key)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.event_router
    }

    /// Stop accepting requests and wait for in-flight ones.
    pub async fn shutdown(mut self) -> Result<()> {
        self.stop().await;
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(handle) = self.server_handle.take() {
            if let Err(e) = handle.await {
                warn!("Callback server task ended abnormally: {}", e);
            }
        }
        debug!(port = self.port, "Callback server stopped");
    }

    fn find_available_port(ip: IpAddr, start: u16, end: u16) -> Option<u16> {
        (start..=end).find(|&port| Self::is_port_available(ip, port))
    }

    fn is_port_available(ip: IpAddr, port: u16) -> bool {
        TcpListener::bind(SocketAddr::new(ip, port)).is_ok()
    }

    /// Local address used for outbound traffic. No packet is sent.
    pub fn detect_local_ip() -> Option<IpAddr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        let local_addr = socket.local_addr().ok()?;
        Some(local_addr.ip())
    }

    fn start_server(
        addr: SocketAddr,
        body_limit: u64,
        event_router: Arc<EventRouter>,
        mut shutdown_rx: mpsc::Receiver<()>,
        ready_tx: mpsc::Sender<()>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let delivery_method = warp::method()
                .and_then(|method: Method| async move {
                    if is_delivery_method(&method) {
                        Ok(method)
                    } else {
                        Err(warp::reject::custom(MethodRejected))
                    }
                });

            let notify_route = delivery_method
                .and(warp::path(ROUTE_PREFIX))
                .and(warp::path::param::<String>())
                .and(warp::path::end())
                .and(warp::body::content_length_limit(body_limit))
                .and(warp::body::bytes())
                .and_then({
                    let router = event_router.clone();
                    move |method: Method, route_key: String, body: bytes::Bytes| {
                        let router = router.clone();
                        async move {
                            debug!(
                                method = %method,
                                route = %route_key,
                                bytes = body.len(),
                                "Incoming notification"
                            );

                            let body = String::from_utf8_lossy(&body).into_owned();
                            if router.route_event(route_key, body).await {
                                Ok::<_, warp::Rejection>(warp::reply::with_status("", StatusCode::OK))
                            } else {
                                Err(warp::reject::not_found())
                            }
                        }
                    }
                });

            let routes = notify_route.recover(handle_rejection);

            let (bound, server) = warp::serve(routes).bind_with_graceful_shutdown(addr, async move {
                shutdown_rx.recv().await;
            });

            debug!("Callback listener bound on {}", bound);
            let _ = ready_tx.send(()).await;
            server.await;
        })
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.try_send(());
        }
    }
}

fn is_delivery_method(method: &Method) -> bool {
    method == Method::POST || method.as_str() == "NOTIFY"
}

#[derive(Debug)]
struct MethodRejected;

impl warp::reject::Reject for MethodRejected {}

async fn handle_rejection(err: warp::Rejection) -> std::result::Result<impl warp::Reply, std::convert::Infallible> {
    let (code, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Route not found")
    } else if err.find::<MethodRejected>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "Payload too large")
    } else if err.find::<warp::reject::LengthRequired>().is_some() {
        (StatusCode::LENGTH_REQUIRED, "Content-Length required")
    } else {
        (StatusCode::BAD_REQUEST, "Bad request")
    };

    Ok(warp::reply::with_status(message, code))
}
