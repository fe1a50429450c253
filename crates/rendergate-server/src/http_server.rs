//! HTTP Server for rendergate
//!
//! hyper HTTP/1.1 server with one tokio task per connection. Requests are
//! handed to the [`RenderRouter`].
//!
//! # Example
//!
//! ```no_run
//! use rendergate_server::{HttpServer, Orchestrator, RenderConfig, RenderRouter};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = RenderConfig::from_file("rendergate.toml").unwrap();
//!     let orchestrator = Orchestrator::from_config(&config).unwrap();
//!     let server = HttpServer::new(RenderRouter::new(orchestrator, config.route.clone()));
//!     server.run("127.0.0.1:8080".parse().unwrap()).await.unwrap();
//! }
//! ```

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use rendergate_common::{RenderError, Result};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::http_router::{HttpResponse, RenderRouter};

pub struct HttpServer {
    router: Arc<RenderRouter>,
}

impl HttpServer {
    pub fn new(router: RenderRouter) -> Self {
        Self {
            router: Arc::new(router),
        }
    }

    /// Binds `addr` and serves until the process exits.
    pub async fn run(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RenderError::Internal(format!("Failed to bind to {}: {}", addr, e)))?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Serves connections from `listener` until `shutdown` resolves. Open
    /// connections finish on their own tasks.
    pub async fn serve_with_shutdown<S>(self, listener: TcpListener, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        let local = listener
            .local_addr()
            .map_err(|e| RenderError::Internal(format!("Failed to get local address: {}", e)))?;
        tracing::info!(route = self.router.route(), "HTTP server listening on {}", local);

        tokio::pin!(shutdown);
        loop {
            let (stream, peer) = tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("HTTP server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            let io = TokioIo::new(stream);
            let router = self.router.clone();

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let router = router.clone();
                    async move { Self::handle_request(router, req).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    tracing::debug!(%peer, "Error serving connection: {}", err);
                }
            });
        }
    }

    async fn handle_request(
        router: Arc<RenderRouter>,
        req: Request<Incoming>,
    ) -> std::result::Result<HttpResponse, Infallible> {
        tracing::debug!(method = %req.method(), uri = %req.uri(), "Request");
        Ok(router.handle(req).await)
    }
}
