//! HTTP exposition server for the dynamic `logscrape-metrics` registry.
//!
//! Exposes a single `GET` endpoint returning the current snapshot of all registered series, in
//! OpenMetrics or Prometheus text format depending on the request's `Accept` header, optionally
//! restricted to a subset of metric families via repeated `name[]` query parameters.

// Linter settings.
#![warn(missing_debug_implementations, missing_docs, bare_trait_objects)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::must_use_candidate, clippy::module_name_repetitions)]

use std::{
    convert::Infallible,
    fmt,
    future::{self, Future},
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
};

use http_body_util::Full;
use hyper::{
    body::Bytes, header, server::conn::http1, service::service_fn, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use logscrape_metrics::{Format, Registry};
use tokio::{io, net::TcpListener, sync::watch};

#[derive(Clone)]
struct ExporterInner {
    registry: Arc<Registry>,
}

impl ExporterInner {
    async fn render(&self, req: Request<hyper::body::Incoming>) -> Response<Full<Bytes>> {
        let format = Format::from_accept_header(
            req.headers()
                .get(header::ACCEPT)
                .and_then(|value| value.to_str().ok()),
        );
        let names = query_names(req.uri().query().unwrap_or(""));

        let registry = Arc::clone(&self.registry);
        let body = tokio::task::spawn_blocking(move || registry.snapshot(format, &names))
            .await
            .unwrap(); // propagate panics should they occur in the spawned blocking task

        let content_type = match format {
            Format::OpenMetrics | Format::OpenMetricsForPrometheus => {
                Format::OPEN_METRICS_CONTENT_TYPE
            }
            Format::Prometheus => Format::PROMETHEUS_CONTENT_TYPE,
            _ => Format::OPEN_METRICS_CONTENT_TYPE,
        };
        tracing::debug!(scraped_size = body.len(), ?format, "served metrics scrape");

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type)
            .body(Full::new(Bytes::from(body)))
            .unwrap()
    }
}

/// Parses the repeated `name[]` query parameters used to restrict a scrape to a subset of
/// metric families.
fn query_names(query: &str) -> Vec<String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == "name[]").then(|| value.to_owned())
        })
        .collect()
}

/// HTTP server exposing a [`Registry`]'s current snapshot.
///
/// The server responds to `GET` requests on any path. It does not implement TLS, authentication,
/// or a push mode; the log-to-metrics scraper is expected to sit behind whatever ingress the
/// deployment already uses for scrape targets.
pub struct MetricsExporter<'a> {
    inner: ExporterInner,
    shutdown_future: Pin<Box<dyn Future<Output = ()> + Send + 'a>>,
}

impl fmt::Debug for MetricsExporter<'_> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("MetricsExporter")
            .finish_non_exhaustive()
    }
}

impl<'a> MetricsExporter<'a> {
    /// Creates an exporter serving the given registry.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            inner: ExporterInner { registry },
            shutdown_future: Box::pin(future::pending()),
        }
    }

    /// Configures graceful shutdown for the exporter server.
    #[must_use]
    pub fn with_graceful_shutdown<F>(mut self, shutdown: F) -> Self
    where
        F: Future<Output = ()> + Send + 'a,
    {
        self.shutdown_future = Box::pin(shutdown);
        self
    }

    /// Starts the server on the specified address. This future resolves once the server is shut
    /// down.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the specified address fails.
    pub async fn start(self, bind_address: SocketAddr) -> io::Result<()> {
        tracing::info!("starting metrics exporter on {bind_address}");
        self.bind(bind_address).await?.start().await?;
        tracing::info!("metrics exporter shut down");
        Ok(())
    }

    /// Creates an HTTP exporter server and binds it to the specified address.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the specified address fails.
    pub async fn bind(mut self, bind_address: SocketAddr) -> io::Result<MetricsServer<'a>> {
        let listener = TcpListener::bind(bind_address).await?;
        let local_addr = listener.local_addr()?;
        let server = async move {
            let (started_shutdown_sender, started_shutdown) = watch::channel(());
            loop {
                let stream = tokio::select! {
                    res = listener.accept() => res?.0,
                    () = &mut self.shutdown_future => break,
                };

                let io = TokioIo::new(stream);
                let inner = self.inner.clone();
                let mut started_shutdown = started_shutdown.clone();
                tokio::spawn(async move {
                    let conn = http1::Builder::new().serve_connection(
                        io,
                        service_fn(|req| {
                            let inner = inner.clone();
                            async move { Ok::<_, Infallible>(inner.render(req).await) }
                        }),
                    );
                    tokio::pin!(conn);

                    let res = tokio::select! {
                        _ = started_shutdown.changed() => {
                            conn.as_mut().graceful_shutdown();
                            conn.await
                        }
                        res = conn.as_mut() => res,
                    };
                    if let Err(err) = res {
                        tracing::warn!(%err, "error serving connection");
                    }
                });
            }

            tracing::info!("stop signal received, metrics exporter is shutting down");
            drop(started_shutdown);
            started_shutdown_sender.send_replace(());
            started_shutdown_sender.closed().await;

            Ok(())
        };

        Ok(MetricsServer {
            server: Box::pin(server),
            local_addr,
        })
    }
}

/// Metrics server bound to a certain local address, returned by [`MetricsExporter::bind()`].
#[must_use = "Server should be `start()`ed"]
pub struct MetricsServer<'a> {
    server: Pin<Box<dyn Future<Output = io::Result<()>> + Send + 'a>>,
    local_addr: SocketAddr,
}

impl fmt::Debug for MetricsServer<'_> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("MetricsServer")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl MetricsServer<'_> {
    /// Returns the local address this server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts this server. Resolves once the server is shut down.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection-accept loop fails.
    pub async fn start(self) -> io::Result<()> {
        self.server.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_name_parsing() {
        assert_eq!(query_names(""), Vec::<String>::new());
        assert_eq!(
            query_names("name[]=test:a&name[]=test:b"),
            vec!["test:a".to_owned(), "test:b".to_owned()]
        );
        assert_eq!(query_names("other=1"), Vec::<String>::new());
    }

    #[test]
    fn exporter_starts_and_reports_local_addr() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let registry =
                Arc::new(Registry::new("test", std::time::Duration::from_secs(60)).unwrap());
            let (shutdown_tx, shutdown_rx) = watch::channel(());
            let exporter = MetricsExporter::new(registry).with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                let _ = shutdown_rx.changed().await;
            });
            let server = exporter
                .bind("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap();
            assert_ne!(server.local_addr().port(), 0);
            shutdown_tx.send_replace(());
            server.start().await.unwrap();
        });
    }
}
