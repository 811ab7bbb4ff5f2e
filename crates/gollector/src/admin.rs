// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Administrative HTTP server.
//!
//! - `GET /statistics` returns the counters of every stage, keyed by stage name.
//! - `GET /diagnostics` returns the process start time and uptime.
//!
//! Both accept a `pretty` query parameter for indented output.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::errors::BindError;
use crate::pipeline::Pipeline;

const STATISTICS_PATH: &str = "/statistics";
const DIAGNOSTICS_PATH: &str = "/diagnostics";

pub struct AdminServer {
    listener: TcpListener,
    pipeline: Arc<Pipeline>,
}

impl AdminServer {
    pub async fn bind(address: &str, pipeline: Arc<Pipeline>) -> Result<AdminServer, BindError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| BindError {
                transport: "admin http",
                address: address.to_string(),
                source,
            })?;
        Ok(AdminServer { listener, pipeline })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn serve(self, cancel: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("admin: serving statistics on http://{addr}{STATISTICS_PATH}");
        }
        let server = hyper::server::conn::http1::Builder::new();
        let mut connections = JoinSet::new();

        loop {
            let conn = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((conn, _)) => conn,
                    Err(e) => {
                        debug!("admin: failed to accept connection: {e}");
                        continue;
                    }
                },
                finished = async {
                    match connections.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!("admin: connection handler panicked: {e:?}");
                        }
                    }
                    continue;
                },
            };

            let conn = TokioIo::new(conn);
            let server = server.clone();
            let pipeline = Arc::clone(&self.pipeline);
            let service = service_fn(move |req| {
                let pipeline = Arc::clone(&pipeline);
                async move { Ok::<_, Infallible>(respond(&pipeline, &req)) }
            });
            connections.spawn(async move {
                if let Err(e) = server.serve_connection(conn, service).await {
                    debug!("admin: connection error: {e}");
                }
            });
        }
        connections.abort_all();
        info!("admin: server stopped");
    }
}

/// Routes one request.
pub fn respond<B>(pipeline: &Pipeline, req: &Request<B>) -> Response<Full<Bytes>> {
    if req.method() != Method::GET {
        return not_found();
    }
    let pretty = wants_pretty(req.uri().query());
    match req.uri().path() {
        STATISTICS_PATH => match pipeline.statistics() {
            Ok(statistics) => json_response(StatusCode::OK, &statistics, pretty),
            Err(e) => error_response(
                &format!("failed to collect statistics: {e}"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        },
        DIAGNOSTICS_PATH => json_response(StatusCode::OK, &pipeline.diagnostics(), pretty),
        _ => not_found(),
    }
}

fn wants_pretty(query: Option<&str>) -> bool {
    query
        .into_iter()
        .flat_map(|q| q.split('&'))
        .any(|pair| pair.split('=').next() == Some("pretty"))
}

fn to_json<T: Serialize>(value: &T, pretty: bool) -> Result<Vec<u8>, serde_json::Error> {
    if !pretty {
        return serde_json::to_vec(value);
    }
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut serializer)?;
    Ok(buf)
}

fn json_response<T: Serialize>(
    status: StatusCode,
    value: &T,
    pretty: bool,
) -> Response<Full<Bytes>> {
    match to_json(value, pretty) {
        Ok(body) => with_body(status, body),
        Err(e) => error_response(
            &format!("failed to encode response: {e}"),
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
    }
}

fn error_response(message: &str, status: StatusCode) -> Response<Full<Bytes>> {
    error!("admin: {message}");
    with_body(status, json!({ "message": message }).to_string().into_bytes())
}

fn not_found() -> Response<Full<Bytes>> {
    with_body(
        StatusCode::NOT_FOUND,
        json!({ "message": "not found" }).to_string().into_bytes(),
    )
}

fn with_body(status: StatusCode, body: Vec<u8>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::errors::StatisticsError;
    use crate::statistics::{Counter, StatisticsProvider, StatisticsSnapshot};
    use http_body_util::BodyExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    struct Messages(Counter);

    impl StatisticsProvider for Messages {
        fn statistics(&self) -> Result<StatisticsSnapshot, StatisticsError> {
            Ok(StatisticsSnapshot::new().with("messages", &self.0))
        }
    }

    struct Unavailable;

    impl StatisticsProvider for Unavailable {
        fn statistics(&self) -> Result<StatisticsSnapshot, StatisticsError> {
            Err(StatisticsError::Unavailable("kafka".to_string()))
        }
    }

    fn messages(n: u64) -> Arc<dyn StatisticsProvider> {
        let counter = Counter::new();
        counter.add(n);
        Arc::new(Messages(counter))
    }

    fn pipeline() -> Pipeline {
        Pipeline::new(messages(1), messages(2), messages(3), messages(4))
    }

    fn get(uri: &str) -> Request<()> {
        Request::builder().uri(uri).body(()).unwrap()
    }

    async fn body(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_statistics_compact() {
        let response = respond(&pipeline(), &get("/statistics"));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(
            body(response).await,
            r#"{"kafka":{"messages":4},"parser":{"messages":3},"tcp":{"messages":1},"udp":{"messages":2}}"#
        );
    }

    #[tokio::test]
    async fn test_statistics_pretty_uses_four_spaces() {
        let response = respond(&pipeline(), &get("/statistics?pretty"));
        let text = body(response).await;
        assert!(text.starts_with("{\n    \"kafka\": {\n        \"messages\": 4\n    },"), "{text}");

        let response = respond(&pipeline(), &get("/statistics?foo=1&pretty=true"));
        assert!(body(response).await.contains("\n    "));
    }

    #[tokio::test]
    async fn test_statistics_failure_is_500() {
        let pipeline = Pipeline::new(
            messages(1),
            messages(2),
            messages(3),
            Arc::new(Unavailable),
        );
        let response = respond(&pipeline, &get("/statistics"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let value: serde_json::Value = serde_json::from_str(&body(response).await).unwrap();
        assert_eq!(
            value["message"],
            "failed to collect statistics: statistics for kafka are unavailable"
        );
    }

    #[tokio::test]
    async fn test_diagnostics() {
        let pipeline = pipeline();
        let response = respond(&pipeline, &get("/diagnostics"));
        assert_eq!(response.status(), StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body(response).await).unwrap();
        assert_eq!(value["started"], pipeline.started_at().to_rfc3339());
        assert!(value["uptime"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_routes_are_404() {
        for uri in ["/", "/metrics", "/statistics/tcp"] {
            let response = respond(&pipeline(), &get(uri));
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
        }
        let post = Request::builder()
            .method(Method::POST)
            .uri("/statistics")
            .body(())
            .unwrap();
        assert_eq!(respond(&pipeline(), &post).status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_serves_over_http() {
        let server = AdminServer::bind("127.0.0.1:0", Arc::new(pipeline()))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(server.serve(cancel.clone()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /statistics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        assert!(response.ends_with(r#""udp":{"messages":2}}"#), "{response}");

        cancel.cancel();
        task.await.unwrap();
    }
}
