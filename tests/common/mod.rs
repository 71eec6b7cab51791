//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;

use axum::body::Bytes;
use axum::extract::Path as UrlPath;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use docserve::http::ApiError;
use docserve::modules::{Module, ModuleDescriptor, ModuleError, RouteProvider};
use docserve::routing::Route;
use docserve::{builtin_registry, HttpServer, ServerConfig, Shutdown};

/// A request captured by [`start_receiver`].
#[derive(Debug)]
pub struct Delivery {
    pub kind: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Delivery {
    pub fn header(&self, name: &str) -> &str {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    }
}

async fn serve_on_random_port(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Start a webhook receiver. Every request to `/{kind}` is forwarded to the channel.
pub async fn start_receiver() -> (String, mpsc::UnboundedReceiver<Delivery>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |UrlPath(kind): UrlPath<String>, method: Method, headers: HeaderMap, body: Bytes| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(Delivery {
                kind,
                method,
                headers,
                body,
            });
            StatusCode::OK
        }
    };
    let app = Router::new().route(
        "/{kind}",
        post(handler.clone()).put(handler.clone()).patch(handler),
    );

    let addr = serve_on_random_port(app).await;
    (format!("http://{addr}"), rx)
}

/// Start a file server answering `/{name}` with `body` as an attachment.
pub async fn start_file_backend(body: &'static [u8]) -> String {
    let app = Router::new().route(
        "/{name}",
        get(move |UrlPath(name): UrlPath<String>| async move {
            (
                [(
                    "content-disposition",
                    format!("attachment; filename=\"{name}\""),
                )],
                body,
            )
        }),
    );

    let addr = serve_on_random_port(app).await;
    format!("http://{addr}")
}

/// Test module: `POST /forms/convert` turns every uploaded file into a fake PDF.
pub struct Convert;

pub const CONVERTED_PREFIX: &[u8] = b"%PDF-1.7\n";

impl Module for Convert {
    fn as_router(&self) -> Option<&dyn RouteProvider> {
        Some(self)
    }
}

impl RouteProvider for Convert {
    fn routes(&self) -> Result<Vec<Route>, ModuleError> {
        Ok(vec![Route::form(Method::POST, "/forms/convert", |ctx| async move {
            let inputs: BTreeMap<_, _> = ctx.files().clone().into_iter().collect();
            if inputs.is_empty() {
                return Err(ApiError::bad_request("no form file found for extensions: [.txt]"));
            }

            let mut outputs = Vec::new();
            for (name, input) in inputs {
                let stem = Path::new(&name)
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("output")
                    .to_string();
                let output = ctx.generate_path_from_filename(&format!("{stem}.pdf")).await?;

                let mut content = CONVERTED_PREFIX.to_vec();
                content.extend(tokio::fs::read(&input).await.map_err(ApiError::internal)?);
                tokio::fs::write(&output, content)
                    .await
                    .map_err(ApiError::internal)?;
                outputs.push(output);
            }

            ctx.add_output_paths(outputs)?;
            Ok(())
        })])
    }
}

/// A running server and the handle to stop it.
pub struct TestServer {
    pub base: String,
    pub shutdown: Shutdown,
    pub handle: JoinHandle<Result<(), docserve::http::ServerError>>,
    _working_dir: tempfile::TempDir,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub async fn stop(self) {
        self.shutdown.trigger();
        self.handle.await.unwrap().unwrap();
    }
}

/// Start the built-in modules plus [`Convert`] on a random port.
pub async fn start_server(mut config: ServerConfig) -> TestServer {
    let working_dir = tempfile::tempdir().unwrap();
    config.api.working_dir = Some(working_dir.path().to_path_buf());

    let mut registry = builtin_registry().unwrap();
    registry
        .register(ModuleDescriptor::new("convert", || Convert))
        .unwrap();

    let server = HttpServer::new(config, &registry).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let handle = tokio::spawn(server.run(listener, shutdown.subscribe()));

    TestServer {
        base: format!("http://{addr}"),
        shutdown,
        handle,
        _working_dir: working_dir,
    }
}

/// Config with fast webhook retries, for tests that exercise delivery.
pub fn fast_webhook_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    let flags: toml::Table = toml::from_str(
        r#"
        max_retry = 1
        retry_min_wait_ms = 10
        retry_max_wait_ms = 50
        client_timeout_secs = 5
        "#,
    )
    .unwrap();
    config
        .modules
        .insert("webhook".to_string(), toml::Value::Table(flags));
    config
}

/// A multipart form with one text file per `(name, content)` pair.
pub fn form(files: &[(&str, &str)]) -> reqwest::multipart::Form {
    files
        .iter()
        .fold(reqwest::multipart::Form::new(), |form, (name, content)| {
            let part = reqwest::multipart::Part::bytes(content.as_bytes().to_vec())
                .file_name(name.to_string());
            form.part("files", part)
        })
}
