//! Blocking HTTP front end for the pipeline.
//!
//! Every request gets its own worker thread. The worker runs the pipeline to
//! completion before writing the response, so a sender hanging up early
//! never interrupts a publish half way.

use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result, anyhow};
use pkgsync_webhook::WebhookRequest;
use tiny_http::{Header, Method, Request, Server, StatusCode};

use crate::Pipeline;
use crate::outcome::Response;

/// Health check path
pub const HEALTH_PATH: &str = "/health";

/// Largest body accepted; matches GitHub's own payload cap.
pub const MAX_BODY_BYTES: u64 = 25 * 1024 * 1024;

/// Webhook listener bound to an address.
pub struct WebhookServer {
    http: Arc<Server>,
    pipeline: Arc<Pipeline>,
    path: String,
}

/// Stops a running [`WebhookServer`] from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    http: Arc<Server>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.http.unblock();
    }
}

impl WebhookServer {
    /// Bind to `addr`, answering webhooks on the configured path.
    pub fn bind(addr: &str, pipeline: Arc<Pipeline>) -> Result<Self> {
        let http = Server::http(addr)
            .map_err(|e| anyhow!("{e}"))
            .with_context(|| format!("failed to listen on {addr}"))?;
        let path = pipeline.config().server.path.clone();

        Ok(Self {
            http: Arc::new(http),
            pipeline,
            path,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.http
            .server_addr()
            .to_ip()
            .context("server is not listening on an IP socket")
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            http: Arc::clone(&self.http),
        }
    }

    /// Serve until shut down.
    pub fn run(&self) -> Result<()> {
        if let Ok(addr) = self.local_addr() {
            tracing::info!(%addr, path = %self.path, "listening for webhooks");
        }

        let mut workers: Vec<thread::JoinHandle<()>> = Vec::new();
        for request in self.http.incoming_requests() {
            let pipeline = Arc::clone(&self.pipeline);
            let path = self.path.clone();
            workers.retain(|w| !w.is_finished());
            workers.push(thread::spawn(move || serve(&pipeline, &path, request)));
        }

        for worker in workers {
            if worker.join().is_err() {
                tracing::error!("webhook worker panicked");
            }
        }
        tracing::info!("server stopped");
        Ok(())
    }
}

fn serve(pipeline: &Pipeline, path: &str, mut request: Request) {
    let response = route(pipeline, path, &mut request);

    let mut reply =
        tiny_http::Response::from_string(response.body).with_status_code(StatusCode(response.status));
    if let Ok(header) = Header::from_bytes("Content-Type", "text/plain; charset=utf-8") {
        reply = reply.with_header(header);
    }
    if let Err(e) = request.respond(reply) {
        tracing::warn!("failed to send response: {e}");
    }
}

fn route(pipeline: &Pipeline, path: &str, request: &mut Request) -> Response {
    let url_path = request.url().split('?').next().unwrap_or_default().to_string();
    let method = request.method().clone();

    if url_path == HEALTH_PATH {
        return match method {
            Method::Get | Method::Head => Response::new(200, "ok"),
            _ => Response::new(405, "method not allowed"),
        };
    }
    if url_path != path {
        return Response::new(404, "not found");
    }
    if method != Method::Post {
        return Response::new(405, "method not allowed");
    }

    match webhook_request(request) {
        Ok(webhook) => pipeline.handle(&webhook),
        Err(response) => response,
    }
}

fn webhook_request(request: &mut Request) -> Result<WebhookRequest, Response> {
    let mut body = Vec::new();
    request
        .as_reader()
        .take(MAX_BODY_BYTES + 1)
        .read_to_end(&mut body)
        .map_err(|e| Response::new(400, format!("failed to read body: {e}")))?;
    if body.len() as u64 > MAX_BODY_BYTES {
        return Err(Response::new(413, "payload too large"));
    }

    let mut webhook = WebhookRequest::new(body);
    for header in request.headers() {
        webhook.insert_header(header.field.as_str().as_str(), header.value.as_str());
    }
    Ok(webhook)
}
