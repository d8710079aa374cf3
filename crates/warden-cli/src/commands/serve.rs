//! Demo API: `/public` for anyone, `/private` behind [`AuthGate`].
//!
//! `tiny_http` only offers a blocking `recv`, so the accept loop polls it in
//! `spawn_blocking` and hands each request to its own task for verification.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use tiny_http::{Header, Method, Request, Response, Server};
use tokio_util::sync::CancellationToken;
use warden_auth::{AuthGate, KeySetSource};

use crate::bootstrap;
use crate::cli::{GlobalFlags, ServeArgs};
use crate::output::output;

const ACCEPT_POLL: Duration = Duration::from_millis(200);

#[derive(Serialize)]
struct ServeResponse {
    listening: String,
    issuer: String,
    audience: String,
}

/// Status and optional JSON body for one response.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: u16,
    pub body: Option<Value>,
}

impl Reply {
    fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            body: Some(body),
        }
    }

    const fn empty(status: u16) -> Self {
        Self { status, body: None }
    }
}

pub async fn handle(
    args: &ServeArgs,
    flags: &GlobalFlags,
    config: &warden_config::WardenConfig,
) -> anyhow::Result<()> {
    let audience = config.require_verifier()?.audience.clone();
    let issuer = bootstrap::issuer(config.require_provider()?);
    let verifier = Arc::new(bootstrap::http_verifier(config)?);
    let gate = Arc::new(AuthGate::new(verifier, issuer.clone(), audience.clone()));

    let bind = match &args.bind {
        Some(bind) => bind.clone(),
        None => config.server.socket_addr()?.to_string(),
    };
    let server = Server::http(&bind).map_err(|e| anyhow::anyhow!("failed to bind {bind}: {e}"))?;
    let server = Arc::new(server);
    let listening = server
        .server_addr()
        .to_ip()
        .map_or_else(|| bind.clone(), |addr| addr.to_string());

    output(
        &ServeResponse {
            listening: format!("http://{listening}"),
            issuer,
            audience,
        },
        flags.format,
    )?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutting down");
        }
        on_signal.cancel();
    });

    serve(server, gate, shutdown).await
}

/// Accept requests until `shutdown` fires.
pub async fn serve<S: KeySetSource + 'static>(
    server: Arc<Server>,
    gate: Arc<AuthGate<S>>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        let listener = Arc::clone(&server);
        let next = tokio::task::spawn_blocking(move || listener.recv_timeout(ACCEPT_POLL));

        let received = tokio::select! {
            () = shutdown.cancelled() => break,
            joined = next => joined?,
        };
        let Some(request) = received? else {
            continue;
        };

        let gate = Arc::clone(&gate);
        tokio::spawn(async move { respond(&gate, request).await });
    }

    server.unblock();
    Ok(())
}

async fn respond<S: KeySetSource>(gate: &AuthGate<S>, request: Request) {
    let authorization = request
        .headers()
        .iter()
        .find(|h| h.field.equiv("Authorization"))
        .map(|h| h.value.as_str().to_string());
    let reply = route(gate, request.method(), request.url(), authorization.as_deref()).await;
    tracing::debug!(
        method = %request.method(),
        path = %request.url(),
        status = reply.status,
        "request served"
    );

    let response = to_response(&reply);
    let written = tokio::task::spawn_blocking(move || request.respond(response)).await;
    match written {
        Ok(Ok(())) => {}
        Ok(Err(error)) => tracing::debug!(%error, "failed to write response"),
        Err(error) => tracing::warn!(%error, "response task failed"),
    }
}

/// Decide the response for one request.
pub async fn route<S: KeySetSource>(
    gate: &AuthGate<S>,
    method: &Method,
    url: &str,
    authorization: Option<&str>,
) -> Reply {
    let path = url.split('?').next().unwrap_or_default();

    match (method, path) {
        (Method::Options, _) => Reply::empty(204),
        (Method::Get, "/public") => Reply::json(200, json!({ "hello": "world" })),
        (Method::Get, "/private") => match gate.authenticate(authorization).await {
            Ok(ctx) => {
                let subject = ctx.subject().unwrap_or("anonymous");
                Reply::json(
                    200,
                    json!({
                        "secrets": [
                            format!("You're {subject}"),
                            "          ... I'm Batman!",
                        ],
                    }),
                )
            }
            Err(_) => Reply::json(401, json!({ "error": "unauthorized" })),
        },
        _ => Reply::json(404, json!({ "error": "not found" })),
    }
}

fn to_response(reply: &Reply) -> Response<Cursor<Vec<u8>>> {
    let body = reply.body.as_ref().map(Value::to_string).unwrap_or_default();
    let mut response = Response::from_string(body).with_status_code(reply.status);

    let mut headers = vec![
        ("Access-Control-Allow-Origin", "*"),
        ("Access-Control-Allow-Headers", "authorization"),
    ];
    if reply.body.is_some() {
        headers.push(("Content-Type", "application/json"));
    }
    for (field, value) in headers {
        if let Ok(header) = Header::from_bytes(field, value) {
            response.add_header(header);
        }
    }
    response
}
