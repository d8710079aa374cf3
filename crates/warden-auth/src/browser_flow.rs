//! Authorization-code + PKCE login through the system browser.
//!
//! 1. Bind `tiny_http` on `127.0.0.1` (configured or random port)
//! 2. Open the browser at the provider's authorize endpoint
//! 3. Wait for `/callback?code=…&state=…` in `spawn_blocking`, since
//!    `tiny_http::recv_timeout` blocks
//! 4. Hand the code and PKCE verifier back for the token exchange

use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::error::AuthError;
use crate::provider::{AuthorizationGrant, AuthorizeRequest};

/// How often the blocking wait checks for cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(200);

const CALLBACK_PATH: &str = "/callback";

/// PKCE verifier and its S256 challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

impl Pkce {
    /// Fresh 32-byte verifier.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::NetworkError` if the OS RNG is unavailable.
    pub fn generate() -> Result<Self, AuthError> {
        let mut bytes = [0u8; 32];
        getrandom::fill(&mut bytes)
            .map_err(|e| AuthError::NetworkError(format!("failed to generate PKCE verifier: {e}")))?;
        Ok(Self::from_verifier(URL_SAFE_NO_PAD.encode(bytes)))
    }

    #[must_use]
    pub fn from_verifier(verifier: String) -> Self {
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        Self {
            verifier,
            challenge,
        }
    }
}

/// Random 16-byte hex nonce for the `state` parameter.
///
/// # Errors
///
/// Returns `AuthError::NetworkError` if the OS RNG is unavailable.
pub fn state_nonce() -> Result<String, AuthError> {
    let mut bytes = [0u8; 16];
    getrandom::fill(&mut bytes)
        .map_err(|e| AuthError::NetworkError(format!("failed to generate CSRF nonce: {e}")))?;
    Ok(bytes.iter().map(|b| format!("{b:02x}")).collect())
}

/// Settings for one interactive login.
#[derive(Debug, Clone)]
pub struct BrowserLogin<'a> {
    pub authorize_endpoint: &'a str,
    pub client_id: &'a str,
    /// `None` picks a free port.
    pub redirect_port: Option<u16>,
    pub timeout: Duration,
    /// Disable to only print the URL (headless use and tests).
    pub open_browser: bool,
}

/// Full authorize URL for `request`.
#[must_use]
pub fn authorize_url(
    authorize_endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    request: &AuthorizeRequest,
    state: &str,
    code_challenge: &str,
) -> String {
    let mut params: Vec<(&str, &str)> = vec![
        ("response_type", "code"),
        ("client_id", client_id),
        ("redirect_uri", redirect_uri),
    ];
    if !request.audience.is_empty() {
        params.push(("audience", request.audience.as_str()));
    }
    if !request.scope.is_empty() {
        params.push(("scope", request.scope.as_str()));
    }
    params.push(("state", state));
    params.push(("code_challenge", code_challenge));
    params.push(("code_challenge_method", "S256"));
    if let Some(hint) = &request.login_hint {
        params.push(("login_hint", hint.as_str()));
    }
    for (key, value) in &request.extra_params {
        params.push((key.as_str(), value.as_str()));
    }

    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    let separator = if authorize_endpoint.contains('?') { '&' } else { '?' };
    format!("{authorize_endpoint}{separator}{query}")
}

/// Run the interactive step and return the authorization grant.
///
/// # Errors
///
/// - `UserCancelled` if the user denied consent or `cancel` fired
/// - `StateMismatch` if the callback's `state` is not ours
/// - `PopupBlocked` if the browser could not be opened and nothing arrived
/// - `TimedOut` if the browser opened but no callback arrived in time
/// - `ProviderRejected` for any other `error=` callback
pub async fn authorize(
    login: &BrowserLogin<'_>,
    request: &AuthorizeRequest,
    cancel: CancellationToken,
) -> Result<AuthorizationGrant, AuthError> {
    let bind = format!("127.0.0.1:{}", login.redirect_port.unwrap_or(0));
    let server = tiny_http::Server::http(&bind)
        .map_err(|e| AuthError::NetworkError(format!("failed to bind {bind}: {e}")))?;
    let port = server
        .server_addr()
        .to_ip()
        .map(|a| a.port())
        .ok_or_else(|| AuthError::NetworkError("callback listener has no port".into()))?;
    let redirect_uri = format!("http://127.0.0.1:{port}{CALLBACK_PATH}");

    let pkce = Pkce::generate()?;
    let state = state_nonce()?;
    let url = authorize_url(
        login.authorize_endpoint,
        login.client_id,
        &redirect_uri,
        request,
        &state,
        &pkce.challenge,
    );

    eprintln!("Opening browser to: {url}");
    let browser_error = if login.open_browser {
        open::that(&url).err().map(|error| {
            eprintln!("Failed to open browser: {error}");
            eprintln!("Open the URL above manually, then return here.");
            error.to_string()
        })
    } else {
        None
    };

    let wait = CallbackWait {
        timeout: login.timeout,
        expected_state: state,
        browser_error,
        cancel: cancel.clone(),
    };
    let waiter = tokio::task::spawn_blocking(move || wait.run(&server));

    let code = tokio::select! {
        () = cancel.cancelled() => return Err(AuthError::UserCancelled),
        joined = waiter => joined
            .map_err(|e| AuthError::NetworkError(format!("spawn_blocking join: {e}")))??,
    };

    Ok(AuthorizationGrant {
        code,
        code_verifier: pkce.verifier,
        redirect_uri,
    })
}

/// What a callback request carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callback {
    Code {
        code: String,
        state: Option<String>,
    },
    Error {
        error: String,
        description: Option<String>,
        state: Option<String>,
    },
    /// Neither a code nor an error, e.g. an intermediate redirect.
    Incomplete,
}

/// Parse the query string of a callback URL.
#[must_use]
pub fn parse_callback(query: &str) -> Callback {
    let mut code = None;
    let mut error = None;
    let mut description = None;
    let mut state = None;

    for pair in query.split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let Ok(value) = urlencoding::decode(&value.replace('+', " ")).map(|v| v.into_owned())
        else {
            continue;
        };
        match key {
            "code" => code = Some(value),
            "error" => error = Some(value),
            "error_description" => description = Some(value),
            "state" => state = Some(value),
            _ => {}
        }
    }

    match (error, code) {
        (Some(error), _) => Callback::Error {
            error,
            description,
            state,
        },
        (None, Some(code)) => Callback::Code { code, state },
        (None, None) => Callback::Incomplete,
    }
}

struct CallbackWait {
    timeout: Duration,
    expected_state: String,
    browser_error: Option<String>,
    cancel: CancellationToken,
}

impl CallbackWait {
    /// Block until the listener receives a decisive callback.
    ///
    /// Loops on `recv_timeout()` in short slices, ignoring requests that are
    /// not the callback (favicon, preflight, user refreshes).
    fn run(self, server: &tiny_http::Server) -> Result<String, AuthError> {
        let deadline = Instant::now() + self.timeout;

        loop {
            if self.cancel.is_cancelled() {
                return Err(AuthError::UserCancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.timed_out());
            }

            let request = match server.recv_timeout(remaining.min(CANCEL_POLL)) {
                Ok(Some(request)) => request,
                Ok(None) => continue,
                Err(e) => return Err(AuthError::NetworkError(format!("recv error: {e}"))),
            };

            let url = request.url().to_string();
            let (path, query) = url.split_once('?').unwrap_or((url.as_str(), ""));
            if path != CALLBACK_PATH {
                let _ = request.respond(tiny_http::Response::from_string("").with_status_code(204));
                continue;
            }

            let outcome = match parse_callback(query) {
                Callback::Incomplete => {
                    let _ = request.respond(html(
                        200,
                        "Waiting for authentication…",
                        "Redirecting, please wait.",
                    ));
                    continue;
                }
                Callback::Code { state, .. } | Callback::Error { state, .. }
                    if state.as_deref() != Some(self.expected_state.as_str()) =>
                {
                    Err(AuthError::StateMismatch)
                }
                Callback::Code { code, .. } => Ok(code),
                Callback::Error {
                    error, description, ..
                } => Err(match error.as_str() {
                    "access_denied" | "login_required" => AuthError::UserCancelled,
                    _ => AuthError::ProviderRejected { error, description },
                }),
            };

            let response = match &outcome {
                Ok(_) => html(200, "Authenticated!", "You can close this tab."),
                Err(error) => html(400, "Auth failed", &format!("{error}. Check CLI output.")),
            };
            let _ = request.respond(response);
            return outcome;
        }
    }

    fn timed_out(&self) -> AuthError {
        match &self.browser_error {
            Some(reason) => AuthError::PopupBlocked(reason.clone()),
            None => AuthError::TimedOut {
                operation: "browser login",
                secs: self.timeout.as_secs(),
            },
        }
    }
}

fn html(status: u16, title: &str, message: &str) -> tiny_http::Response<std::io::Cursor<Vec<u8>>> {
    let body = format!("<html><body><h1>{title}</h1><p>{message}</p></body></html>");
    let response = tiny_http::Response::from_string(body).with_status_code(status);
    match tiny_http::Header::from_bytes("Content-Type", "text/html; charset=utf-8") {
        Ok(header) => response.with_header(header),
        Err(()) => response,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[test]
    fn pkce_challenge_matches_rfc7636_example() {
        let pkce = Pkce::from_verifier("dBjftJeZ4CVP-mJ92K9qgKFWkqJ6DWqFfRl8jNl8Kd8".into());
        assert_eq!(pkce.challenge, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuEJSJGMmDM");
    }

    #[test]
    fn generated_verifiers_are_unique_and_url_safe() {
        let a = Pkce::generate().expect("rng");
        let b = Pkce::generate().expect("rng");
        assert_ne!(a.verifier, b.verifier);
        assert_eq!(a.verifier.len(), 43);
        assert!(a.verifier.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn state_nonce_is_32_hex_chars() {
        let state = state_nonce().expect("rng");
        assert_eq!(state.len(), 32);
        assert!(state.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn authorize_url_carries_all_parameters() {
        let request = AuthorizeRequest {
            audience: "TheSweetestAPI".into(),
            scope: "openid profile".into(),
            login_hint: Some("bruce@wayne.example".into()),
            extra_params: vec![("prompt".into(), "login".into())],
        };
        let url = authorize_url(
            "https://tenant.example/authorize",
            "client-1",
            "http://127.0.0.1:4000/callback",
            &request,
            "abc",
            "challenge",
        );

        assert_eq!(
            url,
            "https://tenant.example/authorize?response_type=code&client_id=client-1\
             &redirect_uri=http%3A%2F%2F127.0.0.1%3A4000%2Fcallback&audience=TheSweetestAPI\
             &scope=openid%20profile&state=abc&code_challenge=challenge\
             &code_challenge_method=S256&login_hint=bruce%40wayne.example&prompt=login"
        );
    }

    #[rstest]
    #[case::code("code=xyz&state=s1", Callback::Code { code: "xyz".into(), state: Some("s1".into()) })]
    #[case::denied(
        "error=access_denied&error_description=User+did+not+authorize&state=s1",
        Callback::Error {
            error: "access_denied".into(),
            description: Some("User did not authorize".into()),
            state: Some("s1".into()),
        }
    )]
    #[case::error_wins("code=xyz&error=server_error", Callback::Error {
        error: "server_error".into(),
        description: None,
        state: None,
    })]
    #[case::encoded("code=a%2Fb&state=s%201", Callback::Code { code: "a/b".into(), state: Some("s 1".into()) })]
    #[case::nothing("foo=bar", Callback::Incomplete)]
    #[case::empty("", Callback::Incomplete)]
    fn callback_parsing(#[case] query: &str, #[case] expected: Callback) {
        assert_eq!(parse_callback(query), expected);
    }

    fn waiter(timeout: Duration, browser_error: Option<&str>) -> (tiny_http::Server, String, CallbackWait) {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind");
        let port = server.server_addr().to_ip().expect("ip").port();
        let wait = CallbackWait {
            timeout,
            expected_state: "s1".into(),
            browser_error: browser_error.map(str::to_string),
            cancel: CancellationToken::new(),
        };
        (server, format!("http://127.0.0.1:{port}"), wait)
    }

    async fn run_with_requests(
        wait: CallbackWait,
        server: tiny_http::Server,
        requests: Vec<String>,
    ) -> Result<String, AuthError> {
        let handle = tokio::task::spawn_blocking(move || wait.run(&server));
        let client = reqwest::Client::new();
        for url in requests {
            let _ = client.get(url).send().await;
        }
        handle.await.expect("join")
    }

    #[tokio::test]
    async fn callback_with_matching_state_yields_code() {
        let (server, base, wait) = waiter(Duration::from_secs(5), None);
        let result = run_with_requests(
            wait,
            server,
            vec![
                format!("{base}/favicon.ico"),
                format!("{base}/callback?code=the-code&state=s1"),
            ],
        )
        .await;
        assert_eq!(result, Ok("the-code".into()));
    }

    #[tokio::test]
    async fn callback_with_foreign_state_is_rejected() {
        let (server, base, wait) = waiter(Duration::from_secs(5), None);
        let result = run_with_requests(
            wait,
            server,
            vec![format!("{base}/callback?code=the-code&state=evil")],
        )
        .await;
        assert_eq!(result, Err(AuthError::StateMismatch));
    }

    #[tokio::test]
    async fn denied_consent_is_user_cancelled() {
        let (server, base, wait) = waiter(Duration::from_secs(5), None);
        let result = run_with_requests(
            wait,
            server,
            vec![format!("{base}/callback?error=access_denied&state=s1")],
        )
        .await;
        assert_eq!(result, Err(AuthError::UserCancelled));
    }

    #[tokio::test]
    async fn silence_after_failed_browser_open_is_popup_blocked() {
        let (server, _, wait) = waiter(Duration::from_millis(100), Some("no display"));
        let result = run_with_requests(wait, server, vec![]).await;
        assert_eq!(result, Err(AuthError::PopupBlocked("no display".into())));
    }

    #[tokio::test]
    async fn silence_after_opened_browser_times_out() {
        let (server, _, wait) = waiter(Duration::from_millis(100), None);
        let result = run_with_requests(wait, server, vec![]).await;
        assert!(matches!(result, Err(AuthError::TimedOut { .. })));
    }

    #[tokio::test]
    async fn cancellation_stops_the_wait() {
        let (server, _, wait) = waiter(Duration::from_secs(30), None);
        let cancel = wait.cancel.clone();
        let handle = tokio::task::spawn_blocking(move || wait.run(&server));
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("wait ends promptly")
            .expect("join");
        assert_eq!(result, Err(AuthError::UserCancelled));
    }

    #[tokio::test]
    async fn authorize_returns_grant_for_callback_on_configured_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("probe");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let login = BrowserLogin {
            authorize_endpoint: "https://tenant.example/authorize",
            client_id: "client-1",
            redirect_port: Some(port),
            timeout: Duration::from_secs(5),
            open_browser: false,
        };
        let request = AuthorizeRequest::default();
        let cancel = CancellationToken::new();

        let flow = tokio::spawn({
            let cancel = cancel.clone();
            async move { authorize(&login, &request, cancel).await }
        });

        // The state is random, so a callback without it must be refused.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = reqwest::get(format!("http://127.0.0.1:{port}/callback?code=c&state=guess")).await;

        let result = flow.await.expect("join");
        assert_eq!(result, Err(AuthError::StateMismatch));
    }
}
