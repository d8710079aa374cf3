use serde::Serialize;

use crate::bootstrap;
use crate::cli::GlobalFlags;
use crate::output::output;

#[derive(Serialize)]
struct LoginResponse {
    authenticated: bool,
    sub: String,
    name: Option<String>,
    email: Option<String>,
    expires_at: Option<String>,
}

pub async fn handle(flags: &GlobalFlags, config: &warden_config::WardenConfig) -> anyhow::Result<()> {
    let session = bootstrap::session(config)?;

    // Ctrl-C abandons the browser wait instead of killing the process.
    let interrupt = {
        let session = session.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                session.cancel_login();
            }
        })
    };
    let result = session.login().await;
    interrupt.abort();

    let user = result?;
    let response = LoginResponse {
        authenticated: true,
        sub: user.sub.clone(),
        name: user.name.clone(),
        email: user.email.clone(),
        expires_at: session.expires_at().map(|at| at.to_rfc3339()),
    };
    session.dispose();

    output(&response, flags.format)
}
