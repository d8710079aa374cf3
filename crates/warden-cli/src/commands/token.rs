use chrono::Utc;
use serde::Serialize;

use crate::bootstrap;
use crate::cli::{GlobalFlags, TokenArgs};
use crate::output::output;

#[derive(Serialize)]
struct TokenResponse {
    access_token: String,
    audience: String,
    scope: String,
    expires_at: String,
    expires_in_secs: i64,
}

pub async fn handle(
    args: &TokenArgs,
    flags: &GlobalFlags,
    config: &warden_config::WardenConfig,
) -> anyhow::Result<()> {
    let session = bootstrap::session(config)?;
    session.silent_auth().await?;

    let options = session.options();
    let audience = args.audience.as_deref().unwrap_or(&options.audience);
    let scope = args.scope.as_deref().unwrap_or(&options.scope);
    let token = session.access_token(audience, scope).await?;
    session.dispose();

    output(
        &TokenResponse {
            expires_in_secs: (token.expires_at - Utc::now()).num_seconds().max(0),
            expires_at: token.expires_at.to_rfc3339(),
            access_token: token.value,
            audience: token.audience,
            scope: token.scope,
        },
        flags.format,
    )
}
