use std::sync::Arc;

use serde::Serialize;
use warden_auth::{CredentialStore, KeyringStore};

use crate::bootstrap;
use crate::cli::GlobalFlags;
use crate::output::output;

#[derive(Serialize, Default)]
struct StatusResponse {
    authenticated: bool,
    state: String,
    sub: Option<String>,
    name: Option<String>,
    email: Option<String>,
    expires_at: Option<String>,
    credential_source: Option<String>,
    note: Option<String>,
}

pub async fn handle(flags: &GlobalFlags, config: &warden_config::WardenConfig) -> anyhow::Result<()> {
    if !config.client.is_configured() {
        let status = StatusResponse {
            state: "anonymous".into(),
            note: Some("WARDEN_CLIENT__CLIENT_ID not configured".into()),
            ..Default::default()
        };
        return output(&status, flags.format);
    }

    let store = Arc::new(KeyringStore::new()?);
    let credential_source = store.load().map(|(_, source)| source.as_str().to_string());
    let session = bootstrap::session_with_store(config, store)?;

    let status = match session.silent_auth().await {
        Ok(user) => StatusResponse {
            authenticated: true,
            state: session.state().name().to_string(),
            sub: Some(user.sub.clone()),
            name: user.name.clone(),
            email: user.email.clone(),
            expires_at: session.expires_at().map(|at| at.to_rfc3339()),
            credential_source,
            note: None,
        },
        Err(error) => StatusResponse {
            state: session.state().name().to_string(),
            credential_source,
            note: Some(error.to_string()),
            ..Default::default()
        },
    };
    session.dispose();

    output(&status, flags.format)
}
