use serde::Serialize;

use crate::bootstrap;
use crate::cli::GlobalFlags;
use crate::output::output;

#[derive(Serialize)]
struct LogoutResponse {
    cleared: bool,
}

pub async fn handle(flags: &GlobalFlags, config: &warden_config::WardenConfig) -> anyhow::Result<()> {
    let session = bootstrap::session(config)?;
    session.logout().await?;
    session.dispose();
    output(&LogoutResponse { cleared: true }, flags.format)
}
