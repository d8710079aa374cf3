mod login;
mod logout;
mod serve;
mod status;
mod token;
mod verify;

use crate::cli::{Commands, GlobalFlags};

/// Run one `warden` subcommand.
pub async fn dispatch(
    command: &Commands,
    flags: &GlobalFlags,
    config: &warden_config::WardenConfig,
) -> anyhow::Result<()> {
    match command {
        Commands::Serve(args) => serve::handle(args, flags, config).await,
        Commands::Login => login::handle(flags, config).await,
        Commands::Logout => logout::handle(flags, config).await,
        Commands::Status => status::handle(flags, config).await,
        Commands::Token(args) => token::handle(args, flags, config).await,
        Commands::Verify(args) => verify::handle(args, flags, config).await,
    }
}
