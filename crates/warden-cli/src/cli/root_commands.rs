use std::path::PathBuf;

use clap::{Args, Subcommand};

#[derive(Clone, Debug, Subcommand)]
pub enum Commands {
    /// Run the demo API with a public and a bearer-protected route.
    Serve(ServeArgs),
    /// Log in through the browser and keep the refresh credential.
    Login,
    /// End the session and forget the stored credential.
    Logout,
    /// Show who is signed in, restoring the session silently.
    Status,
    /// Print an access token for an API audience.
    Token(TokenArgs),
    /// Verify a bearer token the way `serve` does.
    Verify(VerifyArgs),
}

#[derive(Clone, Debug, Args)]
pub struct ServeArgs {
    /// Listen address, overriding `server.bind`.
    #[arg(long)]
    pub bind: Option<String>,
}

#[derive(Clone, Debug, Args)]
pub struct TokenArgs {
    /// API audience. Defaults to `client.audience`.
    #[arg(long)]
    pub audience: Option<String>,
    /// Requested scope. Defaults to `client.scope`.
    #[arg(long)]
    pub scope: Option<String>,
}

#[derive(Clone, Debug, Args)]
pub struct VerifyArgs {
    /// The token, with or without a `Bearer ` prefix.
    pub token: String,
    /// Expected audience. Defaults to `verifier.audience`.
    #[arg(long)]
    pub audience: Option<String>,
    /// Verify against a local JWKS document instead of the provider.
    #[arg(long)]
    pub jwks_file: Option<PathBuf>,
}
