use anyhow::Context;
use serde::Serialize;
use warden_auth::{JwkSet, KeySetSource, StaticKeySource, TokenVerifier, VerificationResult, bearer_token};

use crate::bootstrap;
use crate::cli::{GlobalFlags, VerifyArgs};
use crate::output::output;

#[derive(Debug, Serialize, Default, PartialEq, Eq)]
struct VerifyResponse {
    valid: bool,
    sub: Option<String>,
    scopes: Vec<String>,
    expires_at: Option<String>,
    reason: Option<String>,
}

pub async fn handle(
    args: &VerifyArgs,
    flags: &GlobalFlags,
    config: &warden_config::WardenConfig,
) -> anyhow::Result<()> {
    let issuer = bootstrap::issuer(config.require_provider()?);
    let audience = match &args.audience {
        Some(audience) => audience.clone(),
        None => config.require_verifier()?.audience.clone(),
    };
    let token = bearer_token(&args.token).unwrap_or_else(|| args.token.trim());

    let response = if let Some(path) = &args.jwks_file {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let set: JwkSet = serde_json::from_str(&raw)
            .with_context(|| format!("{} is not a JWKS document", path.display()))?;
        let verifier = bootstrap::verifier(StaticKeySource::new(set), config);
        check(&verifier, token, &issuer, &audience).await
    } else {
        let verifier = bootstrap::http_verifier(config)?;
        check(&verifier, token, &issuer, &audience).await
    };

    output(&response, flags.format)
}

async fn check<S: KeySetSource>(
    verifier: &TokenVerifier<S>,
    token: &str,
    issuer: &str,
    audience: &str,
) -> VerifyResponse {
    match verifier.verify(token, issuer, audience).await {
        VerificationResult::Valid(claims) => VerifyResponse {
            valid: true,
            sub: claims.sub.clone(),
            scopes: claims.scopes().into_iter().map(str::to_string).collect(),
            expires_at: claims.expires_at().map(|at| at.to_rfc3339()),
            reason: None,
        },
        VerificationResult::Rejected(reason) => VerifyResponse {
            reason: Some(reason.to_string()),
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use warden_auth::KeySetCache;
    use warden_auth::testutil::{self, AUDIENCE, ISSUER};

    use super::*;

    fn verifier() -> TokenVerifier<StaticKeySource> {
        let source = StaticKeySource::new(testutil::primary_key_set());
        TokenVerifier::new(Arc::new(KeySetCache::new(source)))
    }

    #[tokio::test]
    async fn valid_token_reports_claims() {
        let token = testutil::sign_primary(&testutil::claims(300));
        let response = check(&verifier(), &token, ISSUER, AUDIENCE).await;

        assert!(response.valid);
        assert_eq!(response.sub.as_deref(), Some(testutil::SUBJECT));
        assert_eq!(response.scopes, vec!["openid", "profile", "email"]);
        assert!(response.expires_at.is_some());
        assert_eq!(response.reason, None);
    }

    #[tokio::test]
    async fn wrong_audience_reports_reason_only() {
        let token = testutil::sign_primary(&testutil::claims(300));
        let response = check(&verifier(), &token, ISSUER, "OtherAPI").await;

        assert!(!response.valid);
        assert_eq!(response.sub, None);
        assert!(response.reason.is_some());
    }
}
