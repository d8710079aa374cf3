use figment::Jail;
use pretty_assertions::assert_eq;
use warden_config::WardenConfig;

#[test]
fn env_fills_nested_fields() {
    Jail::expect_with(|jail| {
        jail.set_env("WARDEN_PROVIDER__DOMAIN", "klee-test.au.auth0.com");
        jail.set_env("WARDEN_CLIENT__CLIENT_ID", "warden-cli");
        jail.set_env("WARDEN_CLIENT__REDIRECT_PORT", "4000");
        jail.set_env("WARDEN_JWKS__SERVE_STALE", "false");

        let config = WardenConfig::load().expect("config loads");
        assert_eq!(config.provider.domain, "klee-test.au.auth0.com");
        assert_eq!(config.client.client_id, "warden-cli");
        assert_eq!(config.client.redirect_port, Some(4000));
        assert!(!config.jwks.serve_stale);
        Ok(())
    });
}

#[test]
fn env_beats_project_file() {
    Jail::expect_with(|jail| {
        jail.create_dir(".warden")?;
        jail.create_file(
            ".warden/config.toml",
            r#"
            [verifier]
            audience = "FromFile"
            leeway_secs = 5
            "#,
        )?;
        jail.set_env("WARDEN_VERIFIER__AUDIENCE", "TheSweetestAPI");

        let config = WardenConfig::load().expect("config loads");
        assert_eq!(config.verifier.audience, "TheSweetestAPI");
        assert_eq!(config.verifier.leeway_secs, 5);
        Ok(())
    });
}

#[test]
fn unrelated_warden_variables_are_ignored() {
    Jail::expect_with(|jail| {
        jail.set_env("WARDEN_LOG", "debug");
        jail.set_env("WARDEN_AUTH__REFRESH_TOKEN", "rt-from-env");

        let config = WardenConfig::load().expect("config loads");
        assert_eq!(config, WardenConfig::default());
        Ok(())
    });
}
