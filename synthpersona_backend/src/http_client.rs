use anyhow::{Context, Result};
use std::time::Duration;

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|value| {
            value == "1" || value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes")
        })
        .unwrap_or(false)
}

/// HTTP client for provider calls. System proxy discovery is opt-in via
/// `SYNTHPERSONA_ENABLE_SYSTEM_PROXY`; certificate checks can be disabled with
/// `LLM_INSECURE_SKIP_VERIFY` for self-signed gateways.
pub fn build_http_client_with_timeout(timeout: Option<Duration>) -> Result<reqwest::Client> {
    let insecure = env_flag("LLM_INSECURE_SKIP_VERIFY");
    if insecure {
        tracing::warn!("LLM_INSECURE_SKIP_VERIFY is set; TLS certificates will not be verified");
    }

    if env_flag("SYNTHPERSONA_ENABLE_SYSTEM_PROXY") {
        match attempt_build(timeout, false, insecure) {
            Ok(client) => return Ok(client),
            Err(e) => tracing::warn!(
                "HTTP client initialization with system proxy discovery failed ({}); retrying with no_proxy",
                e
            ),
        }
    }

    attempt_build(timeout, true, insecure).context("Failed to initialize HTTP client")
}

fn attempt_build(
    timeout: Option<Duration>,
    no_proxy: bool,
    insecure: bool,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    if no_proxy {
        builder = builder.no_proxy();
    }
    if insecure {
        builder = builder.danger_accept_invalid_certs(true);
    }
    builder.build()
}
