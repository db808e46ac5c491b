use base64::Engine;
use std::time::Duration;
use ureq::Agent;

/// Timeout for every health check, metadata push and notification.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

pub fn agent(timeout: Duration) -> Agent {
    let config = Agent::config_builder()
        .timeout_global(Some(timeout))
        .build();
    config.into()
}

/// `Authorization` header value for HTTP Basic auth.
pub fn basic_auth(username: &str, password: &str) -> String {
    let token = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", username, password));
    format!("Basic {}", token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_auth_encodes_credentials() {
        assert_eq!(basic_auth("source", "hackme"), "Basic c291cmNlOmhhY2ttZQ==");
    }
}
