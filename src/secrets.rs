use anyhow::{Context, Result};
use keyring::Entry;
use tracing::debug;

const KEYRING_SERVICE: &str = "rift-coach";

/// Looks a secret up with environment-first precedence, then the per-user
/// OS key store.
fn lookup(env_key: &str, keyring_user: &str) -> Option<String> {
    if let Some(value) = std::env::var(env_key)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
    {
        debug!(env_key, "secret resolved from environment");
        return Some(value);
    }
    Entry::new(KEYRING_SERVICE, keyring_user)
        .ok()
        .and_then(|entry| entry.get_password().ok())
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

pub fn riot_api_key() -> Result<String> {
    lookup("RIOT_API_KEY", "riot_api_key")
        .context("no riot api key in environment or key store")
}

pub fn anthropic_api_key() -> Option<String> {
    lookup("ANTHROPIC_API_KEY", "anthropic_api_key")
}

pub fn region(default: &str) -> String {
    lookup("RIOT_REGION", "riot_region").unwrap_or_else(|| default.to_owned())
}

pub fn routing(default: &str) -> String {
    lookup("RIOT_ROUTING", "riot_routing").unwrap_or_else(|| default.to_owned())
}

#[cfg(test)]
mod tests {
    use super::lookup;

    #[test]
    fn environment_wins_over_key_store() {
        std::env::set_var("RIFT_COACH_TEST_SECRET", "  from-env  ");
        let value = lookup("RIFT_COACH_TEST_SECRET", "nonexistent_test_user");
        assert_eq!(value.as_deref(), Some("from-env"));
        std::env::remove_var("RIFT_COACH_TEST_SECRET");
    }

    #[test]
    fn empty_environment_value_is_ignored() {
        std::env::set_var("RIFT_COACH_TEST_EMPTY", "   ");
        // Falls through to the key store, which has no such user.
        let value = lookup("RIFT_COACH_TEST_EMPTY", "nonexistent_test_user");
        assert!(value.is_none());
        std::env::remove_var("RIFT_COACH_TEST_EMPTY");
    }
}
