//! Operator-facing environment contract
//!
//! Secrets and switches arrive as environment variables. They are read once
//! into [`GatewayEnv`] and projected into the gateway config and process
//! environment by the supervisor.

use std::collections::HashMap;

pub const GATEWAY_TOKEN: &str = "GATEWAY_TOKEN";
pub const DEV_MODE: &str = "DEV_MODE";
pub const DEBUG_ROUTES: &str = "DEBUG_ROUTES";
pub const SLEEP_AFTER: &str = "SLEEP_AFTER";

pub const NATIVE_ACCOUNT_ID: &str = "CF_AI_GATEWAY_ACCOUNT_ID";
pub const NATIVE_GATEWAY_ID: &str = "CF_AI_GATEWAY_GATEWAY_ID";
pub const NATIVE_API_KEY: &str = "CLOUDFLARE_AI_GATEWAY_API_KEY";
pub const NATIVE_MODEL: &str = "CF_AI_GATEWAY_MODEL";
pub const LEGACY_BASE_URL: &str = "AI_GATEWAY_BASE_URL";
pub const LEGACY_API_KEY: &str = "AI_GATEWAY_API_KEY";
pub const ANTHROPIC_API_KEY: &str = "ANTHROPIC_API_KEY";
pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";

pub const TELEGRAM_BOT_TOKEN: &str = "TELEGRAM_BOT_TOKEN";
pub const TELEGRAM_DM_POLICY: &str = "TELEGRAM_DM_POLICY";
pub const DISCORD_BOT_TOKEN: &str = "DISCORD_BOT_TOKEN";
pub const DISCORD_DM_POLICY: &str = "DISCORD_DM_POLICY";
pub const SLACK_BOT_TOKEN: &str = "SLACK_BOT_TOKEN";
pub const SLACK_APP_TOKEN: &str = "SLACK_APP_TOKEN";

/// Every variable the proxy understands, in display order
pub const KNOWN_VARS: &[&str] = &[
    GATEWAY_TOKEN,
    DEV_MODE,
    DEBUG_ROUTES,
    SLEEP_AFTER,
    NATIVE_ACCOUNT_ID,
    NATIVE_GATEWAY_ID,
    NATIVE_API_KEY,
    NATIVE_MODEL,
    LEGACY_BASE_URL,
    LEGACY_API_KEY,
    ANTHROPIC_API_KEY,
    OPENAI_API_KEY,
    TELEGRAM_BOT_TOKEN,
    TELEGRAM_DM_POLICY,
    DISCORD_BOT_TOKEN,
    DISCORD_DM_POLICY,
    SLACK_BOT_TOKEN,
    SLACK_APP_TOKEN,
];

/// Credentials forwarded into the gateway process environment when set
const PASSTHROUGH_VARS: &[&str] = &[
    ANTHROPIC_API_KEY,
    OPENAI_API_KEY,
    NATIVE_API_KEY,
    LEGACY_API_KEY,
    TELEGRAM_BOT_TOKEN,
    DISCORD_BOT_TOKEN,
    SLACK_BOT_TOKEN,
    SLACK_APP_TOKEN,
];

/// Snapshot of the operator environment
#[derive(Debug, Clone, Default)]
pub struct GatewayEnv {
    vars: HashMap<String, String>,
}

impl GatewayEnv {
    /// Read the process environment
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Build from explicit pairs; empty values count as unset
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(_, v)| !v.trim().is_empty())
            .collect();
        Self { vars }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    fn flag(&self, name: &str) -> bool {
        self.get(name)
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false)
    }

    pub fn gateway_token(&self) -> Option<&str> {
        self.get(GATEWAY_TOKEN)
    }

    /// Relaxes auth: skips access verification and the required-settings check
    pub fn dev_mode(&self) -> bool {
        self.flag(DEV_MODE)
    }

    pub fn debug_routes(&self) -> bool {
        self.flag(DEBUG_ROUTES)
    }

    pub fn sleep_after(&self) -> Option<&str> {
        self.get(SLEEP_AFTER)
    }

    /// Names from `required` that are unset, in the given order
    pub fn missing<'a>(&self, required: &'a [String]) -> Vec<&'a str> {
        required
            .iter()
            .map(String::as_str)
            .filter(|name| !self.is_set(name))
            .collect()
    }

    /// True when any model-provider credential is present
    pub fn has_provider_credential(&self) -> bool {
        [NATIVE_API_KEY, LEGACY_API_KEY, ANTHROPIC_API_KEY, OPENAI_API_KEY]
            .iter()
            .any(|name| self.is_set(name))
    }

    /// Variables handed to the gateway process
    pub fn container_env(&self) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = PASSTHROUGH_VARS
            .iter()
            .filter_map(|name| self.get(name).map(|v| (name.to_string(), v.to_string())))
            .collect();
        if let Some(token) = self.gateway_token() {
            env.insert(GATEWAY_TOKEN.to_string(), token.to_string());
        }
        if let Some(base_url) = self.get(LEGACY_BASE_URL) {
            env.insert(LEGACY_BASE_URL.to_string(), base_url.to_string());
        }
        if self.dev_mode() {
            env.insert(DEV_MODE.to_string(), "true".to_string());
        }
        env
    }

    /// Which known variables are set, never their values
    pub fn presence(&self) -> Vec<(&'static str, bool)> {
        KNOWN_VARS.iter().map(|name| (*name, self.is_set(name))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_values_are_unset() {
        let env = GatewayEnv::from_vars([(GATEWAY_TOKEN, ""), (ANTHROPIC_API_KEY, "  ")]);
        assert!(env.gateway_token().is_none());
        assert!(!env.has_provider_credential());
    }

    #[test]
    fn test_flags() {
        let env = GatewayEnv::from_vars([(DEV_MODE, "true"), (DEBUG_ROUTES, "1")]);
        assert!(env.dev_mode());
        assert!(env.debug_routes());

        let env = GatewayEnv::from_vars([(DEV_MODE, "yes")]);
        assert!(!env.dev_mode());
    }

    #[test]
    fn test_missing_keeps_required_order() {
        let env = GatewayEnv::from_vars([(OPENAI_API_KEY, "sk-test")]);
        let required = vec![GATEWAY_TOKEN.to_string(), OPENAI_API_KEY.to_string(), "ACCESS_AUD".to_string()];
        assert_eq!(env.missing(&required), vec![GATEWAY_TOKEN, "ACCESS_AUD"]);
    }

    #[test]
    fn test_provider_credential_detection() {
        assert!(GatewayEnv::from_vars([(NATIVE_API_KEY, "k")]).has_provider_credential());
        assert!(GatewayEnv::from_vars([(LEGACY_API_KEY, "k")]).has_provider_credential());
        assert!(GatewayEnv::from_vars([(ANTHROPIC_API_KEY, "k")]).has_provider_credential());
        assert!(!GatewayEnv::from_vars([(GATEWAY_TOKEN, "t")]).has_provider_credential());
    }

    #[test]
    fn test_container_env_passes_credentials_only() {
        let env = GatewayEnv::from_vars([
            (GATEWAY_TOKEN, "tok"),
            (ANTHROPIC_API_KEY, "sk-ant"),
            (DEBUG_ROUTES, "true"),
            ("UNRELATED", "x"),
        ]);
        let container = env.container_env();
        assert_eq!(container.get(GATEWAY_TOKEN).map(String::as_str), Some("tok"));
        assert_eq!(container.get(ANTHROPIC_API_KEY).map(String::as_str), Some("sk-ant"));
        assert!(!container.contains_key(DEBUG_ROUTES));
        assert!(!container.contains_key("UNRELATED"));
    }

    #[test]
    fn test_presence_reports_without_values() {
        let env = GatewayEnv::from_vars([(SLACK_BOT_TOKEN, "xoxb-secret")]);
        let presence = env.presence();
        assert!(presence.contains(&(SLACK_BOT_TOKEN, true)));
        assert!(presence.contains(&(SLACK_APP_TOKEN, false)));
        assert_eq!(presence.len(), KNOWN_VARS.len());
    }
}
