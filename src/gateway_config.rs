//! Environment-to-config projection for the gateway's JSON document
//!
//! The document is owned by the gateway and its users; the projection only
//! overwrites the fields listed here and leaves everything else in place.

use crate::config::GatewaySettings;
use crate::env::{self, GatewayEnv};
use serde_json::{json, Map, Value};
use std::io::Write;
use std::path::Path;
use tracing::{debug, info, warn};

/// Host of the natively routed model gateway
const NATIVE_GATEWAY_HOST: &str = "https://gateway.ai.cloudflare.com/v1";

/// Prefix of provider entries created for the native gateway
const NATIVE_ENTRY_PREFIX: &str = "cf-ai-gw-";

/// Entries configured through the legacy base-URL variables or direct keys
const LEGACY_ENTRIES: &[&str] = &["anthropic", "openai"];

const DEFAULT_NATIVE_MODEL: &str = "anthropic/claude-sonnet-4-5";
const ANTHROPIC_PRIMARY: &str = "anthropic/claude-opus-4-5";
const OPENAI_PRIMARY: &str = "openai/gpt-5.2";

/// Used when no credential at all is configured
const BUILTIN_PRIMARY: &str = "anthropic/claude-opus-4-5";

const MODEL_CONTEXT_WINDOW: u64 = 131_072;
const MODEL_MAX_TOKENS: u64 = 8192;

const REDACTED: &str = "***";

/// Which model provider the environment selects, strongest first
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderSelection {
    /// Routed through the native account gateway
    Native {
        provider: String,
        model: String,
        base_url: String,
        api_key: String,
    },
    /// A base URL pointing at an anthropic- or openai-compatible endpoint
    Legacy {
        entry: &'static str,
        base_url: String,
        api_key: String,
    },
    /// A provider key with the provider's own endpoint
    Direct { primary: &'static str },
    /// No credential; the gateway's built-in default
    BuiltIn,
}

impl ProviderSelection {
    pub fn from_env(env: &GatewayEnv) -> Self {
        if let (Some(account), Some(gateway), Some(api_key)) = (
            env.get(env::NATIVE_ACCOUNT_ID),
            env.get(env::NATIVE_GATEWAY_ID),
            env.get(env::NATIVE_API_KEY),
        ) {
            let model_ref = env.get(env::NATIVE_MODEL).unwrap_or(DEFAULT_NATIVE_MODEL);
            let (provider, model) = match model_ref.split_once('/') {
                Some((provider, model)) if !provider.is_empty() && !model.is_empty() => {
                    (provider.to_string(), model.to_string())
                }
                _ => {
                    warn!(value = %model_ref, "Model reference is not provider/model, using default");
                    let (provider, model) = DEFAULT_NATIVE_MODEL
                        .split_once('/')
                        .unwrap_or(("anthropic", DEFAULT_NATIVE_MODEL));
                    (provider.to_string(), model.to_string())
                }
            };
            let mut base_url = format!("{}/{}/{}/{}", NATIVE_GATEWAY_HOST, account, gateway, provider);
            if provider == "workers-ai" {
                base_url.push_str("/v1");
            }
            return ProviderSelection::Native {
                provider,
                model,
                base_url,
                api_key: api_key.to_string(),
            };
        }

        if let Some(base_url) = env.get(env::LEGACY_BASE_URL) {
            let base_url = base_url.trim_end_matches('/').to_string();
            let (entry, provider_key) = if base_url.ends_with("/openai") {
                ("openai", env::OPENAI_API_KEY)
            } else {
                ("anthropic", env::ANTHROPIC_API_KEY)
            };
            let api_key = env.get(env::LEGACY_API_KEY).or_else(|| env.get(provider_key));
            if let Some(api_key) = api_key {
                return ProviderSelection::Legacy {
                    entry,
                    base_url,
                    api_key: api_key.to_string(),
                };
            }
            warn!("Legacy base URL set without an API key, ignoring it");
        }

        if env.is_set(env::ANTHROPIC_API_KEY) {
            return ProviderSelection::Direct {
                primary: ANTHROPIC_PRIMARY,
            };
        }
        if env.is_set(env::OPENAI_API_KEY) {
            return ProviderSelection::Direct {
                primary: OPENAI_PRIMARY,
            };
        }

        ProviderSelection::BuiltIn
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProviderSelection::Native { .. } => "native",
            ProviderSelection::Legacy { .. } => "legacy",
            ProviderSelection::Direct { .. } => "direct",
            ProviderSelection::BuiltIn => "builtin",
        }
    }
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}

/// Walk (and create) nested objects, replacing anything that is not one
fn object_at<'a>(root: &'a mut Value, path: &[&str]) -> &'a mut Map<String, Value> {
    let mut map = ensure_object(root);
    for key in path {
        let child = map
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        map = ensure_object(child);
    }
    map
}

fn model_entry(id: &str) -> Value {
    json!({
        "id": id,
        "name": id,
        "contextWindow": MODEL_CONTEXT_WINDOW,
        "maxTokens": MODEL_MAX_TOKENS,
    })
}

fn primary_is_set(doc: &mut Value) -> bool {
    object_at(doc, &["agents", "defaults", "model"])
        .get("primary")
        .and_then(Value::as_str)
        .map_or(false, |s| !s.is_empty())
}

fn set_primary(doc: &mut Value, primary: &str) {
    object_at(doc, &["agents", "defaults", "model"])
        .insert("primary".to_string(), Value::String(primary.to_string()));
}

fn apply_provider(doc: &mut Value, selection: &ProviderSelection) {
    match selection {
        ProviderSelection::Native {
            provider,
            model,
            base_url,
            api_key,
        } => {
            let name = format!("{}{}", NATIVE_ENTRY_PREFIX, provider);
            let api = if provider == "anthropic" {
                "anthropic-messages"
            } else {
                "openai-completions"
            };
            let providers = object_at(doc, &["models", "providers"]);
            providers.retain(|key, _| {
                !LEGACY_ENTRIES.contains(&key.as_str()) && !key.starts_with(NATIVE_ENTRY_PREFIX)
            });
            providers.insert(
                name.clone(),
                json!({
                    "baseUrl": base_url,
                    "apiKey": api_key,
                    "api": api,
                    "models": [model_entry(model)],
                }),
            );
            set_primary(doc, &format!("{}/{}", name, model));
        }
        ProviderSelection::Legacy {
            entry,
            base_url,
            api_key,
        } => {
            let (api, primary) = if *entry == "openai" {
                ("openai-responses", OPENAI_PRIMARY)
            } else {
                ("anthropic-messages", ANTHROPIC_PRIMARY)
            };
            let model = primary.split_once('/').map_or(primary, |(_, m)| m);
            object_at(doc, &["models", "providers"]).insert(
                entry.to_string(),
                json!({
                    "baseUrl": base_url,
                    "apiKey": api_key,
                    "api": api,
                    "models": [model_entry(model)],
                }),
            );
            set_primary(doc, primary);
        }
        ProviderSelection::Direct { primary } => set_primary(doc, primary),
        ProviderSelection::BuiltIn => {
            if !primary_is_set(doc) {
                set_primary(doc, BUILTIN_PRIMARY);
            }
        }
    }
}

fn apply_channels(doc: &mut Value, env: &GatewayEnv) {
    if let Some(token) = env.get(env::TELEGRAM_BOT_TOKEN) {
        let telegram = object_at(doc, &["channels", "telegram"]);
        telegram.insert("botToken".to_string(), json!(token));
        telegram.insert("enabled".to_string(), json!(true));
        let policy = env.get(env::TELEGRAM_DM_POLICY).unwrap_or("pairing");
        telegram.insert("dmPolicy".to_string(), json!(policy));
    }

    if let Some(token) = env.get(env::DISCORD_BOT_TOKEN) {
        let discord = object_at(doc, &["channels", "discord"]);
        discord.insert("token".to_string(), json!(token));
        discord.insert("enabled".to_string(), json!(true));
        let policy = env.get(env::DISCORD_DM_POLICY).unwrap_or("pairing");
        object_at(doc, &["channels", "discord", "dm"]).insert("policy".to_string(), json!(policy));
    }

    if let Some(bot_token) = env.get(env::SLACK_BOT_TOKEN) {
        let slack = object_at(doc, &["channels", "slack"]);
        slack.insert("botToken".to_string(), json!(bot_token));
        if let Some(app_token) = env.get(env::SLACK_APP_TOKEN) {
            slack.insert("appToken".to_string(), json!(app_token));
        }
        slack.insert("enabled".to_string(), json!(true));
    }
}

/// Overlay the environment onto an existing document. Idempotent.
pub fn project(doc: &mut Value, settings: &GatewaySettings, env: &GatewayEnv) {
    let gateway = object_at(doc, &["gateway"]);
    gateway.insert("port".to_string(), json!(settings.port));
    gateway.insert("mode".to_string(), json!("local"));
    gateway.insert("bind".to_string(), json!(settings.bind_mode));
    gateway.insert("trustedProxies".to_string(), json!(settings.trusted_proxies));

    if let Some(token) = env.gateway_token() {
        object_at(doc, &["gateway", "auth"]).insert("token".to_string(), json!(token));
    }
    if env.dev_mode() {
        object_at(doc, &["gateway", "controlUi"])
            .insert("allowInsecureAuth".to_string(), json!(true));
    }

    object_at(doc, &["agents", "defaults"]).insert(
        "workspace".to_string(),
        json!(settings.workspace_dir.to_string_lossy()),
    );

    apply_channels(doc, env);
    apply_provider(doc, &ProviderSelection::from_env(env));
}

fn parse_document(raw: &str, source: &Path) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) if value.is_object() => value,
        Ok(_) => {
            warn!(path = %source.display(), "Gateway config is not a JSON object, starting from empty");
            Value::Object(Map::new())
        }
        Err(e) => {
            warn!(path = %source.display(), error = %e, "Gateway config is malformed, starting from empty");
            Value::Object(Map::new())
        }
    }
}

/// Current document: the local file, else the template, else `{}`
pub fn load(settings: &GatewaySettings) -> Value {
    let path = settings.config_path();
    match std::fs::read_to_string(&path) {
        Ok(raw) => return parse_document(&raw, &path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read gateway config, starting from empty");
            return Value::Object(Map::new());
        }
    }

    if let Some(template) = &settings.template {
        match std::fs::read_to_string(template) {
            Ok(raw) => {
                debug!(template = %template.display(), "Seeding gateway config from template");
                return parse_document(&raw, template);
            }
            Err(e) => {
                warn!(template = %template.display(), error = %e, "Failed to read config template");
            }
        }
    }

    Value::Object(Map::new())
}

/// Write `doc` to `path` through a temp file in the same directory
pub fn write_atomic(path: &Path, doc: &Value) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Config path '{}' has no parent directory", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, doc)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| anyhow::anyhow!("Failed to persist '{}': {}", path.display(), e.error))?;
    Ok(())
}

/// Load, project and persist the gateway config
pub fn materialize(settings: &GatewaySettings, env: &GatewayEnv) -> anyhow::Result<Value> {
    let mut doc = load(settings);
    project(&mut doc, settings, env);
    let path = settings.config_path();
    write_atomic(&path, &doc)?;
    info!(
        path = %path.display(),
        provider = ProviderSelection::from_env(env).label(),
        "Gateway config materialized"
    );
    Ok(doc)
}

fn is_secret_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.contains("token") || key.contains("apikey") || key.contains("secret") || key == "password"
}

/// Copy of `doc` with every credential-looking string masked
pub fn redact(doc: &Value) -> Value {
    match doc {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let v = if is_secret_key(k) && v.is_string() {
                        json!(REDACTED)
                    } else {
                        redact(v)
                    };
                    (k.clone(), v)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}
