use std::{fs, time::Duration};

use shared::domain::Role;
use tracing::warn;

use crate::backoff::BackoffPolicy;

pub const SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub realtime_endpoint: String,
    pub api_base_url: String,
    pub auth_token: Option<String>,
    pub role: Option<Role>,
    pub connect_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub max_reconnect_attempts: u32,
    pub page_size: u32,
    pub call_decision_window: Duration,
    pub typing_debounce: Duration,
    pub typing_expiry: Duration,
    pub presence_expiry: Duration,
    pub chat_list_ttl: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            realtime_endpoint: "http://127.0.0.1:8443".into(),
            api_base_url: "http://127.0.0.1:8443/api".into(),
            auth_token: None,
            role: None,
            connect_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            max_reconnect_attempts: 8,
            page_size: 50,
            call_decision_window: Duration::from_secs(20),
            typing_debounce: Duration::from_millis(300),
            typing_expiry: Duration::from_secs(5),
            presence_expiry: Duration::from_secs(120),
            chat_list_ttl: Duration::from_secs(60),
        }
    }
}

impl ClientSettings {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: self.backoff_base,
            max_delay: self.backoff_max,
            max_attempts: self.max_reconnect_attempts,
            jitter: 0.2,
        }
    }

    fn apply(&mut self, key: &str, value: &str) {
        let value = value.trim();
        match key {
            "realtime_endpoint" => self.realtime_endpoint = value.to_string(),
            "api_base_url" => self.api_base_url = value.to_string(),
            "auth_token" => {
                self.auth_token = (!value.is_empty()).then(|| value.to_string());
            }
            "role" => match value.parse::<Role>() {
                Ok(role) => self.role = Some(role),
                Err(err) => warn!(%err, "config: ignoring role"),
            },
            "connect_timeout_ms" => set_millis(&mut self.connect_timeout, key, value),
            "backoff_base_ms" => set_millis(&mut self.backoff_base, key, value),
            "backoff_max_ms" => set_millis(&mut self.backoff_max, key, value),
            "max_reconnect_attempts" => set_number(&mut self.max_reconnect_attempts, key, value),
            "page_size" => set_number(&mut self.page_size, key, value),
            "call_decision_window_ms" => set_millis(&mut self.call_decision_window, key, value),
            "typing_debounce_ms" => set_millis(&mut self.typing_debounce, key, value),
            "typing_expiry_ms" => set_millis(&mut self.typing_expiry, key, value),
            "presence_expiry_ms" => set_millis(&mut self.presence_expiry, key, value),
            "chat_list_ttl_ms" => set_millis(&mut self.chat_list_ttl, key, value),
            _ => warn!(key, "config: unknown setting"),
        }
    }
}

const KEYS: &[&str] = &[
    "realtime_endpoint",
    "api_base_url",
    "auth_token",
    "role",
    "connect_timeout_ms",
    "backoff_base_ms",
    "backoff_max_ms",
    "max_reconnect_attempts",
    "page_size",
    "call_decision_window_ms",
    "typing_debounce_ms",
    "typing_expiry_ms",
    "presence_expiry_ms",
    "chat_list_ttl_ms",
];

fn set_millis(target: &mut Duration, key: &str, value: &str) {
    match value.parse::<u64>() {
        Ok(ms) => *target = Duration::from_millis(ms),
        Err(_) => warn!(key, value, "config: expected milliseconds"),
    }
}

fn set_number(target: &mut u32, key: &str, value: &str) {
    match value.parse::<u32>() {
        Ok(parsed) if parsed > 0 => *target = parsed,
        _ => warn!(key, value, "config: expected a positive integer"),
    }
}

/// Defaults, then `client.toml` in the working directory, then the environment.
pub fn load_settings() -> ClientSettings {
    let raw = fs::read_to_string(SETTINGS_FILE).ok();
    load_settings_from(raw.as_deref(), |name| std::env::var(name).ok())
}

pub fn load_settings_from(
    file_contents: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Some(raw) = file_contents {
        match raw.parse::<toml::Table>() {
            Ok(table) => {
                for (key, value) in table {
                    let value = match value {
                        toml::Value::String(text) => text,
                        other => other.to_string(),
                    };
                    settings.apply(&key, &value);
                }
            }
            Err(err) => warn!(%err, file = SETTINGS_FILE, "config: failed to parse settings file"),
        }
    }

    if let Some(v) = env("REALTIME_ENDPOINT") {
        settings.apply("realtime_endpoint", &v);
    }
    if let Some(v) = env("API_BASE_URL") {
        settings.apply("api_base_url", &v);
    }

    for key in KEYS {
        if let Some(v) = env(&format!("APP__{}", key.to_ascii_uppercase())) {
            settings.apply(key, &v);
        }
    }

    settings
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
