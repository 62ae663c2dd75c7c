/*
 * Jiralink - Teams/Jira conversational bridge
 * Copyright (C) 2025–2026 Jiralink contributors
 *
 * This program is free software: you can redistribute it
 * and/or modify it under the terms of the GNU Affero
 * General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your
 * option) any later version.
 *
 * This program is distributed in the hope that it will be
 * useful, but WITHOUT ANY WARRANTY; without even the
 * implied warranty of MERCHANTABILITY or FITNESS FOR A
 * PARTICULAR PURPOSE. See the GNU Affero General Public
 * License for more details.
 *
 * You should have received a copy of the GNU Affero General
 * Public License along with this program. If not, see
 * <https://www.gnu.org/licenses/>.
 */

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use serde::Deserialize;

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub jiralink: JiralinkConfig,
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub teams: TeamsConfig,
    #[serde(default)]
    pub jira: JiraConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub mail: MailConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub tls: TlsConfig,
}

#[derive(Deserialize, Clone, Debug)]
pub struct JiralinkConfig {
    pub env: String,
    pub version: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password_env: String,
    #[serde(default = "default_pg_min")]
    pub min_connections: u32,
    #[serde(default = "default_pg_max")]
    pub max_connections: u32,
}

fn default_pg_min() -> u32 {
    2
}
fn default_pg_max() -> u32 {
    10
}

#[derive(Deserialize, Clone, Debug)]
pub struct ServerConfig {
    #[serde(default = "default_server_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_server_port(),
            cors_origins: Vec::new(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

fn default_server_port() -> u16 {
    3978
}

fn default_body_limit() -> usize {
    1_048_576
}

#[derive(Deserialize, Clone, Debug)]
pub struct TeamsConfig {
    /// Base64-encoded HMAC shared secret for outgoing-webhook verification.
    /// When unset, inbound activities are accepted without a signature check.
    #[serde(default)]
    pub shared_secret: Option<String>,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default = "default_welcome_text")]
    pub welcome_text: String,
}

impl Default for TeamsConfig {
    fn default() -> Self {
        Self {
            shared_secret: None,
            app_id: None,
            welcome_text: default_welcome_text(),
        }
    }
}

fn default_welcome_text() -> String {
    "Hi! I can look up, create and comment on Jira issues for you. Type 'help' to see what I understand.".to_string()
}

#[derive(Deserialize, Clone, Debug)]
pub struct JiraConfig {
    #[serde(default = "default_jira_timeout")]
    pub request_timeout_secs: u64,
    /// Site suggested on the connect card when the user has no connection yet.
    #[serde(default)]
    pub default_site_url: Option<String>,
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    #[serde(default = "default_breaker_recovery")]
    pub breaker_recovery_secs: u64,
}

impl Default for JiraConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_jira_timeout(),
            default_site_url: None,
            breaker_threshold: default_breaker_threshold(),
            breaker_recovery_secs: default_breaker_recovery(),
        }
    }
}

fn default_jira_timeout() -> u64 {
    30
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_recovery() -> u64 {
    30
}

#[derive(Deserialize, Clone, Debug)]
pub struct BridgeConfig {
    /// Seconds to wait for the add-on's callback before reporting "not responding".
    #[serde(default = "default_bridge_timeout")]
    pub response_timeout_secs: u64,
    #[serde(default = "default_bridge_api_key_name")]
    pub api_key_name: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            response_timeout_secs: default_bridge_timeout(),
            api_key_name: default_bridge_api_key_name(),
        }
    }
}

fn default_bridge_timeout() -> u64 {
    25
}

fn default_bridge_api_key_name() -> String {
    "JIRALINK_ADDON_API_KEY".to_string()
}

#[derive(Deserialize, Clone, Debug)]
pub struct RoutingConfig {
    /// Floor below which a literal-text match is rejected.
    #[serde(default = "default_match_threshold")]
    pub default_threshold: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_threshold: default_match_threshold(),
        }
    }
}

fn default_match_threshold() -> f64 {
    0.5
}

#[derive(Deserialize, Clone, Debug)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    60
}

#[derive(Deserialize, Clone, Debug)]
pub struct MailConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_sendgrid_key_name")]
    pub api_key_env: String,
    #[serde(default)]
    pub from_address: String,
    #[serde(default)]
    pub support_inbox: String,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key_env: default_sendgrid_key_name(),
            from_address: String::new(),
            support_inbox: String::new(),
        }
    }
}

fn default_sendgrid_key_name() -> String {
    "SENDGRID_API_KEY".to_string()
}

#[derive(Deserialize, Clone, Debug)]
pub struct GraphConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default = "default_graph_secret_name")]
    pub client_secret_env: String,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tenant_id: String::new(),
            client_id: String::new(),
            client_secret_env: default_graph_secret_name(),
        }
    }
}

fn default_graph_secret_name() -> String {
    "GRAPH_CLIENT_SECRET".to_string()
}

#[derive(Deserialize, Clone, Debug)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: default_otlp_endpoint(),
            sample_rate: default_sample_rate(),
        }
    }
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_sample_rate() -> f64 {
    1.0
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub cert_path: Option<String>,
    #[serde(default)]
    pub key_path: Option<String>,
}

impl Config {
    /// Load configuration from the file path named by the `JIRALINK_CONFIG`
    /// env var (default `config.toml`), with `JIRALINK_*` environment
    /// variable overrides.
    ///
    /// # Errors
    ///
    /// Returns `config::ConfigError` if the config file is missing,
    /// malformed, or required fields are absent.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("JIRALINK_CONFIG").unwrap_or_else(|_| "config.toml".to_string());

        let settings = config::Config::builder()
            .add_source(config::File::with_name(&config_path))
            .add_source(
                config::Environment::with_prefix("JIRALINK")
                    .separator("_")
                    .try_parsing(true),
            )
            .build()?;

        settings.try_deserialize()
    }
}
