//! # Configuration Management
//!
//! Loads the relay's configuration from, in priority order (highest first):
//! 1. Platform variables: `HOST`, `PORT`, `DEEPGRAM_API_KEY`
//! 2. Environment variables prefixed with `APP__` (`APP__AGENT__URL`, `APP__SESSION__GREETING`, ...)
//! 3. An optional `config.toml` in the working directory
//! 4. The defaults in `AppConfig::default()`
//!
//! The double-underscore separator keeps field names such as `connect_timeout_ms` intact.
//!
//! ## Sections:
//! - **server**: where the HTTP/WebSocket listener binds
//! - **agent**: how to reach the voice-agent WebSocket
//! - **audio**: wire format on both legs and the uplink block size
//! - **session**: per-call behaviour, including the agent persona sent in the `Settings` message
//! - **performance**: call limits and queue sizing

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

pub const DEFAULT_AGENT_URL: &str = "wss://agent.deepgram.com/v1/agent/converse";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub agent: AgentConfig,
    pub audio: AudioConfig,
    pub session: SessionConfig,
    pub performance: PerformanceConfig,
}

/// Server bind settings.
///
/// `host = "0.0.0.0"` is the usual production value; Twilio must be able to reach `/twilio`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Voice-agent endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// WebSocket URL of the agent service.
    pub url: String,

    /// API key sent as the `token` subprotocol. Empty means "not configured".
    #[serde(default)]
    pub api_key: String,

    /// Upper bound on establishing the agent connection, per call.
    pub connect_timeout_ms: u64,
}

/// Audio format shared by both legs of the call.
///
/// The bridge never transcodes: Twilio streams 8 kHz μ-law and the agent is told to expect
/// (and produce) the same thing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub encoding: String,
    pub sample_rate: u32,
    pub container: String,

    /// Size of one Twilio media frame (20 ms of 8 kHz μ-law is 160 bytes).
    pub inbound_frame_bytes: usize,

    /// How many inbound frames are batched into one uplink block.
    pub frames_per_block: usize,
}

impl AudioConfig {
    /// Size in bytes of one block sent to the agent (3200 bytes = 0.4 s by default).
    pub fn block_size(&self) -> usize {
        self.inbound_frame_bytes * self.frames_per_block
    }
}

/// Per-call behaviour and the agent persona.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long teardown waits for the remaining duties before aborting them.
    pub teardown_grace_ms: u64,

    pub language: String,
    pub listen_provider: String,
    pub listen_model: String,
    #[serde(default)]
    pub keyterms: Vec<String>,
    pub think_provider: String,
    pub think_model: String,
    pub temperature: f32,
    pub prompt: String,
    pub speak_provider: String,
    pub speak_model: String,
    pub greeting: String,
}

/// Capacity tuning.
///
/// `audio_queue_capacity` is counted in blocks. When the agent falls behind and the queue
/// fills, the inbound reader waits for room instead of growing memory without bound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub audio_queue_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 5000,
            },
            agent: AgentConfig {
                url: DEFAULT_AGENT_URL.to_string(),
                api_key: String::new(),
                connect_timeout_ms: 10_000,
            },
            audio: AudioConfig {
                encoding: "mulaw".to_string(),
                sample_rate: 8000,
                container: "none".to_string(),
                inbound_frame_bytes: 160,
                frames_per_block: 20,
            },
            session: SessionConfig {
                teardown_grace_ms: 2_000,
                language: "en".to_string(),
                listen_provider: "deepgram".to_string(),
                listen_model: "nova-3".to_string(),
                keyterms: vec!["hello".to_string(), "goodbye".to_string()],
                think_provider: "open_ai".to_string(),
                think_model: "gpt-4o-mini".to_string(),
                temperature: 0.7,
                prompt: "You are a helpful AI assistant focused on customer service.".to_string(),
                speak_provider: "deepgram".to_string(),
                speak_model: "aura-2-thalia-en".to_string(),
                greeting: "Hello! How can I help you today?".to_string(),
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
                audio_queue_capacity: 256,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml`, and the environment.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("session.keyterms")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(api_key) = env::var("DEEPGRAM_API_KEY") {
            settings = settings.set_override("agent.api_key", api_key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations the bridge cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.agent.url.trim().is_empty() {
            return Err(anyhow::anyhow!("Agent URL cannot be empty"));
        }

        if !self.agent.url.starts_with("ws://") && !self.agent.url.starts_with("wss://") {
            return Err(anyhow::anyhow!("Agent URL must use ws:// or wss://"));
        }

        if self.agent.connect_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Agent connect timeout must be greater than 0"));
        }

        if self.audio.block_size() == 0 {
            return Err(anyhow::anyhow!(
                "Audio block size (inbound_frame_bytes * frames_per_block) must be greater than 0"
            ));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rate must be greater than 0"));
        }

        if self.session.teardown_grace_ms == 0 {
            return Err(anyhow::anyhow!("Teardown grace period must be greater than 0"));
        }

        if !(0.0..=2.0).contains(&self.session.temperature) {
            return Err(anyhow::anyhow!("Temperature must be between 0.0 and 2.0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.performance.audio_queue_capacity == 0 {
            return Err(anyhow::anyhow!("Audio queue capacity must be greater than 0"));
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.agent.connect_timeout_ms)
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.session.teardown_grace_ms)
    }

    /// Apply a partial JSON update (used by `PUT /api/v1/config`).
    ///
    /// Only the per-call sections can change at runtime; the bind address and the agent
    /// endpoint need a restart. Calls already in progress keep the settings they started with.
    /// The update is applied to a copy and only committed if the result validates.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;
        let mut updated = self.clone();

        if let Some(session) = partial.get("session") {
            let s = &mut updated.session;
            if let Some(v) = session.get("teardown_grace_ms").and_then(|v| v.as_u64()) {
                s.teardown_grace_ms = v;
            }
            if let Some(v) = session.get("temperature").and_then(|v| v.as_f64()) {
                s.temperature = v as f32;
            }
            if let Some(v) = session.get("keyterms").and_then(|v| v.as_array()) {
                s.keyterms = v
                    .iter()
                    .filter_map(|t| t.as_str().map(str::to_string))
                    .collect();
            }
            for (key, field) in [
                ("language", &mut s.language),
                ("listen_provider", &mut s.listen_provider),
                ("listen_model", &mut s.listen_model),
                ("think_provider", &mut s.think_provider),
                ("think_model", &mut s.think_model),
                ("prompt", &mut s.prompt),
                ("speak_provider", &mut s.speak_provider),
                ("speak_model", &mut s.speak_model),
                ("greeting", &mut s.greeting),
            ] {
                if let Some(v) = session.get(key).and_then(|v| v.as_str()) {
                    *field = v.to_string();
                }
            }
        }

        if let Some(performance) = partial.get("performance") {
            if let Some(v) = performance
                .get("max_concurrent_sessions")
                .and_then(|v| v.as_u64())
            {
                updated.performance.max_concurrent_sessions = v as usize;
            }
            if let Some(v) = performance
                .get("audio_queue_capacity")
                .and_then(|v| v.as_u64())
            {
                updated.performance.audio_queue_capacity = v as usize;
            }
        }

        if let Some(agent) = partial.get("agent") {
            if let Some(v) = agent.get("connect_timeout_ms").and_then(|v| v.as_u64()) {
                updated.agent.connect_timeout_ms = v;
            }
        }

        updated.validate()?;
        *self = updated;
        Ok(())
    }
}
