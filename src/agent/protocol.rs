//! # Voice Agent Protocol Messages
//!
//! The relay is a client of the voice-agent WebSocket. The conversation goes:
//! 1. **Settings**: one JSON text message describing the audio format and the agent persona
//! 2. **Audio**: binary frames of caller audio, as long as the call lasts
//!
//! In return the agent sends binary frames of synthesized speech and JSON text events. The
//! only event the relay must act on is `UserStartedSpeaking` (barge-in); the others are logged.

use serde::{Deserialize, Serialize};

use crate::config::{AudioConfig, SessionConfig};

/// The `Settings` message sent once per call before any audio.
///
/// The relay does not interpret the agent section; it only fills it from configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename = "Settings")]
pub struct AgentSettings {
    pub audio: AudioSettings,
    pub agent: AgentBehavior,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioSettings {
    pub input: AudioFormat,
    pub output: AudioFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioFormat {
    pub encoding: String,
    pub sample_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentBehavior {
    pub language: String,
    pub listen: ListenSettings,
    pub think: ThinkSettings,
    pub speak: SpeakSettings,
    pub greeting: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenSettings {
    pub provider: Provider,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThinkSettings {
    pub provider: Provider,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpeakSettings {
    pub provider: Provider,
}

/// A listen/think/speak provider block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Provider {
    #[serde(rename = "type")]
    pub kind: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keyterms: Vec<String>,
}

impl Provider {
    fn new(kind: &str, model: &str) -> Self {
        Self {
            kind: kind.to_string(),
            model: model.to_string(),
            temperature: None,
            keyterms: Vec::new(),
        }
    }
}

impl AgentSettings {
    /// Build the settings message for a call from the current configuration.
    ///
    /// Input and output use the same format: the relay does not transcode, so whatever
    /// Twilio streams in is what the agent must accept and produce.
    pub fn from_config(audio: &AudioConfig, session: &SessionConfig) -> Self {
        let container = if audio.container.is_empty() {
            None
        } else {
            Some(audio.container.clone())
        };

        let mut listen = Provider::new(&session.listen_provider, &session.listen_model);
        listen.keyterms = session.keyterms.clone();

        let mut think = Provider::new(&session.think_provider, &session.think_model);
        think.temperature = Some(session.temperature);

        Self {
            audio: AudioSettings {
                input: AudioFormat {
                    encoding: audio.encoding.clone(),
                    sample_rate: audio.sample_rate,
                    container: None,
                },
                output: AudioFormat {
                    encoding: audio.encoding.clone(),
                    sample_rate: audio.sample_rate,
                    container,
                },
            },
            agent: AgentBehavior {
                language: session.language.clone(),
                listen: ListenSettings { provider: listen },
                think: ThinkSettings {
                    provider: think,
                    prompt: session.prompt.clone(),
                },
                speak: SpeakSettings {
                    provider: Provider::new(&session.speak_provider, &session.speak_model),
                },
                greeting: session.greeting.clone(),
            },
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// A text event received from the agent.
///
/// Fields the relay only logs are optional so that a schema change on the agent side
/// degrades into less detailed logs rather than dropped events.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum AgentEvent {
    Welcome {
        #[serde(default)]
        request_id: Option<String>,
    },
    SettingsApplied,
    ConversationText {
        #[serde(default)]
        role: Option<String>,
        #[serde(default)]
        content: Option<String>,
    },
    /// The caller started talking: anything still playing must be cut off.
    UserStartedSpeaking,
    AgentThinking {
        #[serde(default)]
        content: Option<String>,
    },
    AgentStartedSpeaking,
    AgentAudioDone,
    Error {
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        code: Option<String>,
    },
    Warning {
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        code: Option<String>,
    },
    #[serde(other)]
    Other,
}

impl AgentEvent {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// True for the barge-in signal.
    pub fn is_barge_in(&self) -> bool {
        matches!(self, AgentEvent::UserStartedSpeaking)
    }
}
