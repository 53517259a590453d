//! Agent persona configuration
//!
//! Who the agent is and how it sounds. Settings come from defaults or from
//! environment variables, and compile into the system instruction and session
//! configuration sent at call start.

use serde::{Deserialize, Serialize};

use crate::session::SessionConfig;

/// Prebuilt voices accepted by the synthesis backend.
pub const AVAILABLE_VOICES: &[&str] = &["Kore", "Puck", "Charon", "Fenrir", "Zephyr"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    pub agent_name: String,
    pub agent_role: String,
    pub agent_description: String,
    pub voice: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            agent_name: "Ayla".to_string(),
            agent_role: "Customer Service Representative".to_string(),
            agent_description: "You work for a hospitality company and help guests \
                 with bookings, changes and general questions. Keep answers short \
                 and conversational; this is a voice call."
                .to_string(),
            voice: "Kore".to_string(),
        }
    }
}

impl AgentSettings {
    /// Build settings from `LIVECALL_*` environment variables, falling back
    /// to the defaults field by field.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            agent_name: env_or("LIVECALL_AGENT_NAME", defaults.agent_name),
            agent_role: env_or("LIVECALL_AGENT_ROLE", defaults.agent_role),
            agent_description: env_or("LIVECALL_AGENT_DESCRIPTION", defaults.agent_description),
            voice: env_or("LIVECALL_VOICE", defaults.voice),
        }
    }

    /// Render the persona into the system instruction for the session.
    pub fn system_instruction(&self) -> String {
        format!(
            "SYSTEM PROMPT — {} ({})\n\nROLE & BRAND\nYou are **{}**, an expert {}.\n{}",
            self.agent_name.to_uppercase(),
            self.agent_role.to_uppercase(),
            self.agent_name,
            self.agent_role,
            self.agent_description,
        )
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            system_instruction: self.system_instruction(),
            voice: self.voice.clone(),
            input_transcription: true,
            output_transcription: true,
        }
    }
}

fn env_or(key: &str, default: String) -> String {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default,
    }
}
