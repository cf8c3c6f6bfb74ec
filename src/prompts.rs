//! Workflow kinds and the system prompts that go with them.
//!
//! The wire name of each profile is sent as `prompt_name` so the desktop
//! server can select matching behaviour; the same profile picks the system
//! prompt placed at the top of the context window on the phone.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PromptProfile {
    #[default]
    Default,
    LabProtocolGuide,
    StructuredDataExtraction,
}

const DEFAULT_PROMPT: &str = "You are a helpful assistant. Answer clearly and concisely.";

const LAB_PROTOCOL_GUIDE_PROMPT: &str = "You are a laboratory assistant with expertise in \
scientific equipment, experimental procedures and laboratory safety. Be precise, put safety \
first, give step-by-step guidance when explaining a protocol, and say so when you are unsure. \
Keep formatting light: bold, italics and bullet points only.";

const STRUCTURED_DATA_EXTRACTION_PROMPT: &str = "You extract structured data from laboratory \
notes, transcripts and instrument output. Respond with a single JSON object and nothing else. \
Use null for fields that are not present in the input.";

impl PromptProfile {
    pub const ALL: [PromptProfile; 3] = [
        PromptProfile::Default,
        PromptProfile::LabProtocolGuide,
        PromptProfile::StructuredDataExtraction,
    ];

    /// Name understood by the server's prompt registry.
    pub fn wire_name(&self) -> &'static str {
        match self {
            PromptProfile::Default => "default",
            PromptProfile::LabProtocolGuide => "lab_protocol_guide",
            PromptProfile::StructuredDataExtraction => "structured_data_extraction",
        }
    }

    pub fn system_prompt(&self) -> &'static str {
        match self {
            PromptProfile::Default => DEFAULT_PROMPT,
            PromptProfile::LabProtocolGuide => LAB_PROTOCOL_GUIDE_PROMPT,
            PromptProfile::StructuredDataExtraction => STRUCTURED_DATA_EXTRACTION_PROMPT,
        }
    }
}

impl fmt::Display for PromptProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl FromStr for PromptProfile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PromptProfile::ALL
            .into_iter()
            .find(|p| p.wire_name() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown prompt profile: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_match_serde_names() {
        for profile in PromptProfile::ALL {
            let json = serde_json::to_string(&profile).unwrap();
            assert_eq!(json, format!("\"{}\"", profile.wire_name()));
            assert_eq!(profile.wire_name().parse::<PromptProfile>().unwrap(), profile);
        }
    }

    #[test]
    fn unknown_profile_is_rejected() {
        assert!("chatty".parse::<PromptProfile>().is_err());
    }
}
