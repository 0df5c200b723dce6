use crate::models::ModelCapabilities;
use std::fmt;

/// Upstream operation selected for a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelType {
    Chat,
    Tts,
    Asr,
    Stt,
    Image,
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelType::Chat => "chat",
            ModelType::Tts => "tts",
            ModelType::Asr => "asr",
            ModelType::Stt => "stt",
            ModelType::Image => "image",
        };
        f.write_str(name)
    }
}

/// Resolve the operation for a set of capability flags.
///
/// Priority is tts > asr > stt > imageOutput > chat.
pub fn detect_model_type(capabilities: &ModelCapabilities) -> ModelType {
    if capabilities.tts {
        ModelType::Tts
    } else if capabilities.asr {
        ModelType::Asr
    } else if capabilities.stt {
        ModelType::Stt
    } else if capabilities.image_output {
        ModelType::Image
    } else {
        ModelType::Chat
    }
}
