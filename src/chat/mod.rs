pub mod context;
pub mod generation;
pub mod sampler;
pub mod stop_conditions;
pub mod telemetry;
pub mod templates;

pub use context::{ChatContext, SharedChatContext};
pub use generation::{GenerationController, GenerationFault, TurnHandle};
pub use sampler::{MirostatMode, ParamError, SamplingParams};
pub use telemetry::TelemetrySink;
pub use templates::{display_transcript, render, render_history, render_with, SettingsProvider, TemplateError};
