use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use log::info;

/// Mirostat sampling mode, sent to the server as 0, 1 or 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MirostatMode {
    #[default]
    Off,
    V1,
    V2,
}

impl From<MirostatMode> for u8 {
    fn from(mode: MirostatMode) -> Self {
        match mode {
            MirostatMode::Off => 0,
            MirostatMode::V1 => 1,
            MirostatMode::V2 => 2,
        }
    }
}

impl TryFrom<u8> for MirostatMode {
    type Error = ParamError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MirostatMode::Off),
            1 => Ok(MirostatMode::V1),
            2 => Ok(MirostatMode::V2),
            other => Err(ParamError::InvalidMirostatMode(i64::from(other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParamError {
    #[error("unknown sampling parameter '{0}'")]
    UnknownField(String),
    #[error("invalid value '{value}' for sampling parameter '{name}'")]
    InvalidValue { name: String, value: String },
    #[error("mirostat mode must be 0, 1 or 2 (got {0})")]
    InvalidMirostatMode(i64),
}

// Sampling controls forwarded to the completion server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default = "default_n_predict")]
    pub n_predict: i32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// 0 = disable penalty, -1 = context size
    #[serde(default = "default_repeat_last_n")]
    pub repeat_last_n: i32,
    /// 1.0 = disabled
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f64,
    /// <= 0 to use vocab size
    #[serde(default = "default_top_k")]
    pub top_k: i32,
    /// 1.0 = disabled
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    /// 1.0 = disabled
    #[serde(default = "default_one")]
    pub tfs_z: f64,
    /// 1.0 = disabled
    #[serde(default = "default_one")]
    pub typical_p: f64,
    #[serde(default)]
    pub presence_penalty: f64,
    #[serde(default)]
    pub frequency_penalty: f64,
    #[serde(default)]
    pub mirostat: MirostatMode,
    /// Target entropy
    #[serde(default = "default_mirostat_tau")]
    pub mirostat_tau: f64,
    /// Learning rate
    #[serde(default = "default_mirostat_eta")]
    pub mirostat_eta: f64,
}

fn default_n_predict() -> i32 {
    400
}

fn default_temperature() -> f64 {
    0.7
}

fn default_repeat_last_n() -> i32 {
    256
}

fn default_repeat_penalty() -> f64 {
    1.18
}

fn default_top_k() -> i32 {
    40
}

fn default_top_p() -> f64 {
    0.5
}

fn default_one() -> f64 {
    1.0
}

fn default_mirostat_tau() -> f64 {
    5.0
}

fn default_mirostat_eta() -> f64 {
    0.1
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            n_predict: default_n_predict(),
            temperature: default_temperature(),
            repeat_last_n: default_repeat_last_n(),
            repeat_penalty: default_repeat_penalty(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            tfs_z: 1.0,
            typical_p: 1.0,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            mirostat: MirostatMode::Off,
            mirostat_tau: default_mirostat_tau(),
            mirostat_eta: default_mirostat_eta(),
        }
    }
}

impl SamplingParams {
    /// Parameter names accepted by [`SamplingParams::set_field`].
    pub const FIELDS: &'static [&'static str] = &[
        "n_predict",
        "temperature",
        "repeat_last_n",
        "repeat_penalty",
        "top_k",
        "top_p",
        "tfs_z",
        "typical_p",
        "presence_penalty",
        "frequency_penalty",
        "mirostat",
        "mirostat_tau",
        "mirostat_eta",
    ];

    /// Set one parameter from user text.
    ///
    /// Integer parameters accept decimal input and are floored, the way the
    /// settings sliders report them.
    pub fn set_field(&mut self, name: &str, raw: &str) -> Result<(), ParamError> {
        match name {
            "n_predict" => self.n_predict = parse_int(name, raw)?,
            "repeat_last_n" => self.repeat_last_n = parse_int(name, raw)?,
            "top_k" => self.top_k = parse_int(name, raw)?,
            "mirostat" => {
                let mode: i32 = parse_int(name, raw)?;
                self.mirostat = u8::try_from(mode)
                    .map_err(|_| ParamError::InvalidMirostatMode(i64::from(mode)))
                    .and_then(MirostatMode::try_from)?;
            }
            "temperature" => self.temperature = parse_float(name, raw)?,
            "repeat_penalty" => self.repeat_penalty = parse_float(name, raw)?,
            "top_p" => self.top_p = parse_float(name, raw)?,
            "tfs_z" => self.tfs_z = parse_float(name, raw)?,
            "typical_p" => self.typical_p = parse_float(name, raw)?,
            "presence_penalty" => self.presence_penalty = parse_float(name, raw)?,
            "frequency_penalty" => self.frequency_penalty = parse_float(name, raw)?,
            "mirostat_tau" => self.mirostat_tau = parse_float(name, raw)?,
            "mirostat_eta" => self.mirostat_eta = parse_float(name, raw)?,
            _ => return Err(ParamError::UnknownField(name.to_string())),
        }
        Ok(())
    }

    /// Request payload: every parameter plus the per-request fields.
    pub fn to_payload(&self, prompt: &str, stop: &[String]) -> Value {
        let mut body = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        body.insert("stream".to_string(), Value::Bool(true));
        body.insert("prompt".to_string(), Value::String(prompt.to_string()));
        body.insert(
            "stop".to_string(),
            Value::Array(stop.iter().cloned().map(Value::String).collect()),
        );
        Value::Object(body)
    }

    /// Log which sampling strategy the server will apply for this turn.
    pub fn log_strategy(&self, turn_id: &str) {
        let use_penalties = self.repeat_penalty != 1.0
            || self.frequency_penalty > 0.0
            || self.presence_penalty > 0.0;

        if use_penalties {
            info!(
                "[{turn_id}] Penalties enabled: repeat={}, freq={}, presence={}, last_n={}",
                self.repeat_penalty, self.frequency_penalty, self.presence_penalty, self.repeat_last_n
            );
        }

        match self.mirostat {
            MirostatMode::Off => info!(
                "[{turn_id}] Sampling: temp={}, top_k={}, top_p={}, tfs_z={}, typical_p={}, n_predict={}",
                self.temperature, self.top_k, self.top_p, self.tfs_z, self.typical_p, self.n_predict
            ),
            mode => info!(
                "[{turn_id}] Sampling: mirostat v{} tau={}, eta={}, n_predict={}",
                u8::from(mode),
                self.mirostat_tau,
                self.mirostat_eta,
                self.n_predict
            ),
        }
    }
}

fn parse_float(name: &str, raw: &str) -> Result<f64, ParamError> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ParamError::InvalidValue {
            name: name.to_string(),
            value: raw.to_string(),
        })
}

fn parse_int(name: &str, raw: &str) -> Result<i32, ParamError> {
    let value = parse_float(name, raw)?.floor();
    if value < f64::from(i32::MIN) || value > f64::from(i32::MAX) {
        return Err(ParamError::InvalidValue {
            name: name.to_string(),
            value: raw.to_string(),
        });
    }
    Ok(value as i32)
}
