// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use lifesim_common::{PhaseSpec, PhaseTable, expand_env_vars};
use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_BIND: &str = "0.0.0.0:8090";
pub const DEFAULT_LLM_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_LLM_TIMEOUT_SECONDS: u64 = 90;
pub const DEFAULT_RETRIEVAL_TOP_K: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationMode {
    Live,
    Simulated,
}

impl GenerationMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "live" => Some(Self::Live),
            "simulated" | "simulation" | "offline" => Some(Self::Simulated),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Simulated => "simulated",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    /// `None` disables image generation.
    pub image_model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// `None` disables retrieval.
    pub url: Option<String>,
    pub top_k: usize,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub generation_mode: GenerationMode,
    pub llm: LlmConfig,
    pub retrieval: RetrievalConfig,
    pub phases: PhaseTable,
}

/// Shape of the optional YAML file named by `LIFESIM_CONFIG_PATH`.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    phases: Option<Vec<PhaseSpec>>,
    #[serde(default)]
    llm: LlmSection,
    #[serde(default)]
    retrieval: RetrievalSection,
}

#[derive(Debug, Default, Deserialize)]
struct LlmSection {
    base_url: Option<String>,
    model: Option<String>,
    api_key: Option<String>,
    image_model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RetrievalSection {
    url: Option<String>,
    top_k: Option<usize>,
}

impl ServiceConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let file = std::env::var("LIFESIM_CONFIG_PATH")
            .ok()
            .and_then(|path| load_config_file(path.trim()));
        Self::resolve(|name| std::env::var(name).ok(), file.unwrap_or_default())
    }

    fn resolve(
        lookup: impl Fn(&str) -> Option<String>,
        file: ConfigFile,
    ) -> anyhow::Result<Self> {
        let var = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let bind_addr: SocketAddr = var("STORY_SERVICE_BIND")
            .unwrap_or_else(|| DEFAULT_BIND.to_string())
            .parse()
            .context("invalid STORY_SERVICE_BIND")?;

        let llm = LlmConfig {
            base_url: non_empty(file.llm.base_url)
                .or_else(|| var("LLM_BASE_URL"))
                .unwrap_or_else(|| DEFAULT_LLM_BASE_URL.to_string()),
            model: non_empty(file.llm.model)
                .or_else(|| var("LLM_MODEL"))
                .unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
            api_key: non_empty(file.llm.api_key).or_else(|| var("LLM_API_KEY")),
            timeout: Duration::from_secs(match var("LLM_TIMEOUT_SECONDS") {
                Some(raw) => raw
                    .parse::<u64>()
                    .context("invalid LLM_TIMEOUT_SECONDS")?,
                None => DEFAULT_LLM_TIMEOUT_SECONDS,
            }),
            image_model: non_empty(file.llm.image_model).or_else(|| var("IMAGE_MODEL")),
        };

        let retrieval = RetrievalConfig {
            url: non_empty(file.retrieval.url).or_else(|| var("RETRIEVAL_URL")),
            top_k: match (file.retrieval.top_k, var("RETRIEVAL_TOP_K")) {
                (Some(top_k), _) => top_k,
                (None, Some(raw)) => raw.parse::<usize>().context("invalid RETRIEVAL_TOP_K")?,
                (None, None) => DEFAULT_RETRIEVAL_TOP_K,
            },
        };

        let generation_mode = match var("GENERATION_MODE") {
            Some(raw) => GenerationMode::parse(&raw).with_context(|| {
                format!("invalid GENERATION_MODE {raw:?}; expected live or simulated")
            })?,
            None if llm.api_key.is_some() => GenerationMode::Live,
            None => GenerationMode::Simulated,
        };
        if generation_mode == GenerationMode::Live && llm.api_key.is_none() {
            anyhow::bail!("GENERATION_MODE=live requires LLM_API_KEY");
        }

        let phases = match file.phases {
            Some(phases) => PhaseTable::new(phases).context("invalid phase table in config file")?,
            None => PhaseTable::default(),
        };

        Ok(Self {
            bind_addr,
            generation_mode,
            llm,
            retrieval,
            phases,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn load_config_file(path: &str) -> Option<ConfigFile> {
    if path.is_empty() {
        return None;
    }

    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) => {
            warn!(path = %path, error = %error, "failed to read service config file");
            return None;
        }
    };

    if raw.trim().is_empty() {
        warn!(path = %path, "service config file is empty");
        return None;
    }

    match serde_yaml::from_str::<ConfigFile>(&expand_env_vars(&raw)) {
        Ok(file) => Some(file),
        Err(error) => {
            warn!(path = %path, error = %error, "failed to parse service config yaml");
            None
        }
    }
}
