use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use anyhow::Result;

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[default]
    OpenAi,
    LmStudio,
    OpenRouter,
}

impl LlmProvider {
    pub fn base_url(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "https://api.openai.com/v1",
            LlmProvider::LmStudio => "http://localhost:1234/v1",
            LlmProvider::OpenRouter => "https://openrouter.ai/api/v1",
        }
    }
}

impl FromStr for LlmProvider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "openai" | "open_ai" => Ok(LlmProvider::OpenAi),
            "lmstudio" | "lm_studio" => Ok(LlmProvider::LmStudio),
            "openrouter" | "open_router" => Ok(LlmProvider::OpenRouter),
            other => Err(format!("unknown LLM provider '{}'", other)),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    pub llm_provider: LlmProvider,
    pub llm_base_url: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub llm_temperature: f32,
    pub llm_max_tokens: u32,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    pub embedding_max_retries: u32,
    pub embedding_timeout_secs: u64,
    pub pdf_dpi: u32,
    pub max_pages: usize,
    pub max_upload_bytes: u64,
    pub field_mappings_path: Option<PathBuf>,
    pub save_outputs: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llm_provider: LlmProvider::default(),
            llm_base_url: None,
            llm_api_key: None,
            llm_model: "gpt-4-turbo".to_string(),
            llm_temperature: 0.0,
            llm_max_tokens: 4096,
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dimensions: 1024,
            embedding_max_retries: 3,
            embedding_timeout_secs: 60,
            pdf_dpi: 300,
            max_pages: 50,
            max_upload_bytes: 50 * 1024 * 1024,
            field_mappings_path: None,
            save_outputs: true,
        }
    }
}

fn parse_or_warn<T: FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring invalid value for {}: {:?}", key, raw);
            None
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Get the application data directory
    pub fn get_app_data_dir() -> PathBuf {
        let mut path = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("certex");

        if !path.exists() {
            let _ = std::fs::create_dir_all(&path);
        }
        path
    }

    fn config_path() -> PathBuf {
        Self::get_app_data_dir().join("config.json")
    }

    pub fn get_index_path() -> PathBuf {
        Self::get_app_data_dir().join("certex.index")
    }

    pub fn get_rules_path() -> PathBuf {
        Self::get_app_data_dir().join("rules.json")
    }

    pub fn get_output_dir() -> PathBuf {
        Self::get_app_data_dir().join("outputs")
    }

    /// Config file merged with process environment (env wins).
    pub fn load() -> Config {
        let mut config = Self::load_file();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    fn load_file() -> Config {
        let path = Self::config_path();
        if path.exists() {
            if let Ok(contents) = std::fs::read_to_string(&path) {
                match serde_json::from_str(&contents) {
                    Ok(config) => return config,
                    Err(e) => tracing::warn!("Ignoring malformed config {:?}: {}", path, e),
                }
            }
        }
        Config::default()
    }

    pub fn save(&self) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(Self::config_path(), contents)?;
        Ok(())
    }

    pub fn save_model(model: &str) -> Result<()> {
        let mut config = Self::load_file();
        config.llm_model = model.to_string();
        config.save()
    }

    /// Applies `KEY=value` overrides from `lookup`. Unparseable numbers keep the current value.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("LLM_PROVIDER") {
            match v.parse() {
                Ok(p) => self.llm_provider = p,
                Err(e) => tracing::warn!("{}", e),
            }
        }
        if let Some(v) = lookup("OPENAI_BASE_URL").filter(|v| !v.trim().is_empty()) {
            self.llm_base_url = Some(v.trim().to_string());
        }
        if let Some(v) = lookup("OPENAI_API_KEY").filter(|v| !v.trim().is_empty()) {
            self.llm_api_key = Some(v.trim().to_string());
        }
        if let Some(v) = lookup("OPENAI_MODEL").filter(|v| !v.trim().is_empty()) {
            self.llm_model = v.trim().to_string();
        }
        if let Some(v) = lookup("OPENAI_EMBEDDING_MODEL").filter(|v| !v.trim().is_empty()) {
            self.embedding_model = v.trim().to_string();
        }
        if let Some(v) = lookup("ACORD_FIELD_MAPPINGS").filter(|v| !v.trim().is_empty()) {
            self.field_mappings_path = Some(PathBuf::from(v.trim()));
        }

        macro_rules! numeric {
            ($key:literal, $field:expr) => {
                if let Some(raw) = lookup($key) {
                    if let Some(v) = parse_or_warn($key, &raw) {
                        $field = v;
                    }
                }
            };
        }
        numeric!("OPENAI_TEMPERATURE", self.llm_temperature);
        numeric!("OPENAI_MAX_TOKENS", self.llm_max_tokens);
        numeric!("EMBEDDING_DIMENSIONS", self.embedding_dimensions);
        numeric!("OPENAI_EMBEDDING_MAX_RETRIES", self.embedding_max_retries);
        numeric!("OPENAI_EMBEDDING_TIMEOUT_SECONDS", self.embedding_timeout_secs);
        numeric!("PDF_DPI", self.pdf_dpi);
        numeric!("MAX_PAGES", self.max_pages);
        numeric!("MAX_CONTENT_LENGTH", self.max_upload_bytes);

        if let Some(v) = lookup("SAVE_OUTPUTS") {
            match parse_flag(&v) {
                Some(flag) => self.save_outputs = flag,
                None => tracing::warn!("Ignoring invalid value for SAVE_OUTPUTS: {:?}", v),
            }
        }
    }

    pub fn llm_base_url(&self) -> String {
        self.llm_base_url
            .clone()
            .unwrap_or_else(|| self.llm_provider.base_url().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.llm_model, "gpt-4-turbo");
        assert_eq!(config.llm_temperature, 0.0);
        assert_eq!(config.llm_max_tokens, 4096);
        assert_eq!(config.pdf_dpi, 300);
        assert_eq!(config.max_pages, 50);
        assert_eq!(config.embedding_dimensions, 1024);
        assert_eq!(config.llm_base_url(), "https://api.openai.com/v1");
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let mut config = Config::default();
        config.apply_overrides(lookup(&[
            ("OPENAI_MODEL", "gpt-4o"),
            ("PDF_DPI", "150"),
            ("MAX_PAGES", "10"),
            ("LLM_PROVIDER", "lm-studio"),
            ("SAVE_OUTPUTS", "off"),
        ]));
        assert_eq!(config.llm_model, "gpt-4o");
        assert_eq!(config.pdf_dpi, 150);
        assert_eq!(config.max_pages, 10);
        assert_eq!(config.llm_provider, LlmProvider::LmStudio);
        assert_eq!(config.llm_base_url(), "http://localhost:1234/v1");
        assert!(!config.save_outputs);
    }

    #[test]
    fn invalid_numbers_are_ignored() {
        let mut config = Config::default();
        config.apply_overrides(lookup(&[("PDF_DPI", "high"), ("OPENAI_TEMPERATURE", "")]));
        assert_eq!(config.pdf_dpi, 300);
        assert_eq!(config.llm_temperature, 0.0);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let config: Config = serde_json::from_str(r#"{"llm_model": "local"}"#).unwrap();
        assert_eq!(config.llm_model, "local");
        assert_eq!(config.max_pages, 50);
    }
}
