// Language configuration management for the execution engine
use anyhow::{bail, Context, Result};
use polyglot_common::types::Language;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Placeholder replaced with the raw source text
pub const CODE_PLACEHOLDER: &str = "{code}";
/// Placeholder replaced with the path of the scratch source file
pub const SOURCE_PLACEHOLDER: &str = "{source}";
/// Placeholder replaced with the path of the compiled binary
pub const BINARY_PLACEHOLDER: &str = "{binary}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    InProcess,
    Interpreter,
    Compiled,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackendKind::InProcess => "in_process",
            BackendKind::Interpreter => "interpreter",
            BackendKind::Compiled => "compiled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LanguageExecution {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_extension")]
    pub file_extension: String,
    /// Feed the source on stdin instead of through arguments
    #[serde(default)]
    pub stdin: bool,
}

fn default_extension() -> String {
    "txt".to_string()
}

impl LanguageExecution {
    /// True when any argument refers to a scratch source file
    pub fn needs_source_file(&self) -> bool {
        self.command.contains(SOURCE_PLACEHOLDER)
            || self.args.iter().any(|a| a.contains(SOURCE_PLACEHOLDER))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileStep {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: String,
    pub backend: BackendKind,
    #[serde(default)]
    pub execution: LanguageExecution,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile: Option<CompileStep>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl LanguageConfig {
    /// Program that must be present on the host for this language to run
    pub fn toolchain_program(&self) -> Option<&str> {
        match self.backend {
            BackendKind::InProcess => None,
            BackendKind::Interpreter => Some(self.execution.command.as_str()),
            BackendKind::Compiled => self.compile.as_ref().map(|c| c.command.as_str()),
        }
    }

    fn validate(&self, language: Language) -> Result<()> {
        match self.backend {
            BackendKind::InProcess if language != Language::JavaScript => {
                bail!("Language '{}' cannot use the in-process backend", language)
            }
            BackendKind::InProcess => {}
            BackendKind::Interpreter => {
                if self.execution.command.trim().is_empty() {
                    bail!("Language '{}' has no interpreter command", language);
                }
            }
            BackendKind::Compiled => {
                let compile = self
                    .compile
                    .as_ref()
                    .with_context(|| format!("Language '{}' is compiled but has no compile step", language))?;
                if compile.command.trim().is_empty() {
                    bail!("Language '{}' has an empty compile command", language);
                }
                if self.execution.command.trim().is_empty() {
                    bail!("Language '{}' has no run command", language);
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageConfig>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Toolchain settings used when no configuration file overrides them
pub fn builtin_config(language: Language) -> LanguageConfig {
    let name = language.to_string();
    match language {
        Language::JavaScript => LanguageConfig {
            name,
            backend: BackendKind::InProcess,
            execution: LanguageExecution {
                file_extension: "js".to_string(),
                ..Default::default()
            },
            compile: None,
            env: BTreeMap::new(),
        },
        Language::TypeScript => LanguageConfig {
            name,
            backend: BackendKind::Interpreter,
            execution: LanguageExecution {
                command: "npx".to_string(),
                args: strings(&["--yes", "tsx", SOURCE_PLACEHOLDER]),
                file_extension: "ts".to_string(),
                stdin: false,
            },
            compile: None,
            env: BTreeMap::new(),
        },
        Language::Python => LanguageConfig {
            name,
            backend: BackendKind::Interpreter,
            execution: LanguageExecution {
                command: "python3".to_string(),
                args: strings(&["-u", "-c", CODE_PLACEHOLDER]),
                file_extension: "py".to_string(),
                stdin: false,
            },
            compile: None,
            env: BTreeMap::from([
                ("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()),
                ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
            ]),
        },
        Language::C => LanguageConfig {
            name,
            backend: BackendKind::Compiled,
            execution: LanguageExecution {
                command: BINARY_PLACEHOLDER.to_string(),
                args: Vec::new(),
                file_extension: "c".to_string(),
                stdin: false,
            },
            compile: Some(CompileStep {
                command: "gcc".to_string(),
                args: strings(&["-O2", "-o", BINARY_PLACEHOLDER, SOURCE_PLACEHOLDER, "-lm"]),
            }),
            env: BTreeMap::new(),
        },
        Language::Rust => LanguageConfig {
            name,
            backend: BackendKind::Compiled,
            execution: LanguageExecution {
                command: BINARY_PLACEHOLDER.to_string(),
                args: Vec::new(),
                file_extension: "rs".to_string(),
                stdin: false,
            },
            compile: Some(CompileStep {
                command: "rustc".to_string(),
                args: strings(&["-O", "-o", BINARY_PLACEHOLDER, SOURCE_PLACEHOLDER]),
            }),
            env: BTreeMap::new(),
        },
        Language::Bash => LanguageConfig {
            name,
            backend: BackendKind::Interpreter,
            execution: LanguageExecution {
                command: "bash".to_string(),
                args: strings(&["-s"]),
                file_extension: "sh".to_string(),
                stdin: true,
            },
            compile: None,
            env: BTreeMap::new(),
        },
    }
}

/// Language configuration manager
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<Language, LanguageConfig>,
}

impl LanguageConfigManager {
    /// Built-in configuration for every known language
    pub fn builtin() -> Self {
        let configs = Language::ALL
            .iter()
            .map(|lang| (*lang, builtin_config(*lang)))
            .collect();
        Self { configs }
    }

    /// Load language configurations from a languages.json file.
    ///
    /// Languages the file does not mention keep their built-in settings.
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let languages_json: LanguagesJson =
            serde_json::from_str(content).context("Invalid languages JSON")?;

        let mut manager = Self::builtin();
        for config in languages_json.languages {
            let language: Language = config
                .name
                .parse()
                .map_err(|e| anyhow::anyhow!("Unknown language in config: {}", e))?;
            config.validate(language)?;
            manager.configs.insert(language, config);
        }
        Ok(manager)
    }

    /// Load the file when it exists, otherwise fall back to built-ins
    pub fn load_or_default(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let manager = Self::load(config_path)?;
            info!(path = %config_path.display(), "Loaded language configuration");
            Ok(manager)
        } else {
            warn!(
                path = %config_path.display(),
                "Language config not found, using built-in toolchain defaults"
            );
            Ok(Self::builtin())
        }
    }

    /// Replace the configuration of one language
    pub fn with_config(mut self, language: Language, config: LanguageConfig) -> Result<Self> {
        config.validate(language)?;
        self.configs.insert(language, config);
        Ok(self)
    }

    /// Get configuration for a specific language
    pub fn get_config(&self, language: &Language) -> Result<&LanguageConfig> {
        self.configs
            .get(language)
            .ok_or_else(|| anyhow::anyhow!("No configuration found for language: {}", language))
    }

    /// List all configured languages in a stable order
    pub fn list_languages(&self) -> Vec<Language> {
        Language::ALL
            .iter()
            .copied()
            .filter(|lang| self.configs.contains_key(lang))
            .collect()
    }

    /// Serialize the whole configuration in languages.json form
    pub fn to_json_pretty(&self) -> Result<String> {
        let languages = self
            .list_languages()
            .iter()
            .filter_map(|lang| self.configs.get(lang).cloned())
            .collect();
        serde_json::to_string_pretty(&LanguagesJson { languages })
            .context("Failed to serialize language configuration")
    }
}
