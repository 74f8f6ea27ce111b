// Language adapter registry
// Built-in adapters, optionally extended or overridden by config/languages.json
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;

pub const DEFAULT_LANGUAGES_PATH: &str = "config/languages.json";

const DEFAULT_BINARY: &str = "solution";

/// A program plus its argument vector. Never joined into a shell string.
///
/// Arguments may contain `{source}`, `{binary}` and `{memory_mb}`, which are
/// substituted inside each argument independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// A rendered command ready to spawn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub version: String,
    pub source_file: String,
    #[serde(default)]
    pub binary: Option<String>,
    #[serde(default)]
    pub compile: Option<CommandSpec>,
    pub run: CommandSpec,
    /// When false the runtime enforces the heap limit itself (e.g. `-Xmx`) and
    /// RLIMIT_AS is raised by `runtime_overhead_mb` to leave room for the VM.
    #[serde(default = "default_true")]
    pub address_space_limit: bool,
    #[serde(default)]
    pub runtime_overhead_mb: u64,
}

impl LanguageConfig {
    pub fn binary_name(&self) -> &str {
        self.binary.as_deref().unwrap_or(DEFAULT_BINARY)
    }

    pub fn requires_compilation(&self) -> bool {
        self.compile.is_some()
    }

    pub fn compile_command(&self, memory_limit_mb: u32) -> Option<CommandLine> {
        self.compile
            .as_ref()
            .map(|spec| self.render(spec, memory_limit_mb))
    }

    pub fn run_command(&self, memory_limit_mb: u32) -> CommandLine {
        self.render(&self.run, memory_limit_mb)
    }

    /// Address-space ceiling in bytes for a process allowed `memory_mb`
    pub fn address_space_bytes(&self, memory_mb: u64) -> u64 {
        let mb = if self.address_space_limit {
            memory_mb
        } else {
            memory_mb + self.runtime_overhead_mb
        };
        mb * 1024 * 1024
    }

    fn render(&self, spec: &CommandSpec, memory_limit_mb: u32) -> CommandLine {
        let memory = memory_limit_mb.to_string();
        let substitute = |arg: &str| {
            arg.replace("{source}", &self.source_file)
                .replace("{binary}", self.binary_name())
                .replace("{memory_mb}", &memory)
        };

        CommandLine {
            program: substitute(&spec.program),
            args: spec.args.iter().map(|a| substitute(a)).collect(),
        }
    }

    /// Reject adapter definitions that could escape the workspace or never run
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("language name cannot be empty");
        }
        for file in [Some(self.source_file.as_str()), self.binary.as_deref()]
            .into_iter()
            .flatten()
        {
            if file.is_empty() || file.contains('/') || file == "." || file == ".." {
                bail!(
                    "language '{}': '{}' must be a plain file name",
                    self.name,
                    file
                );
            }
        }
        if self.run.program.trim().is_empty() {
            bail!("language '{}': run program cannot be empty", self.name);
        }
        if let Some(compile) = &self.compile {
            if compile.program.trim().is_empty() {
                bail!("language '{}': compile program cannot be empty", self.name);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageConfig>,
}

fn cmd(program: &str, args: &[&str]) -> CommandSpec {
    CommandSpec {
        program: program.to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
    }
}

/// Adapters available without any configuration file
pub fn builtin_languages() -> Vec<LanguageConfig> {
    vec![
        LanguageConfig {
            name: "c".to_string(),
            aliases: vec![],
            version: "c11".to_string(),
            source_file: "solution.c".to_string(),
            binary: Some("solution".to_string()),
            compile: Some(cmd(
                "gcc",
                &["-std=c11", "-O2", "-Wall", "-pipe", "-o", "{binary}", "{source}", "-lm"],
            )),
            run: cmd("./{binary}", &[]),
            address_space_limit: true,
            runtime_overhead_mb: 0,
        },
        LanguageConfig {
            name: "cpp".to_string(),
            aliases: vec!["c++".to_string(), "cxx".to_string(), "cc".to_string()],
            version: "c++17".to_string(),
            source_file: "solution.cpp".to_string(),
            binary: Some("solution".to_string()),
            compile: Some(cmd(
                "g++",
                &["-std=c++17", "-O2", "-Wall", "-pipe", "-o", "{binary}", "{source}"],
            )),
            run: cmd("./{binary}", &[]),
            address_space_limit: true,
            runtime_overhead_mb: 0,
        },
        LanguageConfig {
            name: "python".to_string(),
            aliases: vec!["py".to_string(), "python3".to_string()],
            version: "3".to_string(),
            source_file: "solution.py".to_string(),
            binary: None,
            compile: Some(cmd("python3", &["-m", "py_compile", "{source}"])),
            run: cmd("python3", &["-B", "-u", "{source}"]),
            address_space_limit: true,
            runtime_overhead_mb: 0,
        },
        LanguageConfig {
            name: "java".to_string(),
            aliases: vec![],
            version: "17".to_string(),
            source_file: "Main.java".to_string(),
            binary: None,
            compile: Some(cmd("javac", &["-J-Xmx512m", "{source}"])),
            run: cmd("java", &["-Xmx{memory_mb}m", "-Xss64m", "-cp", ".", "Main"]),
            address_space_limit: false,
            runtime_overhead_mb: 2048,
        },
    ]
}

/// Registry of language adapters, keyed by canonical name
#[derive(Debug, Clone, Default)]
pub struct LanguageRegistry {
    adapters: BTreeMap<String, Arc<LanguageConfig>>,
    aliases: HashMap<String, String>,
}

impl LanguageRegistry {
    /// Registry containing only the given adapters
    pub fn from_configs(configs: Vec<LanguageConfig>) -> Result<Self> {
        let mut registry = Self::default();
        for config in configs {
            registry.insert(config)?;
        }
        Ok(registry)
    }

    /// Registry of built-in adapters
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        for config in builtin_languages() {
            let name = config.name.clone();
            for alias in &config.aliases {
                registry.aliases.insert(alias.clone(), name.clone());
            }
            registry.adapters.insert(name, Arc::new(config));
        }
        registry
    }

    /// Built-ins overridden and extended by a languages.json file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let languages_json: LanguagesJson = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        let mut registry = Self::builtin();
        for lang in languages_json.languages {
            registry.insert(lang)?;
        }
        Ok(registry)
    }

    /// Load `config_path` if it exists, otherwise just the built-ins
    pub fn load_or_builtin(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            Self::load(config_path)
        } else {
            Ok(Self::builtin())
        }
    }

    /// Load with default path (config/languages.json), falling back to built-ins
    pub fn load_default() -> Result<Self> {
        Self::load_or_builtin(Path::new(DEFAULT_LANGUAGES_PATH))
    }

    /// Add or replace an adapter
    pub fn insert(&mut self, config: LanguageConfig) -> Result<()> {
        config.validate()?;
        let name = config.name.to_lowercase();
        self.aliases.retain(|_, target| target != &name);
        for alias in &config.aliases {
            self.aliases.insert(alias.to_lowercase(), name.clone());
        }
        self.adapters.insert(name, Arc::new(config));
        Ok(())
    }

    /// Canonical name for a tag, case-insensitive, aliases included
    pub fn canonical_name(&self, tag: &str) -> Option<String> {
        let tag = tag.trim().to_lowercase();
        if self.adapters.contains_key(&tag) {
            return Some(tag);
        }
        self.aliases.get(&tag).cloned()
    }

    pub fn resolve(&self, tag: &str) -> Option<Arc<LanguageConfig>> {
        self.canonical_name(tag)
            .and_then(|name| self.adapters.get(&name).cloned())
    }

    pub fn is_supported(&self, tag: &str) -> bool {
        self.canonical_name(tag).is_some()
    }

    /// List all supported languages
    pub fn list_languages(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    pub fn configs(&self) -> impl Iterator<Item = &LanguageConfig> {
        self.adapters.values().map(|c| c.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_languages() {
        let registry = LanguageRegistry::builtin();
        assert_eq!(registry.list_languages(), vec!["c", "cpp", "java", "python"]);
    }

    #[test]
    fn test_aliases_resolve_case_insensitively() {
        let registry = LanguageRegistry::builtin();
        assert_eq!(registry.canonical_name("C++").as_deref(), Some("cpp"));
        assert_eq!(registry.canonical_name("py").as_deref(), Some("python"));
        assert_eq!(registry.canonical_name(" Java ").as_deref(), Some("java"));
        assert!(registry.resolve("brainfuck").is_none());
    }

    #[test]
    fn test_compile_command_is_argument_vector() {
        let registry = LanguageRegistry::builtin();
        let cpp = registry.resolve("cpp").unwrap();
        let compile = cpp.compile_command(256).unwrap();
        assert_eq!(compile.program, "g++");
        assert_eq!(
            compile.args,
            vec!["-std=c++17", "-O2", "-Wall", "-pipe", "-o", "solution", "solution.cpp"]
        );
        let run = cpp.run_command(256);
        assert_eq!(run.program, "./solution");
        assert!(run.args.is_empty());
    }

    #[test]
    fn test_memory_placeholder_substitution() {
        let registry = LanguageRegistry::builtin();
        let java = registry.resolve("java").unwrap();
        let run = java.run_command(128);
        assert_eq!(run.args[0], "-Xmx128m");
        assert_eq!(java.address_space_bytes(128), (128 + 2048) * 1024 * 1024);
    }

    #[test]
    fn test_address_space_for_native_languages() {
        let registry = LanguageRegistry::builtin();
        let c = registry.resolve("c").unwrap();
        assert_eq!(c.address_space_bytes(64), 64 * 1024 * 1024);
    }

    #[test]
    fn test_rejects_path_in_source_file() {
        let config = LanguageConfig {
            name: "evil".to_string(),
            aliases: vec![],
            version: String::new(),
            source_file: "../escape.c".to_string(),
            binary: None,
            compile: None,
            run: cmd("sh", &["{source}"]),
            address_space_limit: true,
            runtime_overhead_mb: 0,
        };
        assert!(config.validate().is_err());
        assert!(LanguageRegistry::from_configs(vec![config]).is_err());
    }

    #[test]
    fn test_override_replaces_builtin() {
        let mut registry = LanguageRegistry::builtin();
        registry
            .insert(LanguageConfig {
                name: "python".to_string(),
                aliases: vec!["pypy".to_string()],
                version: "pypy3".to_string(),
                source_file: "main.py".to_string(),
                binary: None,
                compile: None,
                run: cmd("pypy3", &["{source}"]),
                address_space_limit: true,
                runtime_overhead_mb: 0,
            })
            .unwrap();

        let python = registry.resolve("pypy").unwrap();
        assert_eq!(python.run_command(64).program, "pypy3");
        assert!(!python.requires_compilation());
        assert!(registry.resolve("py").is_none());
    }

    #[test]
    fn test_load_file_extends_builtins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("languages.json");
        fs::write(
            &path,
            r#"{"languages": [{"name": "sh", "source_file": "solution.sh",
                "compile": {"program": "sh", "args": ["-n", "{source}"]},
                "run": {"program": "sh", "args": ["{source}"]}}]}"#,
        )
        .unwrap();

        let registry = LanguageRegistry::load(&path).unwrap();
        assert!(registry.is_supported("sh"));
        assert!(registry.is_supported("cpp"));
    }
}
