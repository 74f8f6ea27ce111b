// CLI commands for running and configuring Gavel
use anyhow::{bail, Context, Result};
use gavel_common::config::{JudgeConfig, SandboxConfig};
use gavel_common::types::{StatusSnapshot, SubmissionStatus, TestStatus};
use gavel_engine::languages::{builtin_languages, CommandSpec, LanguageConfig};
use gavel_engine::sandbox::effective_uid;
use gavel_engine::{
    ExerciseCatalog, JobSpec, Judge, LanguageRegistry, MemoryStore, StaticCatalog, TestCaseSpec,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LanguagesJson {
    pub languages: Vec<LanguageConfig>,
}

/// Test file: either a bare array or `{"test_cases": [...]}`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TestsFile {
    List(Vec<TestCaseSpec>),
    Wrapped { test_cases: Vec<TestCaseSpec> },
}

/// Load languages configuration
fn load_languages_config(config_path: &Path) -> Result<LanguagesJson> {
    if !config_path.exists() {
        return Ok(LanguagesJson::default());
    }

    let content = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read {}", config_path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", config_path.display()))
}

/// Save languages configuration
fn save_languages_config(config_path: &Path, config: &LanguagesJson) -> Result<()> {
    // Ensure config directory exists
    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let json_content =
        serde_json::to_string_pretty(&config).context("Failed to serialize languages.json")?;

    fs::write(config_path, json_content)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    Ok(())
}

pub struct NewLanguage<'a> {
    pub name: &'a str,
    pub version: &'a str,
    pub source_file: &'a str,
    pub binary: Option<&'a str>,
    pub aliases: &'a [String],
    pub compile: Option<&'a str>,
    pub compile_args: &'a [String],
    pub run: &'a str,
    pub run_args: &'a [String],
    pub no_address_space_limit: bool,
    pub runtime_overhead_mb: u64,
}

/// Add a new language adapter to config/languages.json
pub fn add_language(config_path: &Path, lang: NewLanguage<'_>) -> Result<()> {
    println!("🚀 Adding language: {}", lang.name);

    if lang.compile.is_none() && !lang.compile_args.is_empty() {
        bail!("--compile-arg given without --compile");
    }

    let config = LanguageConfig {
        name: lang.name.to_lowercase(),
        aliases: lang.aliases.to_vec(),
        version: lang.version.to_string(),
        source_file: lang.source_file.to_string(),
        binary: lang.binary.map(str::to_string),
        compile: lang.compile.map(|program| CommandSpec {
            program: program.to_string(),
            args: lang.compile_args.to_vec(),
        }),
        run: CommandSpec {
            program: lang.run.to_string(),
            args: lang.run_args.to_vec(),
        },
        address_space_limit: !lang.no_address_space_limit,
        runtime_overhead_mb: lang.runtime_overhead_mb,
    };
    config.validate()?;

    // Load existing config
    let mut languages_json = load_languages_config(config_path)?;

    // Check if language already exists
    if languages_json.languages.iter().any(|l| l.name == config.name) {
        bail!("Language '{}' already exists in config", config.name);
    }

    languages_json.languages.push(config);

    // The merged registry must still load
    LanguageRegistry::from_configs(languages_json.languages.clone())
        .context("Language would conflict with existing configuration")?;

    println!("📝 Updating {}...", config_path.display());
    save_languages_config(config_path, &languages_json)?;

    println!("✅ Language '{}' added successfully!", lang.name);
    println!("\n📋 Next steps:");
    println!("  1. Make sure '{}' is installed on every judge host", lang.run);
    println!("  2. Restart gavel-api to pick up the change");

    Ok(())
}

/// Remove a language from config/languages.json
pub fn remove_language(config_path: &Path, name: &str, yes: bool) -> Result<()> {
    println!("🗑️  Removing language: {}", name);

    // Load existing config
    let mut languages_json = load_languages_config(config_path)?;

    // Find language
    let lang_index = languages_json
        .languages
        .iter()
        .position(|l| l.name == name)
        .ok_or_else(|| {
            if builtin_languages().iter().any(|l| l.name == name) {
                anyhow::anyhow!("Language '{}' is built in and has no config entry", name)
            } else {
                anyhow::anyhow!("Language '{}' not found in config", name)
            }
        })?;

    // Confirm deletion
    if !yes {
        print!("⚠️  This will remove the config entry for '{}'", name);
        if builtin_languages().iter().any(|l| l.name == name) {
            print!(" (the built-in adapter takes over again)");
        }
        print!("\n\nContinue? (y/N): ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("❌ Aborted");
            return Ok(());
        }
    }

    languages_json.languages.remove(lang_index);
    println!("📝 Removing from {}...", config_path.display());
    save_languages_config(config_path, &languages_json)?;

    println!("✅ Language '{}' removed successfully!", name);
    Ok(())
}

/// List all supported languages, built-in and configured
pub fn list_languages(config_path: &Path) -> Result<()> {
    let registry = LanguageRegistry::load_or_builtin(config_path)?;
    let configured = load_languages_config(config_path)?;

    println!("📋 Supported Languages:\n");
    println!(
        "{:<10} {:<10} {:<16} {:<12} {:<40} {:<8}",
        "Name", "Version", "Source", "Origin", "Run", "RLIMIT_AS"
    );
    println!("{}", "─".repeat(100));

    for lang in registry.configs() {
        let origin = if configured.languages.iter().any(|l| l.name == lang.name) {
            "config"
        } else {
            "builtin"
        };
        let run = std::iter::once(lang.run.program.as_str())
            .chain(lang.run.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        println!(
            "{:<10} {:<10} {:<16} {:<12} {:<40} {:<8}",
            lang.name,
            lang.version,
            lang.source_file,
            origin,
            run,
            if lang.address_space_limit { "yes" } else { "no" }
        );
    }

    println!("\n✅ Total: {} language(s)", registry.list_languages().len());

    Ok(())
}

/// Load every configuration file and report problems
pub fn check_config(judge_config: Option<&Path>) -> Result<()> {
    println!("🔍 Checking configuration...\n");

    let config = match judge_config {
        Some(path) => JudgeConfig::load_from_file(path).map_err(anyhow::Error::msg)?,
        None => JudgeConfig::load_default().map_err(anyhow::Error::msg)?,
    };
    println!(
        "  ✅ Judge config: {} workers, queue {}, comparison {:?}",
        config.scheduler.workers, config.scheduler.queue_capacity, config.comparison
    );
    println!(
        "     limits {}-{} s, {}-{} MB, compile timeout {} s",
        config.limits.min_time_secs,
        config.limits.max_time_secs,
        config.limits.min_memory_mb,
        config.limits.max_memory_mb,
        config.limits.compile_timeout_secs
    );

    let registry = LanguageRegistry::load_or_builtin(&config.languages_path)?;
    println!(
        "  ✅ Languages: {}",
        registry.list_languages().join(", ")
    );

    let catalog = StaticCatalog::load_or_empty(&config.exercises_path, config.limits.clone())?;
    println!("  ✅ Exercises: {}", catalog.list().len());

    match &config.store.redis_url {
        Some(url) => println!("  ✅ Result store: redis ({})", url),
        None => println!("  ✅ Result store: in-memory"),
    }

    if config.sandbox.isolate_network {
        println!("  ℹ️  Network isolation is on; the judge needs CAP_SYS_ADMIN");
    }
    println!("  {}", privilege_summary(&config.sandbox, effective_uid()));

    println!("\n✅ Configuration is valid");
    Ok(())
}

/// Which user submissions run as, given the judge's effective uid
fn privilege_summary(sandbox: &SandboxConfig, euid: u32) -> String {
    match (sandbox.effective_run_as(euid), sandbox.run_as_uid) {
        (Some((uid, gid)), Some(_)) => format!("✅ Submissions run as uid {} gid {}", uid, gid),
        (Some((uid, gid)), None) => format!(
            "✅ Judge runs as root; submissions drop to uid {} gid {} (set sandbox.run_as_uid to choose)",
            uid, gid
        ),
        (None, _) => format!(
            "⚠️  Submissions run as the judge's own uid {}; run the judge as root to drop to a dedicated user",
            euid
        ),
    }
}

pub struct JudgeArgs<'a> {
    pub language: &'a str,
    pub source: &'a Path,
    pub tests: &'a Path,
    pub time_limit_secs: Option<u32>,
    pub memory_limit_mb: Option<u32>,
    pub json: bool,
    pub languages: Option<&'a Path>,
}

fn read_tests(path: &Path) -> Result<Vec<TestCaseSpec>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let parsed: TestsFile = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(match parsed {
        TestsFile::List(tests) => tests,
        TestsFile::Wrapped { test_cases } => test_cases,
    })
}

/// Judge a local source file and print the verdict
pub async fn judge(args: JudgeArgs<'_>) -> Result<SubmissionStatus> {
    let config = JudgeConfig::load_default().map_err(anyhow::Error::msg)?;
    let languages_path = args.languages.unwrap_or(config.languages_path.as_path());
    let registry = LanguageRegistry::load_or_builtin(languages_path)?;
    let catalog = StaticCatalog::empty(config.limits.clone());

    let source_code = fs::read_to_string(args.source)
        .with_context(|| format!("Failed to read {}", args.source.display()))?;
    let test_cases = read_tests(args.tests)?;

    let judge = Judge::new(
        config,
        registry,
        Arc::new(catalog),
        Arc::new(MemoryStore::new()),
    );

    let submitted = judge
        .submit_job(JobSpec {
            source_code,
            language: args.language.to_string(),
            test_cases,
            time_limit_secs: args.time_limit_secs,
            memory_limit_mb: args.memory_limit_mb,
            owner: None,
            exercise_id: None,
        })
        .await?;

    if !args.json {
        println!("⚖️  Judging submission {}", submitted.submission_id);
    }

    let snapshot = judge.wait(submitted.submission_id).await?;
    judge.shutdown().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print_report(&snapshot);
    }

    Ok(snapshot.status)
}

fn print_report(snapshot: &StatusSnapshot) {
    if let Some(diagnostics) = &snapshot.compile_output {
        println!("\n❌ Compilation failed:\n{}", diagnostics);
    }

    for result in &snapshot.results {
        let mark = match result.status {
            TestStatus::Accepted => "✅",
            TestStatus::WrongAnswer => "❌",
            TestStatus::TimeLimitExceeded => "⏱️ ",
            TestStatus::RuntimeError => "💥",
        };
        println!(
            "  {} Test {:<3} {:<20} {} ms{}",
            mark,
            result.test,
            format!("{:?}", result.status),
            result.execution_time_ms,
            if result.output_truncated { " (output truncated)" } else { "" }
        );
        if let Some(error) = &result.error {
            for line in error.lines().take(5) {
                println!("        {}", line);
            }
        }
    }

    match &snapshot.summary {
        Some(summary) => println!(
            "\n📊 Verdict: {} ({}/{} passed, {}%)",
            snapshot.status, summary.passed, summary.total, summary.percentage
        ),
        None => println!("\n📊 Verdict: {}", snapshot.status),
    }
}
