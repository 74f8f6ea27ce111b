mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use gavel_common::types::SubmissionStatus;
use gavel_engine::languages::DEFAULT_LANGUAGES_PATH;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "gavel-cli")]
#[command(about = "Gavel CLI - Judge code locally and manage language adapters", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Judge a local source file against a JSON test file
    Judge {
        /// Language tag (e.g., cpp, python, java)
        #[arg(short, long)]
        lang: String,

        /// Source file to judge
        #[arg(short, long)]
        source: PathBuf,

        /// JSON file with test cases
        #[arg(short, long)]
        tests: PathBuf,

        /// Time limit per test in seconds
        #[arg(long)]
        time: Option<u32>,

        /// Memory limit in MB
        #[arg(long)]
        memory: Option<u32>,

        /// Print the full status snapshot as JSON
        #[arg(long, default_value = "false")]
        json: bool,

        /// Languages config file (defaults to the judge config's languages_path)
        #[arg(long)]
        languages: Option<PathBuf>,
    },

    /// Add a language adapter to config/languages.json
    AddLang {
        /// Language name (e.g., rust, go)
        #[arg(short, long)]
        name: String,

        /// Source file name written into the workspace (e.g., main.rs)
        #[arg(short, long)]
        source_file: String,

        /// Language version, informational
        #[arg(short, long, default_value = "latest")]
        version: String,

        /// Compiled artifact name used for {binary}
        #[arg(short, long)]
        binary: Option<String>,

        /// Alternative tags accepted for this language
        #[arg(short, long)]
        alias: Vec<String>,

        /// Compiler program (omit for interpreted languages)
        #[arg(short, long)]
        compile: Option<String>,

        /// Compiler argument; repeat for each one ({source}, {binary}, {memory_mb} are substituted)
        #[arg(long = "compile-arg", allow_hyphen_values = true)]
        compile_args: Vec<String>,

        /// Program that runs the submission
        #[arg(short, long)]
        run: String,

        /// Run argument; repeat for each one
        #[arg(long = "run-arg", allow_hyphen_values = true)]
        run_args: Vec<String>,

        /// Let the runtime enforce memory itself (JVM-style)
        #[arg(long, default_value = "false")]
        no_address_space_limit: bool,

        /// Extra address space in MB when the runtime enforces memory itself
        #[arg(long, default_value = "0")]
        runtime_overhead_mb: u64,

        /// Languages config file
        #[arg(long, default_value = DEFAULT_LANGUAGES_PATH)]
        config: PathBuf,
    },

    /// Remove a language adapter from config/languages.json
    RemoveLang {
        /// Language name
        #[arg(short, long)]
        name: String,

        /// Skip confirmation
        #[arg(short, long, default_value = "false")]
        yes: bool,

        /// Languages config file
        #[arg(long, default_value = DEFAULT_LANGUAGES_PATH)]
        config: PathBuf,
    },

    /// List supported languages
    ListLangs {
        /// Languages config file
        #[arg(long, default_value = DEFAULT_LANGUAGES_PATH)]
        config: PathBuf,
    },

    /// Validate judge, language and exercise configuration
    CheckConfig {
        /// Judge config file (defaults to config/judge.json plus environment)
        #[arg(long)]
        judge_config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Judge {
            lang,
            source,
            tests,
            time,
            memory,
            json,
            languages,
        } => {
            let status = commands::judge(commands::JudgeArgs {
                language: &lang,
                source: &source,
                tests: &tests,
                time_limit_secs: time,
                memory_limit_mb: memory,
                json,
                languages: languages.as_deref(),
            })
            .await?;

            if status != SubmissionStatus::Accepted {
                std::process::exit(1);
            }
        }
        Commands::AddLang {
            name,
            source_file,
            version,
            binary,
            alias,
            compile,
            compile_args,
            run,
            run_args,
            no_address_space_limit,
            runtime_overhead_mb,
            config,
        } => {
            commands::add_language(
                &config,
                commands::NewLanguage {
                    name: &name,
                    version: &version,
                    source_file: &source_file,
                    binary: binary.as_deref(),
                    aliases: &alias,
                    compile: compile.as_deref(),
                    compile_args: &compile_args,
                    run: &run,
                    run_args: &run_args,
                    no_address_space_limit,
                    runtime_overhead_mb,
                },
            )?;
        }
        Commands::RemoveLang { name, yes, config } => {
            commands::remove_language(&config, &name, yes)?;
        }
        Commands::ListLangs { config } => {
            commands::list_languages(&config)?;
        }
        Commands::CheckConfig { judge_config } => {
            commands::check_config(judge_config.as_deref())?;
        }
    }

    Ok(())
}
