// CLI commands for running code and managing language configuration
use anyhow::{bail, Context, Result};
use polyglot_common::types::{ExecutionEvent, ExecutionRequest};
use polyglot_engine::backend::BackendOptions;
use polyglot_engine::{
    ClientKey, Coordinator, CoordinatorOptions, LanguageConfigManager, Ledger, RateLimiter,
};
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use which::which;

const LANGUAGES_JSON: &str = "config/languages.json";

/// Run a snippet locally, echoing output as it is produced.
///
/// Returns whether the execution succeeded.
pub async fn run_code(
    config_path: &Path,
    language: &str,
    file: Option<&Path>,
    code: Option<String>,
    timeout_ms: Option<u64>,
) -> Result<bool> {
    let code = match (file, code) {
        (Some(path), _) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        (None, Some(code)) => code,
        (None, None) => bail!("Provide code with --code or --file"),
    };

    let languages = LanguageConfigManager::load_or_default(config_path)?;
    let coordinator = Coordinator::new(
        &languages,
        &BackendOptions::default(),
        RateLimiter::unlimited(),
        Arc::new(Ledger::new()),
        CoordinatorOptions::default(),
    )?;

    let mut request = ExecutionRequest::new(language, code);
    request.timeout_ms = timeout_ms;

    let mut stream = coordinator
        .execute_streaming(&ClientKey::local(), request)
        .await?;

    let mut succeeded = false;
    while let Some(event) = stream.next().await {
        match event {
            ExecutionEvent::Started { execution_id } => {
                eprintln!("→ Running {} ({})", stream.language, execution_id);
            }
            ExecutionEvent::Stdout { data } => {
                print!("{}", data);
                io::stdout().flush()?;
            }
            ExecutionEvent::Stderr { data } => {
                eprint!("{}", data);
            }
            ExecutionEvent::Completed {
                success,
                execution_time_ms,
                error,
                failure_kind,
                ..
            } => {
                succeeded = success;
                if success {
                    eprintln!("✅ Completed in {} ms", execution_time_ms);
                } else {
                    let kind = failure_kind.map(|k| k.to_string()).unwrap_or_default();
                    eprintln!("❌ Failed ({}) after {} ms", kind, execution_time_ms);
                    if let Some(error) = error {
                        eprintln!("{}", error.trim_end());
                    }
                }
            }
            ExecutionEvent::Failed { error, .. } => {
                eprintln!("❌ Could not run: {}", error);
            }
        }
    }

    Ok(succeeded)
}

/// List all configured languages
pub fn list_languages(config_path: &Path) -> Result<()> {
    let languages = LanguageConfigManager::load_or_default(config_path)?;

    println!("📋 Configured Languages:\n");
    println!("{:<12} {:<12} {:<16} {:<10}", "Name", "Backend", "Toolchain", "Installed");
    println!("{}", "─".repeat(54));

    for language in languages.list_languages() {
        let config = languages.get_config(&language)?;
        let (toolchain, installed) = match config.toolchain_program() {
            Some(program) => (
                program.to_string(),
                if which(program).is_ok() { "yes" } else { "no" },
            ),
            None => ("(embedded)".to_string(), "yes"),
        };
        println!(
            "{:<12} {:<12} {:<16} {:<10}",
            language,
            config.backend.to_string(),
            toolchain,
            installed
        );
    }

    println!("\n✅ Total: {} language(s)", languages.list_languages().len());
    Ok(())
}

/// Write the built-in language configuration under `path`
pub fn init_project(path: &Path, force: bool) -> Result<()> {
    println!("🚀 Initializing Polyglot project at: {}", path.display());

    let config_dir = path.join("config");
    fs::create_dir_all(&config_dir)
        .with_context(|| format!("Failed to create directory: {}", config_dir.display()))?;

    let languages_json_path = path.join(LANGUAGES_JSON);
    if languages_json_path.exists() && !force {
        println!("  ⚠️  Skipped: {} already exists (use --force to overwrite)", LANGUAGES_JSON);
        return Ok(());
    }

    let json_content = LanguageConfigManager::builtin().to_json_pretty()?;
    fs::write(&languages_json_path, json_content)
        .with_context(|| format!("Failed to write {}", languages_json_path.display()))?;
    println!("  ✅ Created: {}", LANGUAGES_JSON);

    println!("✅ Project initialized successfully!");
    println!("\n📋 Next steps:");
    println!("  1. Adjust commands in {} for your toolchains", LANGUAGES_JSON);
    println!("  2. Check installed toolchains: polyglot-cli languages");
    println!("  3. Start the API: LANGUAGES_CONFIG={} polyglot-api", LANGUAGES_JSON);

    Ok(())
}
