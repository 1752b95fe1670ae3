use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::{fs, sync::Arc};

use anyhow::{Context, Result, bail};
use clap::Parser;
use completion::CompletionAdapter;
use config::{ConfigStore, RelayConfig};
use core_types::PromptMessage;
use provider_openai::HttpChatCompletions;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Stream a chat completion from an OpenAI-compatible endpoint.
#[derive(Debug, Parser)]
#[command(name = "relay", version)]
struct Cli {
    /// Directory holding config.json (defaults to the platform config dir).
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Base URL of the OpenAI-compatible API, e.g. http://localhost:11434/v1.
    #[arg(long)]
    endpoint: Option<String>,

    #[arg(long, short)]
    model: Option<String>,

    #[arg(long)]
    max_tokens: Option<u32>,

    /// Optional system message sent before the prompt.
    #[arg(long, short)]
    system: Option<String>,

    /// Print only the assembled text once the stream has finished.
    #[arg(long, short)]
    quiet: bool,

    /// Prompt text; words are joined with spaces.
    #[arg(required = true)]
    prompt: Vec<String>,
}

impl Cli {
    fn apply_to(&self, config: &mut RelayConfig) {
        if let Some(endpoint) = &self.endpoint {
            config.endpoint = endpoint.clone();
        }
        if let Some(model) = &self.model {
            config.model = Some(model.clone());
        }
        if let Some(max_tokens) = self.max_tokens {
            config.max_tokens = Some(max_tokens);
        }
    }

    fn messages(&self) -> Vec<PromptMessage> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = self.system.as_deref().filter(|s| !s.trim().is_empty()) {
            messages.push(PromptMessage::system(system));
        }
        messages.push(PromptMessage::user(self.prompt.join(" ")));
        messages
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let store = match &cli.config_dir {
        Some(dir) => ConfigStore::from_dir(dir),
        None => match ConfigStore::from_default_location() {
            Ok(store) => store,
            Err(err) => {
                eprintln!("relay: {err:#}");
                return ExitCode::FAILURE;
            }
        },
    };
    let log_dir = store
        .path()
        .parent()
        .map(|dir| dir.join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"));
    let _log_guard = init_local_logger(&log_dir);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to create tokio runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(&cli, &store)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("relay failed: {err:#}");
            eprintln!("relay: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli, store: &ConfigStore) -> Result<()> {
    let mut config = store.load_or_init()?;
    config.apply_process_env();
    cli.apply_to(&mut config);
    if config.endpoint.trim().is_empty() {
        bail!("no endpoint configured; set --endpoint or RELAY_ENDPOINT");
    }
    info!(
        endpoint = %config.endpoint,
        model = config.model.as_deref().unwrap_or_default(),
        config = %store.path().display(),
        "evaluating prompt"
    );

    let transport = HttpChatCompletions::new(config.endpoint.clone(), config.api_key.clone())
        .with_extra_headers(config.extra_headers.clone());
    let adapter = CompletionAdapter::with_transport(Arc::new(transport), config.model.clone());

    let mut options = config.eval_options();
    if !cli.quiet {
        options = options.on_token(|token| {
            let mut stdout = io::stdout().lock();
            let _ = stdout.write_all(token.as_bytes());
            let _ = stdout.flush();
        });
    }

    let text = adapter.evaluate(&cli.messages(), options).await?;

    let mut stdout = io::stdout().lock();
    if cli.quiet {
        stdout.write_all(text.as_bytes()).context("failed to write output")?;
    }
    writeln!(stdout).context("failed to write output")?;
    Ok(())
}

fn init_local_logger(log_dir: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    if let Err(err) = fs::create_dir_all(log_dir) {
        eprintln!("failed to create log dir `{}`: {err}", log_dir.display());
    }
    let file_appender = tracing_appender::rolling::daily(log_dir, "relay.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,relay=debug,completion=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_writer(writer)
        .init();

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_system_and_user_messages() {
        let cli = Cli::parse_from(["relay", "--system", "be terse", "write", "a", "haiku"]);
        assert_eq!(
            cli.messages(),
            vec![
                PromptMessage::system("be terse"),
                PromptMessage::user("write a haiku")
            ]
        );
    }

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from([
            "relay",
            "--endpoint",
            "http://localhost:11434/v1",
            "--model",
            "llama3",
            "--max-tokens",
            "64",
            "hi",
        ]);
        let mut config = RelayConfig::default();
        cli.apply_to(&mut config);
        assert_eq!(config.endpoint, "http://localhost:11434/v1");
        assert_eq!(config.model.as_deref(), Some("llama3"));
        assert_eq!(config.max_tokens, Some(64));
    }

    #[test]
    fn prompt_is_required() {
        assert!(Cli::try_parse_from(["relay"]).is_err());
    }
}
