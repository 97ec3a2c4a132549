#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    dead_code
)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};
use webpilot::config::Config;

/// `webpilot` - drive a browser toward a goal with a vision model.
#[derive(Parser, Debug)]
#[command(name = "webpilot")]
#[command(version)]
#[command(about = "Vision-model browser navigator.", long_about = None)]
struct Cli {
    /// Config file (default: $WEBPILOT_CONFIG, then the per-user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List known models with capabilities and prices
    Models,

    /// Parse a model response into an action
    #[command(long_about = "\
Parse a model response into an action.

Reads the response from --file, or from stdin when omitted, and prints \
the parsed action as JSON together with the reasoning text before it.

Examples:
  echo 'Click login. ACTION: click(5)' | webpilot parse
  webpilot parse --file response.txt")]
    Parse {
        /// File holding the raw response text
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Run one navigation against a WebDriver browser
    #[command(long_about = "\
Run one navigation against a WebDriver browser.

Needs a running chromedriver or geckodriver (see [browser] in the \
config) and a binary built with the `browser-native` feature. Steps are \
logged, or POSTed to --callback-url when given. Ctrl-C aborts.

Examples:
  webpilot navigate --goal 'Find the pricing page' --start-url https://example.com
  webpilot navigate --goal 'Log in' --model gpt-4o --max-steps 15")]
    Navigate {
        /// What the agent should accomplish
        #[arg(long)]
        goal: String,
        /// Model id from `webpilot models` (default: config default_model)
        #[arg(long)]
        model: Option<String>,
        /// Page to open before the first step
        #[arg(long)]
        start_url: Option<String>,
        #[arg(long)]
        max_steps: Option<u32>,
        /// Receive step and completion events here
        #[arg(long)]
        callback_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    match cli.command {
        Commands::Models => {
            let config = Config::load(cli.config.as_deref()).await?;
            print_models(&config);
            Ok(())
        }
        Commands::Parse { file } => parse_response(file).await,
        Commands::Navigate {
            goal,
            model,
            start_url,
            max_steps,
            callback_url,
        } => {
            let config = Config::load(cli.config.as_deref()).await?;
            let request = webpilot::agent::NavigationRequest {
                goal,
                model: model.unwrap_or_else(|| config.default_model.clone()),
                api_key: None,
                max_steps,
                callback_url,
                target_id: None,
                start_url,
            };
            navigate(config, request).await
        }
    }
}

fn print_models(config: &Config) {
    let registry = config.registry();
    println!(
        "{:<20} {:<11} {:>9} {:>9} {:>10}  computer-use",
        "id", "provider", "in $/M", "out $/M", "context"
    );
    for spec in registry.list() {
        println!(
            "{:<20} {:<11} {:>9.2} {:>9.2} {:>10}  {}",
            spec.id,
            spec.provider,
            spec.input_cost_per_mtok,
            spec.output_cost_per_mtok,
            spec.max_context_tokens,
            if spec.supports_computer_use { "yes" } else { "no" }
        );
    }
}

async fn parse_response(file: Option<PathBuf>) -> Result<()> {
    let text = match file {
        Some(path) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read stdin")?;
            buf
        }
    };

    let (action, reasoning) = webpilot::actions::parse_with_reasoning(&text)?;
    let output = serde_json::json!({
        "action": action,
        "call": action.to_string(),
        "reasoning": reasoning,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[cfg(feature = "browser-native")]
async fn navigate(config: Config, request: webpilot::agent::NavigationRequest) -> Result<()> {
    use std::sync::Arc;
    use webpilot::agent::{HttpClientFactory, NavigationService, SharedPage};
    use webpilot::browser::native::WebDriverPage;
    use webpilot::browser::BrowserPage;

    let page = Arc::new(
        WebDriverPage::connect(&config.browser.webdriver_url, config.browser.headless).await?,
    );
    let shared: Arc<dyn BrowserPage> = page.clone();
    let service = NavigationService::new(
        Arc::new(config.registry()),
        Arc::new(HttpClientFactory::new(config.client_options())),
        Arc::new(SharedPage(shared)),
        config.service_settings(),
    );

    let accepted = service.accept(request).await?;
    let navigation_id = accepted.navigation_id.clone();
    let mut task = accepted.task;

    let result = tokio::select! {
        joined = &mut task => joined.context("navigation task failed")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!(%navigation_id, "Interrupted, aborting navigation");
            service.abort(&navigation_id);
            task.await.context("navigation task failed")?
        }
    };
    drop(service);

    println!("{}", serde_json::to_string_pretty(&result)?);
    close_when_unshared(page, WebDriverPage::close).await;
    Ok(())
}

/// Close `page` once this is its last handle. Returns whether it was closed.
async fn close_when_unshared<P, F>(page: std::sync::Arc<P>, close: impl FnOnce(P) -> F) -> bool
where
    F: std::future::Future<Output = Result<()>>,
{
    match std::sync::Arc::try_unwrap(page) {
        Ok(page) => {
            if let Err(err) = close(page).await {
                tracing::warn!(error = %format!("{err:#}"), "Failed to close browser session");
            }
            true
        }
        Err(page) => {
            tracing::warn!(
                handles = std::sync::Arc::strong_count(&page),
                "Browser session still in use after navigation; leaving it open"
            );
            false
        }
    }
}

#[cfg(not(feature = "browser-native"))]
async fn navigate(_config: Config, _request: webpilot::agent::NavigationRequest) -> Result<()> {
    anyhow::bail!("navigate needs a browser backend; rebuild with `--features browser-native`")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn navigate_args_parse() {
        let cli = Cli::try_parse_from([
            "webpilot",
            "navigate",
            "--goal",
            "find docs",
            "--max-steps",
            "7",
        ])
        .unwrap();
        match cli.command {
            Commands::Navigate { goal, max_steps, model, .. } => {
                assert_eq!(goal, "find docs");
                assert_eq!(max_steps, Some(7));
                assert!(model.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn page_is_closed_only_when_unshared() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let closed = Arc::new(AtomicBool::new(false));
        let close = |flag: Arc<AtomicBool>| async move {
            flag.store(true, Ordering::SeqCst);
            Ok::<(), anyhow::Error>(())
        };

        let page = Arc::new(closed.clone());
        let _held = page.clone();
        assert!(!close_when_unshared(page, close).await);
        assert!(!closed.load(Ordering::SeqCst));

        let page = Arc::new(closed.clone());
        assert!(close_when_unshared(page, close).await);
        assert!(closed.load(Ordering::SeqCst));
    }
}
