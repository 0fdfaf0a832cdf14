use clap::{Parser, Subcommand};
use colored::Colorize;
use std::process::ExitCode;
use tokmon_core::config::LoggingConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

mod commands;

use commands::{cmd_cost, cmd_pricing, cmd_serve, load_serve_config, OutputFormat};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "tokmon-beam")]
#[command(version = VERSION)]
#[command(about = "tokmon-beam - real-time relay and cost aggregation for LLM API traffic")]
#[command(long_about = r#"
tokmon-beam accepts chat exchanges from an instrumentation agent, keeps one
running cost and token summary per conversation, and relays every update to
connected WebSocket observers.

Run 'tokmon-beam serve' (or just 'tokmon-beam') with WSS_PORT set to start
the relay and the ingest API on one port.
"#)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the relay and ingest gateway until Ctrl+C (default)")]
    Serve {
        #[arg(short, long, help = "Listen port, overrides WSS_PORT")]
        port: Option<u16>,

        #[arg(long, help = "Listen address, overrides relay.host")]
        host: Option<String>,
    },

    #[command(about = "Show the built-in model pricing table")]
    Pricing {
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    #[command(about = "Compute the cost of a single exchange")]
    Cost {
        #[arg(short, long, help = "Model name (e.g., gpt-4o, claude-3-opus)")]
        model: String,

        #[arg(short, long, help = "Prompt tokens")]
        prompt: u64,

        #[arg(short, long, help = "Completion tokens")]
        completion: u64,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    #[command(about = "Show version information")]
    Version,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &LoggingConfig, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
    };

    let fmt_layer = if config.json_format {
        fmt::layer().json().with_current_span(true).boxed()
    } else {
        fmt::layer().with_target(false).boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let command = cli.command.unwrap_or(Commands::Serve {
        port: None,
        host: None,
    });

    match command {
        Commands::Serve { port, host } => {
            let config = load_serve_config(port, host)?;
            init_logging(&config.logging, cli.verbose);
            cmd_serve(config).await
        }
        Commands::Pricing { format } => {
            init_logging(&quiet_logging(), cli.verbose);
            cmd_pricing(format)
        }
        Commands::Cost {
            model,
            prompt,
            completion,
            format,
        } => {
            init_logging(&quiet_logging(), cli.verbose);
            cmd_cost(&model, prompt, completion, format)
        }
        Commands::Version => {
            println!("tokmon-beam {}", VERSION);
            Ok(())
        }
    }
}

fn quiet_logging() -> LoggingConfig {
    LoggingConfig {
        level: "warn".to_string(),
        json_format: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_is_default() {
        let cli = Cli::parse_from(["tokmon-beam"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_cost_args() {
        let cli = Cli::parse_from([
            "tokmon-beam",
            "cost",
            "--model",
            "gpt-4",
            "--prompt",
            "1000",
            "--completion",
            "500",
        ]);
        match cli.command {
            Some(Commands::Cost {
                model,
                prompt,
                completion,
                format,
            }) => {
                assert_eq!(model, "gpt-4");
                assert_eq!(prompt, 1000);
                assert_eq!(completion, 500);
                assert_eq!(format, OutputFormat::Text);
            }
            _ => panic!("expected cost command"),
        }
    }
}
