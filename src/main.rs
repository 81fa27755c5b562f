mod ai;
mod app;
mod bot;
mod config;
mod db;
mod discord;
mod error;
mod feed;
mod models;
mod pipeline;
mod services;

use app::App;
use config::Config;
use error::{AppError, Result};

/// Run mode selected on the command line.
#[derive(Debug, PartialEq, Eq)]
enum Mode {
    Bot,
    Fetch { reenrich: bool },
    Check,
    Prune { days: u32 },
}

fn parse_args(args: &[String]) -> Result<Mode> {
    match args.first().map(String::as_str) {
        None => Ok(Mode::Bot),
        Some("--fetch") => match args.get(1).map(String::as_str) {
            None => Ok(Mode::Fetch { reenrich: false }),
            Some("--reenrich") => Ok(Mode::Fetch { reenrich: true }),
            Some(other) => Err(AppError::InvalidInput(format!("unexpected argument {}", other))),
        },
        Some("--check") => Ok(Mode::Check),
        Some("--prune") => {
            let days = args
                .get(1)
                .ok_or_else(|| AppError::InvalidInput("--prune needs a number of days".to_string()))?;
            let days = days
                .parse()
                .map_err(|_| AppError::InvalidInput(format!("invalid number of days: {}", days)))?;
            Ok(Mode::Prune { days })
        }
        Some(other) => Err(AppError::InvalidInput(format!(
            "unknown argument {} (expected --fetch [--reenrich], --check or --prune <days>)",
            other
        ))),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mode = parse_args(&args)?;

    let config = Config::from_env()?;
    let app = App::new(config).await?;

    match mode {
        Mode::Bot => app.run_bot().await?,
        Mode::Fetch { reenrich } => {
            let stats = app.fetch_papers(reenrich).await?;
            println!(
                "Stored {} new and {} updated papers ({} already known, {} skipped)",
                stats.new,
                stats.updated,
                stats.duplicates,
                stats.skipped()
            );
        }
        Mode::Check => app.check().await?,
        Mode::Prune { days } => {
            let deleted = app.prune(days).await?;
            println!("Pruned {} papers older than {} days", deleted, days);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_run_modes() {
        assert_eq!(parse_args(&args(&[])).unwrap(), Mode::Bot);
        assert_eq!(parse_args(&args(&["--fetch"])).unwrap(), Mode::Fetch { reenrich: false });
        assert_eq!(
            parse_args(&args(&["--fetch", "--reenrich"])).unwrap(),
            Mode::Fetch { reenrich: true }
        );
        assert_eq!(parse_args(&args(&["--check"])).unwrap(), Mode::Check);
        assert_eq!(parse_args(&args(&["--prune", "90"])).unwrap(), Mode::Prune { days: 90 });
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(parse_args(&args(&["--prune"])).is_err());
        assert!(parse_args(&args(&["--prune", "soon"])).is_err());
        assert!(parse_args(&args(&["--fetch", "--all"])).is_err());
        assert!(parse_args(&args(&["--serve"])).is_err());
    }
}
