mod config;
mod database;
mod error;
mod services;

use config::AppConfig;
use error::AppError;
use std::str::FromStr;

const USAGE: &str = "Usage: expense-sync [--config <path>] <command>

Commands:
  run            keep draining the upload queue until Ctrl-C
  drain          run one drain cycle and exit
  status         print queue counts as JSON
  list           list queued photo uploads
  reset-stuck    force every in-flight upload back to pending
  clear-stuck    delete failed and stale uploads with their photos
  clear-all      delete every queued upload and its photo
  purge-orphans  delete cached photos no upload or draft refers to";

/// Subcommands of the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Run,
    Drain,
    Status,
    List,
    ResetStuck,
    ClearStuck,
    ClearAll,
    PurgeOrphans,
}

impl FromStr for Command {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run" => Ok(Command::Run),
            "drain" => Ok(Command::Drain),
            "status" => Ok(Command::Status),
            "list" => Ok(Command::List),
            "reset-stuck" => Ok(Command::ResetStuck),
            "clear-stuck" => Ok(Command::ClearStuck),
            "clear-all" => Ok(Command::ClearAll),
            "purge-orphans" => Ok(Command::PurgeOrphans),
            other => Err(AppError::Validation(format!("Unknown command '{}'", other))),
        }
    }
}

/// Parsed command line: optional config path plus one command
#[derive(Debug, PartialEq)]
struct Args {
    config: Option<String>,
    command: Command,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args, AppError> {
    let mut config = None;
    let mut command = None;
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                config = Some(args.next().ok_or_else(|| {
                    AppError::Validation("--config needs a path".to_string())
                })?);
            }
            _ if command.is_none() => command = Some(arg.parse()?),
            _ => return Err(AppError::Validation(format!("Unexpected argument '{}'", arg))),
        }
    }
    Ok(Args {
        config,
        command: command.unwrap_or(Command::Run),
    })
}

async fn execute(command: Command, config: &AppConfig) -> Result<(), AppError> {
    match command {
        Command::Run => services::background_sync::run(config).await,
        Command::Drain => {
            let report = services::background_sync::drain_once(config).await?;
            println!(
                "{} uploaded, {} failed, {} attempted",
                report.processed, report.failed, report.total
            );
            Ok(())
        }
        Command::Status => {
            let queue = database::open_queue(config)?;
            let status = queue.status().current();
            let json = serde_json::to_string_pretty(&status)
                .map_err(|e| AppError::Other(format!("JSON encode failed: {}", e)))?;
            println!("{}", json);
            if let Some(summary) = status.summary() {
                println!("{}", summary);
            }
            Ok(())
        }
        Command::List => {
            let queue = database::open_queue(config)?;
            let tasks = queue.all_tasks()?;
            if tasks.is_empty() {
                println!("No queued uploads");
            }
            for task in tasks {
                println!(
                    "{}  {:<9}  retries {}  {}  updated {}{}",
                    task.upload_id,
                    task.status.as_str(),
                    task.retries,
                    task.filename,
                    task.updated_at
                        .with_timezone(&chrono::Local)
                        .format("%Y-%m-%d %H:%M:%S"),
                    task.last_error
                        .map(|e| format!("  ({})", e))
                        .unwrap_or_default()
                );
            }
            Ok(())
        }
        Command::ResetStuck => {
            let n = database::open_queue(config)?.reset_all_uploading()?;
            println!("{} upload(s) reset to pending", n);
            Ok(())
        }
        Command::ClearStuck => {
            let n = database::open_queue(config)?.clear_stuck()?;
            println!("{} upload(s) removed", n);
            Ok(())
        }
        Command::ClearAll => {
            let n = database::open_queue(config)?.clear_all()?;
            println!("{} upload(s) removed", n);
            Ok(())
        }
        Command::PurgeOrphans => {
            let n = database::open_queue(config)?.purge_orphan_blobs()?;
            println!("{} cached photo(s) removed", n);
            Ok(())
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}\n\n{}", e.user_message(), USAGE);
            std::process::exit(2);
        }
    };

    let path = config::config_path(args.config.as_deref());
    let result = match AppConfig::load(&path) {
        Ok(config) => execute(args.command, &config).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        log::error!("{}", e);
        eprintln!("{}", e.user_message());
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<Args, AppError> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_parse_args() {
        assert_eq!(
            args(&[]).unwrap(),
            Args {
                config: None,
                command: Command::Run
            }
        );
        assert_eq!(
            args(&["--config", "/etc/es.toml", "clear-stuck"]).unwrap(),
            Args {
                config: Some("/etc/es.toml".to_string()),
                command: Command::ClearStuck
            }
        );
        assert_eq!(args(&["status"]).unwrap().command, Command::Status);
    }

    #[test]
    fn test_parse_args_errors() {
        assert!(matches!(args(&["upload"]), Err(AppError::Validation(_))));
        assert!(matches!(args(&["--config"]), Err(AppError::Validation(_))));
        assert!(matches!(args(&["drain", "now"]), Err(AppError::Validation(_))));
    }
}
