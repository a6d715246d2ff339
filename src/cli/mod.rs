mod dispatch;
mod serve;

use std::path::PathBuf;

use anyhow::Result;
use console::style;

use crate::core::config::{AppConfig, default_config_path};
use crate::core::terminal::{self, print_error};

fn print_help() {
    terminal::print_banner();

    println!("  {}", style("Commands").bold().underlined());
    for (cmd, desc) in [
        ("serve", "Run the job API server (and the in-process cron, if configured)"),
        ("dispatch", "Run one pass over due scheduled jobs and print the summary"),
        ("help", "Show this help"),
    ] {
        println!("    {:<10} {}", style(cmd).green(), desc);
    }

    println!("\n  {}", style("Options").bold().underlined());
    for (flag, desc) in [
        ("--config <path>", "Config file (default: $FUNNEL_SWIPER_CONFIG or the data dir)"),
        ("--host <addr>", "Bind address for serve"),
        ("--port <port>", "Port for serve"),
    ] {
        println!("    {:<18} {}", style(flag).cyan(), desc);
    }

    println!(
        "\n {} {} <command> [options]\n",
        style("Usage:").bold(),
        style("funnel-swiper").green()
    );
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CliFlags {
    pub config: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

pub(crate) fn parse_flags(args: &[String], start: usize) -> CliFlags {
    let mut flags = CliFlags::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    flags.config = Some(PathBuf::from(&args[i + 1]));
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--host" => {
                if i + 1 < args.len() {
                    flags.host = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--port" => {
                if i + 1 < args.len() {
                    flags.port = args[i + 1].parse().ok();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    flags
}

async fn load_config(flags: &CliFlags) -> Result<AppConfig> {
    let path = flags.config.clone().unwrap_or_else(default_config_path);
    let mut config = AppConfig::load(Some(&path)).await?;
    if let Some(host) = &flags.host {
        config.server.host = host.clone();
    }
    if let Some(port) = flags.port {
        config.server.port = port;
    }
    Ok(config)
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let cmd = args.get(1).map(String::as_str).unwrap_or("help");

    match cmd {
        "serve" => {
            let flags = parse_flags(&args, 2);
            let log_tx = crate::logging::init_tracing(false);
            let config = load_config(&flags).await?;
            serve::run_server(config, log_tx).await
        }
        "dispatch" => {
            let flags = parse_flags(&args, 2);
            crate::logging::init_tracing(false);
            let config = load_config(&flags).await?;
            dispatch::run_dispatch(config).await
        }
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other => {
            print_error(&format!("Unknown command '{other}'."));
            print_help();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_flags_reads_config_host_and_port() {
        let args = argv(&[
            "funnel-swiper",
            "serve",
            "--config",
            "/etc/fs.toml",
            "--host",
            "0.0.0.0",
            "--port",
            "19000",
        ]);
        let flags = parse_flags(&args, 2);
        assert_eq!(flags.config, Some(PathBuf::from("/etc/fs.toml")));
        assert_eq!(flags.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(flags.port, Some(19000));
    }

    #[test]
    fn parse_flags_ignores_dangling_and_invalid_values() {
        let args = argv(&["funnel-swiper", "serve", "--port", "not-a-port", "--host"]);
        let flags = parse_flags(&args, 2);
        assert_eq!(flags, CliFlags::default());
    }

    #[tokio::test]
    async fn flags_override_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fs.toml");
        tokio::fs::write(&path, "[server]\nhost = \"10.0.0.1\"\nport = 8000\n")
            .await
            .unwrap();
        let flags = CliFlags {
            config: Some(path),
            host: None,
            port: Some(9001),
        };
        let config = load_config(&flags).await.unwrap();
        assert_eq!(config.server.host, "10.0.0.1");
        assert_eq!(config.server.port, 9001);
    }
}
