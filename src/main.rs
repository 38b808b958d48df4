// src/main.rs

use anyhow::{Context, Result};
use apprelay::{
    AppId, AppRelayConfig, FamilyResolver, PublishRequest, PublishStatus, RotationController,
    compare_versions, is_locked,
};
use clap::{Parser, Subcommand};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "apprelay")]
#[command(author, version, about = "Publish application versions and rotate their deployments", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare two version strings
    Compare {
        a: String,
        b: String,
    },
    /// Check whether a version is blocked by a lock pattern
    LockCheck {
        version: String,
        /// Wildcard pattern, e.g. 19.42.2.x
        pattern: Option<String>,
    },
    /// List the versions of an application family
    Family {
        /// Application display name
        name: String,
        /// Configuration file
        #[arg(short, long, default_value = "/etc/apprelay/apprelay.toml")]
        config: PathBuf,
    },
    /// Publish newly registered versions into their families
    Publish {
        /// Configuration file
        #[arg(short, long, default_value = "/etc/apprelay/apprelay.toml")]
        config: PathBuf,
        /// Application to publish as NAME=ID (repeatable)
        #[arg(long = "app", value_name = "NAME=ID", required = true, value_parser = parse_app_arg)]
        apps: Vec<(String, String)>,
        /// Publish even when locked or already present
        #[arg(long)]
        force: bool,
        /// Print outcomes as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Split `NAME=ID` at the last `=`
fn parse_app_arg(s: &str) -> std::result::Result<(String, String), String> {
    match s.rsplit_once('=') {
        Some((name, id)) if !name.trim().is_empty() && !id.trim().is_empty() => {
            Ok((name.trim().to_string(), id.trim().to_string()))
        }
        _ => Err(format!("expected NAME=ID, got '{}'", s)),
    }
}

fn ordering_symbol(ordering: Ordering) -> &'static str {
    match ordering {
        Ordering::Less => "<",
        Ordering::Equal => "=",
        Ordering::Greater => ">",
    }
}

fn cmd_family(name: &str, config_path: &Path) -> Result<()> {
    let config = AppRelayConfig::load(config_path)?;
    let directory = config.graph_directory()?;
    let family = FamilyResolver::new(&directory, config.retry_policies().query).resolve(name)?;

    if family.is_empty() {
        println!("No versions of '{}' found", name);
        return Ok(());
    }
    for (index, member) in family.members().iter().enumerate() {
        println!(
            "  [{}] {} {} ({}) created {}",
            index,
            member.display_name,
            member.version,
            member.id,
            member.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    if !family.is_compact() {
        println!("Family names are out of order; the next publish will rename them");
    }
    Ok(())
}

fn cmd_publish(config_path: &Path, apps: Vec<(String, String)>, force: bool, json: bool) -> Result<()> {
    let config = AppRelayConfig::load(config_path)?;
    let directory = config.graph_directory()?;
    let controller = RotationController::new(&directory, config.retry_policies());

    let requests: Vec<PublishRequest> = apps
        .into_iter()
        .map(|(name, id)| {
            let mut policy = config.policy_for(&name);
            policy.force |= force;
            PublishRequest {
                name,
                app_id: AppId::new(id),
                policy,
            }
        })
        .collect();

    info!("Publishing {} applications", requests.len());
    let outcomes = controller.publish_batch(&requests, config.publish.parallel);

    if json {
        let report = serde_json::to_string_pretty(&outcomes).context("Failed to encode outcomes")?;
        println!("{}", report);
    } else {
        for outcome in &outcomes {
            println!("{}", outcome);
        }
    }

    let failed = outcomes.iter().filter(|o| o.is_failed()).count();
    let degraded = outcomes
        .iter()
        .filter(|o| o.status == PublishStatus::Degraded)
        .count();
    if failed > 0 {
        anyhow::bail!("{} of {} publishes failed", failed, outcomes.len());
    }
    if degraded > 0 {
        eprintln!("{} publishes left residue; re-run to finish them", degraded);
    }
    Ok(())
}

fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Compare { a, b }) => {
            println!("{}", ordering_symbol(compare_versions(&a, &b)));
            Ok(())
        }
        Some(Commands::LockCheck { version, pattern }) => {
            if is_locked(&version, pattern.as_deref())? {
                println!("locked");
            } else {
                println!("allowed");
            }
            Ok(())
        }
        Some(Commands::Family { name, config }) => cmd_family(&name, &config),
        Some(Commands::Publish {
            config,
            apps,
            force,
            json,
        }) => cmd_publish(&config, apps, force, json),
        None => {
            // No command provided, show help
            println!("apprelay v{}", env!("CARGO_PKG_VERSION"));
            println!("Run 'apprelay --help' for usage information");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_app_arg() {
        assert_eq!(
            parse_app_arg("Contoso Viewer=1a2b").unwrap(),
            ("Contoso Viewer".to_string(), "1a2b".to_string())
        );
        assert_eq!(
            parse_app_arg("A=B=c3").unwrap(),
            ("A=B".to_string(), "c3".to_string())
        );
        assert!(parse_app_arg("no-separator").is_err());
        assert!(parse_app_arg("=id").is_err());
        assert!(parse_app_arg("name=").is_err());
    }

    #[test]
    fn test_ordering_symbol() {
        assert_eq!(ordering_symbol(compare_versions("1.02", "1.2")), "=");
        assert_eq!(ordering_symbol(compare_versions("1.2.1", "1.2")), ">");
        assert_eq!(ordering_symbol(compare_versions("1.2.1", "1.2.a")), "<");
    }

    #[test]
    fn test_cli_parses_publish() {
        let cli = Cli::try_parse_from([
            "apprelay", "publish", "--config", "relay.toml", "--app", "Tool=abc", "--app", "Other=def", "--json",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Publish { apps, json, force, .. }) => {
                assert_eq!(apps.len(), 2);
                assert!(json);
                assert!(!force);
            }
            _ => panic!("expected publish"),
        }
    }

    #[test]
    fn test_publish_requires_app() {
        assert!(Cli::try_parse_from(["apprelay", "publish"]).is_err());
    }
}
