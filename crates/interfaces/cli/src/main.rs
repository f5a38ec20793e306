mod commands;
mod prompt;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vaultward_core::VaultwardError;

use crate::commands::VaultContext;

#[derive(Debug, Parser)]
#[command(
    name = "vaultward",
    version,
    about = "Safely apply, audit and roll back batched edits to a notes vault"
)]
struct Cli {
    /// Vault root. Defaults to `vault.path` from the config, then `VAULT_PATH`,
    /// then the current directory.
    #[arg(long, global = true)]
    vault: Option<PathBuf>,
    /// Explicit config file instead of `vaultward.toml` discovery.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply an action plan (JSON) to the vault.
    Apply {
        #[arg(value_name = "PLAN")]
        plan: PathBuf,
        /// Accept the batch and any B2 overrides without asking.
        #[arg(long)]
        yes: bool,
        /// Skip the batch confirmation step.
        #[arg(long)]
        non_interactive: bool,
        /// Allow B2 actions (each still needs its own confirmation).
        #[arg(long)]
        allow_b2: bool,
        /// Clear a write lease left behind by a dead process.
        #[arg(long)]
        reclaim_stale: bool,
        /// Print the run record as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Reverse all or part of an earlier run.
    Rollback {
        run_id: String,
        /// Only records touching this vault-relative file.
        #[arg(long)]
        file: Option<PathBuf>,
        /// Only records produced by this action id.
        #[arg(long)]
        action: Option<String>,
        #[arg(long)]
        reclaim_stale: bool,
        #[arg(long)]
        json: bool,
    },
    /// Inspect the run ledger.
    Runs {
        #[command(subcommand)]
        command: RunsCommands,
    },
    /// Check vault, lease, offline marker, version control and ledger health.
    Doctor,
    /// Apply the retention limits to the run ledger now.
    Prune {
        #[arg(long)]
        max_runs: Option<usize>,
        #[arg(long)]
        max_days: Option<u64>,
        #[arg(long)]
        max_mb: Option<u64>,
    },
    /// Write a default `vaultward.toml` into the vault root.
    InitConfig {
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Subcommand)]
enum RunsCommands {
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Show {
        run_id: String,
    },
}

/// Process exit codes. Scripts depend on these values.
mod exit {
    pub const OK: u8 = 0;
    pub const FAILURE: u8 = 1;
    pub const CONFLICTS: u8 = 2;
    pub const VCS_DIRTY: u8 = 10;
    pub const STARVATION: u8 = 11;
    pub const LEASE_DENIED: u8 = 12;
    pub const USAGE: u8 = 20;
    pub const SCHEMA: u8 = 30;
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<VaultwardError>() {
        Some(VaultwardError::LeaseHeld { .. } | VaultwardError::LiveLeaseReclaim { .. }) => exit::LEASE_DENIED,
        Some(VaultwardError::SchemaMismatch { .. }) => exit::SCHEMA,
        Some(
            VaultwardError::InvalidPlan(_)
            | VaultwardError::RunNotFound(_)
            | VaultwardError::RollbackRejected(_)
            | VaultwardError::PathEscapesVault(_)
            | VaultwardError::Serialization(_),
        ) => exit::USAGE,
        _ => exit::FAILURE,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() { exit::USAGE } else { exit::OK };
            let _ = err.print();
            return ExitCode::from(code);
        }
    };

    let context = match VaultContext::resolve(cli.vault, cli.config) {
        Ok(context) => context,
        Err(err) => {
            eprintln!("error: {err:#}");
            return ExitCode::from(exit::USAGE);
        }
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&context.config.telemetry.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    tracing::debug!(vault = %context.vault.display(), state_dir = %context.state_dir().display(), "resolved vault");

    let result = match cli.command {
        Commands::Apply {
            plan,
            yes,
            non_interactive,
            allow_b2,
            reclaim_stale,
            json,
        } => {
            commands::apply(
                &context,
                commands::ApplyArgs {
                    plan,
                    yes,
                    non_interactive,
                    allow_b2,
                    reclaim_stale,
                    json,
                },
            )
            .await
        }
        Commands::Rollback {
            run_id,
            file,
            action,
            reclaim_stale,
            json,
        } => commands::rollback(&context, &run_id, file, action, reclaim_stale, json).await,
        Commands::Runs { command } => match command {
            RunsCommands::List { limit } => commands::runs_list(&context, limit.max(1)),
            RunsCommands::Show { run_id } => commands::runs_show(&context, &run_id),
        },
        Commands::Doctor => commands::doctor(&context).await,
        Commands::Prune {
            max_runs,
            max_days,
            max_mb,
        } => commands::prune(&context, max_runs, max_days, max_mb).await,
        Commands::InitConfig { force } => commands::init_config(&context, force),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_and_schema_errors_map_to_exit_codes() {
        let held = anyhow::Error::new(VaultwardError::LeaseHeld {
            holder: "h".to_string(),
            pid: 1,
            host: "localhost".to_string(),
            expires_at: "later".to_string(),
            stale: false,
        });
        assert_eq!(exit_code_for(&held), exit::LEASE_DENIED);

        let schema = anyhow::Error::new(VaultwardError::SchemaMismatch {
            record: "run-log",
            found: "2".to_string(),
        });
        assert_eq!(exit_code_for(&schema), exit::SCHEMA);

        let rejected = anyhow::Error::new(VaultwardError::RollbackRejected("partial".to_string()));
        assert_eq!(exit_code_for(&rejected), exit::USAGE);
        assert_eq!(exit_code_for(&anyhow::anyhow!("other")), exit::FAILURE);
    }

    #[test]
    fn cli_parses_rollback_filters() {
        let cli = Cli::try_parse_from(["vaultward", "rollback", "run_1", "--file", "notes/x.md", "--action", "a1"])
            .unwrap();
        match cli.command {
            Commands::Rollback { run_id, file, action, .. } => {
                assert_eq!(run_id, "run_1");
                assert_eq!(file, Some(PathBuf::from("notes/x.md")));
                assert_eq!(action.as_deref(), Some("a1"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
