//! Cadence CLI: operator interface for executions, concurrency limits and
//! trigger locks.
//!
//! Every command opens the shared SQLite database, so the CLI can run next to
//! any number of scheduler processes pointed at the same file.

use cadence_cli::commands::{self, FlowArgs, TriggerArgs, TriggerFilterArgs};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

/// Cadence CLI: execution admission control and trigger locks
#[derive(Parser)]
#[command(name = "cadence", version, about = "Cadence CLI: execution admission control and trigger locks")]
pub struct Cli {
    /// Path to the SQLite database file
    #[arg(long, env = "CADENCE_DB_PATH", default_value = "cadence.db")]
    db: String,

    /// Identity stamped on the triggers this process evaluates
    #[arg(long, env = "CADENCE_WORKER_ID", default_value = "cadence-worker")]
    worker_id: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage triggers and their evaluation locks
    Trigger {
        #[command(subcommand)]
        action: TriggerAction,
    },

    /// Manage per-flow concurrency limits
    Concurrency {
        #[command(subcommand)]
        action: ConcurrencyAction,
    },

    /// Inspect and drive executions
    Execution {
        #[command(subcommand)]
        action: ExecutionAction,
    },

    /// Evaluate due triggers
    Scheduler {
        #[command(subcommand)]
        action: SchedulerAction,
    },
}

#[derive(Subcommand)]
enum TriggerAction {
    /// List triggers matching a filter
    List {
        #[command(flatten)]
        filter: TriggerFilterArgs,
    },
    /// Create a trigger or update its schedule
    Register {
        #[command(flatten)]
        trigger: TriggerArgs,
        /// Next execution date (RFC 3339); defaults to now
        #[arg(long)]
        next: Option<DateTime<Utc>>,
        /// Register the trigger disabled
        #[arg(long)]
        disabled: bool,
    },
    /// Clear the evaluation lock of a trigger
    Unlock {
        #[command(flatten)]
        trigger: TriggerArgs,
    },
    /// Clear the evaluation lock of every matching trigger
    UnlockAll {
        #[command(flatten)]
        filter: TriggerFilterArgs,
    },
    /// Clear the lock and make the trigger due immediately
    Restart {
        #[command(flatten)]
        trigger: TriggerArgs,
    },
    /// Disable a trigger
    Disable {
        #[command(flatten)]
        trigger: TriggerArgs,
    },
    /// Enable a trigger
    Enable {
        #[command(flatten)]
        trigger: TriggerArgs,
    },
    /// Enable or disable every matching trigger
    SetDisabled {
        #[command(flatten)]
        filter: TriggerFilterArgs,
        /// New disabled flag
        #[arg(long = "set", action = clap::ArgAction::Set)]
        value: bool,
    },
    /// Delete a trigger
    Delete {
        #[command(flatten)]
        trigger: TriggerArgs,
    },
    /// Delete every matching trigger
    DeleteAll {
        #[command(flatten)]
        filter: TriggerFilterArgs,
    },
}

#[derive(Subcommand)]
enum ConcurrencyAction {
    /// List the limits of a tenant
    List {
        #[arg(long, env = "CADENCE_TENANT", default_value = "main")]
        tenant: String,
    },
    /// Show the limit and queue of a flow
    Get {
        #[command(flatten)]
        flow: FlowArgs,
    },
    /// Overwrite limit and running counter (drift repair)
    Set {
        #[command(flatten)]
        flow: FlowArgs,
        #[arg(long)]
        limit: u32,
        #[arg(long)]
        running: u32,
    },
    /// Set the limit, keeping the running counter
    Configure {
        #[command(flatten)]
        flow: FlowArgs,
        #[arg(long)]
        limit: u32,
    },
    /// Remove the limit of a flow
    Delete {
        #[command(flatten)]
        flow: FlowArgs,
    },
}

#[derive(Subcommand)]
enum ExecutionAction {
    /// Show an execution
    Get {
        /// Execution ID
        id: String,
    },
    /// List executions of a tenant
    List {
        #[arg(long, env = "CADENCE_TENANT", default_value = "main")]
        tenant: String,
        #[arg(long)]
        namespace: Option<String>,
        #[arg(long)]
        flow: Option<String>,
        /// Only executions currently in this state
        #[arg(long)]
        state: Option<String>,
        /// Sort field: createdAt or duration
        #[arg(long, default_value = "createdAt")]
        sort: String,
        /// asc or desc
        #[arg(long, default_value = "asc")]
        order: String,
    },
    /// Create a manual execution
    Submit {
        #[command(flatten)]
        flow: FlowArgs,
        #[arg(long, default_value_t = 1)]
        revision: u32,
        /// Label as key=value (repeatable)
        #[arg(long = "label")]
        labels: Vec<String>,
    },
    /// Fire a trigger now
    Fire {
        #[command(flatten)]
        trigger: TriggerArgs,
    },
    /// Report a state change
    Transition {
        /// Execution ID
        id: String,
        /// New state (e.g. SUCCESS)
        #[arg(long)]
        state: String,
    },
    /// Move a queued execution to RUNNING, CANCELLED or FAILED
    Unqueue {
        /// Execution ID
        id: String,
        #[arg(long, default_value = "RUNNING")]
        state: String,
    },
}

#[derive(Subcommand)]
enum SchedulerAction {
    /// Fire every due trigger once
    Tick,
    /// Run the scheduler loop until Ctrl-C
    Run {
        /// Seconds between ticks
        #[arg(long, default_value_t = 1)]
        interval: u64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence_core=info,cadence_cli=info".into()),
        )
        .init();

    let state = commands::init_state(&cli.db, &cli.worker_id);

    let result = match cli.command {
        Commands::Trigger { action } => match action {
            TriggerAction::List { filter } => commands::trigger::list(&state, &filter.filter()).await,
            TriggerAction::Register {
                trigger,
                next,
                disabled,
            } => {
                let next = next.unwrap_or_else(Utc::now);
                commands::trigger::register(&state, trigger.key(), Some(next), disabled).await
            }
            TriggerAction::Unlock { trigger } => commands::trigger::unlock(&state, &trigger.key()).await,
            TriggerAction::UnlockAll { filter } => {
                commands::trigger::unlock_all(&state, &filter.filter()).await
            }
            TriggerAction::Restart { trigger } => commands::trigger::restart(&state, &trigger.key()).await,
            TriggerAction::Disable { trigger } => {
                commands::trigger::set_disabled(&state, &trigger.key(), true).await
            }
            TriggerAction::Enable { trigger } => {
                commands::trigger::set_disabled(&state, &trigger.key(), false).await
            }
            TriggerAction::SetDisabled { filter, value } => {
                commands::trigger::set_disabled_all(&state, &filter.filter(), value).await
            }
            TriggerAction::Delete { trigger } => commands::trigger::delete(&state, &trigger.key()).await,
            TriggerAction::DeleteAll { filter } => {
                commands::trigger::delete_all(&state, &filter.filter()).await
            }
        },

        Commands::Concurrency { action } => match action {
            ConcurrencyAction::List { tenant } => commands::concurrency::list(&state, &tenant).await,
            ConcurrencyAction::Get { flow } => commands::concurrency::get(&state, &flow.key()).await,
            ConcurrencyAction::Set { flow, limit, running } => {
                commands::concurrency::set(&state, &flow.key(), limit, running).await
            }
            ConcurrencyAction::Configure { flow, limit } => {
                commands::concurrency::configure(&state, &flow.key(), limit).await
            }
            ConcurrencyAction::Delete { flow } => commands::concurrency::delete(&state, &flow.key()).await,
        },

        Commands::Execution { action } => match action {
            ExecutionAction::Get { id } => commands::execution::get(&state, &id).await,
            ExecutionAction::List {
                tenant,
                namespace,
                flow,
                state: status,
                sort,
                order,
            } => {
                commands::execution::list(&state, &tenant, namespace, flow, status.as_deref(), &sort, &order)
                    .await
            }
            ExecutionAction::Submit {
                flow,
                revision,
                labels,
            } => commands::execution::submit(&state, &flow.key(), revision, &labels).await,
            ExecutionAction::Fire { trigger } => commands::execution::fire(&state, &trigger.key()).await,
            ExecutionAction::Transition { id, state: to } => {
                commands::execution::transition(&state, &id, &to).await
            }
            ExecutionAction::Unqueue { id, state: to } => commands::execution::unqueue(&state, &id, &to).await,
        },

        Commands::Scheduler { action } => match action {
            SchedulerAction::Tick => commands::scheduler::tick(&state).await,
            SchedulerAction::Run { interval } => commands::scheduler::run(&state, interval).await,
        },
    };

    match result {
        Ok(value) => commands::print_json(&value),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
