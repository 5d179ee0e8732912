use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use sluice_core::error::ConfigError;
use sluice_core::{Clock, LeaseQueue, RocksDbStorage, Storage, SystemClock};

#[derive(Parser)]
#[command(
    name = "sluice",
    about = "Sluice pipeline queue CLI",
    after_help = "The data directory is locked while sluice-server runs; stop it first."
)]
struct Cli {
    /// Pipeline data directory
    #[arg(long, env = "SLUICE_DATA_DIR", default_value = "data", global = true)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect queues
    #[command(subcommand)]
    Queue(QueueCommands),

    /// Manage a queue's dead letters
    #[command(subcommand)]
    Dlq(DlqCommands),
}

#[derive(Subcommand)]
enum QueueCommands {
    /// List all queues
    List,

    /// Show queue configuration and counts
    Inspect {
        /// Queue name
        name: String,
    },
}

#[derive(Subcommand)]
enum DlqCommands {
    /// List dead letters of a queue
    List {
        /// Source queue name
        queue: String,
    },

    /// Move dead letters back to their source queue with a fresh receive budget
    Redrive {
        /// Source queue name
        queue: String,

        /// Maximum number of messages to redrive (0 = all)
        #[arg(long, default_value = "0")]
        count: u64,
    },

    /// Delete dead letters past their retention
    Purge {
        /// Source queue name
        queue: String,

        /// Delete every dead letter, not only expired ones
        #[arg(long)]
        all: bool,
    },
}

fn open_storage(data_dir: &Path) -> Arc<dyn Storage> {
    match RocksDbStorage::open(data_dir) {
        Ok(storage) => Arc::new(storage),
        Err(e) => {
            eprintln!("Error: cannot open data directory {}: {e}", data_dir.display());
            process::exit(1);
        }
    }
}

fn open_queue(storage: &Arc<dyn Storage>, name: &str) -> LeaseQueue {
    match LeaseQueue::open_existing(name, Arc::clone(storage), Arc::new(SystemClock)) {
        Ok(queue) => queue,
        Err(ConfigError::UnknownQueue(_)) => {
            eprintln!("Error: queue \"{name}\" does not exist");
            process::exit(1);
        }
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}

fn fail(e: impl std::fmt::Display) -> ! {
    eprintln!("Error: {e}");
    process::exit(1);
}

fn plural(n: u64) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

fn cmd_queue_list(storage: &Arc<dyn Storage>) {
    let configs = storage.list_queues().unwrap_or_else(|e| fail(e));
    if configs.is_empty() {
        println!("No queues found.");
        return;
    }

    let name_width = configs
        .iter()
        .map(|q| q.name.len())
        .max()
        .unwrap_or(4)
        .max(4);

    println!(
        "{:<name_width$}  {:>7}  {:>9}  {:>7}  {:>12}",
        "NAME", "VISIBLE", "IN_FLIGHT", "DELAYED", "DEAD_LETTERS"
    );
    for config in configs {
        let name = config.name.clone();
        let queue = LeaseQueue::open(config, Arc::clone(storage), Arc::new(SystemClock))
            .unwrap_or_else(|e| fail(e));
        let stats = queue.stats().unwrap_or_else(|e| fail(e));
        println!(
            "{:<name_width$}  {:>7}  {:>9}  {:>7}  {:>12}",
            name, stats.visible, stats.in_flight, stats.delayed, stats.dead_letters
        );
    }
}

fn cmd_queue_inspect(storage: &Arc<dyn Storage>, name: String) {
    let queue = open_queue(storage, &name);
    let stats = queue.stats().unwrap_or_else(|e| fail(e));
    let config = queue.config();
    println!("Queue: {name}");
    println!("  Visibility timeout:  {} ms", config.visibility_timeout_ms);
    println!("  Max receive count:   {}", config.max_receive_count);
    println!(
        "  Dead-letter queue:   {}",
        config.dead_letter_queue.as_deref().unwrap_or("(disabled)")
    );
    println!("  DLQ retention:       {} ms", config.dead_letter_retention_ms);
    println!("  Visible:             {}", stats.visible);
    println!("  In-flight:           {}", stats.in_flight);
    println!("  Delayed:             {}", stats.delayed);
    println!("  Dead letters:        {}", stats.dead_letters);
}

fn cmd_dlq_list(storage: &Arc<dyn Storage>, name: String) {
    let queue = open_queue(storage, &name);
    let letters = queue.dead_letters().unwrap_or_else(|e| fail(e));
    if letters.is_empty() {
        println!("No dead letters in \"{name}\".");
        return;
    }

    let now = SystemClock.now_ns();
    println!("{:<36}  {:>8}  {:>9}  REASON", "ID", "RECEIVES", "AGE_SECS");
    for letter in &letters {
        let age_secs = now.saturating_sub(letter.dead_lettered_at) / 1_000_000_000;
        println!(
            "{:<36}  {:>8}  {:>9}  {}",
            letter.message.id, letter.message.delivery_count, age_secs, letter.reason
        );
    }
}

fn cmd_dlq_redrive(storage: &Arc<dyn Storage>, name: String, count: u64) {
    let queue = open_queue(storage, &name);
    let redriven = queue.redrive(count).unwrap_or_else(|e| fail(e));
    println!("Redrove {redriven} message{} into \"{name}\"", plural(redriven));
}

fn cmd_dlq_purge(storage: &Arc<dyn Storage>, name: String, all: bool) {
    let queue = open_queue(storage, &name);
    let purged = queue.purge_dead_letters(!all).unwrap_or_else(|e| fail(e));
    println!("Purged {purged} dead letter{} of \"{name}\"", plural(purged));
}

fn main() {
    let cli = Cli::parse();
    let storage = open_storage(&cli.data_dir);

    match cli.command {
        Commands::Queue(cmd) => match cmd {
            QueueCommands::List => cmd_queue_list(&storage),
            QueueCommands::Inspect { name } => cmd_queue_inspect(&storage, name),
        },
        Commands::Dlq(cmd) => match cmd {
            DlqCommands::List { queue } => cmd_dlq_list(&storage, queue),
            DlqCommands::Redrive { queue, count } => cmd_dlq_redrive(&storage, queue, count),
            DlqCommands::Purge { queue, all } => cmd_dlq_purge(&storage, queue, all),
        },
    }

    if let Err(e) = storage.flush() {
        fail(e);
    }
}
