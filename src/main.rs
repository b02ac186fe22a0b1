use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use riji::{EntryId, EntryStore};

#[derive(Parser)]
#[command(name = "riji", about = "A personal diary kept in a single transactional store file", version)]
struct Cli {
  /// Path to the diary file
  #[arg(long, env = "RIJI_DB", default_value = "diary.db", global = true)]
  db: PathBuf,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Add a new entry
  Add {
    title: String,
    content: String,
  },
  /// List all entries, oldest first
  List,
  /// Show one entry
  Show { id: EntryId },
  /// Delete one entry
  Delete { id: EntryId },
}

fn run(cli: Cli) -> riji::Result<()> {
  let entries = EntryStore::open(&cli.db)?;
  match cli.command {
    Commands::Add { title, content } => {
      let id = entries.create_entry(&title, &content)?;
      println!("Entry added successfully! ID: {id}");
    }
    Commands::List => {
      let all = entries.list_entries()?;
      println!("=== ALL DIARY ENTRIES ===");
      for (count, entry) in all.iter().enumerate() {
        println!("\n--- Entry {} (ID: {}) ---", count + 1, entry.id);
        println!("{entry}");
        println!("----------------------");
      }
      if all.is_empty() {
        println!("No entries found. Start writing your diary!");
      } else {
        println!("Total entries: {}", all.len());
      }
    }
    Commands::Show { id } => {
      let entry = entries.read_entry(id)?;
      println!("--- Entry (ID: {id}) ---");
      println!("{entry}");
      println!("----------------------");
    }
    Commands::Delete { id } => {
      entries.delete_entry(id)?;
      println!("Entry {id} deleted successfully!");
    }
  }
  entries.close()
}

fn main() -> ExitCode {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
    )
    .with_writer(std::io::stderr)
    .init();

  match run(Cli::parse()) {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      eprintln!("Error: {err}");
      ExitCode::FAILURE
    }
  }
}
