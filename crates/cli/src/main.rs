//! Dietshop CLI - Database migrations and reconciliation tools.
//!
//! # Usage
//!
//! ```bash
//! # Run storefront database migrations
//! dietshop migrate
//!
//! # Inspect and replay the reconciliation queue
//! dietshop reconcile list
//! dietshop reconcile retry --limit 100
//!
//! # Grant a product by hand
//! dietshop grant --user <user-id> --email a@x.com --product diet_42 --price 99
//! ```

#![cfg_attr(not(test), forbid(unsafe_code))]

use clap::{Parser, Subcommand};
use rust_decimal::Decimal;

mod commands;

#[derive(Parser)]
#[command(name = "dietshop")]
#[command(author, version, about = "Dietshop CLI tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run storefront database migrations
    Migrate,
    /// Inspect or replay queued grants and guest transfers
    Reconcile {
        #[command(subcommand)]
        action: ReconcileAction,
    },
    /// Grant a product to an account by hand
    Grant {
        /// Account user ID
        #[arg(short, long)]
        user: String,

        /// Account email (used if the customer document does not exist yet)
        #[arg(short, long)]
        email: String,

        /// Product ID
        #[arg(short, long)]
        product: String,

        /// Price paid, counted toward the account's total spent
        #[arg(long)]
        price: Decimal,
    },
}

#[derive(Subcommand)]
enum ReconcileAction {
    /// List open tasks, oldest first
    List {
        #[arg(short, long, default_value_t = 50)]
        limit: u32,
    },
    /// Replay open tasks now
    Retry {
        #[arg(short, long, default_value_t = 50)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let result: Result<(), Box<dyn std::error::Error>> = run(cli).await;

    if let Err(e) = result {
        tracing::error!("Command failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Migrate => commands::migrate::storefront().await?,
        Commands::Reconcile { action } => match action {
            ReconcileAction::List { limit } => commands::reconcile::list(limit).await?,
            ReconcileAction::Retry { limit } => commands::reconcile::retry(limit).await?,
        },
        Commands::Grant {
            user,
            email,
            product,
            price,
        } => {
            commands::grant::grant(&user, &email, &product, price).await?;
        }
    }
    Ok(())
}
