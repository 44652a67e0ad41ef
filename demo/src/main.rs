//! optistack pet-store demo
//!
//! Loads the pet list from an in-process server, observes it, then adds
//! each pet given on the command line concurrently. Every notification the
//! observer receives is printed, so the optimistic entry and its
//! replacement (or rollback) are visible.
//!
//! Usage:
//!   optistack-demo --latency-ms 300 Rex Luna:CAT
//!   optistack-demo --fail Rex

use anyhow::{Context, Result};
use clap::Parser;
use optistack_client::{Client, FetchPolicy, QueryState};
use optistack_demo::{DemoConfig, NewPet, PetServer, PetType, add_pet_request, all_pets_query, describe_pets, pet_schema};
use serde_json::json;
use std::{fs, path::PathBuf, sync::Arc};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "optistack-demo")]
#[command(about = "Adds pets through an optimistic client and prints every notification")]
struct Args {
    /// Simulated server latency in milliseconds
    #[arg(short, long)]
    latency_ms: Option<u64>,

    /// Make the server reject every mutation
    #[arg(long)]
    fail: bool,

    /// JSON file with `client` and `server` settings
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Pets to add, as NAME or NAME:TYPE (DOG or CAT)
    #[arg(required = true)]
    pets: Vec<NewPet>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    let mut config = load_config(args.config.as_ref())?;
    if let Some(latency_ms) = args.latency_ms {
        config.server.latency_ms = latency_ms;
    }
    if args.fail {
        config.server.fail_mutations = true;
    }

    let server = Arc::new(PetServer::with_pets(
        config.server.clone(),
        vec![("Tom", PetType::Cat), ("Fido", PetType::Dog)],
    ));
    let client = Client::new(pet_schema(), server.clone(), config.client.clone());

    let pets = client
        .query(&all_pets_query(), &json!({}), FetchPolicy::CacheFirst)
        .await
        .context("Failed to load pets")?;
    println!("initial      {}", describe_pets(&pets));

    let mut subscription = client.observe(&all_pets_query(), &json!({})).await?;
    let printer = tokio::spawn(async move {
        let mut received = 0usize;
        while let Some(notification) = subscription.recv().await {
            received += 1;
            match &notification.state {
                QueryState::Ready(data) => println!("revision {:<3} {}", notification.revision, describe_pets(data)),
                QueryState::Missing(path) => println!("revision {:<3} <incomplete at {path}>", notification.revision),
            }
        }
        received
    });

    let handles: Vec<_> = args
        .pets
        .into_iter()
        .map(|pet| {
            let client = client.clone();
            tokio::spawn(async move {
                let result = client.mutate(add_pet_request(&pet.name, pet.kind)).await;
                (pet, result)
            })
        })
        .collect();

    let mut added = 0usize;
    for handle in handles {
        let (pet, result) = handle.await.context("Mutation task panicked")?;
        match result {
            Ok(committed) => {
                added += 1;
                info!("{} added as Pet:{} ({})", pet.name, committed.data.add_pet.id, committed.id);
            }
            Err(e) => warn!("{} not added: {}", pet.name, e),
        }
    }

    let final_list = client.read_query(&all_pets_query(), &json!({})).await?;
    client.dispose().await;
    let notifications = printer.await.context("Printer task panicked")?;

    println!("\n========================================");
    println!("  final        {}", describe_pets(&final_list));
    println!("  added        {added}");
    println!("  server pets  {}", server.pets().await.len());
    println!("  notified     {notifications}");
    println!("========================================\n");
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<DemoConfig> {
    let Some(path) = path else {
        return Ok(DemoConfig::default());
    };
    info!("Loading config from {:?}", path);
    let text = fs::read_to_string(path).context("Failed to read config file")?;
    DemoConfig::from_json(&text).context("Failed to parse config file")
}
