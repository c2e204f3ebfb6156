//! StreamVerse node and streaming CLI.
//!
//! Commands:
//!   serve     Run the payment-gated chunk server
//!   register  Add a media file to the asset catalog
//!   stream    Play an asset from a node into a file, paying per chunk
//!   keygen    Create a payer key
//!   info      Print an asset's layout and price

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use streamverse_client::{
    FileSink, HttpChunkSource, RetryPolicy, SessionOutcome, StreamSession, VoucherWallet,
};
use streamverse_core::payment::format_units;
use streamverse_core::storage::FsObjectStore;
use streamverse_node::catalog::{self, RegisterRequest};
use streamverse_node::cli::{Cli, Commands};
use streamverse_node::state::{self, AppState};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match &cli.command {
        Commands::Serve => {
            let state = AppState::open(cli.node_config())?;
            streamverse_node::serve(state, cli.http_port).await
        }

        Commands::Register {
            file,
            duration,
            chunk_duration,
            price,
            title,
        } => {
            let objects = FsObjectStore::new(state::objects_dir(&cli.storage_dir))
                .context("opening object store")?;
            let mut entries = catalog::load_catalog(&cli.storage_dir)?;
            let (entry, new) = catalog::register(
                &cli.storage_dir,
                &objects,
                &mut entries,
                RegisterRequest {
                    file: file.clone(),
                    duration_secs: *duration,
                    chunk_duration_secs: *chunk_duration,
                    price_per_chunk: price.unwrap_or(cli.price),
                    title: title.clone(),
                },
            )
            .with_context(|| format!("registering {}", file.display()))?;
            if !new {
                println!("Already registered.");
            }
            let plan = entry.plan();
            println!("Asset:   {}", entry.content_address);
            println!("Size:    {} bytes", entry.size_bytes);
            println!(
                "Chunks:  {} x {}s",
                plan.count(),
                entry.chunk_duration_secs
            );
            println!(
                "Price:   {} per chunk, {} total",
                format_units(entry.price_per_chunk),
                format_units(entry.total_price())
            );
            Ok(())
        }

        Commands::Stream {
            server,
            asset,
            output,
            key_file,
            max_retries,
            start_at,
            budget,
        } => {
            let source = HttpChunkSource::new(server)?;
            let mut wallet = match key_file {
                Some(path) => VoucherWallet::from_key_file(path)?,
                None => {
                    warn!("no --key-file given; paying with a throwaway key");
                    VoucherWallet::generate()
                }
            };
            if let Some(budget) = budget {
                wallet = wallet.with_budget(*budget);
            }
            info!(payer = %wallet.payer(), server = %source.base_url(), %asset, "starting stream");

            let policy = RetryPolicy {
                max_retries: *max_retries,
                ..RetryPolicy::default()
            };
            let mut session = StreamSession::new(asset.clone(), source, wallet, FileSink::new(output))
                .with_policy(policy)
                .starting_at(*start_at);

            let control = session.control();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    control.stop();
                }
            });

            let outcome = session.run().await;
            let paid = format_units(session.total_paid());
            match outcome {
                Ok(SessionOutcome::Completed { chunks }) => {
                    println!(
                        "Streamed {} chunks into {} ({} paid, {} receipts)",
                        chunks,
                        output.display(),
                        paid,
                        session.receipts().len()
                    );
                    Ok(())
                }
                Ok(SessionOutcome::Paused { next_index } | SessionOutcome::Stopped { next_index }) => {
                    println!("Stopped before chunk {next_index} ({paid} paid). Resume with --start-at {next_index}.");
                    Ok(())
                }
                Err(e) => {
                    let next = session.next_index();
                    Err(anyhow::Error::new(e).context(format!(
                        "stream failed at chunk {next} ({paid} paid); resume with --start-at {next}"
                    )))
                }
            }
        }

        Commands::Keygen { out } => {
            let payer = streamverse_client::wallet::keygen(out)?;
            println!("Payer key written to {}", out.display());
            println!("Payer: {payer}");
            Ok(())
        }

        Commands::Info { server, asset } => {
            use streamverse_client::ChunkSource;
            let info = HttpChunkSource::new(server)?.info(asset).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
    }
}
