// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

/// Command line tools for a custody node's data directory.
///
/// Query subcommands open the store read-only, so they can run next to a live node. `expire`
/// opens it for writing and runs one reclamation pass.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use stderrlog::Timestamp;

use custody_node::chain::ManualChainHeight;
use custody_node::chunk_store::ChunkStore;
use custody_node::merkle::MerkleProof;
use custody_node::retrieval::RetrievalServer;
use custody_node::{BatchHeaderHash, BatchStatus, BlobHeader, BlobIndex, NodeConfig, QuorumId};
use custody_node_storage::rocks::RocksBackend;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory of the node's store.
    #[arg(long, env = "CUSTODY_NODE_DATA_DIR", default_value = "./data/custody-node")]
    data_dir: PathBuf,

    /// JSON file with the node configuration. Unset fields take their defaults.
    #[arg(long, env = "CUSTODY_NODE_CONFIG")]
    config: Option<PathBuf>,

    /// Custody period in blocks. Overrides the config file.
    #[arg(long, env = "CUSTODY_NODE_CUSTODY_BLOCKS")]
    custody_blocks: Option<u64>,

    /// Request deadline in seconds. Overrides the config file.
    #[arg(long, env = "CUSTODY_NODE_TIMEOUT")]
    timeout: Option<u64>,

    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the chunks held for a blob in one quorum, one hex string per line.
    Chunks(BlobKey),
    /// Print a blob header and its inclusion proof as JSON.
    BlobHeader(BlobKey),
    /// Print the custody status of a batch as JSON.
    Status(StatusArgs),
    /// Remove every batch past its custody window.
    Expire(ExpireArgs),
}

#[derive(Args)]
struct BlobKey {
    #[arg(long)]
    batch: BatchHeaderHash,
    #[arg(long)]
    blob_index: BlobIndex,
    #[arg(long)]
    quorum: QuorumId,
    /// Chain height to evaluate custody at. Batches past custody are not served.
    #[arg(long)]
    current_block: u64,
}

#[derive(Args)]
struct StatusArgs {
    #[arg(long)]
    batch: BatchHeaderHash,
    /// Chain height to evaluate custody at.
    #[arg(long)]
    current_block: u64,
}

#[derive(Args)]
struct ExpireArgs {
    /// Chain height to evaluate custody at.
    #[arg(long)]
    current_block: u64,
}

#[derive(Debug, thiserror::Error)]
enum ConfigError {
    #[error("Failed to read config file {}", .0.display())]
    Read(PathBuf, #[source] std::io::Error),
    #[error("Invalid config file {}", .0.display())]
    Parse(PathBuf, #[source] serde_json::Error),
}

#[derive(Serialize)]
struct BlobHeaderReply {
    header: BlobHeader,
    proof: MerkleProof,
}

impl Cli {
    async fn node_config(&self) -> Result<NodeConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => load_config(path).await?,
            None => NodeConfig::default(),
        };
        if let Some(blocks) = self.custody_blocks {
            config.custody_period = blocks;
        }
        if let Some(secs) = self.timeout {
            config.request_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

async fn load_config(path: &Path) -> Result<NodeConfig, ConfigError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
    serde_json::from_slice(&bytes).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    stderrlog::new()
        .module(module_path!())
        .module("custody_node")
        .module("custody_node_storage")
        .verbosity(usize::from(cli.verbose) + 1)
        .timestamp(Timestamp::Millisecond)
        .init()?;

    let config = cli.node_config().await?;
    log::debug!("using {:?}", config);

    match &cli.command {
        Commands::Chunks(key) => {
            let retrieval = open_retrieval(&cli.data_dir, config, key.current_block)?;
            let chunks = retrieval
                .retrieve_chunks(&key.batch, key.blob_index, key.quorum)
                .await?;
            for chunk in chunks {
                println!("{}", hex::encode(chunk));
            }
        }
        Commands::BlobHeader(key) => {
            let retrieval = open_retrieval(&cli.data_dir, config, key.current_block)?;
            let (header, proof) = retrieval
                .get_blob_header(&key.batch, key.blob_index, key.quorum)
                .await?;
            let reply = BlobHeaderReply { header, proof };
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
        Commands::Status(args) => {
            let store = ChunkStore::new(
                RocksBackend::open_read_only(&cli.data_dir)?,
                config.storage_retry,
            );
            let status = match store.batch_record(&args.batch).await? {
                Some(record) => BatchStatus::of_record(&record, &config, args.current_block),
                None => BatchStatus::Unknown,
            };
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Expire(args) => {
            let store = ChunkStore::new(RocksBackend::open(&cli.data_dir)?, config.storage_retry);
            let removed = store
                .expire(args.current_block, config.custody_period)
                .await?;
            for hash in &removed {
                println!("{}", hash);
            }
            println!("expired {} batches", removed.len());
        }
    }

    Ok(())
}

fn open_retrieval(
    data_dir: &Path,
    config: NodeConfig,
    current_block: u64,
) -> anyhow::Result<RetrievalServer<RocksBackend>> {
    let store = ChunkStore::new(RocksBackend::open_read_only(data_dir)?, config.storage_retry);
    let chain = Arc::new(ManualChainHeight::new(current_block));
    Ok(RetrievalServer::new(store, chain, config))
}
