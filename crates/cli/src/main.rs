//! Command-line client for Tessera.

mod api_client;
mod plan;

use anyhow::{Context, Result};
use api_client::ApiClient;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use plan::{ChunkPlan, file_digest};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tessera_core::DEFAULT_CHUNK_SIZE;
use tessera_core::upload::{InitUploadRequest, MergeResponse};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

const DEFAULT_SERVER: &str = "http://127.0.0.1:8080";

#[derive(Parser)]
#[command(name = "tessera")]
#[command(about = "Resumable chunked uploads to a Tessera server")]
#[command(version)]
struct Cli {
    /// Server base URL
    #[arg(long, global = true, env = "TESSERA_SERVER", default_value = DEFAULT_SERVER)]
    server: String,

    /// First retry delay in milliseconds; later retries double it
    #[arg(long, global = true, env = "TESSERA_RETRY_DELAY_MS", default_value_t = 1000)]
    retry_delay_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file, resuming any earlier attempt for the same content
    Upload {
        /// File to upload
        file: PathBuf,

        /// Owner ID the upload belongs to
        #[arg(long)]
        owner: String,

        /// Chunk size in bytes
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: u64,

        /// Maximum chunks in flight at once
        #[arg(long, default_value_t = 4)]
        parallel: usize,

        /// Name stored on the server (defaults to the file's name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Show progress and missing chunks of an upload
    Status { owner: String, digest: String },
    /// Merge a fully uploaded file
    Merge { owner: String, digest: String },
    /// Show the record of a merged upload
    Record { owner: String, digest: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let Cli {
        server,
        retry_delay_ms,
        command,
    } = Cli::parse();
    let client = ApiClient::new(&server)?.with_retry_delay(Duration::from_millis(retry_delay_ms));

    match command {
        Commands::Upload {
            file,
            owner,
            chunk_size,
            parallel,
            name,
        } => handle_upload(&client, &file, &owner, chunk_size, parallel, name).await,
        Commands::Status { owner, digest } => handle_status(&client, &owner, &digest).await,
        Commands::Merge { owner, digest } => {
            let merged = client.merge(&owner, &digest).await?;
            print_merge(&merged);
            Ok(())
        }
        Commands::Record { owner, digest } => match client.record(&owner, &digest).await? {
            Some(record) => {
                println!("{}", serde_json::to_string_pretty(&record)?);
                Ok(())
            }
            None => anyhow::bail!("no merged upload for {owner}/{digest}"),
        },
    }
}

async fn handle_upload(
    client: &ApiClient,
    file: &Path,
    owner: &str,
    chunk_size: u64,
    parallel: usize,
    name: Option<String>,
) -> Result<()> {
    let file_name = match name {
        Some(name) => name,
        None => file
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .context("file path has no usable file name; pass --name")?,
    };
    let file_size = tokio::fs::metadata(file)
        .await
        .with_context(|| format!("failed to stat {}", file.display()))?
        .len();
    let plan = ChunkPlan::new(file_size, chunk_size)?;

    println!("Hashing {} ({} bytes)...", file.display(), file_size);
    let digest = file_digest(file).await?;

    let init = client
        .init_upload(&InitUploadRequest {
            owner_id: owner.to_string(),
            content_digest: digest.clone(),
            file_name,
            file_size,
            chunk_count: plan.chunk_count,
            chunk_size: Some(chunk_size),
        })
        .await?;

    if init.resumed {
        println!(
            "Resuming upload {owner}/{digest}: {}/{} chunks already uploaded ({:.2}%)",
            init.uploaded_chunks, init.chunk_count, init.progress
        );
        anyhow::ensure!(
            init.chunk_count == plan.chunk_count && init.file_size == file_size,
            "server session was created with a different layout ({} chunks, {} bytes); \
             wait for it to expire or upload with the original chunk size",
            init.chunk_count,
            init.file_size
        );
    } else {
        println!(
            "Started upload {owner}/{digest}: {} chunks of {} bytes",
            plan.chunk_count, chunk_size
        );
    }

    if init.need_upload {
        let status = client.upload_status(owner, &digest).await?;
        println!("Uploading {} missing chunks...", status.missing.len());
        upload_chunks(client, file, owner, &digest, &plan, &status.missing, parallel).await?;
    }

    let merged = client.merge(owner, &digest).await?;
    print_merge(&merged);
    Ok(())
}

async fn upload_chunks(
    client: &ApiClient,
    file: &Path,
    owner: &str,
    digest: &str,
    plan: &ChunkPlan,
    indices: &[u32],
    parallel: usize,
) -> Result<()> {
    let mut reader = tokio::fs::File::open(file)
        .await
        .with_context(|| format!("failed to open {}", file.display()))?;
    let parallel = parallel.max(1);
    let mut in_flight = FuturesUnordered::new();

    for &index in indices {
        let (offset, len) = plan.chunk_range(index);
        let len = usize::try_from(len)
            .map_err(|_| anyhow::anyhow!("chunk size exceeds platform limits"))?;
        let mut data = vec![0u8; len];
        reader.seek(std::io::SeekFrom::Start(offset)).await?;
        reader.read_exact(&mut data).await?;

        let client = client.clone();
        in_flight.push(async move {
            let response = client
                .upload_chunk(owner, digest, index, Bytes::from(data))
                .await
                .with_context(|| format!("chunk {index} failed"))?;
            println!(
                "  chunk {index}: {} ({:.2}%)",
                response.message, response.progress
            );
            anyhow::Ok(())
        });

        if in_flight.len() >= parallel
            && let Some(result) = in_flight.next().await
        {
            result?;
        }
    }

    while let Some(result) = in_flight.next().await {
        result?;
    }

    Ok(())
}

async fn handle_status(client: &ApiClient, owner: &str, digest: &str) -> Result<()> {
    let status = client.upload_status(owner, digest).await?;
    println!("File:     {} ({} bytes)", status.file_name, status.file_size);
    println!(
        "Progress: {}/{} chunks ({:.2}%)",
        status.uploaded_count, status.chunk_count, status.progress
    );
    println!("Expires:  {}", status.expires_at);
    if status.missing.is_empty() {
        println!("All chunks uploaded, ready to merge");
    } else {
        println!("Missing:  {:?}", status.missing);
    }
    Ok(())
}

fn print_merge(merged: &MergeResponse) {
    println!(
        "Merged {} -> {} ({} bytes, {}) in {} ms",
        merged.file_name,
        merged.final_path,
        merged.file_size,
        merged.content_type,
        merged.merge_duration_ms
    );
    for warning in &merged.warnings {
        eprintln!("warning: {}", warning.message);
    }
}
