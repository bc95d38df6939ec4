use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;

use shardfs::cadapter::s3::{S3Config, S3Store};
use shardfs::codec::{ErasurePolicy, ReedSolomonCodec};
use shardfs::fuse::FuseFs;
use shardfs::fuse::mount::mount_unprivileged;
use shardfs::tree::DeleteMarkerVisibility;
use shardfs::vfs::{FsOptions, ObjectFs};

#[derive(Parser)]
#[command(name = "shardfs", about = "S3-backed FUSE filesystem with erasure coding")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mount the bucket namespace onto an empty directory.
    Mount {
        /// Mount point (must exist and be empty)
        mountpoint: PathBuf,
        /// Local cache root; defaults to the user cache directory
        #[arg(long)]
        cache: Option<PathBuf>,
        /// S3-compatible endpoint URL (e.g. http://127.0.0.1:9000)
        #[arg(long)]
        endpoint: Option<String>,
        /// Store region
        #[arg(long, default_value = "us-east-1")]
        region: String,
        /// Upload files whole instead of erasure-encoding them on flush
        #[arg(long)]
        no_encode: bool,
        /// Erasure policy file: `k m technique w packet_size buffer_size`
        #[arg(long, default_value = "erasure_policy")]
        policy: PathBuf,
        /// Show version delete markers as empty entries
        #[arg(long)]
        show_delete_markers: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Command::Mount {
            mountpoint,
            cache,
            endpoint,
            region,
            no_encode,
            policy,
            show_delete_markers,
        } => {
            let policy = match ErasurePolicy::load(&policy) {
                Ok(policy) => policy,
                Err(e) if no_encode => {
                    info!("no erasure policy file ({e}); using defaults for decode");
                    ErasurePolicy::default()
                }
                Err(e) => {
                    eprintln!("cannot read erasure policy {}: {e}", policy.display());
                    std::process::exit(1);
                }
            };
            let cache_root = cache.unwrap_or_else(|| {
                dirs::cache_dir()
                    .unwrap_or_else(std::env::temp_dir)
                    .join("shardfs")
            });
            let staging_root = std::env::temp_dir().join("shardfs-coding");

            let store = S3Store::new(S3Config {
                endpoint_url: endpoint,
                region,
                ..S3Config::default()
            })
            .await;
            let codec = ReedSolomonCodec::from_policy(&policy);
            let fs = ObjectFs::new(
                store,
                codec,
                FsOptions {
                    cache_root: cache_root.clone(),
                    staging_root,
                    encode: !no_encode,
                    policy,
                    delete_markers: if show_delete_markers {
                        DeleteMarkerVisibility::Visible
                    } else {
                        DeleteMarkerVisibility::Hidden
                    },
                },
            );

            let handle = match mount_unprivileged(FuseFs::new(fs), &mountpoint).await {
                Ok(handle) => handle,
                Err(e) => {
                    eprintln!("mount failed: {e}");
                    std::process::exit(1);
                }
            };
            info!(
                "mounted shardfs at {} (cache: {})",
                mountpoint.display(),
                cache_root.display()
            );
            if let Err(e) = handle.await {
                eprintln!("fuse session ended with error: {e}");
                std::process::exit(1);
            }
        }
    }
}
