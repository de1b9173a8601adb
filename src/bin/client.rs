//! SFTP client command-line tool.
//!
//! Run with: `cargo run --bin snow-owl-sftp-client -- --host ... <command>`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use snow_owl_sftp_client::backend::RusshSigner;
use snow_owl_sftp_client::{AuthMethod, Client, ClientConfig};
use tracing::error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server host
    #[arg(short = 'H', long, default_value = "localhost")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = 22)]
    port: u16,

    /// Username
    #[arg(short, long, default_value = "user")]
    username: String,

    /// Path to an SSH private key. Ignored if `--password` is given.
    #[arg(short = 'i', long, default_value = "~/.ssh/id_rsa")]
    identity: PathBuf,

    /// Authenticate with a password instead of the identity file.
    #[arg(long)]
    password: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upload a file
    Put { local: PathBuf, remote: String },
    /// Download a file
    Get { remote: String, local: PathBuf },
    /// Append bytes from a local file to a remote file
    Append { local: PathBuf, remote: String },
    /// List directory contents
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Print a file or directory's attributes
    Stat { path: String },
    /// Create a remote directory
    Mkdir {
        path: String,
        /// Create missing parent directories
        #[arg(short, long)]
        recursive: bool,
    },
    /// Remove a remote file
    Rm { path: String },
    /// Remove a remote directory
    Rmdir {
        path: String,
        /// Remove non-empty directories by deleting their contents first
        #[arg(short, long)]
        recursive: bool,
    },
    /// Rename or move a remote file or directory
    Rename { old: String, new: String },
    /// Change a remote file's permission bits (octal, e.g. 644)
    Chmod { path: String, mode: String },
    /// Canonicalize a remote path
    Realpath { path: String },
    /// Recursively upload a local directory
    UploadDir { local: PathBuf, remote: String },
    /// Recursively download a remote directory
    DownloadDir { remote: String, local: PathBuf },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = if args.verbose { "debug,russh=info" } else { "info,russh=warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let auth = match build_auth(&args) {
        Ok(auth) => auth,
        Err(err) => {
            error!("failed to prepare credentials: {err}");
            std::process::exit(1);
        }
    };

    let config = ClientConfig::new(args.host.as_str(), args.username.as_str()).with_auth(auth);
    let config = ClientConfig { port: args.port, ..config };

    let client = match Client::connect(config).await {
        Ok(client) => client,
        Err(err) => {
            error!("failed to connect: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = run_command(&client, args.command).await {
        error!("operation failed: {err}");
        let _ = client.end(Duration::from_secs(5)).await;
        std::process::exit(1);
    }

    if let Err(err) = client.end(Duration::from_secs(5)).await {
        error!("disconnect error: {err}");
        std::process::exit(1);
    }
}

fn build_auth(args: &Args) -> Result<AuthMethod, Box<dyn std::error::Error>> {
    if let Some(password) = &args.password {
        return Ok(AuthMethod::Password(password.clone()));
    }

    let identity_path = expand_tilde(&args.identity);
    let signer = RusshSigner::from_file(&identity_path)?;
    Ok(AuthMethod::PrivateKey(Arc::new(signer)))
}

fn expand_tilde(path: &std::path::Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}

async fn run_command(client: &Client, command: Commands) -> snow_owl_sftp_client::Result<()> {
    match command {
        Commands::Put { local, remote } => {
            let bytes = client.put(&local, &remote).await?;
            println!("uploaded {bytes} bytes");
        }
        Commands::Get { remote, local } => {
            let bytes = client.get(&remote, &local).await?;
            println!("downloaded {bytes} bytes");
        }
        Commands::Append { local, remote } => {
            let data = tokio::fs::read(&local).await?;
            client.append(&remote, &data).await?;
            println!("appended {} bytes", data.len());
        }
        Commands::Ls { path } => {
            let entries = client.list(&path, None).await?;
            for entry in entries {
                match entry.attrs.size {
                    Some(size) => println!("{:>12}  {}", size, entry.filename),
                    None => println!("{:>12}  {}", "-", entry.filename),
                }
            }
        }
        Commands::Stat { path } => {
            let attrs = client.stat(&path).await?;
            println!("{attrs:?}");
        }
        Commands::Mkdir { path, recursive } => client.mkdir(&path, recursive).await?,
        Commands::Rm { path } => client.delete(&path).await?,
        Commands::Rmdir { path, recursive } => client.rmdir(&path, recursive).await?,
        Commands::Rename { old, new } => client.rename(&old, &new).await?,
        Commands::Chmod { path, mode } => {
            let mode = u32::from_str_radix(&mode, 8).map_err(|e| snow_owl_sftp_client::Error::Config(format!("invalid mode: {e}")))?;
            client.chmod(&path, mode).await?;
        }
        Commands::Realpath { path } => {
            let resolved = client.realpath(&path).await?;
            println!("{resolved}");
        }
        Commands::UploadDir { local, remote } => client.upload_dir(&local, &remote, None).await?,
        Commands::DownloadDir { remote, local } => client.download_dir(&remote, &local, None).await?,
    }
    Ok(())
}
