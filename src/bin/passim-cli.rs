//! Thin D-Bus client for the passim control-plane object: list, publish,
//! and unpublish items without going through the GLib client library this
//! crate's distillation named as an external collaborator.

use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use zbus::zvariant::Fd;

use passim::control::{ItemRecord, PublishAttrs, OBJECT_PATH, WELL_KNOWN_NAME};

#[derive(Parser)]
#[clap(name = "passim-cli", about = "Control a running passim daemon")]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List every item currently held by the daemon.
    List,
    /// Publish a file for sharing.
    Publish {
        path: PathBuf,
        #[clap(long)]
        max_age: Option<u32>,
        #[clap(long)]
        share_limit: Option<u32>,
        #[clap(long)]
        next_reboot: bool,
    },
    /// Remove a previously published item by its hash.
    Unpublish { hash: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let connection = zbus::Connection::system().await?;
    let proxy = zbus::Proxy::new(&connection, WELL_KNOWN_NAME, OBJECT_PATH, WELL_KNOWN_NAME).await?;

    match args.command {
        Command::List => {
            let items: Vec<ItemRecord> = proxy.call("GetItems", &()).await?;
            for item in items {
                println!(
                    "{}  {:>10}  {}/{}  {}",
                    item.hash, item.size, item.share_count, item.share_limit, item.filename
                );
            }
        }
        Command::Publish {
            path,
            max_age,
            share_limit,
            next_reboot,
        } => {
            let file = std::fs::File::open(&path)?;
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let attrs = PublishAttrs {
                filename,
                max_age,
                share_limit,
                next_reboot: Some(next_reboot),
            };
            let fd = Fd::from(file.as_raw_fd());
            proxy.call("Publish", &(fd, attrs)).await?;
        }
        Command::Unpublish { hash } => {
            proxy.call("Unpublish", &(hash,)).await?;
        }
    }

    Ok(())
}
