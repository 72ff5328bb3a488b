use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use stowage_driver::{Driver, UrlOptions};

mod config;
use crate::config::Config;

const READ_BUFFER_SIZE: usize = 1 << 20;

#[derive(Parser)]
struct Cli {
    #[arg(short, long)]
    config_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload a file (or stdin) through a multipart writer.
    Put {
        path: String,
        /// Read from this file instead of stdin.
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Continue the upload already in flight for this path.
        #[arg(long)]
        append: bool,
        /// Leave the upload in flight instead of committing it.
        #[arg(long)]
        no_commit: bool,
    },
    /// Write the content at a path to stdout.
    Get {
        path: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },
    Stat {
        path: String,
    },
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    Rm {
        path: String,
    },
    Mv {
        source: String,
        destination: String,
    },
    /// Print a presigned download URL.
    Url {
        path: String,
        /// Minutes until the URL expires.
        #[arg(long)]
        expires_in: Option<i64>,
    },
    /// Abort the upload in flight for a path.
    Cancel {
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    // load configuration
    let config = Config::load(&cli.config_file.unwrap_or("./stowage.yml".into()))?;

    // initialize storage layer
    let objects = config.objects.new_objects().await?;
    let driver = Driver::new(objects, &config.driver)?;
    tracing::debug!("initialized {} driver", driver.name());

    match cli.command {
        Command::Put {
            path,
            file,
            append,
            no_commit,
        } => match file {
            Some(f) => put(&driver, &path, tokio::fs::File::open(f).await?, append, no_commit).await,
            None => put(&driver, &path, tokio::io::stdin(), append, no_commit).await,
        },
        Command::Get { path, offset } => {
            let mut body = driver.reader(&path, offset).await?;
            let mut stdout = tokio::io::stdout();
            while let Some(chunk) = body.try_next().await? {
                stdout.write_all(&chunk).await?;
            }
            stdout.flush().await?;
            Ok(())
        }
        Command::Stat { path } => {
            let info = driver.stat(&path).await?;
            let modified = info
                .modified
                .map(|m| m.to_rfc3339())
                .unwrap_or_else(|| String::from("-"));
            let kind = if info.is_dir { "directory" } else { "file" };
            println!("{}\t{}\t{}\t{}", info.path, kind, info.size, modified);
            Ok(())
        }
        Command::Ls { path } => {
            for child in driver.list(&path).await? {
                println!("{child}");
            }
            Ok(())
        }
        Command::Rm { path } => Ok(driver.delete(&path).await?),
        Command::Mv {
            source,
            destination,
        } => Ok(driver.move_path(&source, &destination).await?),
        Command::Url { path, expires_in } => {
            let options = UrlOptions {
                method: None,
                expiry: expires_in.map(|m| chrono::Utc::now() + chrono::Duration::minutes(m)),
            };
            println!("{}", driver.url_for(&path, &options).await?);
            Ok(())
        }
        Command::Cancel { path } => {
            let mut writer = driver.writer(&path, true).await?;
            tracing::info!(
                "cancelling upload {} holding {} bytes",
                writer.session().upload_id,
                writer.size()
            );
            Ok(writer.cancel().await?)
        }
    }
}

async fn put<R>(driver: &Driver, path: &str, mut input: R, append: bool, no_commit: bool) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut writer = driver.writer(path, append).await?;
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = input.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        if let Err(e) = writer.write(&buf[..n]).await {
            tracing::error!(
                "write to {path} failed after {} bytes, upload {} left in flight",
                writer.size(),
                writer.session().upload_id
            );
            return Err(e.into());
        }
    }

    if no_commit {
        writer.close().await?;
        tracing::info!("left {} bytes in flight at {path}", writer.size());
    } else {
        writer.commit().await?;
        tracing::info!("wrote {} bytes to {path}", writer.size());
    }
    println!("{}", writer.size());
    Ok(())
}
