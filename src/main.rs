//! treefetch - interactive client
//!
//! Connects to a treefetch daemon (following a mirror redirect if told to),
//! then reads commands from stdin until `quit` or end of input.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::{IsTerminal, Write};
use tokio::io::{AsyncBufReadExt, BufReader};

use treefetch::cli::ClientOpts;
use treefetch::client::{Client, Reply};
use treefetch::command::{Command, CommandError};
use treefetch::logger;
use treefetch::progress::DownloadProgress;
use treefetch::Error;

const PROMPT: &str = "Enter command: ";

fn main() -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        std::process::exit(130);
    })
    .context("install Ctrl-C handler")?;

    let opts = ClientOpts::parse();
    logger::init(opts.log_level.as_deref(), None, log::Level::Warn)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    rt.block_on(run(opts))
}

/// What the user sees for a line that failed local validation
fn rejection_message(e: &CommandError) -> String {
    format!("ERROR: Invalid command\n{}\n{}", e, e.usage())
}

async fn run(opts: ClientOpts) -> Result<()> {
    let mut client = Client::connect(&opts.host, opts.port, &opts.download_dir)
        .await
        .with_context(|| format!("connect to {}:{}", opts.host, opts.port))?;
    let (host, port) = client.endpoint();
    if client.was_redirected() {
        println!("Redirected to mirror {}:{}", host, port);
    }
    println!("Connected to {}:{}", host, port);

    let interactive = std::io::stdout().is_terminal();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{}", PROMPT);
        std::io::stdout().flush().ok();

        let Some(line) = lines.next_line().await? else {
            // End of input: leave the session cleanly
            client.quit().await?;
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        let cmd = match Command::parse(&line) {
            Ok(cmd) => cmd,
            Err(e) => {
                println!("{}", rejection_message(&e));
                continue;
            }
        };

        let progress = DownloadProgress::new(interactive && cmd.verb.returns_archive());
        let result = client
            .execute_with(&cmd, |got, total| progress.update(got, total))
            .await;
        progress.finish();

        match result {
            Ok(Reply::Quit) => {
                println!("Closing connection");
                return Ok(());
            }
            Ok(Reply::Text(text)) => println!("{}", text.trim_end()),
            Ok(Reply::NoArchive) => println!("No files found"),
            Ok(Reply::Archive {
                path,
                bytes,
                marker,
                extracted,
            }) => {
                println!("{} ({} bytes)", marker, bytes);
                match extracted {
                    Some(n) => println!(
                        "Extracted {} file(s) into {}",
                        n,
                        client.download_dir().display()
                    ),
                    None => println!("Archive saved to {}", path.display()),
                }
            }
            Err(Error::ServerValidation) => println!("ERROR: server rejected the command"),
            Err(e) if !e.is_fatal() => println!("ERROR: {}", e),
            Err(e) => return Err(e).context("session ended"),
        }
    }
}
