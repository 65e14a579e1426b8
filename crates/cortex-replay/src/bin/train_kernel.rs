//! Training kernel child process.
//!
//! Protocol: one JSON document on stdin, one on stdout. Everything else
//! (logs, panics) goes to stderr so the parent's stdout parser stays clean.

use std::io::{Read, Write};

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use cortex_replay::kernel::{run_training, KernelInput, KernelOutput};

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut raw = String::new();
    std::io::stdin()
        .read_to_string(&mut raw)
        .context("reading stdin")?;

    let output = match serde_json::from_str::<KernelInput>(&raw) {
        Ok(input) => run_training(input),
        Err(err) => KernelOutput::failure(format!("malformed input: {err}")),
    };

    let document = serde_json::to_string(&output).context("encoding output")?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(document.as_bytes())?;
    stdout.write_all(b"\n")?;
    stdout.flush()?;
    Ok(())
}
