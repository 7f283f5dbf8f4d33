// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Compute a TPM 2.0 policy digest from a JSON policy description
//!
//! Usage:
//!   policy-digest policy.json
//!   policy-digest --hash sha1 - < policy.json

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use tpm2_policy::{PolicyScript, TpmAlgId};

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// Policy description file, or `-` for stdin
    script: PathBuf,
    /// Override the hash algorithm named in the script
    #[arg(long)]
    hash: Option<String>,
    /// Print a JSON object instead of the bare hex digest
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Output {
    hash: String,
    digest: String,
}

fn parse_hash(name: &str) -> Result<TpmAlgId> {
    let alg = match name.to_ascii_lowercase().as_str() {
        "sha1" => TpmAlgId::Sha1,
        "sha256" => TpmAlgId::Sha256,
        "sha384" => TpmAlgId::Sha384,
        "sha512" => TpmAlgId::Sha512,
        _ => bail!("unsupported hash algorithm: {name}"),
    };
    Ok(alg)
}

fn read_script(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut input = String::new();
        std::io::stdin()
            .read_to_string(&mut input)
            .context("Failed to read policy from stdin")?;
        return Ok(input);
    }
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read policy file {}", path.display()))
}

fn main() -> Result<()> {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let args = Args::parse();
    let mut script = PolicyScript::from_json(&read_script(&args.script)?)
        .context("Failed to parse policy description")?;
    if let Some(name) = &args.hash {
        script.hash = parse_hash(name)?;
    }
    let digest = script.digest().context("Failed to evaluate policy")?;
    let digest = hex::encode(digest.as_slice());

    if args.json {
        let output = Output {
            hash: format!("{:?}", script.hash).to_ascii_lowercase(),
            digest,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("{digest}");
    }
    Ok(())
}
