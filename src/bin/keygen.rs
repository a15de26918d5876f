//! Identity key generation for MeshLink nodes.
//!
//! Writes the node's Ed25519 identity in the historical raw formats:
//! `identity.priv` is the 96-byte private blob, `identity.pub` the
//! 43-character base64 public key.

use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use meshlink::crypto::{Keypair, KEY_FILE_SIZE};

#[derive(Parser)]
#[command(name = "keygen", about = "Generate or inspect a MeshLink identity key")]
struct Args {
    /// Directory the key files live in
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    /// Print the public key of an existing identity instead of generating
    #[arg(long)]
    show: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let priv_path = args.dir.join("identity.priv");
    let pub_path = args.dir.join("identity.pub");

    if args.show {
        let blob = match std::fs::read(&priv_path) {
            Ok(blob) => blob,
            Err(e) => {
                error!("cannot read {}: {}", priv_path.display(), e);
                exit(1);
            }
        };
        let blob: [u8; KEY_FILE_SIZE] = match blob.try_into() {
            Ok(blob) => blob,
            Err(raw) => {
                error!(
                    "{} has {} bytes, expected {}",
                    priv_path.display(),
                    raw.len(),
                    KEY_FILE_SIZE
                );
                exit(1);
            }
        };
        match Keypair::from_key_file(&blob) {
            Ok(keypair) => println!("{}", keypair.public().to_base64()),
            Err(e) => {
                error!("invalid identity: {}", e);
                exit(1);
            }
        }
        return;
    }

    if priv_path.exists() {
        error!("{} already exists, refusing to overwrite", priv_path.display());
        exit(1);
    }

    let keypair = Keypair::generate();
    if let Err(e) = std::fs::create_dir_all(&args.dir) {
        error!("cannot create {}: {}", args.dir.display(), e);
        exit(1);
    }
    if let Err(e) = std::fs::write(&priv_path, keypair.to_key_file()) {
        error!("cannot write {}: {}", priv_path.display(), e);
        exit(1);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = std::fs::metadata(&priv_path) {
            let mut perms = meta.permissions();
            perms.set_mode(0o600);
            let _ = std::fs::set_permissions(&priv_path, perms);
        }
    }
    let public = keypair.public().to_base64();
    if let Err(e) = std::fs::write(&pub_path, format!("{public}\n")) {
        error!("cannot write {}: {}", pub_path.display(), e);
        exit(1);
    }

    info!("wrote identity to {}", priv_path.display());
    println!("{public}");
}
