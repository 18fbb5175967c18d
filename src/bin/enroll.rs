//! Agent enrollment tool
//!
//! Generates an agent keypair, writes its certificate into the frontend's
//! store, and saves the private keys for distribution to the endpoint.
//!
//! Usage:
//!   cargo run --bin enroll -- --name C.1a2b3c --data-dir ./data --output ./keys/

use clap::Parser;
use drover::crypto::{self, Keypair};
use drover::store::{AgentCertificate, AgentStore};
use rand::rngs::OsRng;
use std::fs;
use std::path::PathBuf;
use x25519_dalek::StaticSecret;

#[derive(Parser)]
#[command(name = "enroll", version, about = "Drover agent enrollment")]
struct Args {
    /// Canonical agent name (certificate subject)
    #[arg(short, long)]
    name: String,

    /// Frontend data directory (the store to enroll into)
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Output directory for the agent's key material
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Comma-separated record labels (used for per-label ping metrics)
    #[arg(short, long)]
    labels: Option<String>,
}

fn main() {
    let args = Args::parse();

    println!("Enrolling agent: {}", args.name);

    let db = match sled::open(args.data_dir.join("store")) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Failed to open store at {:?}: {}", args.data_dir, e);
            std::process::exit(1);
        }
    };
    let store = match AgentStore::new(&db) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Failed to open agent store: {}", e);
            std::process::exit(1);
        }
    };

    let identity = Keypair::generate();
    let exchange = StaticSecret::random_from_rng(OsRng);

    let labels: Vec<String> = args
        .labels
        .as_deref()
        .map(|s| s.split(',').map(|l| l.trim().to_string()).collect())
        .unwrap_or_default();

    let cert = AgentCertificate {
        subject: args.name.clone(),
        signing_key: identity.public.clone(),
        exchange_key: crypto::exchange_public(&exchange),
    };

    match store.enroll(cert, labels) {
        Ok(true) => {}
        Ok(false) => {
            eprintln!("Agent {} already has a certificate; refusing to overwrite", args.name);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Enrollment failed: {}", e);
            std::process::exit(1);
        }
    }

    fs::create_dir_all(&args.output).expect("Failed to create output directory");

    let signing_path = args.output.join(format!("{}_signing.key", args.name));
    fs::write(&signing_path, identity.secret_bytes()).expect("Failed to write signing key");
    println!("Signing key saved to: {}", signing_path.display());

    let exchange_path = args.output.join(format!("{}_exchange.key", args.name));
    fs::write(&exchange_path, exchange.to_bytes()).expect("Failed to write exchange key");
    println!("Exchange key saved to: {}", exchange_path.display());

    // Round-trip check before handing the keys out.
    let test_message = b"drover enrollment verification";
    let signature = identity.sign(test_message);
    match crypto::verify(&identity.public, test_message, &signature) {
        Ok(()) => println!("Signature verification: PASSED"),
        Err(_) => {
            println!("Signature verification: FAILED");
            std::process::exit(1);
        }
    }

    println!();
    println!("Agent {} enrolled.", args.name);
    println!(
        "  Generated: {}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("  Identity pubkey: {}…", hex::encode(&identity.public[..16]));
    println!("  Exchange pubkey: {}", hex::encode(crypto::exchange_public(&exchange)));
    println!();
    println!("Distribute both key files to the endpoint over a secure channel;");
    println!("they are not recoverable from the store.");
}
