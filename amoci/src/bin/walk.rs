use std::collections::BTreeMap;
use std::path::Path;

use clap::Parser;
use serde::Deserialize;

use amlib::CancellationToken;
use amoci::{ImageReference, RegistryAuth, RegistryClient, walk};

#[derive(Deserialize)]
struct AuthEntry {
    username: String,
    password: String,
}

type StoredAuth = BTreeMap<String, AuthEntry>;

fn load_stored_auth(p: impl AsRef<Path>) -> StoredAuth {
    serde_json::from_str(&std::fs::read_to_string(p).unwrap()).unwrap()
}

#[derive(Parser, Debug)]
#[command(version, about = "walk an image reference and print its mirror items", long_about = None)]
struct Args {
    image_ref: String,

    #[arg(long)]
    json: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();

    let args = Args::parse();
    let reference = ImageReference::parse(&args.image_ref).unwrap();

    let mut builder = RegistryClient::builder();
    if let Ok(path) = std::env::var("AM_REGISTRY_AUTH") {
        for (endpoint, entry) in load_stored_auth(path) {
            builder = builder.auth(
                endpoint,
                RegistryAuth {
                    username: entry.username,
                    password: entry.password,
                },
            );
        }
    }
    let client = builder.build().unwrap();

    let items = walk(&client, &reference, &CancellationToken::new())
        .await
        .unwrap();
    for item in items {
        if args.json {
            println!(
                "{}",
                serde_json::json!({
                    "path": item.path,
                    "digest": item.digest,
                    "size": item.size,
                    "url": item.url,
                })
            );
        } else {
            println!("{:>12} {} {}", item.size, item.digest, item.path);
        }
    }
}
