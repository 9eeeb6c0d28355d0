//! Node identity generation tool.
//!
//! Creates (or prints) the persistent `node.key`/`node.crt` pair used by
//! direct TLS, DTLS, and gossip sealing. The certificate's Common Name is
//! the node ID.
//!
//! Usage:
//!   cargo run --bin keygen -- --data-dir ./data

use clap::Parser;
use meshcore::identity::NodeIdentity;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "keygen", version, about = "Meshcore node identity generator")]
struct Args {
    /// Directory where node.key and node.crt live
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Print the certificate PEM after generation
    #[arg(long)]
    show_cert: bool,
}

fn main() {
    let args = Args::parse();

    match NodeIdentity::load_or_generate(&args.data_dir) {
        Ok(identity) => {
            println!("node id:   {}", identity.node_id);
            println!("key file:  {}", identity.key_path.display());
            println!("cert file: {}", identity.cert_path.display());
            if args.show_cert {
                println!("\n{}", identity.cert_pem);
            }
        }
        Err(e) => {
            eprintln!("identity generation failed: {e}");
            std::process::exit(1);
        }
    }
}
