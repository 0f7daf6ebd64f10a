use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "trustchain")]
pub struct Opt {
    /// Path to a TOML configuration file; defaults apply when omitted
    #[arg(long = "config", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(name = "startnode", about = "Start a blockchain node")]
    StartNode {
        #[arg(long, help = "Forge blocks, sending rewards to this node's key")]
        validator: bool,
    },
    #[command(name = "keygen", about = "Generate a PKCS#8 key pair and print its address")]
    Keygen {
        #[arg(help = "File to write the key to")]
        out: PathBuf,
    },
    #[command(name = "getbalance", about = "Get the balance of the target address")]
    GetBalance {
        #[arg(help = "The address (hex public key or named pool)")]
        address: String,
    },
    #[command(name = "send", about = "Sign a transfer and submit it to a running node")]
    Send {
        #[arg(long, help = "PKCS#8 key file of the sender")]
        key: PathBuf,
        #[arg(help = "Recipient address")]
        to: String,
        #[arg(help = "Amount in base units")]
        amount: u64,
        #[arg(long, default_value_t = 0, help = "Fee in base units")]
        fee: u64,
        #[arg(
            long,
            help = "Node address to submit to; defaults to the configured listen address"
        )]
        node: Option<String>,
    },
    #[command(name = "printchain", about = "Print all blocks in the blockchain")]
    Printchain,
}
