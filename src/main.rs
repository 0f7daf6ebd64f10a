use clap::Parser;
use log::{error, LevelFilter};
use std::net::TcpStream;
use std::process;
use std::thread;
use std::time::Duration;
use trustchain::utils::{hex_encode, new_key_pair, public_key_from_pkcs8};
use trustchain::{
    Command, HandshakePayload, Ledger, Message, MessagePayload, Node, NodeConfig, Opt, Transaction,
};

fn main() {
    env_logger::builder().filter_level(LevelFilter::Info).init();

    let opt = Opt::parse();

    if let Err(e) = run_command(opt) {
        error!("Error: {e}");
        process::exit(1);
    }
}

fn run_command(opt: Opt) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = NodeConfig::load(opt.config.as_deref())?;

    match opt.command {
        Command::StartNode { validator } => {
            if validator {
                config.validator.enabled = true;
            }
            let mut node = Node::new(config)?;
            node.start()?;
            // The node runs on its background threads until the process ends
            loop {
                thread::sleep(Duration::from_secs(60));
            }
        }
        Command::Keygen { out } => {
            let pkcs8 = new_key_pair()?;
            if let Some(parent) = out.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&out, &pkcs8)?;
            let address = hex_encode(&public_key_from_pkcs8(&pkcs8)?);
            println!("Key written to {}", out.display());
            println!("Address: {address}");
        }
        Command::GetBalance { address } => {
            let ledger = open_ledger(&config)?;
            println!("Balance of {address}: {}", ledger.balance(&address));
        }
        Command::Send {
            key,
            to,
            amount,
            fee,
            node,
        } => {
            let pkcs8 = std::fs::read(&key)
                .map_err(|e| format!("Failed to read key file {}: {e}", key.display()))?;
            let tx = Transaction::new_signed(&pkcs8, to, amount, fee, None, 0)?;
            let addr = node.unwrap_or_else(|| config.network.listen_addr.clone());
            submit_transaction(&addr, tx)?;
            println!("Success!");
        }
        Command::Printchain => {
            let ledger = open_ledger(&config)?;
            for index in 0..=ledger.height() {
                let block = ledger
                    .block_by_index(index)
                    .ok_or("Chain is missing an index it reported")?;
                println!("Block #{index} [{}]", block.get_hash());
                println!("  Prev hash: {}", block.get_prev_hash());
                println!("  Timestamp: {}", block.get_timestamp());
                if let Some(validator) = block.get_validator() {
                    println!("  Validator: {validator}");
                }
                for tx in block.get_transactions() {
                    let sender = tx.get_sender().unwrap_or("COINBASE");
                    println!(
                        "  - {} : {sender} -> {} ({} + {} fee)",
                        tx.get_id(),
                        tx.get_recipient(),
                        tx.get_amount(),
                        tx.get_fee()
                    );
                }
                println!();
            }
        }
    }
    Ok(())
}

fn open_ledger(config: &NodeConfig) -> trustchain::Result<Ledger> {
    Ledger::open(
        &config.data_dir,
        &config.genesis_allocations(),
        config.max_block_transactions,
    )
}

/// Dial a running node, handshake as a short-lived client, and hand it one
/// signed transaction.
fn submit_transaction(addr: &str, tx: Transaction) -> Result<(), Box<dyn std::error::Error>> {
    let stream = TcpStream::connect(addr)
        .map_err(|e| format!("Failed to connect to node at {addr}: {e}"))?;
    stream.set_write_timeout(Some(Duration::from_millis(5000)))?;

    let handshake = Message::new(MessagePayload::Handshake(HandshakePayload {
        version: Some(trustchain::PROTOCOL_VERSION),
        node_id: Some(format!("cli-{}", uuid_suffix())),
        listen_addr: None,
        height: None,
    }))?;
    serde_json::to_writer(&stream, &handshake)?;
    serde_json::to_writer(
        &stream,
        &Message::new(MessagePayload::Transaction { transaction: tx })?,
    )?;
    // Give the node a moment to drain the session before the socket drops
    thread::sleep(Duration::from_millis(500));
    Ok(())
}

fn uuid_suffix() -> String {
    uuid::Uuid::new_v4().to_string()
}
