// Entry point for the frostline node binary
use clap::Parser;
use frostline::cli::{Command, Opt};
use frostline::config::NodeConfig;
use frostline::core::hash::AddressSpecHash;
use frostline::core::monetary::format_snow;
use frostline::core::params::{NetworkParams, REGTEST_NAME};
use frostline::core::{BlockSummary, TransactionOutput};
use frostline::node::Node;
use frostline::utils::deserialize;
use log::{error, info, LevelFilter};
use std::process;
use std::str::FromStr;

const MINE_ATTEMPTS: u64 = 1_000_000;
const UTXO_LIST_MAX: usize = 10_000;

fn main() {
    // Info by default, RUST_LOG still wins when set
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let opt = Opt::parse();

    if let Err(e) = run_command(opt) {
        error!("Error: {e}");
        process::exit(1);
    }
}

fn run_command(opt: Opt) -> Result<(), Box<dyn std::error::Error>> {
    let config = NodeConfig::load(opt.config.as_deref())?;
    let node = Node::open(config)?;

    match opt.command {
        Command::StartNode => {
            let server = node.start()?;
            info!(
                "Node running on port {} with {} known peers",
                node.config().listen_port,
                node.peerage().get_rumors().len()
            );
            server
                .join()
                .map_err(|_| "Listener thread panicked".to_string())?;
        }
        Command::Printchain { limit } => {
            let mut current = node.ingestor().head();
            let mut printed = 0;
            while let Some(summary) = current {
                if printed >= limit {
                    break;
                }
                print_summary(&summary);
                if let Some(block) = node.ingestor().get_block(&summary.get_hash())? {
                    for tx in block.get_transactions() {
                        let inner = tx.inner()?;
                        println!("- Transaction {} fee {}", tx.get_tx_hash(), inner.fee);
                        for input in &inner.inputs {
                            println!(
                                "-- Input {}:{} from {}",
                                input.src_tx_id, input.src_tx_out_idx, input.spec_hash
                            );
                        }
                        for output in &inner.outputs {
                            println!(
                                "-- Output {} to {}",
                                format_snow(output.value),
                                output.recipient_spec_hash
                            );
                        }
                    }
                }
                println!();
                printed += 1;

                current = if summary.get_height() == 0 {
                    None
                } else {
                    node.ingestor()
                        .get_summary(&summary.header.prev_block_hash)?
                };
            }
        }
        Command::ShowTip => match node.ingestor().head() {
            Some(summary) => print_summary(&summary),
            None => println!("No blocks yet"),
        },
        Command::Utxos { spec_hash } => {
            let spec_hash = AddressSpecHash::from_str(&spec_hash)?;
            let root = node.ingestor().head_or_start().header.utxo_root_hash;
            let entries =
                node.ingestor()
                    .trie()
                    .get_data_map(&root, spec_hash.as_bytes(), UTXO_LIST_MAX)?;
            let mut total = 0u64;
            for value in entries.values() {
                let output: TransactionOutput = deserialize(value)?;
                total += output.value;
                println!("{}", format_snow(output.value));
            }
            println!("{} outputs, {} total", entries.len(), format_snow(total));
        }
        Command::Mine { count, spec_hash } => {
            if node.params().network_name != REGTEST_NAME {
                return Err("Built-in mining only works on regtest".into());
            }
            let spec_hash = AddressSpecHash::from_str(&spec_hash)?;
            let mut mined = 0;
            while mined < count {
                let mut block = node.block_template(&spec_hash)?;
                let field_id = block.get_header().snow_field;
                let field = NetworkParams::regtest_field(field_id)
                    .ok_or_else(|| format!("No regtest data for field {field_id}"))?;
                if !field.mine(block.header_mut(), MINE_ATTEMPTS) {
                    info!("No solution in {MINE_ATTEMPTS} attempts, refreshing template");
                    continue;
                }
                let reply = node.submit_block(&block);
                if !reply.success {
                    return Err(reply.error_message.into());
                }
                println!("Mined block {} at height {}", block.get_hash(), block.get_height());
                mined += 1;
            }
        }
    }

    node.shutdown()?;
    Ok(())
}

fn print_summary(summary: &BlockSummary) {
    let header = &summary.header;
    println!("Block {} height {}", summary.get_hash(), summary.get_height());
    println!("  Prev: {}", header.prev_block_hash);
    println!("  Timestamp: {}", header.timestamp);
    println!("  UTXO root: {}", header.utxo_root_hash);
    println!("  Snow field: {}", header.snow_field);
    println!("  Work sum: {}", summary.work_sum());
}
