use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "frostline")]
pub struct Opt {
    #[arg(long, short, global = true, help = "Path to a TOML node config")]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(name = "startnode", about = "Run the node")]
    StartNode,
    #[command(name = "printchain", about = "Print blocks walking back from the tip")]
    Printchain {
        #[arg(long, default_value_t = 20, help = "How many blocks to print")]
        limit: u32,
    },
    #[command(name = "showtip", about = "Print the current chain tip")]
    ShowTip,
    #[command(name = "utxos", about = "List unspent outputs for an address")]
    Utxos {
        #[arg(help = "Address spec hash in hex")]
        spec_hash: String,
    },
    #[command(
        name = "mine",
        about = "Regtest only: mine blocks on the local chain"
    )]
    Mine {
        #[arg(help = "Number of blocks to mine")]
        count: u32,
        #[arg(help = "Address spec hash in hex that receives the rewards")]
        spec_hash: String,
    },
}
