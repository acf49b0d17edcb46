//! The assembled node
//!
//! [`Node`] opens storage, builds the ingestor, mempool and peerage on top of
//! it, and is where miners and local tools hand in blocks and transactions.
//! Those go through exactly the same paths as data arriving from peers.
//! Miners can also subscribe to templates that are rebuilt on every new tip.

use crate::config::NodeConfig;
use crate::core::block::{Block, BlockSummary};
use crate::core::block_forge::BlockForge;
use crate::core::hash::AddressSpecHash;
use crate::core::ingestor::{BlockIngestor, ChainStateSource, IngestOutcome};
use crate::core::params::NetworkParams;
use crate::core::Transaction;
use crate::error::{BlockchainError, Result};
use crate::network::{Peerage, Server};
use crate::storage::chain_store::ChainStore;
use crate::storage::memory_pool::MemPool;
use crate::storage::trie::HashedTrie;
use crate::utils::current_timestamp;
use log::{debug, info, warn};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

type TemplateSubscribers = Arc<Mutex<Vec<(AddressSpecHash, Sender<Block>)>>>;

/// Answer to a submitted block or transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReply {
    pub success: bool,
    pub error_message: String,
}

impl SubmitReply {
    pub fn accepted() -> SubmitReply {
        SubmitReply {
            success: true,
            error_message: String::new(),
        }
    }

    pub fn rejected(err: &BlockchainError) -> SubmitReply {
        SubmitReply {
            success: false,
            error_message: err.to_string(),
        }
    }
}

pub struct Node {
    config: NodeConfig,
    ingestor: Arc<BlockIngestor>,
    mempool: Arc<MemPool>,
    peerage: Arc<Peerage>,
    forge: Arc<BlockForge>,
    template_subscribers: TemplateSubscribers,
}

impl Node {
    pub fn open(config: NodeConfig) -> Result<Node> {
        let params = NetworkParams::load(&config.network)?;
        info!(
            "Opening {} node with database {}",
            params.network_name, config.db_path
        );

        let store = ChainStore::open(&config.db_path)?;
        let trie = HashedTrie::sled(store.utxo_trie_tree()?)?;
        let ingestor = Arc::new(BlockIngestor::new(
            params,
            store,
            trie.clone(),
            config.tx_index,
        )?);
        let mempool = Arc::new(MemPool::new(
            trie,
            ingestor.clone(),
            config.mempool_eviction_grace_ms,
        ));
        let peerage = Arc::new(Peerage::new(ingestor.clone(), mempool.clone(), &config)?);
        let forge = Arc::new(BlockForge::new(ingestor.clone(), mempool.clone()));

        let template_subscribers = TemplateSubscribers::default();
        spawn_template_notifier(
            ingestor.subscribe()?,
            Arc::downgrade(&forge),
            template_subscribers.clone(),
        );

        Ok(Node {
            config,
            ingestor,
            mempool,
            peerage,
            forge,
            template_subscribers,
        })
    }

    /// Starts listening for peers and the peerage maintenance loop. Returns
    /// the listener thread.
    pub fn start(&self) -> Result<JoinHandle<()>> {
        let server = Server::bind(self.peerage.clone(), self.config.listen_port)?;
        let handle = server.spawn();
        self.peerage.clone().start_maintenance();
        Ok(handle)
    }

    pub fn submit_transaction(&self, tx: &Transaction) -> SubmitReply {
        match self.mempool.add_transaction(tx) {
            Ok(true) => {
                self.peerage.broadcast_transaction(tx, None);
                SubmitReply::accepted()
            }
            Ok(false) => SubmitReply::accepted(),
            Err(e) => {
                info!("Rejected transaction {}: {e}", tx.get_tx_hash());
                SubmitReply::rejected(&e)
            }
        }
    }

    pub fn submit_block(&self, block: &Block) -> SubmitReply {
        match self.ingestor.ingest_block(block) {
            Ok(IngestOutcome::Accepted { tip_advanced: true }) => {
                if let Err(e) = self.peerage.tip_advanced() {
                    warn!("Failed to announce new tip: {e}");
                }
                SubmitReply::accepted()
            }
            Ok(_) => SubmitReply::accepted(),
            Err(e) => {
                info!("Rejected block {}: {e}", block.get_hash());
                SubmitReply::rejected(&e)
            }
        }
    }

    /// Unmined block on the current tip paying `reward_spec_hash`
    pub fn block_template(&self, reward_spec_hash: &AddressSpecHash) -> Result<Block> {
        self.forge.create_block_template(reward_spec_hash)
    }

    /// Channel that gets a template paying `reward_spec_hash` right away and
    /// a fresh one after every tip change
    pub fn subscribe_templates(&self, reward_spec_hash: &AddressSpecHash) -> Result<Receiver<Block>> {
        let (tx, rx) = channel();
        let mut subscribers = self.template_subscribers.lock()?;
        let template = self.forge.create_block_template(reward_spec_hash)?;
        if tx.send(template).is_ok() {
            subscribers.push((*reward_spec_hash, tx));
        }
        Ok(rx)
    }

    pub fn params(&self) -> &NetworkParams {
        self.ingestor.params()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn ingestor(&self) -> &Arc<BlockIngestor> {
        &self.ingestor
    }

    pub fn mempool(&self) -> &Arc<MemPool> {
        &self.mempool
    }

    pub fn peerage(&self) -> &Arc<Peerage> {
        &self.peerage
    }

    /// Saves the rumor list and flushes the database
    pub fn shutdown(&self) -> Result<()> {
        self.peerage.close_all();
        self.peerage.save_peers(current_timestamp()?, true)?;
        self.ingestor.store().flush()
    }
}

// Rebuilds templates for every subscriber whenever the ingestor reports a new
// tip. Exits once the node, and with it the ingestor, is gone.
fn spawn_template_notifier(
    tips: Receiver<BlockSummary>,
    forge: Weak<BlockForge>,
    subscribers: TemplateSubscribers,
) -> JoinHandle<()> {
    thread::spawn(move || {
        for summary in tips {
            let Some(forge) = forge.upgrade() else {
                break;
            };
            let mut subscribers = match subscribers.lock() {
                Ok(s) => s,
                Err(_) => {
                    log::error!("Failed to acquire template subscriber lock");
                    break;
                }
            };
            debug!(
                "Refreshing {} block templates for tip {}",
                subscribers.len(),
                summary.get_hash()
            );
            subscribers.retain(|(spec, sender)| match forge.create_block_template(spec) {
                Ok(template) => sender.send(template).is_ok(),
                Err(e) => {
                    warn!("Failed to build block template for {spec}: {e}");
                    true
                }
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::AddressSpec;
    use crate::testnet::{create_temp_dir, mine, reward_key, spend_output};
    use std::time::Duration;

    fn open_node(dir: &tempfile::TempDir) -> Node {
        let config = NodeConfig {
            db_path: dir.path().join("node").to_string_lossy().to_string(),
            tx_index: true,
            ..NodeConfig::default()
        };
        Node::open(config).unwrap()
    }

    #[test]
    fn test_mined_template_is_accepted() {
        let dir = create_temp_dir().unwrap();
        let node = open_node(&dir);
        let spec = AddressSpec::single(reward_key()).spec_hash();

        let mut block = node.block_template(&spec).unwrap();
        mine(&mut block).unwrap();
        assert_eq!(node.submit_block(&block), SubmitReply::accepted());
        assert_eq!(node.ingestor().height(), Some(0));

        // Submitting it again is harmless
        assert!(node.submit_block(&block).success);
    }

    #[test]
    fn test_submitted_transaction_lands_in_next_template() {
        let dir = create_temp_dir().unwrap();
        let node = open_node(&dir);
        let spec = AddressSpec::single(reward_key()).spec_hash();

        let mut b0 = node.block_template(&spec).unwrap();
        mine(&mut b0).unwrap();
        assert!(node.submit_block(&b0).success);

        let tx = spend_output(reward_key(), &b0.get_transactions()[0], 0, 2500, &spec).unwrap();
        assert!(node.submit_transaction(&tx).success);

        let template = node.block_template(&spec).unwrap();
        assert_eq!(template.get_transactions().len(), 2);
        assert_eq!(template.get_transactions()[1], tx);

        let double = spend_output(reward_key(), &b0.get_transactions()[0], 0, 100, &spec).unwrap();
        let reply = node.submit_transaction(&double);
        assert!(!reply.success);
        assert!(reply.error_message.contains("double-spend"));
    }

    #[test]
    fn test_rejected_block_reports_reason() {
        let dir = create_temp_dir().unwrap();
        let node = open_node(&dir);
        let spec = AddressSpec::single(reward_key()).spec_hash();

        let mut block = node.block_template(&spec).unwrap();
        block.header_mut().timestamp += 1;
        mine(&mut block).unwrap();
        block.header_mut().timestamp += 1;

        let reply = node.submit_block(&block);
        assert!(!reply.success);
        assert!(!reply.error_message.is_empty());
        assert!(node.ingestor().head().is_none());
    }

    #[test]
    fn test_template_subscribers_follow_the_tip() {
        let dir = create_temp_dir().unwrap();
        let node = open_node(&dir);
        let spec = AddressSpec::single(reward_key()).spec_hash();

        let templates = node.subscribe_templates(&spec).unwrap();
        let mut first = templates.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first.get_height(), 0);

        mine(&mut first).unwrap();
        assert!(node.submit_block(&first).success);

        let next = templates.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(next.get_height(), 1);
        assert_eq!(next.get_header().prev_block_hash, first.get_hash());
    }
}
