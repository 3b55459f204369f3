//! Routes freshly submitted transactions: completes their master metadata
//! via lookups, classifies them, and hands them to the right orderer.

use std::collections::HashMap;

use async_trait::async_trait;
use meridian_engine::config::ConfigPtr;
use meridian_engine::messages::{Request, Response};
use meridian_engine::txn::{set_transaction_type, Transaction, TransactionType};
use meridian_engine::types::{
    Channel, Key, MachineId, Metadata, TxnId, DEFAULT_MASTER_REGION_OF_NEW_KEY, FORWARDER_CHANNEL,
    MULTI_HOME_ORDERER_CHANNEL, SEQUENCER_CHANNEL, SERVER_CHANNEL,
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::broker::Sender;
use crate::module::Module;

pub struct Forwarder {
    config: ConfigPtr,
    sender: Sender,
    /// Transactions awaiting master-lookup responses.
    pending: HashMap<TxnId, Transaction>,
    rng: SmallRng,
}

impl Forwarder {
    pub fn new(config: ConfigPtr, sender: Sender) -> Self {
        let seed = u64::from(config.local_machine_id());
        Self {
            config,
            sender,
            pending: HashMap::new(),
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    fn keys_missing_metadata(txn: &Transaction) -> Vec<Key> {
        txn.read_set
            .keys()
            .chain(txn.write_set.keys())
            .filter(|key| !txn.master_metadata.contains_key(*key))
            .cloned()
            .collect()
    }

    fn contains_key(txn: &Transaction, key: &Key) -> bool {
        txn.read_set.contains_key(key) || txn.write_set.contains_key(key)
    }

    fn forward(&mut self, txn: Transaction) {
        let txn_id = txn.id;
        match txn.txn_type {
            TransactionType::SingleHome => {
                let home = txn.home;
                if home == self.config.local_replica() {
                    debug!(txn_id, "current region is home; forwarding to local sequencer");
                    self.sender.send_request(
                        SEQUENCER_CHANNEL,
                        FORWARDER_CHANNEL,
                        Request::ForwardTxn { txn },
                    );
                } else {
                    // Any machine in the home region can sequence it.
                    let partition = self.rng.gen_range(0..self.config.num_partitions());
                    let machine = self.config.machine_id(home, partition);
                    debug!(txn_id, home, partition, "forwarding txn to its home region");
                    self.sender.send_request_to(
                        machine,
                        SEQUENCER_CHANNEL,
                        FORWARDER_CHANNEL,
                        Request::ForwardTxn { txn },
                    );
                }
            }
            TransactionType::MultiHome => {
                let machine = self.config.machine_id(
                    self.config.local_replica(),
                    self.config.leader_partition_for_multi_home_ordering(),
                );
                debug!(txn_id, "multi-home txn; forwarding to the orderer");
                self.sender.send_request_to(
                    machine,
                    MULTI_HOME_ORDERER_CHANNEL,
                    FORWARDER_CHANNEL,
                    Request::ForwardTxn { txn },
                );
            }
            other => warn!(txn_id, ?other, "forwarder cannot route this txn type"),
        }
    }
}

#[async_trait]
impl Module for Forwarder {
    type Event = ();

    fn name(&self) -> &'static str {
        "forwarder"
    }

    async fn handle_request(
        &mut self,
        request: Request,
        _from: MachineId,
        _from_channel: Channel,
    ) -> anyhow::Result<()> {
        let Request::ForwardTxn { mut txn } = request else {
            warn!("unexpected request at forwarder");
            return Ok(());
        };

        if set_transaction_type(&mut txn) != TransactionType::Unknown {
            self.forward(txn);
            return Ok(());
        }

        // Some masters are unknown; ask every partition of this region.
        let keys = Self::keys_missing_metadata(&txn);
        let txn_id = txn.id;
        debug!(txn_id, num_keys = keys.len(), "looking up masters");
        self.pending.insert(txn_id, txn);
        let local_replica = self.config.local_replica();
        for part in 0..self.config.num_partitions() {
            let machine = self.config.machine_id(local_replica, part);
            self.sender.send_request_to(
                machine,
                SERVER_CHANNEL,
                FORWARDER_CHANNEL,
                Request::LookupMaster {
                    txn_id,
                    keys: keys.clone(),
                },
            );
        }
        Ok(())
    }

    async fn handle_response(
        &mut self,
        response: Response,
        _from: MachineId,
    ) -> anyhow::Result<()> {
        let Response::LookupMaster {
            txn_id,
            metadata,
            new_keys,
        } = response
        else {
            warn!("unexpected response at forwarder");
            return Ok(());
        };
        let Some(txn) = self.pending.get_mut(&txn_id) else {
            return Ok(());
        };

        for (key, meta) in metadata {
            if Self::contains_key(txn, &key) {
                txn.master_metadata.insert(key, meta);
            }
        }
        // Keys nobody stores yet default to the configured new-key master.
        for key in new_keys {
            if Self::contains_key(txn, &key) {
                txn.master_metadata
                    .entry(key)
                    .or_insert(Metadata::new(DEFAULT_MASTER_REGION_OF_NEW_KEY, 0));
            }
        }

        if set_transaction_type(txn) != TransactionType::Unknown {
            let txn = self.pending.remove(&txn_id).expect("pending txn vanished");
            self.forward(txn);
        }
        Ok(())
    }
}
