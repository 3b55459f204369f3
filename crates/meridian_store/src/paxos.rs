//! Single-leader multi-paxos providing the total-order service contract:
//! `propose(value)` eventually fires the commit action for `(slot, value)`
//! exactly once per member, in identical slot order on every member.
//!
//! The member at position 0 is the elected leader and never changes; other
//! members forward proposals to it. A slot commits once a majority of
//! members acknowledge the accept round.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use meridian_engine::async_log::AsyncLog;
use meridian_engine::config::ConfigPtr;
use meridian_engine::messages::{ForwardBatch, Request, Response};
use meridian_engine::types::{
    Channel, MachineId, SlotId, GLOBAL_PAXOS_CHANNEL, INTERLEAVER_CHANNEL, LOCAL_PAXOS_CHANNEL,
    MULTI_HOME_ORDERER_CHANNEL, PAXOS_LEADER_POSITION,
};
use tracing::{debug, warn};

use crate::broker::Sender;
use crate::module::Module;

/// What a committed slot means to the rest of the pipeline.
#[derive(Clone, Copy, Debug)]
enum CommitAction {
    /// Local paxos: the value is an origin partition taking the next local
    /// log slot.
    LocalQueueOrder,
    /// Global paxos: the value is a multi-home batch id taking the next
    /// global slot.
    MultiHomeBatchOrder,
}

struct Acceptance {
    value: u32,
    acks: HashSet<MachineId>,
}

pub struct SimpleMultiPaxos {
    sender: Sender,
    channel: Channel,
    action: CommitAction,
    members: Vec<MachineId>,
    me: MachineId,
    is_member: bool,
    is_elected: bool,
    elected_leader: MachineId,
    ballot: u32,
    next_empty_slot: SlotId,
    /// Leader-side accept rounds still gathering a quorum.
    acceptances: HashMap<SlotId, Acceptance>,
    /// Member-side commits, delivered strictly in slot order.
    commits: AsyncLog<u32>,
}

impl SimpleMultiPaxos {
    fn new(
        sender: Sender,
        channel: Channel,
        action: CommitAction,
        members: Vec<MachineId>,
        me: MachineId,
    ) -> Self {
        assert!(!members.is_empty());
        let position = members.iter().position(|m| *m == me);
        Self {
            sender,
            channel,
            action,
            elected_leader: members[PAXOS_LEADER_POSITION],
            is_member: position.is_some(),
            is_elected: position == Some(PAXOS_LEADER_POSITION),
            ballot: position.map(|p| p as u32).unwrap_or(0),
            members,
            me,
            next_empty_slot: 0,
            acceptances: HashMap::new(),
            commits: AsyncLog::new(0),
        }
    }

    /// The group ordering batches within one replica: every machine of the
    /// local replica, feeding the interleavers.
    pub fn local(config: &ConfigPtr, sender: Sender) -> Self {
        let members = (0..config.num_partitions())
            .map(|part| config.machine_id(config.local_replica(), part))
            .collect();
        Self::new(
            sender,
            LOCAL_PAXOS_CHANNEL,
            CommitAction::LocalQueueOrder,
            members,
            config.local_machine_id(),
        )
    }

    /// The group ordering multi-home batches across replicas: one fixed
    /// partition in every replica, feeding the multi-home orderers.
    pub fn global(config: &ConfigPtr, sender: Sender) -> Self {
        let part = config.leader_partition_for_multi_home_ordering();
        let members = (0..config.num_replicas())
            .map(|rep| config.machine_id(rep, part))
            .collect();
        Self::new(
            sender,
            GLOBAL_PAXOS_CHANNEL,
            CommitAction::MultiHomeBatchOrder,
            members,
            config.local_machine_id(),
        )
    }

    pub fn is_member(&self) -> bool {
        self.is_member
    }

    fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    fn start_new_acceptance(&mut self, value: u32) {
        let slot = self.next_empty_slot;
        self.next_empty_slot += 1;
        self.acceptances.insert(
            slot,
            Acceptance {
                value,
                acks: HashSet::new(),
            },
        );
        debug!(channel = self.channel, slot, value, "starting accept round");
        for member in self.members.clone() {
            self.sender.send_request_to(
                member,
                self.channel,
                self.channel,
                Request::PaxosAccept {
                    ballot: self.ballot,
                    slot,
                    value,
                },
            );
        }
    }

    fn process_commit(&mut self, slot: SlotId, value: u32) {
        self.commits.insert(slot, value);
        while self.commits.has_next() {
            let (slot, value) = self.commits.next();
            match self.action {
                CommitAction::LocalQueueOrder => self.sender.send_request(
                    INTERLEAVER_CHANNEL,
                    self.channel,
                    Request::LocalQueueOrder {
                        slot,
                        queue_id: value,
                    },
                ),
                CommitAction::MultiHomeBatchOrder => self.sender.send_request(
                    MULTI_HOME_ORDERER_CHANNEL,
                    self.channel,
                    Request::ForwardBatch(ForwardBatch::Order {
                        batch_id: value,
                        slot,
                    }),
                ),
            }
        }
    }
}

#[async_trait]
impl Module for SimpleMultiPaxos {
    type Event = ();

    fn name(&self) -> &'static str {
        match self.action {
            CommitAction::LocalQueueOrder => "local-paxos",
            CommitAction::MultiHomeBatchOrder => "global-paxos",
        }
    }

    async fn handle_request(
        &mut self,
        request: Request,
        from: MachineId,
        _from_channel: Channel,
    ) -> anyhow::Result<()> {
        match request {
            Request::PaxosPropose { value } => {
                if self.is_elected {
                    self.start_new_acceptance(value);
                } else {
                    // Not the leader: relay the proposal.
                    self.sender.send_request_to(
                        self.elected_leader,
                        self.channel,
                        self.channel,
                        Request::PaxosPropose { value },
                    );
                }
            }
            Request::PaxosAccept { ballot, slot, .. } => {
                self.sender.send_response_to(
                    from,
                    self.channel,
                    self.channel,
                    Response::PaxosAccepted { ballot, slot },
                );
            }
            Request::PaxosCommit { slot, value, .. } => {
                self.process_commit(slot, value);
            }
            other => warn!(module = self.name(), ?other, "unexpected request"),
        }
        Ok(())
    }

    async fn handle_response(
        &mut self,
        response: Response,
        from: MachineId,
    ) -> anyhow::Result<()> {
        let Response::PaxosAccepted { slot, .. } = response else {
            warn!(module = self.name(), from, "unexpected response");
            return Ok(());
        };
        let quorum = self.quorum();
        let Some(acceptance) = self.acceptances.get_mut(&slot) else {
            // Already committed; late acks are harmless.
            return Ok(());
        };
        acceptance.acks.insert(from);
        if acceptance.acks.len() >= quorum {
            let value = acceptance.value;
            self.acceptances.remove(&slot);
            debug!(channel = self.channel, slot, value, "slot committed");
            for member in self.members.clone() {
                self.sender.send_request_to(
                    member,
                    self.channel,
                    self.channel,
                    Request::PaxosCommit {
                        ballot: self.ballot,
                        slot,
                        value,
                    },
                );
            }
        }
        Ok(())
    }
}
