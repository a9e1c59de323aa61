// tests/consensus.rs
// In-process validator sets: engines exchange messages through a shared
// queue instead of sockets, and timeouts are fired by hand.

use ed25519_dalek::SigningKey;
use std::collections::{HashSet, VecDeque};

use ouro_validator::bft::leader_rotation::proposer_for;
use ouro_validator::bft::{
    qc, ConsensusEngine, ConsensusError, ConsensusMessage, EngineConfig, EngineOutput, Phase,
    ValidatorInfo, ValidatorSet,
};
use ouro_validator::chain::Block;
use ouro_validator::crypto::{self, keys::signing_key_from_seed};

const PARENT: &str = "parent";

struct Sim {
    engines: Vec<ConsensusEngine>,
    set: ValidatorSet,
    queue: VecDeque<(usize, ConsensusMessage)>,
    committed: Vec<Option<Block>>,
    silent: HashSet<usize>,
}

impl Sim {
    fn new(stakes: &[u64]) -> Self {
        let keys: Vec<SigningKey> = (1..=stakes.len() as u8)
            .map(|i| signing_key_from_seed(&[i; 32]))
            .collect();
        let set = ValidatorSet::new(
            keys.iter()
                .zip(stakes)
                .map(|(k, stake)| ValidatorInfo {
                    address: crypto::address_of(k),
                    public_key: crypto::pubkey_hex(k),
                    stake: *stake,
                })
                .collect(),
        );
        let engines = keys
            .into_iter()
            .map(|k| ConsensusEngine::new(EngineConfig::default(), k))
            .collect();
        Sim {
            engines,
            set,
            queue: VecDeque::new(),
            committed: vec![None; stakes.len()],
            silent: HashSet::new(),
        }
    }

    fn index_of(&self, address: &str) -> usize {
        self.engines
            .iter()
            .position(|e| e.address() == address)
            .expect("known validator")
    }

    fn proposer_index(&self, height: u64, round: u32) -> usize {
        let proposer = proposer_for(&self.set, height, round).expect("proposer");
        self.index_of(&proposer.address)
    }

    fn start(&mut self, height: u64) {
        for i in 0..self.engines.len() {
            let out = self.engines[i]
                .start_height(height, PARENT.into(), self.set.clone())
                .expect("start height");
            self.handle(i, out);
        }
    }

    fn handle(&mut self, i: usize, out: EngineOutput) {
        if self.silent.contains(&i) {
            return;
        }
        for msg in out.messages {
            self.queue.push_back((i, msg));
        }
        if let Some(block) = out.committed {
            self.committed[i] = Some(block);
        }
        if out.request_proposal {
            let engine = &mut self.engines[i];
            let block = Block::new(
                engine.height(),
                PARENT.into(),
                1_700_000_000_000,
                Vec::new(),
                engine.address().to_string(),
            );
            let next = engine.set_proposal_block(block).expect("own proposal");
            self.handle(i, next);
        }
    }

    fn run(&mut self) {
        while let Some((from, msg)) = self.queue.pop_front() {
            for j in 0..self.engines.len() {
                if j == from || self.silent.contains(&j) {
                    continue;
                }
                let result = match &msg {
                    ConsensusMessage::Proposal(p) => self.engines[j].on_proposal(p.clone()),
                    ConsensusMessage::Vote(v) => self.engines[j].on_vote(v.clone()),
                };
                match result {
                    Ok(out) => self.handle(j, out),
                    Err(e) => assert!(!e.is_fatal(), "fatal error at validator {}: {}", j, e),
                }
            }
        }
    }

    fn timeout_all(&mut self, height: u64, round: u32, phase: Phase) {
        for i in 0..self.engines.len() {
            if self.silent.contains(&i) {
                continue;
            }
            let out = self.engines[i].on_timeout(height, round, phase).expect("timeout");
            self.handle(i, out);
        }
    }

    fn live_commits(&self) -> Vec<&Block> {
        self.committed
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.silent.contains(i))
            .filter_map(|(_, b)| b.as_ref())
            .collect()
    }
}

#[test]
fn four_validators_commit_the_same_block() {
    let mut sim = Sim::new(&[10, 10, 10, 10]);
    sim.start(1);
    sim.run();

    let commits = sim.live_commits();
    assert_eq!(commits.len(), 4, "every validator commits");
    let hash = &commits[0].hash;
    assert!(commits.iter().all(|b| &b.hash == hash));

    let proposer = sim.proposer_index(1, 0);
    assert_eq!(commits[0].proposer, sim.engines[proposer].address());
    for block in commits {
        assert!(block.signatures.len() >= 3);
        qc::verify_commit(block, &sim.set, 2, 3).expect("commit certificate");
    }
    assert!(sim.engines.iter().all(|e| e.phase() == Phase::Commit));
}

#[test]
fn commits_with_one_silent_validator() {
    let mut sim = Sim::new(&[10, 10, 10, 10]);
    let proposer = sim.proposer_index(1, 0);
    let silent = (0..4).find(|i| *i != proposer).expect("non-proposer");
    sim.silent.insert(silent);

    sim.start(1);
    sim.run();

    let commits = sim.live_commits();
    assert_eq!(commits.len(), 3);
    for block in commits {
        assert_eq!(block.signatures.len(), 3);
        assert!(block
            .signatures
            .iter()
            .all(|s| s.validator != sim.engines[silent].address()));
        qc::verify_commit(block, &sim.set, 2, 3).expect("commit certificate");
    }
}

#[test]
fn silent_proposer_forces_a_view_change() {
    let mut sim = Sim::new(&[10, 10, 10, 10]);
    let first = sim.proposer_index(1, 0);
    sim.silent.insert(first);

    sim.start(1);
    sim.run();
    assert!(sim.live_commits().is_empty(), "no proposal, no commit");

    sim.timeout_all(1, 0, Phase::Propose);
    sim.run();

    let second = sim.proposer_index(1, 1);
    assert_ne!(first, second);
    let commits = sim.live_commits();
    assert_eq!(commits.len(), 3);
    for block in commits {
        assert_eq!(block.proposer, sim.engines[second].address());
        assert!(block.signatures.iter().all(|s| s.round == 1));
    }
    assert!(sim
        .engines
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != first)
        .all(|(_, e)| e.round() == 1));
}

#[test]
fn quorum_is_weighted_by_stake() {
    // seed 1 carries 70 of 100 and sorts first; height 4 gives it the proposer slot
    let mut alone = Sim::new(&[70, 10, 10, 10]);
    alone.silent.extend([1, 2, 3]);
    alone.start(4);
    assert_eq!(alone.proposer_index(4, 0), 0);
    alone.run();
    let commits = alone.live_commits();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].signatures.len(), 1);
    qc::verify_commit(commits[0], &alone.set, 2, 3).expect("single heavy signer suffices");

    // three of four validators but only 60 of 100 stake: no commit
    let mut light = Sim::new(&[40, 20, 20, 20]);
    let light_proposer = light.proposer_index(1, 0);
    let heavy_light = (0..4)
        .find(|i| light.set.stake_of(light.engines[*i].address()) == 40)
        .expect("heaviest");
    assert_ne!(light_proposer, heavy_light);
    light.silent.insert(heavy_light);
    light.start(1);
    light.run();
    assert!(light.live_commits().is_empty());
    assert!(light.engines[light_proposer].state().prevotes.stake >= 60);
}

#[test]
fn max_rounds_halts_every_engine() {
    let mut sim = Sim::new(&[10, 10, 10, 10]);
    let rounds = EngineConfig::default().max_rounds_per_height;
    for i in 0..4 {
        sim.silent.insert(i);
    }
    sim.start(1);

    for engine in sim.engines.iter_mut() {
        let mut last = Ok(EngineOutput::default());
        for round in 0..rounds {
            last = engine.on_timeout(1, round, Phase::Propose);
        }
        assert_eq!(
            last.unwrap_err(),
            ConsensusError::MaxRoundsExceeded { height: 1, rounds }
        );
        assert!(engine.is_halted());
        assert!(engine.state().halted);
    }
}
