//! In-memory doubles for the chain capabilities
//!
//! Used by unit tests and, with the `testing` feature, by downstream crates
//! that want to drive a [`crate::ChainRuntime`] without a node.

use alloy::primitives::{Address, Bytes, B256};
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::MutexGuard;

use crate::bridge::{Bridge, DepositRecord};
use crate::checkpoint::CheckpointStore;
use crate::connection::{CallOpts, ChainLog, Connection, Keypair, LogFilter, TransactOpts};
use crate::error::{ChainError, Result};
use crate::events::{DEPOSIT, PROPOSAL_EVENT, PROPOSAL_VOTE};
use crate::pending::ProposalStore;
use crate::proposal::ProposalStatus;
use crate::router::{MessageHandler, Router};
use crate::types::{ChainId, DepositNonce, HandlerKind, Message, ResourceId};

pub const BRIDGE: Address = Address::new([0xb0; 20]);
pub const ERC20_HANDLER: Address = Address::new([0x20; 20]);

/// Route `tracing` output to the test harness; `RUST_LOG` selects the level
#[cfg(test)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn word_u64(value: u64) -> B256 {
    B256::left_padding_from(&value.to_be_bytes())
}

fn tx_hash_for(block: u64, log_index: u64) -> B256 {
    let mut raw = [0u8; 16];
    raw[..8].copy_from_slice(&block.to_be_bytes());
    raw[8..].copy_from_slice(&log_index.to_be_bytes());
    B256::left_padding_from(&raw)
}

pub fn deposit_log(
    address: Address,
    block: u64,
    log_index: u64,
    destination: ChainId,
    resource_id: ResourceId,
    nonce: u64,
) -> ChainLog {
    ChainLog {
        address,
        topics: vec![
            DEPOSIT.topic(),
            B256::with_last_byte(destination.0),
            resource_id,
            word_u64(nonce),
        ],
        data: Bytes::new(),
        block_number: block,
        log_index,
        tx_hash: Some(tx_hash_for(block, log_index)),
    }
}

#[allow(clippy::too_many_arguments)]
pub fn proposal_event_log(
    address: Address,
    block: u64,
    log_index: u64,
    origin: ChainId,
    nonce: u64,
    status: ProposalStatus,
    resource_id: ResourceId,
    data_hash: B256,
) -> ChainLog {
    let mut data = resource_id.to_vec();
    data.extend_from_slice(data_hash.as_slice());
    ChainLog {
        address,
        topics: vec![
            PROPOSAL_EVENT.topic(),
            B256::with_last_byte(origin.0),
            word_u64(nonce),
            B256::with_last_byte(status as u8),
        ],
        data: data.into(),
        block_number: block,
        log_index,
        tx_hash: Some(tx_hash_for(block, log_index)),
    }
}

pub fn proposal_vote_log(
    address: Address,
    block: u64,
    log_index: u64,
    origin: ChainId,
    nonce: u64,
    status: ProposalStatus,
    resource_id: ResourceId,
) -> ChainLog {
    ChainLog {
        address,
        topics: vec![
            PROPOSAL_VOTE.topic(),
            B256::with_last_byte(origin.0),
            word_u64(nonce),
            B256::with_last_byte(status as u8),
        ],
        data: resource_id.to_vec().into(),
        block_number: block,
        log_index,
        tx_hash: Some(tx_hash_for(block, log_index)),
    }
}

/// Take one unit from a failure budget; `true` if this call should fail
fn take_failure(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Scripted chain: a settable head, a log set and a gas price
pub struct MockConnection {
    keypair: Keypair,
    opts: tokio::sync::Mutex<TransactOpts>,
    head: AtomicU64,
    head_after_wait: Mutex<Option<u64>>,
    latest_failures: AtomicU32,
    gas_price: Mutex<u128>,
    gas_price_fails: AtomicBool,
    logs: Mutex<Vec<ChainLog>>,
    filter_ranges: Mutex<Vec<(u64, u64)>>,
    waits: Mutex<Vec<(u64, u64)>>,
    missing_bytecode: Mutex<HashSet<Address>>,
    pending_nonce: AtomicU64,
    lock_count: AtomicU32,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl MockConnection {
    pub fn new(head: u64) -> Self {
        let keypair = Keypair::new(PrivateKeySigner::random());
        let opts = TransactOpts {
            from: keypair.address(),
            nonce: 0,
            gas_price: 0,
            gas_limit: 6_721_975,
            chain_id: 1337,
        };
        Self {
            keypair,
            opts: tokio::sync::Mutex::new(opts),
            head: AtomicU64::new(head),
            head_after_wait: Mutex::new(None),
            latest_failures: AtomicU32::new(0),
            gas_price: Mutex::new(1_000_000_000),
            gas_price_fails: AtomicBool::new(false),
            logs: Mutex::new(Vec::new()),
            filter_ranges: Mutex::new(Vec::new()),
            waits: Mutex::new(Vec::new()),
            missing_bytecode: Mutex::new(HashSet::new()),
            pending_nonce: AtomicU64::new(0),
            lock_count: AtomicU32::new(0),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    /// Jump the head to `head` when the next wait starts
    pub fn advance_head_on_wait(&self, head: u64) {
        *self.head_after_wait.lock().unwrap() = Some(head);
    }

    /// Fail the next `count` head queries
    pub fn fail_latest_block(&self, count: u32) {
        self.latest_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_gas_price(&self, price: u128) {
        *self.gas_price.lock().unwrap() = price;
    }

    pub fn fail_gas_price(&self, fail: bool) {
        self.gas_price_fails.store(fail, Ordering::SeqCst);
    }

    pub fn push_log(&self, log: ChainLog) {
        self.logs.lock().unwrap().push(log);
    }

    pub fn remove_bytecode(&self, address: Address) {
        self.missing_bytecode.lock().unwrap().insert(address);
    }

    /// Block ranges passed to `filter_logs`, in call order
    pub fn filter_ranges(&self) -> Vec<(u64, u64)> {
        self.filter_ranges.lock().unwrap().clone()
    }

    /// `(block, delay)` of every `wait_for_block` call
    pub fn waits(&self) -> Vec<(u64, u64)> {
        self.waits.lock().unwrap().clone()
    }

    /// Number of times the transaction options were locked
    pub fn lock_count(&self) -> u32 {
        self.lock_count.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ChainError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn connect(&self) -> Result<()> {
        self.check_open()?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    async fn lock_and_update_opts(&self) -> Result<MutexGuard<'_, TransactOpts>> {
        self.check_open()?;
        let mut opts = self.opts.lock().await;
        self.lock_count.fetch_add(1, Ordering::SeqCst);
        opts.nonce = self.pending_nonce.fetch_add(1, Ordering::SeqCst);
        Ok(opts)
    }

    fn call_opts(&self) -> CallOpts {
        CallOpts {
            from: self.keypair.address(),
        }
    }

    async fn ensure_has_bytecode(&self, address: Address) -> Result<()> {
        self.check_open()?;
        if self.missing_bytecode.lock().unwrap().contains(&address) {
            return Err(ChainError::MissingBytecode(address));
        }
        Ok(())
    }

    async fn latest_block(&self) -> Result<u64> {
        self.check_open()?;
        if take_failure(&self.latest_failures) {
            return Err(ChainError::Rpc("connection refused".into()));
        }
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn wait_for_block(&self, block: u64, delay: u64) -> Result<()> {
        self.waits.lock().unwrap().push((block, delay));
        let jump = self.head_after_wait.lock().unwrap().take();
        if let Some(head) = jump {
            self.set_head(head);
        }
        while self.head.load(Ordering::SeqCst) < block.saturating_add(delay) {
            self.check_open()?;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        Ok(())
    }

    async fn filter_logs(&self, filter: &LogFilter) -> Result<Vec<ChainLog>> {
        self.check_open()?;
        self.filter_ranges
            .lock()
            .unwrap()
            .push((filter.from_block, filter.to_block));
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|log| log.block_number >= filter.from_block && log.block_number <= filter.to_block)
            .filter(|log| filter.addresses.is_empty() || filter.addresses.contains(&log.address))
            .cloned()
            .collect())
    }

    async fn suggest_gas_price(&self) -> Result<u128> {
        self.check_open()?;
        if self.gas_price_fails.load(Ordering::SeqCst) {
            return Err(ChainError::Rpc("eth_gasPrice: 502 bad gateway".into()));
        }
        Ok(*self.gas_price.lock().unwrap())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedVote {
    pub source: ChainId,
    pub nonce: DepositNonce,
    pub resource_id: ResourceId,
    pub data_hash: B256,
    pub tx_nonce: u64,
    pub gas_price: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedExecution {
    pub source: ChainId,
    pub nonce: DepositNonce,
    pub resource_id: ResourceId,
    pub data: Bytes,
    pub tx_nonce: u64,
}

type ProposalKey = (ChainId, DepositNonce, B256);

/// Bridge contract state held in memory.
///
/// Votes move an inactive proposal to active; executions move it to executed.
pub struct MockBridge {
    chain_id: AtomicU8,
    resources: Mutex<HashMap<ResourceId, Address>>,
    deposits: Mutex<HashMap<(Address, DepositNonce, ChainId), DepositRecord>>,
    statuses: Mutex<HashMap<ProposalKey, ProposalStatus>>,
    voted: Mutex<HashSet<ProposalKey>>,
    read_failures: AtomicU32,
    status_reads: AtomicU32,
    submit_failures: Mutex<VecDeque<String>>,
    submit_delay: Mutex<Duration>,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
    tx_counter: AtomicU64,
    votes: Mutex<Vec<RecordedVote>>,
    executions: Mutex<Vec<RecordedExecution>>,
}

impl Default for MockBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBridge {
    pub fn new() -> Self {
        Self {
            chain_id: AtomicU8::new(1),
            resources: Mutex::new(HashMap::new()),
            deposits: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
            voted: Mutex::new(HashSet::new()),
            read_failures: AtomicU32::new(0),
            status_reads: AtomicU32::new(0),
            submit_failures: Mutex::new(VecDeque::new()),
            submit_delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
            tx_counter: AtomicU64::new(0),
            votes: Mutex::new(Vec::new()),
            executions: Mutex::new(Vec::new()),
        }
    }

    pub fn set_chain_id(&self, chain: ChainId) {
        self.chain_id.store(chain.0, Ordering::SeqCst);
    }

    pub fn map_resource(&self, resource_id: ResourceId, handler: Address) {
        self.resources.lock().unwrap().insert(resource_id, handler);
    }

    pub fn set_deposit_record(
        &self,
        handler: Address,
        nonce: DepositNonce,
        destination: ChainId,
        record: DepositRecord,
    ) {
        self.deposits
            .lock()
            .unwrap()
            .insert((handler, nonce, destination), record);
    }

    pub fn set_status(&self, source: ChainId, nonce: DepositNonce, data_hash: B256, status: ProposalStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert((source, nonce, data_hash), status);
    }

    pub fn set_voted(&self, source: ChainId, nonce: DepositNonce, data_hash: B256) {
        self.voted.lock().unwrap().insert((source, nonce, data_hash));
    }

    /// Fail the next `count` contract reads with an RPC error
    pub fn fail_reads(&self, count: u32) {
        self.read_failures.store(count, Ordering::SeqCst);
    }

    /// Queue node error strings for the next submissions
    pub fn fail_submissions(&self, errors: Vec<String>) {
        self.submit_failures.lock().unwrap().extend(errors);
    }

    pub fn set_submit_delay(&self, delay: Duration) {
        *self.submit_delay.lock().unwrap() = delay;
    }

    pub fn votes(&self) -> Vec<RecordedVote> {
        self.votes.lock().unwrap().clone()
    }

    pub fn executions(&self) -> Vec<RecordedExecution> {
        self.executions.lock().unwrap().clone()
    }

    pub fn clear_submissions(&self) {
        self.votes.lock().unwrap().clear();
        self.executions.lock().unwrap().clear();
    }

    pub fn status_reads(&self) -> u32 {
        self.status_reads.load(Ordering::SeqCst)
    }

    /// Highest number of submissions observed in flight at once
    pub fn max_concurrent_submissions(&self) -> u32 {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn read(&self) -> Result<()> {
        if take_failure(&self.read_failures) {
            return Err(ChainError::Rpc("connection reset by peer".into()));
        }
        Ok(())
    }

    fn status_of(&self, key: &ProposalKey) -> ProposalStatus {
        self.statuses
            .lock()
            .unwrap()
            .get(key)
            .copied()
            .unwrap_or(ProposalStatus::Inactive)
    }

    /// Simulated send: tracks overlap, then fails or yields a tx hash
    async fn submit(&self) -> Result<B256> {
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let delay = *self.submit_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failure = self.submit_failures.lock().unwrap().pop_front();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match failure {
            Some(error) => Err(ChainError::Submission(error)),
            None => Ok(word_u64(self.tx_counter.fetch_add(1, Ordering::SeqCst) + 1)),
        }
    }
}

#[async_trait]
impl Bridge for MockBridge {
    fn address(&self) -> Address {
        BRIDGE
    }

    async fn chain_id(&self) -> Result<ChainId> {
        self.read()?;
        Ok(ChainId(self.chain_id.load(Ordering::SeqCst)))
    }

    async fn handler_for_resource(&self, resource_id: ResourceId) -> Result<Address> {
        self.read()?;
        Ok(self
            .resources
            .lock()
            .unwrap()
            .get(&resource_id)
            .copied()
            .unwrap_or(Address::ZERO))
    }

    async fn deposit_record(
        &self,
        _kind: HandlerKind,
        handler: Address,
        nonce: DepositNonce,
        destination: ChainId,
    ) -> Result<DepositRecord> {
        self.read()?;
        self.deposits
            .lock()
            .unwrap()
            .get(&(handler, nonce, destination))
            .cloned()
            .ok_or_else(|| ChainError::Decode(format!("no deposit record for nonce {}", nonce)))
    }

    async fn proposal_status(
        &self,
        source: ChainId,
        nonce: DepositNonce,
        data_hash: B256,
    ) -> Result<ProposalStatus> {
        self.read()?;
        self.status_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.status_of(&(source, nonce, data_hash)))
    }

    async fn has_voted(
        &self,
        source: ChainId,
        nonce: DepositNonce,
        data_hash: B256,
        _relayer: Address,
    ) -> Result<bool> {
        self.read()?;
        Ok(self.voted.lock().unwrap().contains(&(source, nonce, data_hash)))
    }

    async fn vote_proposal(
        &self,
        source: ChainId,
        nonce: DepositNonce,
        resource_id: ResourceId,
        data_hash: B256,
        opts: &TransactOpts,
    ) -> Result<B256> {
        let tx_hash = self.submit().await?;
        let key = (source, nonce, data_hash);
        if self.status_of(&key) == ProposalStatus::Inactive {
            self.set_status(source, nonce, data_hash, ProposalStatus::Active);
        }
        self.voted.lock().unwrap().insert(key);
        self.votes.lock().unwrap().push(RecordedVote {
            source,
            nonce,
            resource_id,
            data_hash,
            tx_nonce: opts.nonce,
            gas_price: opts.gas_price,
        });
        Ok(tx_hash)
    }

    async fn execute_proposal(
        &self,
        source: ChainId,
        nonce: DepositNonce,
        data: Bytes,
        resource_id: ResourceId,
        opts: &TransactOpts,
    ) -> Result<B256> {
        let tx_hash = self.submit().await?;
        let data_hash = self
            .statuses
            .lock()
            .unwrap()
            .iter()
            .find(|((s, n, _), status)| *s == source && *n == nonce && **status == ProposalStatus::Passed)
            .map(|((_, _, hash), _)| *hash);
        if let Some(data_hash) = data_hash {
            self.set_status(source, nonce, data_hash, ProposalStatus::Executed);
        }
        self.executions.lock().unwrap().push(RecordedExecution {
            source,
            nonce,
            resource_id,
            data,
            tx_nonce: opts.nonce,
        });
        Ok(tx_hash)
    }
}

/// Checkpoint store kept in memory
pub struct MemoryCheckpointStore {
    height: Mutex<Option<u64>>,
    store_failures: AtomicU32,
    load_failures: AtomicU32,
}

impl MemoryCheckpointStore {
    pub fn new(height: Option<u64>) -> Self {
        Self {
            height: Mutex::new(height),
            store_failures: AtomicU32::new(0),
            load_failures: AtomicU32::new(0),
        }
    }

    pub fn current(&self) -> Option<u64> {
        *self.height.lock().unwrap()
    }

    pub fn fail_stores(&self, count: u32) {
        self.store_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_loads(&self, count: u32) {
        self.load_failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self) -> Result<Option<u64>> {
        if take_failure(&self.load_failures) {
            return Err(ChainError::Checkpoint("database unavailable".into()));
        }
        Ok(self.current())
    }

    async fn store(&self, height: u64) -> Result<()> {
        if take_failure(&self.store_failures) {
            return Err(ChainError::Checkpoint("disk full".into()));
        }
        *self.height.lock().unwrap() = Some(height);
        Ok(())
    }
}

/// Proposal store kept in memory; clone the `Arc` to share it across writers
#[derive(Default)]
pub struct MemoryProposalStore {
    entries: Mutex<HashMap<[u8; 32], Bytes>>,
    save_failures: AtomicU32,
}

impl MemoryProposalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fail_saves(&self, count: u32) {
        self.save_failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProposalStore for MemoryProposalStore {
    async fn save(&self, key: [u8; 32], data: &Bytes) -> Result<()> {
        if take_failure(&self.save_failures) {
            return Err(ChainError::Checkpoint("disk full".into()));
        }
        self.entries.lock().unwrap().insert(key, data.clone());
        Ok(())
    }

    async fn load(&self, key: &[u8; 32]) -> Result<Option<Bytes>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn remove(&self, key: &[u8; 32]) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Router that records sent messages and forwards them to registered handlers
#[derive(Default)]
pub struct RecordingRouter {
    messages: Mutex<Vec<Message>>,
    failures: AtomicU32,
    handlers: Mutex<HashMap<ChainId, Arc<dyn MessageHandler>>>,
}

impl RecordingRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    /// Reject the next `count` messages
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn handler(&self, chain: ChainId) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.lock().unwrap().get(&chain).cloned()
    }
}

#[async_trait]
impl Router for RecordingRouter {
    async fn send(&self, message: Message) -> Result<()> {
        if take_failure(&self.failures) {
            return Err(ChainError::Router("router queue full".into()));
        }
        self.messages.lock().unwrap().push(message.clone());
        if let Some(handler) = self.handler(message.destination) {
            handler.resolve_message(message).await?;
        }
        Ok(())
    }

    fn listen(&self, chain: ChainId, handler: Arc<dyn MessageHandler>) {
        self.handlers.lock().unwrap().insert(chain, handler);
    }
}
