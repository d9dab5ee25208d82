//! Proposal writer
//!
//! Turns messages routed to this chain into votes and executions. Each
//! attempt re-reads the proposal state first, so re-delivered messages and
//! proposals already handled by other relayers cost no transaction.
//!
//! Proposal data from transfers is written to a [`ProposalStore`] before the
//! vote, so a `ProposalPassed` seen after a restart can still be executed.

use alloy::primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::bounded_cache::BoundedPendingCache;
use crate::bridge::{Bridge, HandlerSet};
use crate::connection::Connection;
use crate::error::{ChainError, Result, SystemError, SystemErrorSender};
use crate::gas::GasPricer;
use crate::hash::{proposal_data_hash, proposal_key};
use crate::metrics;
use crate::pending::ProposalStore;
use crate::proposal::{required_action, ProposalAction, ProposalGoal, ProposalStatus, SkipReason};
use crate::retry::{classify, ErrorClass, RetryConfig};
use crate::router::MessageHandler;
use crate::stop::StopSignal;
use crate::types::{ChainId, Message, MessageKind};

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub handlers: HandlerSet,
    /// Attempt budget and backoff for submissions
    pub retry: RetryConfig,
    pub proposal_cache_size: usize,
    pub proposal_cache_ttl: Duration,
}

/// What happened to a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Submitted(B256),
    /// The proposal state made the action pointless
    Skipped(SkipReason),
    /// The message cannot be acted on; reported and discarded
    Dropped(String),
}

/// What a message asks of the bridge
struct Intent {
    goal: ProposalGoal,
    data_hash: B256,
    key: [u8; 32],
    /// Proposal data carried by a transfer
    data: Option<Bytes>,
}

pub struct Writer {
    chain: ChainId,
    name: String,
    config: WriterConfig,
    conn: Arc<dyn Connection>,
    bridge: Arc<dyn Bridge>,
    gas: GasPricer,
    proposals: Mutex<BoundedPendingCache<Bytes>>,
    store: Arc<dyn ProposalStore>,
    stop: StopSignal,
    sys_err: SystemErrorSender,
}

impl Writer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: ChainId,
        name: String,
        config: WriterConfig,
        conn: Arc<dyn Connection>,
        bridge: Arc<dyn Bridge>,
        store: Arc<dyn ProposalStore>,
        gas: GasPricer,
        stop: StopSignal,
        sys_err: SystemErrorSender,
    ) -> Self {
        let proposals =
            BoundedPendingCache::new(config.proposal_cache_size, config.proposal_cache_ttl);
        Self {
            chain,
            name,
            config,
            conn,
            bridge,
            gas,
            proposals: Mutex::new(proposals),
            store,
            stop,
            sys_err,
        }
    }

    /// Handle one message to completion: submitted, skipped, or dropped.
    ///
    /// Returns `RetriesExhausted` if recoverable failures outlast the attempt budget.
    pub async fn handle(&self, message: Message) -> Result<Outcome> {
        let started = Instant::now();
        let intent = match self.intent(&message) {
            Ok(intent) => intent,
            Err(reason) => return Ok(self.drop_message(&message, reason)),
        };
        if let Some(data) = &intent.data {
            self.remember(&message, intent.key, data).await;
        }

        let mut attempt = 0u32;
        let mut gas_bumps = 0u32;
        loop {
            if self.stop.is_stopped() {
                return Ok(Outcome::Dropped("writer stopping".into()));
            }

            let err = match self.attempt(&message, &intent, gas_bumps).await {
                Ok(outcome) => {
                    self.record_outcome(&message, &intent, &outcome, started);
                    if Self::resolves_proposal(&intent, &outcome) {
                        self.forget(&message, &intent.key).await;
                    }
                    return Ok(outcome);
                }
                Err(e) => e,
            };

            let class = classify(&err);
            metrics::record_error(&self.name, class.as_str());
            if !class.is_recoverable() {
                return Ok(self.drop_message(&message, err.to_string()));
            }

            attempt += 1;
            if !self.config.retry.should_retry(attempt) {
                metrics::record_transaction(&self.name, intent.goal.as_str(), "failed");
                return Err(ChainError::RetriesExhausted {
                    operation: "proposal submission",
                    attempts: attempt,
                    last_error: err.to_string(),
                });
            }
            if class == ErrorClass::Underpriced {
                gas_bumps += 1;
            }

            let backoff = self.config.retry.backoff_for_attempt(attempt - 1);
            warn!(
                chain = %self.name,
                message = %message,
                attempt,
                class = class.as_str(),
                ?backoff,
                error = %err,
                "Submission failed, retrying"
            );
            if !self.stop.sleep(backoff).await {
                return Ok(Outcome::Dropped("writer stopping".into()));
            }
        }
    }

    /// Work out the goal and proposal data hash. Errors are drop reasons.
    fn intent(&self, message: &Message) -> std::result::Result<Intent, String> {
        if message.destination != self.chain {
            return Err(format!("message addressed to chain {}", message.destination));
        }

        if let MessageKind::ProposalPassed { data_hash } = message.kind {
            return Ok(Intent {
                goal: ProposalGoal::Execute,
                data_hash,
                key: proposal_key(message.source.0, message.deposit_nonce.0, &data_hash),
                data: None,
            });
        }

        let (Some(kind), Some(data)) = (message.kind.handler_kind(), message.kind.proposal_data())
        else {
            return Err("message carries no proposal data".into());
        };
        let handler: Address = self
            .config
            .handlers
            .get(kind)
            .ok_or_else(|| format!("no {} handler configured", kind))?;

        let data_hash = proposal_data_hash(handler, &data);
        Ok(Intent {
            goal: ProposalGoal::Vote,
            data_hash,
            key: proposal_key(message.source.0, message.deposit_nonce.0, &data_hash),
            data: Some(data),
        })
    }

    /// Keep proposal data for a later execution. A store failure is logged;
    /// the vote goes ahead and the data lives in memory only.
    async fn remember(&self, message: &Message, key: [u8; 32], data: &Bytes) {
        if let Ok(mut proposals) = self.proposals.lock() {
            proposals.insert(key, data.clone());
        }
        if let Err(e) = self.store.save(key, data).await {
            metrics::record_error(&self.name, e.label());
            warn!(chain = %self.name, message = %message, error = %e, "Failed to persist proposal data");
        }
    }

    async fn forget(&self, message: &Message, key: &[u8; 32]) {
        if let Err(e) = self.store.remove(key).await {
            warn!(chain = %self.name, message = %message, error = %e, "Failed to remove proposal data");
        }
    }

    /// Memory first, then the durable store
    async fn proposal_data(&self, key: &[u8; 32]) -> Result<Option<Bytes>> {
        let cached = match self.proposals.lock() {
            Ok(proposals) => proposals.get(key).cloned(),
            Err(_) => None,
        };
        if cached.is_some() {
            return Ok(cached);
        }

        let stored = self.store.load(key).await?;
        if let (Some(data), Ok(mut proposals)) = (&stored, self.proposals.lock()) {
            proposals.insert(*key, data.clone());
        }
        Ok(stored)
    }

    /// Whether the proposal needs no further action from this relayer
    fn resolves_proposal(intent: &Intent, outcome: &Outcome) -> bool {
        match outcome {
            Outcome::Submitted(_) => intent.goal == ProposalGoal::Execute,
            Outcome::Skipped(SkipReason::AlreadyFinalized(status)) => {
                matches!(status, ProposalStatus::Executed | ProposalStatus::Cancelled)
            }
            _ => false,
        }
    }

    /// Read proposal state and, if still useful, submit under the account lock
    async fn attempt(&self, message: &Message, intent: &Intent, gas_bumps: u32) -> Result<Outcome> {
        let status = self
            .bridge
            .proposal_status(message.source, message.deposit_nonce, intent.data_hash)
            .await?;
        let already_voted = if intent.goal == ProposalGoal::Vote && status.is_active() {
            self.bridge
                .has_voted(
                    message.source,
                    message.deposit_nonce,
                    intent.data_hash,
                    self.conn.keypair().address(),
                )
                .await?
        } else {
            false
        };

        let action = required_action(intent.goal, status, already_voted);
        debug!(
            chain = %self.name,
            message = %message,
            %status,
            already_voted,
            ?action,
            "Proposal state read"
        );

        match action {
            ProposalAction::Skip(reason) => Ok(Outcome::Skipped(reason)),
            ProposalAction::Vote => {
                let mut opts = self.conn.lock_and_update_opts().await?;
                opts.gas_price = self.gas.gas_price(self.conn.as_ref(), gas_bumps).await?;
                let tx_hash = self
                    .bridge
                    .vote_proposal(
                        message.source,
                        message.deposit_nonce,
                        message.resource_id,
                        intent.data_hash,
                        &opts,
                    )
                    .await?;
                Ok(Outcome::Submitted(tx_hash))
            }
            ProposalAction::Execute => {
                let Some(data) = self.proposal_data(&intent.key).await? else {
                    return Ok(Outcome::Dropped(
                        "no proposal data for passed proposal".into(),
                    ));
                };
                let mut opts = self.conn.lock_and_update_opts().await?;
                opts.gas_price = self.gas.gas_price(self.conn.as_ref(), gas_bumps).await?;
                let tx_hash = self
                    .bridge
                    .execute_proposal(
                        message.source,
                        message.deposit_nonce,
                        data,
                        message.resource_id,
                        &opts,
                    )
                    .await?;
                Ok(Outcome::Submitted(tx_hash))
            }
        }
    }

    fn record_outcome(&self, message: &Message, intent: &Intent, outcome: &Outcome, started: Instant) {
        let action = intent.goal.as_str();
        match outcome {
            Outcome::Submitted(tx_hash) => {
                info!(
                    chain = %self.name,
                    message = %message,
                    action,
                    %tx_hash,
                    "Proposal transaction submitted"
                );
                metrics::record_transaction(&self.name, action, "submitted");
                metrics::record_submission_latency(
                    &self.name,
                    action,
                    started.elapsed().as_secs_f64(),
                );
            }
            Outcome::Skipped(reason) => {
                info!(chain = %self.name, message = %message, action, %reason, "Skipping proposal");
                metrics::record_transaction(&self.name, action, "skipped");
            }
            Outcome::Dropped(reason) => {
                warn!(chain = %self.name, message = %message, action, %reason, "Dropping message");
                metrics::record_transaction(&self.name, action, "dropped");
            }
        }
    }

    fn drop_message(&self, message: &Message, reason: String) -> Outcome {
        error!(chain = %self.name, message = %message, reason = %reason, "Dropping message");
        metrics::record_transaction(&self.name, message.kind.name(), "dropped");
        Outcome::Dropped(reason)
    }

    async fn process(&self, message: Message) {
        if let Err(e) = self.handle(message).await {
            error!(chain = %self.name, error = %e, "Message handling failed");
            if e.is_fatal() {
                let _ = self.sys_err.send(SystemError {
                    chain: self.chain,
                    error: e,
                });
            }
        }
    }

    /// Dispatch loop: one task per inbound message until the stop signal fires
    pub async fn run(self: Arc<Self>, mut inbox: mpsc::UnboundedReceiver<Message>) {
        info!(chain = %self.name, chain_id = %self.chain, "Writer started");
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.stop.stopped() => break,
                message = inbox.recv() => match message {
                    Some(message) => {
                        let writer = self.clone();
                        tasks.spawn(async move { writer.process(message).await });
                    }
                    None => break,
                },
                Some(res) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = res {
                        error!(chain = %self.name, error = %e, "Writer task panicked");
                    }
                }
            }
        }

        // In-flight tasks observe the stop signal at their next wait
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!(chain = %self.name, error = %e, "Writer task panicked");
            }
        }
        info!(chain = %self.name, "Writer stopped");
    }
}

/// Router-facing side of a writer: queues messages for the dispatch loop
#[derive(Clone)]
pub struct WriterHandle {
    chain: ChainId,
    inbox: mpsc::UnboundedSender<Message>,
}

impl WriterHandle {
    pub fn channel(chain: ChainId) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (inbox, rx) = mpsc::unbounded_channel();
        (Self { chain, inbox }, rx)
    }
}

#[async_trait]
impl MessageHandler for WriterHandle {
    async fn resolve_message(&self, message: Message) -> Result<()> {
        if message.destination != self.chain {
            return Err(ChainError::Router(format!(
                "message for chain {} delivered to chain {}",
                message.destination, self.chain
            )));
        }
        self.inbox.send(message).map_err(|_| ChainError::Closed)
    }
}
