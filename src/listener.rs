//! Block listener
//!
//! Scans confirmed blocks for bridge events, turns them into router messages
//! and commits a checkpoint once every message of a batch was accepted by the
//! router. Delivery is at-least-once and ordered by (block, log index).

use std::cmp::min;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::bridge::{Bridge, HandlerSet};
use crate::checkpoint::CheckpointStore;
use crate::connection::{ChainLog, Connection, LogFilter};
use crate::error::{ChainError, Result, SystemError, SystemErrorSender};
use crate::events::{self, BridgeEvent};
use crate::metrics;
use crate::retry::RetryConfig;
use crate::router::Router;
use crate::stop::StopSignal;
use crate::types::{ChainId, Message, MessageKind};

/// Latest chain head seen by the listener, for telemetry
#[derive(Debug, Clone, Copy)]
pub struct LatestBlock {
    pub height: u64,
    pub last_updated: Instant,
}

impl Default for LatestBlock {
    fn default() -> Self {
        Self {
            height: 0,
            last_updated: Instant::now(),
        }
    }
}

pub type SharedLatestBlock = Arc<RwLock<LatestBlock>>;

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Blocks to stay behind the head
    pub confirmations: u64,
    /// Upper bound on `target - cursor` per batch
    pub max_batch_size: u64,
    pub poll_interval: Duration,
    /// Budget for consecutive failed polls
    pub retry: RetryConfig,
    pub handlers: HandlerSet,
}

/// Result of one poll of the chain head
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Poll {
    /// A batch was committed; `caught_up` if it reached the confirmed head
    Scanned { caught_up: bool },
    /// Not enough confirmations yet
    Waited,
    Stopped,
}

pub struct Listener {
    chain: ChainId,
    name: String,
    config: ListenerConfig,
    conn: Arc<dyn Connection>,
    bridge: Arc<dyn Bridge>,
    store: Arc<dyn CheckpointStore>,
    router: Option<Arc<dyn Router>>,
    cursor: u64,
    /// Highest height whose events were all handed to the router
    committed: Option<u64>,
    latest: SharedLatestBlock,
    stop: StopSignal,
    sys_err: SystemErrorSender,
}

impl Listener {
    /// `start` is the first height to scan; `stored` is the checkpoint loaded
    /// from the store, which bounds how far the head may recede.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: ChainId,
        name: String,
        config: ListenerConfig,
        conn: Arc<dyn Connection>,
        bridge: Arc<dyn Bridge>,
        store: Arc<dyn CheckpointStore>,
        start: u64,
        stored: Option<u64>,
        stop: StopSignal,
        sys_err: SystemErrorSender,
    ) -> Self {
        Self {
            chain,
            name,
            config,
            conn,
            bridge,
            store,
            router: None,
            cursor: start,
            committed: stored.filter(|h| *h > 0).map(|h| h - 1),
            latest: Arc::new(RwLock::new(LatestBlock::default())),
            stop,
            sys_err,
        }
    }

    pub fn set_router(&mut self, router: Arc<dyn Router>) {
        self.router = Some(router);
    }

    pub fn has_router(&self) -> bool {
        self.router.is_some()
    }

    pub fn latest_block(&self) -> SharedLatestBlock {
        self.latest.clone()
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Scan until the stop signal fires or a fatal error is reported
    pub async fn run(mut self) {
        let Some(router) = self.router.clone() else {
            self.report(ChainError::NotReady);
            return;
        };

        info!(
            chain = %self.name,
            chain_id = %self.chain,
            start_block = self.cursor,
            confirmations = self.config.confirmations,
            "Listener started"
        );

        let mut failures = 0u32;
        while !self.stop.is_stopped() {
            match self.poll(router.as_ref()).await {
                Ok(Poll::Stopped) => break,
                Ok(Poll::Waited) => failures = 0,
                Ok(Poll::Scanned { caught_up }) => {
                    failures = 0;
                    if caught_up && !self.stop.sleep(self.config.poll_interval).await {
                        break;
                    }
                }
                Err(e) if e.is_fatal() => {
                    error!(chain = %self.name, error = %e, "Listener halted");
                    self.report(e);
                    return;
                }
                Err(e) => {
                    metrics::record_error(&self.name, e.label());
                    failures += 1;
                    if !self.config.retry.should_retry(failures) {
                        error!(
                            chain = %self.name,
                            block = self.cursor,
                            attempts = failures,
                            error = %e,
                            "Listener retry budget exhausted"
                        );
                        self.report(ChainError::RetriesExhausted {
                            operation: "block scan",
                            attempts: failures,
                            last_error: e.to_string(),
                        });
                        return;
                    }

                    let backoff = self.config.retry.backoff_for_attempt(failures - 1);
                    warn!(
                        chain = %self.name,
                        block = self.cursor,
                        attempt = failures,
                        ?backoff,
                        error = %e,
                        "Block scan failed, retrying"
                    );
                    if !self.stop.sleep(backoff).await {
                        break;
                    }
                }
            }
        }

        info!(chain = %self.name, block = self.cursor, "Listener stopped");
    }

    async fn poll(&mut self, router: &dyn Router) -> Result<Poll> {
        let latest = self.conn.latest_block().await?;
        self.record_latest(latest);

        if let Some(committed) = self.committed {
            if latest < committed {
                return Err(ChainError::ReorgViolation {
                    head: latest,
                    committed,
                });
            }
        }

        if latest.saturating_sub(self.cursor) < self.config.confirmations
            || latest < self.cursor
        {
            debug!(
                chain = %self.name,
                latest,
                cursor = self.cursor,
                "Waiting for block confirmations"
            );
            tokio::select! {
                _ = self.stop.stopped() => return Ok(Poll::Stopped),
                res = self.conn.wait_for_block(self.cursor, self.config.confirmations) => res?,
            }
            return Ok(Poll::Waited);
        }

        let confirmed = latest - self.config.confirmations;
        let target = min(self.cursor.saturating_add(self.config.max_batch_size), confirmed);
        self.scan_range(router, self.cursor, target).await?;

        self.store.store(target + 1).await?;
        let scanned = target + 1 - self.cursor;
        self.cursor = target + 1;
        self.committed = Some(target);
        metrics::record_blocks_processed(&self.name, scanned, latest, self.cursor);

        Ok(Poll::Scanned {
            caught_up: target == confirmed,
        })
    }

    /// Hand every event in `[from, to]` to the router, in order
    async fn scan_range(&self, router: &dyn Router, from: u64, to: u64) -> Result<()> {
        debug!(chain = %self.name, from_block = from, to_block = to, "Processing blocks");

        let mut addresses = vec![self.bridge.address()];
        addresses.extend(self.config.handlers.addresses());
        let filter = LogFilter {
            from_block: from,
            to_block: to,
            addresses,
            topics: events::watched_topics(),
        };

        let mut logs = self.conn.filter_logs(&filter).await?;
        logs.sort_by_key(|log| (log.block_number, log.log_index));

        for log in &logs {
            let message = match self.decode(log).await {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(ChainError::Decode(reason)) => {
                    warn!(
                        chain = %self.name,
                        block = log.block_number,
                        log_index = log.log_index,
                        tx_hash = ?log.tx_hash,
                        reason = %reason,
                        "Skipping undecodable log"
                    );
                    metrics::record_event_skipped(&self.name);
                    continue;
                }
                Err(e) => return Err(e),
            };

            info!(
                chain = %self.name,
                block = log.block_number,
                message = %message,
                "Routing message"
            );
            let kind = message.kind.name();
            router.send(message).await.map_err(|e| match e {
                ChainError::Router(_) => e,
                other => ChainError::Router(other.to_string()),
            })?;
            metrics::record_event_routed(&self.name, kind);
        }

        Ok(())
    }

    async fn decode(&self, log: &ChainLog) -> Result<Option<Message>> {
        let Some(event) = events::decode_log(log)? else {
            return Err(ChainError::Decode(format!(
                "unrecognised topic {:?}",
                log.topics.first()
            )));
        };

        match event {
            BridgeEvent::Deposit {
                destination,
                resource_id,
                deposit_nonce,
            } => {
                let handler = self.bridge.handler_for_resource(resource_id).await?;
                let kind = self.config.handlers.kind_of(handler).ok_or_else(|| {
                    ChainError::Decode(format!(
                        "resource {} maps to unknown handler {}",
                        resource_id, handler
                    ))
                })?;
                let record = self
                    .bridge
                    .deposit_record(kind, handler, deposit_nonce, destination)
                    .await?;

                Ok(Some(Message {
                    source: self.chain,
                    destination,
                    deposit_nonce,
                    resource_id,
                    kind: record.into_kind(),
                }))
            }
            BridgeEvent::ProposalEvent {
                origin,
                deposit_nonce,
                status,
                resource_id,
                data_hash,
            } if status.is_finalized() => Ok(Some(Message {
                source: origin,
                destination: self.chain,
                deposit_nonce,
                resource_id,
                kind: MessageKind::ProposalPassed { data_hash },
            })),
            BridgeEvent::ProposalEvent {
                origin,
                deposit_nonce,
                status,
                ..
            } => {
                debug!(chain = %self.name, %origin, %deposit_nonce, %status, "Proposal status changed");
                Ok(None)
            }
            BridgeEvent::ProposalVote {
                origin,
                deposit_nonce,
                status,
                ..
            } => {
                debug!(chain = %self.name, %origin, %deposit_nonce, %status, "Proposal vote");
                Ok(None)
            }
        }
    }

    fn record_latest(&self, height: u64) {
        if let Ok(mut latest) = self.latest.write() {
            latest.height = height;
            latest.last_updated = Instant::now();
        }
    }

    fn report(&self, error: ChainError) {
        metrics::record_error(&self.name, error.label());
        let _ = self.sys_err.send(SystemError {
            chain: self.chain,
            error,
        });
    }
}
