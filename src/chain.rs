//! Chain runtime
//!
//! Owns one chain's connection, listener and writer. The host process builds
//! one runtime per configured chain, registers them all with its router and
//! starts them; fatal errors come back on the system-error channel.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bridge::{Bridge, EvmBridge};
use crate::checkpoint::{resume_height, CheckpointStore, FileBlockstore, PgBlockstore};
use crate::config::ChainConfig;
use crate::connection::{Connection, EvmConnection};
use crate::error::{ChainError, Result, SystemErrorSender};
use crate::listener::Listener;
use crate::pending::{FileProposalStore, PgProposalStore, ProposalStore};
use crate::router::Router;
use crate::stop::StopSignal;
use crate::types::{ChainId, Message};
use crate::writer::{Writer, WriterHandle};

pub use crate::listener::{LatestBlock, SharedLatestBlock};

fn config_err(e: eyre::Report) -> ChainError {
    ChainError::Config(format!("{:#}", e))
}

pub struct ChainRuntime {
    id: ChainId,
    name: String,
    conn: Arc<dyn Connection>,
    stop: StopSignal,
    listener: Option<Listener>,
    writer: Arc<Writer>,
    writer_handle: WriterHandle,
    inbox: Option<mpsc::UnboundedReceiver<Message>>,
    latest: SharedLatestBlock,
    tasks: Vec<JoinHandle<()>>,
    started: bool,
}

impl ChainRuntime {
    /// Build a runtime against a live EVM endpoint
    pub async fn initialize(cfg: ChainConfig, sys_err: SystemErrorSender) -> Result<Self> {
        cfg.validate().map_err(config_err)?;
        let keypair = cfg
            .keypair()
            .map_err(|e| ChainError::Keystore(format!("{:#}", e)))?;
        let relayer = keypair.address();
        info!(chain = %cfg.name, chain_id = %cfg.id, %relayer, "Initializing chain");

        let (store, proposals): (Arc<dyn CheckpointStore>, Arc<dyn ProposalStore>) =
            match &cfg.checkpoint_database_url {
                Some(url) => {
                    let blocks = PgBlockstore::connect(url, cfg.id, relayer).await?;
                    let proposals =
                        PgProposalStore::with_pool(blocks.pool().clone(), cfg.id, relayer).await?;
                    (Arc::new(blocks), Arc::new(proposals))
                }
                None => (
                    Arc::new(FileBlockstore::open(&cfg.blockstore_path, cfg.id, relayer).await?),
                    Arc::new(
                        FileProposalStore::open(&cfg.blockstore_path, cfg.id, relayer).await?,
                    ),
                ),
            };

        let conn = EvmConnection::new(&cfg.endpoint, keypair, cfg.gas_limit, cfg.poll_interval())?;
        let bridge = EvmBridge::new(cfg.bridge().map_err(config_err)?, conn.provider());

        Self::assemble(
            cfg,
            Arc::new(conn),
            Arc::new(bridge),
            store,
            proposals,
            sys_err,
        )
        .await
    }

    /// Build a runtime from already constructed capabilities.
    ///
    /// Connects, checks the deployed contracts and loads the checkpoint. On
    /// failure the connection is closed and no runtime is returned.
    pub async fn assemble(
        cfg: ChainConfig,
        conn: Arc<dyn Connection>,
        bridge: Arc<dyn Bridge>,
        store: Arc<dyn CheckpointStore>,
        proposals: Arc<dyn ProposalStore>,
        sys_err: SystemErrorSender,
    ) -> Result<Self> {
        match Self::build(&cfg, conn.clone(), bridge, store, proposals, sys_err).await {
            Ok(runtime) => Ok(runtime),
            Err(e) => {
                error!(chain = %cfg.name, error = %e, "Chain initialization failed");
                conn.close();
                Err(e)
            }
        }
    }

    async fn build(
        cfg: &ChainConfig,
        conn: Arc<dyn Connection>,
        bridge: Arc<dyn Bridge>,
        store: Arc<dyn CheckpointStore>,
        proposals: Arc<dyn ProposalStore>,
        sys_err: SystemErrorSender,
    ) -> Result<Self> {
        conn.connect().await?;

        let listener_config = cfg.listener_config().map_err(config_err)?;
        let writer_config = cfg.writer_config().map_err(config_err)?;
        let gas = cfg.gas_pricer().map_err(config_err)?;

        conn.ensure_has_bytecode(bridge.address()).await?;
        for handler in listener_config.handlers.addresses() {
            conn.ensure_has_bytecode(handler).await?;
        }

        if cfg.verify_chain_id {
            let actual = bridge.chain_id().await?;
            if actual != cfg.id {
                return Err(ChainError::ChainIdMismatch {
                    expected: cfg.id,
                    actual,
                });
            }
        }

        let stored = if cfg.fresh_start {
            None
        } else {
            store.load().await?
        };
        let start = if cfg.latest_block {
            conn.latest_block().await?
        } else {
            resume_height(stored, cfg.start_block, cfg.fresh_start)
        };
        info!(
            chain = %cfg.name,
            stored_checkpoint = ?stored,
            start_block = start,
            "Resolved start block"
        );

        let stop = StopSignal::new();
        let listener = Listener::new(
            cfg.id,
            cfg.name.clone(),
            listener_config,
            conn.clone(),
            bridge.clone(),
            store,
            start,
            stored,
            stop.clone(),
            sys_err.clone(),
        );
        let writer = Arc::new(Writer::new(
            cfg.id,
            cfg.name.clone(),
            writer_config,
            conn.clone(),
            bridge,
            proposals,
            gas,
            stop.clone(),
            sys_err,
        ));
        let (writer_handle, inbox) = WriterHandle::channel(cfg.id);

        Ok(Self {
            id: cfg.id,
            name: cfg.name.clone(),
            conn,
            stop,
            latest: listener.latest_block(),
            listener: Some(listener),
            writer,
            writer_handle,
            inbox: Some(inbox),
            tasks: Vec::new(),
            started: false,
        })
    }

    /// Register the writer with `router` and give the listener its outlet
    pub fn set_router(&mut self, router: Arc<dyn Router>) {
        router.listen(self.id, Arc::new(self.writer_handle.clone()));
        match self.listener.as_mut() {
            Some(listener) => listener.set_router(router),
            None => warn!(chain = %self.name, "Router set after start; listener keeps its router"),
        }
    }

    /// Spawn the listener and writer loops
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(ChainError::AlreadyStarted);
        }
        match &self.listener {
            Some(listener) if listener.has_router() => {}
            _ => return Err(ChainError::NotReady),
        }
        let Some(listener) = self.listener.take() else {
            return Err(ChainError::NotReady);
        };

        let listener_task = tokio::spawn(listener.run());

        let Some(inbox) = self.inbox.take() else {
            listener_task.abort();
            return Err(ChainError::NotReady);
        };
        let writer_task = tokio::spawn(self.writer.clone().run(inbox));

        self.tasks = vec![listener_task, writer_task];
        self.started = true;
        info!(chain = %self.name, chain_id = %self.id, "Chain started");
        Ok(())
    }

    /// Signal both loops to stop and close the connection. Does not wait.
    pub fn stop(&self) {
        info!(chain = %self.name, "Stopping chain");
        self.stop.stop();
        self.conn.close();
    }

    /// Wait for the spawned loops to finish after [`stop`](Self::stop)
    pub async fn join(&mut self) {
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(chain = %self.name, error = %e, "Chain task failed");
            }
        }
    }

    pub fn id(&self) -> ChainId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn latest_block(&self) -> LatestBlock {
        self.latest.read().map(|latest| *latest).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::DepositRecord;
    use crate::error::SystemError;
    use crate::testing::{
        deposit_log, init_tracing, MemoryCheckpointStore, MemoryProposalStore, MockBridge,
        MockConnection, RecordingRouter, BRIDGE, ERC20_HANDLER,
    };
    use crate::types::DepositNonce;
    use alloy::primitives::{Bytes, B256, U256};
    use std::time::Duration;

    struct Parts {
        conn: Arc<MockConnection>,
        bridge: Arc<MockBridge>,
        store: Arc<MemoryCheckpointStore>,
        proposals: Arc<MemoryProposalStore>,
    }

    fn cfg(id: u8) -> ChainConfig {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "name": format!("chain-{}", id),
            "endpoint": "http://localhost:8545",
            "private_key": "0x0000000000000000000000000000000000000000000000000000000000000001",
            "bridge_address": format!("{}", BRIDGE),
            "erc20_handler": format!("{}", ERC20_HANDLER),
            "block_confirmations": 5,
            "poll_interval_ms": 5,
            "block_retry_interval_ms": 1,
            "tx_retry_interval_ms": 1,
        }))
        .unwrap()
    }

    fn parts(head: u64, stored: Option<u64>) -> Parts {
        init_tracing();
        Parts {
            conn: Arc::new(MockConnection::new(head)),
            bridge: Arc::new(MockBridge::new()),
            store: Arc::new(MemoryCheckpointStore::new(stored)),
            proposals: Arc::new(MemoryProposalStore::new()),
        }
    }

    async fn assemble(
        cfg: ChainConfig,
        parts: &Parts,
    ) -> (Result<ChainRuntime>, mpsc::UnboundedReceiver<SystemError>) {
        let (sys_tx, sys_rx) = mpsc::unbounded_channel();
        let runtime = ChainRuntime::assemble(
            cfg,
            parts.conn.clone(),
            parts.bridge.clone(),
            parts.store.clone(),
            parts.proposals.clone(),
            sys_tx,
        )
        .await;
        (runtime, sys_rx)
    }

    #[tokio::test]
    async fn test_start_requires_router() {
        let parts = parts(100, None);
        let (runtime, _sys_rx) = assemble(cfg(1), &parts).await;
        let mut runtime = runtime.unwrap();

        assert!(parts.conn.is_connected());
        assert!(matches!(runtime.start(), Err(ChainError::NotReady)));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let parts = parts(100, None);
        let (runtime, _sys_rx) = assemble(cfg(1), &parts).await;
        let mut runtime = runtime.unwrap();
        runtime.set_router(Arc::new(RecordingRouter::new()));

        runtime.start().unwrap();
        assert!(matches!(runtime.start(), Err(ChainError::AlreadyStarted)));

        runtime.stop();
        runtime.join().await;
    }

    #[tokio::test]
    async fn test_missing_bytecode_aborts_assembly() {
        let parts = parts(100, None);
        parts.conn.remove_bytecode(ERC20_HANDLER);

        let (runtime, _sys_rx) = assemble(cfg(1), &parts).await;

        assert!(matches!(
            runtime,
            Err(ChainError::MissingBytecode(addr)) if addr == ERC20_HANDLER
        ));
        assert!(parts.conn.is_closed());
    }

    #[tokio::test]
    async fn test_chain_id_verification() {
        let parts = parts(100, None);
        parts.bridge.set_chain_id(ChainId(9));

        // Off by default
        let (runtime, _sys_rx) = assemble(cfg(1), &parts).await;
        assert!(runtime.is_ok());

        let mut config = cfg(1);
        config.verify_chain_id = true;
        let parts = self::parts(100, None);
        parts.bridge.set_chain_id(ChainId(9));
        let (runtime, _sys_rx) = assemble(config, &parts).await;
        assert!(matches!(
            runtime,
            Err(ChainError::ChainIdMismatch {
                expected: ChainId(1),
                actual: ChainId(9)
            })
        ));
        assert!(parts.conn.is_closed());
    }

    #[tokio::test]
    async fn test_checkpoint_load_failure_aborts_assembly() {
        let parts = parts(100, None);
        parts.store.fail_loads(1);

        let (runtime, _sys_rx) = assemble(cfg(1), &parts).await;

        assert!(matches!(runtime, Err(ChainError::Checkpoint(_))));
        assert!(parts.conn.is_closed());
    }

    #[tokio::test]
    async fn test_fresh_start_ignores_checkpoint() {
        let parts = parts(100, Some(500));
        let mut config = cfg(1);
        config.start_block = 90;
        config.fresh_start = true;
        let (runtime, mut sys_rx) = assemble(config, &parts).await;
        let mut runtime = runtime.unwrap();
        runtime.set_router(Arc::new(RecordingRouter::new()));

        runtime.start().unwrap();
        for _ in 0..100 {
            if parts.store.current() == Some(96) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        runtime.stop();
        runtime.join().await;

        assert_eq!(parts.conn.filter_ranges().first(), Some(&(90, 95)));
        assert!(sys_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_closes_connection_and_exits() {
        let parts = parts(100, Some(99));
        let (runtime, _sys_rx) = assemble(cfg(1), &parts).await;
        let mut runtime = runtime.unwrap();
        runtime.set_router(Arc::new(RecordingRouter::new()));
        runtime.start().unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        runtime.stop();
        runtime.stop();

        tokio::time::timeout(Duration::from_secs(1), runtime.join())
            .await
            .expect("runtime should stop");
        assert!(parts.conn.is_closed());
        assert_eq!(runtime.latest_block().height, 100);
    }

    #[tokio::test]
    async fn test_deposit_is_voted_on_destination() {
        let source = parts(100, Some(90));
        let destination = parts(200, None);
        let router = Arc::new(RecordingRouter::new());
        let resource = B256::repeat_byte(0x01);

        source.bridge.map_resource(resource, ERC20_HANDLER);
        source.bridge.set_deposit_record(
            ERC20_HANDLER,
            DepositNonce(1),
            ChainId(2),
            DepositRecord::Fungible {
                amount: U256::from(1_000u64),
                recipient: Bytes::from(vec![0xcc; 20]),
            },
        );
        source
            .conn
            .push_log(deposit_log(BRIDGE, 92, 0, ChainId(2), resource, 1));

        let mut dest_cfg = cfg(2);
        dest_cfg.latest_block = true;
        let (chain1, mut sys_rx1) = assemble(cfg(1), &source).await;
        let (chain2, mut sys_rx2) = assemble(dest_cfg, &destination).await;
        let mut chain1 = chain1.unwrap();
        let mut chain2 = chain2.unwrap();
        chain1.set_router(router.clone());
        chain2.set_router(router.clone());
        chain1.start().unwrap();
        chain2.start().unwrap();

        for _ in 0..200 {
            if !destination.bridge.votes().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        chain1.stop();
        chain2.stop();
        chain1.join().await;
        chain2.join().await;

        let votes = destination.bridge.votes();
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].source, ChainId(1));
        assert_eq!(votes[0].nonce, DepositNonce(1));
        assert_eq!(votes[0].resource_id, resource);
        assert_eq!(router.messages().len(), 1);
        assert!(sys_rx1.try_recv().is_err());
        assert!(sys_rx2.try_recv().is_err());
    }
}
