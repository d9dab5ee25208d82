//! Durable record of proposal data awaiting execution
//!
//! A relayer learns a proposal's data from the source-chain deposit, but
//! executes it only after the destination emits `ProposalPassed`. The
//! listener's checkpoint moves past the deposit long before that, so the data
//! is written here when the vote is handled and removed once the proposal is
//! executed or cancelled.

use alloy::primitives::{Address, Bytes};
use async_trait::async_trait;
use sqlx::postgres::PgPool;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::checkpoint::store_err;
use crate::error::Result;
use crate::types::ChainId;

#[async_trait]
pub trait ProposalStore: Send + Sync {
    async fn save(&self, key: [u8; 32], data: &Bytes) -> Result<()>;

    async fn load(&self, key: &[u8; 32]) -> Result<Option<Bytes>>;

    /// Forget `key`. Removing an absent key is not an error.
    async fn remove(&self, key: &[u8; 32]) -> Result<()>;
}

/// One file per proposal under `<dir>/<relayer>-<chain>.proposals/`
pub struct FileProposalStore {
    dir: PathBuf,
}

impl FileProposalStore {
    pub async fn open(dir: impl AsRef<Path>, chain: ChainId, relayer: Address) -> Result<Self> {
        let dir = dir
            .as_ref()
            .join(format!("{:#x}-{}.proposals", relayer, chain));
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| store_err(&format!("failed to create {}", dir.display()), e))?;
        info!(path = %dir.display(), "Using file proposal store");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &[u8; 32]) -> PathBuf {
        self.dir.join(format!("{}.data", hex::encode(key)))
    }
}

#[async_trait]
impl ProposalStore for FileProposalStore {
    async fn save(&self, key: [u8; 32], data: &Bytes) -> Result<()> {
        let path = self.path(&key);
        let tmp = path.with_extension("data.tmp");
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| store_err("failed to create proposal file", e))?;
        file.write_all(hex::encode(data).as_bytes())
            .await
            .map_err(|e| store_err("failed to write proposal file", e))?;
        file.sync_all()
            .await
            .map_err(|e| store_err("failed to sync proposal file", e))?;
        drop(file);
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| store_err("failed to replace proposal file", e))?;
        debug!(key = %hex::encode(key), "Stored proposal data");
        Ok(())
    }

    async fn load(&self, key: &[u8; 32]) -> Result<Option<Bytes>> {
        let path = self.path(key);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(store_err("failed to read proposal file", e)),
        };
        let data = hex::decode(contents.trim())
            .map_err(|e| store_err(&format!("corrupt proposal file {}", path.display()), e))?;
        Ok(Some(Bytes::from(data)))
    }

    async fn remove(&self, key: &[u8; 32]) -> Result<()> {
        match tokio::fs::remove_file(self.path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(store_err("failed to remove proposal file", e)),
        }
    }
}

/// Postgres-backed store sharing the checkpoint database
pub struct PgProposalStore {
    pool: PgPool,
    chain: ChainId,
    relayer: String,
}

impl PgProposalStore {
    pub async fn with_pool(pool: PgPool, chain: ChainId, relayer: Address) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| store_err("failed to run proposal store migrations", e))?;
        Ok(Self {
            pool,
            chain,
            relayer: format!("{:#x}", relayer),
        })
    }
}

#[async_trait]
impl ProposalStore for PgProposalStore {
    async fn save(&self, key: [u8; 32], data: &Bytes) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO relayer_pending_proposals (chain_id, relayer, proposal_key, data)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (chain_id, relayer, proposal_key) DO UPDATE SET data = $4
            "#,
        )
        .bind(self.chain.0 as i16)
        .bind(&self.relayer)
        .bind(key.to_vec())
        .bind(data.to_vec())
        .execute(&self.pool)
        .await
        .map_err(|e| store_err("failed to store proposal data", e))?;
        Ok(())
    }

    async fn load(&self, key: &[u8; 32]) -> Result<Option<Bytes>> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as(
            r#"
            SELECT data FROM relayer_pending_proposals
            WHERE chain_id = $1 AND relayer = $2 AND proposal_key = $3
            "#,
        )
        .bind(self.chain.0 as i16)
        .bind(&self.relayer)
        .bind(key.to_vec())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_err("failed to load proposal data", e))?;

        Ok(row.map(|r| Bytes::from(r.0)))
    }

    async fn remove(&self, key: &[u8; 32]) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM relayer_pending_proposals
            WHERE chain_id = $1 AND relayer = $2 AND proposal_key = $3
            "#,
        )
        .bind(self.chain.0 as i16)
        .bind(&self.relayer)
        .bind(key.to_vec())
        .execute(&self.pool)
        .await
        .map_err(|e| store_err("failed to remove proposal data", e))?;
        Ok(())
    }
}
