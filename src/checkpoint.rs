//! Checkpoint persistence for the listener
//!
//! A checkpoint is the next block height to scan for one (chain, relayer)
//! pair. Every height below it has had all of its events handed to the router.
//! The listener stores a checkpoint before moving its cursor, so a crash can
//! only cause re-delivery, never a gap.

use alloy::primitives::Address;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{ChainError, Result};
use crate::types::ChainId;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Stored next-block height, if any
    async fn load(&self) -> Result<Option<u64>>;

    /// Durably record `height` as the next block to scan
    async fn store(&self, height: u64) -> Result<()>;
}

/// Starting height for the listener.
///
/// A fresh start uses the configured height as-is; otherwise the configured
/// height can only move the stored checkpoint forward.
pub fn resume_height(stored: Option<u64>, configured: u64, fresh_start: bool) -> u64 {
    if fresh_start {
        return configured;
    }
    match stored {
        Some(stored) => stored.max(configured),
        None => configured,
    }
}

pub(crate) fn store_err(context: &str, e: impl std::fmt::Display) -> ChainError {
    ChainError::Checkpoint(format!("{}: {}", context, e))
}

/// One small file per (relayer, chain) holding the height as decimal text
pub struct FileBlockstore {
    path: PathBuf,
}

impl FileBlockstore {
    pub async fn open(dir: impl AsRef<Path>, chain: ChainId, relayer: Address) -> Result<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| store_err(&format!("failed to create {}", dir.display()), e))?;
        let path = dir.join(format!("{:#x}-{}.block", relayer, chain));
        info!(path = %path.display(), "Using file blockstore");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CheckpointStore for FileBlockstore {
    async fn load(&self) -> Result<Option<u64>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(store_err("failed to read blockstore", e)),
        };
        let height = contents
            .trim()
            .parse::<u64>()
            .map_err(|e| store_err(&format!("corrupt blockstore {}", self.path.display()), e))?;
        Ok(Some(height))
    }

    async fn store(&self, height: u64) -> Result<()> {
        let tmp = self.path.with_extension("block.tmp");
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| store_err("failed to create blockstore", e))?;
        file.write_all(height.to_string().as_bytes())
            .await
            .map_err(|e| store_err("failed to write blockstore", e))?;
        file.sync_all()
            .await
            .map_err(|e| store_err("failed to sync blockstore", e))?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| store_err("failed to replace blockstore", e))?;
        debug!(height, "Stored checkpoint");
        Ok(())
    }
}

/// Postgres-backed store, shared by relayers running against one database
pub struct PgBlockstore {
    pool: PgPool,
    chain: ChainId,
    relayer: String,
}

impl PgBlockstore {
    pub async fn connect(database_url: &str, chain: ChainId, relayer: Address) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await
            .map_err(|e| store_err("failed to connect to database", e))?;
        Self::with_pool(pool, chain, relayer).await
    }

    pub async fn with_pool(pool: PgPool, chain: ChainId, relayer: Address) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| store_err("failed to run checkpoint migrations", e))?;
        Ok(Self {
            pool,
            chain,
            relayer: format!("{:#x}", relayer),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CheckpointStore for PgBlockstore {
    async fn load(&self) -> Result<Option<u64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"SELECT next_block FROM relayer_checkpoints WHERE chain_id = $1 AND relayer = $2"#,
        )
        .bind(self.chain.0 as i16)
        .bind(&self.relayer)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_err("failed to load checkpoint", e))?;

        Ok(row.map(|r| r.0 as u64))
    }

    async fn store(&self, height: u64) -> Result<()> {
        let height = i64::try_from(height)
            .map_err(|_| ChainError::Checkpoint(format!("height {} out of range", height)))?;
        sqlx::query(
            r#"
            INSERT INTO relayer_checkpoints (chain_id, relayer, next_block)
            VALUES ($1, $2, $3)
            ON CONFLICT (chain_id, relayer) DO UPDATE SET next_block = $3, updated_at = NOW()
            "#,
        )
        .bind(self.chain.0 as i16)
        .bind(&self.relayer)
        .bind(height)
        .execute(&self.pool)
        .await
        .map_err(|e| store_err(&format!("failed to store checkpoint for chain {}", self.chain), e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_height_prefers_higher() {
        assert_eq!(resume_height(Some(90), 0, false), 90);
        assert_eq!(resume_height(Some(90), 120, false), 120);
        assert_eq!(resume_height(None, 42, false), 42);
    }

    #[test]
    fn test_resume_height_never_moves_down_without_fresh_start() {
        assert_eq!(resume_height(Some(500), 100, false), 500);
    }

    #[test]
    fn test_fresh_start_uses_configured() {
        assert_eq!(resume_height(Some(500), 100, true), 100);
        assert_eq!(resume_height(None, 7, true), 7);
    }
}
