//! Postgres-backed durable state
//!
//! Owns the `documents`, `machines` and `catalog` tables. The `users` table
//! belongs to AuthService; a minimal definition is created here only so the
//! `documents.user_id` reference resolves on a fresh dev database.

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, QueryBuilder, Row};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{CatalogEntry, DocumentRecord, Machine, MachineStatus};

/// Max bind parameters per INSERT; Postgres caps at 65535 and catalog rows
/// carry 6 binds each, so 500 rows stays far under the limit.
const CATALOG_CHUNK: usize = 500;

/// Durable store for sessions, documents, machines and catalogs.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    slow_query: Duration,
}

impl PostgresStore {
    /// Connect with retries and initialize the schema.
    ///
    /// Schema init failure is the one hard-fatal error in the system; callers
    /// are expected to abort startup on it.
    pub async fn connect(url: &str, max_connections: u32, slow_query_ms: u64) -> Result<Self> {
        let pool = create_pool_with_retries(url, max_connections, 5).await?;
        let store = Self {
            pool,
            slow_query: Duration::from_millis(slow_query_ms),
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// Wrap an existing pool (tests, embedded use).
    pub fn from_pool(pool: PgPool, slow_query_ms: u64) -> Self {
        Self {
            pool,
            slow_query: Duration::from_millis(slow_query_ms),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Idempotent schema creation, run once at boot.
    pub async fn init_schema(&self) -> Result<()> {
        let statements = [
            // Owned by AuthService; minimal shape so the FK below resolves in dev.
            r#"CREATE TABLE IF NOT EXISTS users (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                email TEXT UNIQUE,
                username TEXT,
                name TEXT,
                plan TEXT DEFAULT 'free',
                created_at TIMESTAMPTZ DEFAULT NOW()
            )"#,
            r#"CREATE TABLE IF NOT EXISTS documents (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                user_id UUID REFERENCES users(id),
                project TEXT,
                doc_path TEXT,
                yjs_state BYTEA,
                content_text TEXT,
                content_hash TEXT,
                byte_size INTEGER DEFAULT 0,
                updated_at TIMESTAMPTZ DEFAULT NOW(),
                created_at TIMESTAMPTZ DEFAULT NOW(),
                UNIQUE(user_id, project, doc_path)
            )"#,
            r#"CREATE INDEX IF NOT EXISTS idx_documents_user_project
                ON documents(user_id, project)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_documents_updated_at
                ON documents(updated_at)"#,
            r#"CREATE TABLE IF NOT EXISTS machines (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                user_id UUID REFERENCES users(id),
                machine_id TEXT NOT NULL,
                machine_name TEXT,
                hostname TEXT,
                capabilities TEXT[] DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'offline',
                last_seen TIMESTAMPTZ DEFAULT NOW(),
                connected_at TIMESTAMPTZ,
                UNIQUE(user_id, machine_id)
            )"#,
            r#"CREATE TABLE IF NOT EXISTS catalog (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                user_id UUID REFERENCES users(id),
                machine_id TEXT NOT NULL,
                project TEXT NOT NULL,
                doc_path TEXT NOT NULL,
                content_hash TEXT,
                byte_size INTEGER DEFAULT 0,
                updated_at TIMESTAMPTZ DEFAULT NOW()
            )"#,
            r#"CREATE INDEX IF NOT EXISTS idx_catalog_user_machine
                ON catalog(user_id, machine_id)"#,
        ];

        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await?;
        }

        tracing::info!("database schema initialized");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------

    /// Load the persisted CRDT state and text materialization of one doc.
    pub async fn load_document(
        &self,
        user_id: &Uuid,
        project: &str,
        doc_path: &str,
    ) -> Result<Option<(Option<Vec<u8>>, Option<String>)>> {
        let started = Instant::now();
        let row = sqlx::query(
            "SELECT yjs_state, content_text FROM documents
             WHERE user_id = $1 AND project = $2 AND doc_path = $3",
        )
        .bind(user_id)
        .bind(project)
        .bind(doc_path)
        .fetch_optional(&self.pool)
        .await?;
        self.observe("load_document", started);

        Ok(row.map(|r| (r.get("yjs_state"), r.get("content_text"))))
    }

    /// Upsert one document on its unique triple.
    ///
    /// `content_hash` and `byte_size` are derived here so every writer agrees
    /// on how they are computed.
    pub async fn save_document(
        &self,
        user_id: &Uuid,
        project: &str,
        doc_path: &str,
        yjs_state: &[u8],
        content_text: &str,
    ) -> Result<()> {
        let content_hash = format!("{:x}", md5::compute(content_text.as_bytes()));
        let byte_size = yjs_state.len() as i32;

        let started = Instant::now();
        sqlx::query(
            "INSERT INTO documents
                 (user_id, project, doc_path, yjs_state, content_text, content_hash, byte_size)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (user_id, project, doc_path) DO UPDATE SET
                 yjs_state = EXCLUDED.yjs_state,
                 content_text = EXCLUDED.content_text,
                 content_hash = EXCLUDED.content_hash,
                 byte_size = EXCLUDED.byte_size,
                 updated_at = NOW()",
        )
        .bind(user_id)
        .bind(project)
        .bind(doc_path)
        .bind(yjs_state)
        .bind(content_text)
        .bind(content_hash)
        .bind(byte_size)
        .execute(&self.pool)
        .await?;
        self.observe("save_document", started);

        Ok(())
    }

    /// All documents of a user, newest first, without payloads.
    pub async fn list_user_documents(&self, user_id: &Uuid) -> Result<Vec<DocumentRecord>> {
        self.list_documents(user_id, None, false, false).await
    }

    /// Documents of one project.
    pub async fn list_project_documents(
        &self,
        user_id: &Uuid,
        project: &str,
    ) -> Result<Vec<DocumentRecord>> {
        self.list_documents(user_id, Some(project), false, false).await
    }

    /// Listing with optional payload columns (`content_text`, `yjs_state`).
    pub async fn list_documents(
        &self,
        user_id: &Uuid,
        project: Option<&str>,
        with_content: bool,
        with_yjs: bool,
    ) -> Result<Vec<DocumentRecord>> {
        let started = Instant::now();
        let rows = match project {
            Some(p) => {
                sqlx::query(
                    "SELECT user_id, project, doc_path, content_text, yjs_state,
                            content_hash, byte_size, updated_at, created_at
                     FROM documents
                     WHERE user_id = $1 AND project = $2
                     ORDER BY updated_at DESC",
                )
                .bind(user_id)
                .bind(p)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT user_id, project, doc_path, content_text, yjs_state,
                            content_hash, byte_size, updated_at, created_at
                     FROM documents
                     WHERE user_id = $1
                     ORDER BY updated_at DESC",
                )
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        self.observe("list_documents", started);

        Ok(rows
            .into_iter()
            .map(|r| DocumentRecord {
                user_id: r.get("user_id"),
                project: r.get("project"),
                doc_path: r.get("doc_path"),
                content_text: if with_content { r.get("content_text") } else { None },
                yjs_state: if with_yjs { r.get("yjs_state") } else { None },
                content_hash: r.get("content_hash"),
                byte_size: r.get("byte_size"),
                updated_at: r.get("updated_at"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Machines
    // ------------------------------------------------------------------

    pub async fn upsert_machine(
        &self,
        user_id: &Uuid,
        machine_id: &str,
        machine_name: Option<&str>,
        hostname: Option<&str>,
        capabilities: &[String],
        status: MachineStatus,
    ) -> Result<()> {
        let started = Instant::now();
        sqlx::query(
            "INSERT INTO machines
                 (user_id, machine_id, machine_name, hostname, capabilities, status,
                  last_seen, connected_at)
             VALUES ($1, $2, $3, $4, $5, $6, NOW(),
                     CASE WHEN $6 = 'online' THEN NOW() ELSE NULL END)
             ON CONFLICT (user_id, machine_id) DO UPDATE SET
                 machine_name = COALESCE(EXCLUDED.machine_name, machines.machine_name),
                 hostname = COALESCE(EXCLUDED.hostname, machines.hostname),
                 capabilities = CASE WHEN cardinality(EXCLUDED.capabilities) > 0
                                     THEN EXCLUDED.capabilities
                                     ELSE machines.capabilities END,
                 status = EXCLUDED.status,
                 last_seen = NOW(),
                 connected_at = CASE WHEN EXCLUDED.status = 'online'
                                     THEN NOW()
                                     ELSE machines.connected_at END",
        )
        .bind(user_id)
        .bind(machine_id)
        .bind(machine_name)
        .bind(hostname)
        .bind(capabilities)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        self.observe("upsert_machine", started);

        Ok(())
    }

    pub async fn set_machine_offline(&self, user_id: &Uuid, machine_id: &str) -> Result<()> {
        let started = Instant::now();
        sqlx::query(
            "UPDATE machines SET status = 'offline', last_seen = NOW()
             WHERE user_id = $1 AND machine_id = $2",
        )
        .bind(user_id)
        .bind(machine_id)
        .execute(&self.pool)
        .await?;
        self.observe("set_machine_offline", started);

        Ok(())
    }

    pub async fn list_machines(&self, user_id: &Uuid) -> Result<Vec<Machine>> {
        let started = Instant::now();
        let rows = sqlx::query(
            "SELECT user_id, machine_id, machine_name, hostname, capabilities,
                    status, last_seen, connected_at
             FROM machines WHERE user_id = $1
             ORDER BY machine_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        self.observe("list_machines", started);

        Ok(rows
            .into_iter()
            .map(|r| Machine {
                user_id: r.get("user_id"),
                machine_id: r.get("machine_id"),
                machine_name: r.get("machine_name"),
                hostname: r.get("hostname"),
                capabilities: r.get("capabilities"),
                status: if r.get::<String, _>("status") == "online" {
                    MachineStatus::Online
                } else {
                    MachineStatus::Offline
                },
                last_seen: r.get("last_seen"),
                connected_at: r.get("connected_at"),
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Catalog
    // ------------------------------------------------------------------

    /// Atomically replace one machine's catalog rows.
    ///
    /// DELETE + chunked INSERT in a single transaction; any failure rolls the
    /// whole sync back so readers never see a half-replaced catalog.
    pub async fn sync_catalog(
        &self,
        user_id: &Uuid,
        machine_id: &str,
        entries: &[CatalogEntry],
    ) -> Result<()> {
        let started = Instant::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM catalog WHERE user_id = $1 AND machine_id = $2")
            .bind(user_id)
            .bind(machine_id)
            .execute(&mut *tx)
            .await?;

        for chunk in entries.chunks(CATALOG_CHUNK) {
            let mut builder = QueryBuilder::new(
                "INSERT INTO catalog (user_id, machine_id, project, doc_path, content_hash, byte_size) ",
            );
            builder.push_values(chunk, |mut b, entry| {
                b.push_bind(user_id)
                    .push_bind(machine_id)
                    .push_bind(&entry.project)
                    .push_bind(&entry.doc_path)
                    .push_bind(&entry.content_hash)
                    .push_bind(entry.byte_size);
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        self.observe("sync_catalog", started);

        tracing::debug!(
            user_id = %user_id,
            machine_id,
            entries = entries.len(),
            "catalog replaced"
        );
        Ok(())
    }

    /// Catalog rows for one user, optionally narrowed to a project.
    pub async fn list_catalog(
        &self,
        user_id: &Uuid,
        project: Option<&str>,
    ) -> Result<Vec<(String, CatalogEntry)>> {
        let started = Instant::now();
        let rows = match project {
            Some(p) => {
                sqlx::query(
                    "SELECT machine_id, project, doc_path, content_hash, byte_size
                     FROM catalog WHERE user_id = $1 AND project = $2
                     ORDER BY machine_id, project, doc_path",
                )
                .bind(user_id)
                .bind(p)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT machine_id, project, doc_path, content_hash, byte_size
                     FROM catalog WHERE user_id = $1
                     ORDER BY machine_id, project, doc_path",
                )
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        self.observe("list_catalog", started);

        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    r.get("machine_id"),
                    CatalogEntry {
                        project: r.get("project"),
                        doc_path: r.get("doc_path"),
                        content_hash: r.get("content_hash"),
                        byte_size: r.get("byte_size"),
                    },
                )
            })
            .collect())
    }

    /// Per-machine document/project counts for the compact machine list.
    pub async fn machine_doc_counts(&self, user_id: &Uuid) -> Result<Vec<(String, i64, i64)>> {
        let started = Instant::now();
        let rows = sqlx::query(
            "SELECT machine_id,
                    COUNT(*) AS docs,
                    COUNT(DISTINCT project) AS projects
             FROM catalog WHERE user_id = $1
             GROUP BY machine_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        self.observe("machine_doc_counts", started);

        Ok(rows
            .into_iter()
            .map(|r| (r.get("machine_id"), r.get("docs"), r.get("projects")))
            .collect())
    }

    fn observe(&self, what: &str, started: Instant) {
        let elapsed = started.elapsed();
        if elapsed >= self.slow_query {
            tracing::warn!(query = what, elapsed_ms = elapsed.as_millis() as u64, "slow query");
        }
    }
}

/// Create a Postgres pool with exponential-backoff retries.
async fn create_pool_with_retries(url: &str, max_connections: u32, max_retries: u32) -> Result<PgPool> {
    let mut attempt = 0u32;
    let base_delay = Duration::from_secs(1);

    loop {
        match PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
        {
            Ok(pool) => {
                tracing::info!(max_connections, "database connection pool created");
                return Ok(pool);
            }
            Err(e) => {
                attempt += 1;
                if attempt > max_retries {
                    tracing::error!(
                        "failed to connect to database at '{}' after {} attempts: {}",
                        sanitize_connection_url(url),
                        attempt,
                        e
                    );
                    return Err(Error::Database(e));
                }

                let delay = base_delay * 2_u32.pow(attempt.saturating_sub(1));
                tracing::warn!(
                    "database connection attempt {} failed: {}. Retrying in {:?}...",
                    attempt,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Strip the password out of a connection URL before logging it.
fn sanitize_connection_url(url: &str) -> String {
    if let (Some(scheme_end), Some(at_pos)) = (url.find("://"), url.find('@')) {
        let creds = &url[scheme_end + 3..at_pos];
        if let Some(colon) = creds.find(':') {
            let user = &creds[..colon];
            return format!("{}{}:***{}", &url[..scheme_end + 3], user, &url[at_pos..]);
        }
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_hides_password() {
        assert_eq!(
            sanitize_connection_url("postgres://app:hunter2@db:5432/notehub"),
            "postgres://app:***@db:5432/notehub"
        );
        // No credentials: unchanged.
        assert_eq!(
            sanitize_connection_url("postgres://localhost/notehub"),
            "postgres://localhost/notehub"
        );
    }

    #[test]
    fn catalog_chunk_stays_under_bind_limit() {
        // 6 binds per row; Postgres protocol caps at 65535 parameters.
        assert!(CATALOG_CHUNK * 6 < 65_535);
    }

    #[test]
    fn content_hash_is_md5_hex() {
        let digest = format!("{:x}", md5::compute(b"Hello world"));
        assert_eq!(digest, "3e25960a79dbc69b674cd4ec67a72c62");
    }
}
