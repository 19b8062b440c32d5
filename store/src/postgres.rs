//! Relational backend: one table per resource kind, autoincrement
//! primary keys, the operation code as an indexed external id.

use async_trait::async_trait;
use deadpool_postgres::{Config as PgConfig, ManagerConfig, Pool, RecyclingMethod};
use serde_json::Value;
use tokio_postgres::NoTls;
use tokio_postgres::types::ToSql;

use keel_common::args::PostgresArgs;
use keel_types::{CertBundle, SshKey};

use crate::{Backend, Kind, Scope, StoreError};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS cluster (
        id BIGSERIAL PRIMARY KEY,
        owner TEXT NOT NULL,
        name TEXT NOT NULL,
        data JSONB NOT NULL,
        UNIQUE (owner, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS machine (
        id BIGSERIAL PRIMARY KEY,
        owner TEXT NOT NULL,
        cluster TEXT NOT NULL,
        name TEXT NOT NULL,
        data JSONB NOT NULL,
        UNIQUE (owner, cluster, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS machine_set (
        id BIGSERIAL PRIMARY KEY,
        owner TEXT NOT NULL,
        cluster TEXT NOT NULL,
        name TEXT NOT NULL,
        data JSONB NOT NULL,
        UNIQUE (owner, cluster, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS operation (
        id BIGSERIAL PRIMARY KEY,
        code TEXT NOT NULL,
        data JSONB NOT NULL
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS operation_code_idx ON operation (code)",
    r#"
    CREATE TABLE IF NOT EXISTS credential (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        data JSONB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ssh_key (
        id BIGSERIAL PRIMARY KEY,
        owner TEXT NOT NULL,
        cluster TEXT NOT NULL,
        data JSONB NOT NULL,
        UNIQUE (owner, cluster)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS certificate (
        id BIGSERIAL PRIMARY KEY,
        owner TEXT NOT NULL,
        cluster TEXT NOT NULL,
        name TEXT NOT NULL,
        data JSONB NOT NULL,
        UNIQUE (owner, cluster, name)
    )
    "#,
];

pub struct PostgresBackend {
    pool: Pool,
}

/// How a kind's rows are addressed.
enum Addressing {
    /// owner + name
    Owned,
    /// owner + cluster + name
    Clustered,
    /// name only (operation code, credential name)
    Global,
}

fn addressing(kind: Kind) -> Addressing {
    match kind {
        Kind::Cluster => Addressing::Owned,
        Kind::Machine | Kind::MachineSet => Addressing::Clustered,
        Kind::Operation | Kind::Credential => Addressing::Global,
    }
}

fn name_column(kind: Kind) -> &'static str {
    match kind {
        Kind::Operation => "code",
        _ => "name",
    }
}

impl PostgresBackend {
    pub async fn connect(args: &PostgresArgs) -> anyhow::Result<PostgresBackend> {
        let mut cfg = PgConfig::new();
        cfg.host = Some(args.postgres_host.clone());
        cfg.port = Some(args.postgres_port);
        cfg.dbname = Some(args.postgres_database.clone());
        cfg.user = Some(args.postgres_username.clone());
        cfg.password = args.postgres_password.clone();
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        let pool = cfg.create_pool(Some(deadpool_postgres::Runtime::Tokio1), NoTls)?;
        let backend = PostgresBackend { pool };
        backend.init_schema().await?;
        Ok(backend)
    }

    async fn init_schema(&self) -> anyhow::Result<()> {
        let client = self.pool.get().await?;
        for stmt in SCHEMA {
            client.execute(*stmt, &[]).await?;
        }
        tracing::info!("database schema initialized");
        Ok(())
    }

    fn select_sql(kind: Kind) -> String {
        let table = kind.as_str();
        let name = name_column(kind);
        match addressing(kind) {
            Addressing::Owned => {
                format!("SELECT id, data FROM {table} WHERE owner = $1 AND {name} = $2")
            }
            Addressing::Clustered => format!(
                "SELECT id, data FROM {table} WHERE owner = $1 AND cluster = $2 AND {name} = $3"
            ),
            Addressing::Global => format!("SELECT id, data FROM {table} WHERE {name} = $1"),
        }
    }

    async fn select_row(
        &self,
        kind: Kind,
        scope: &Scope,
        name: &str,
    ) -> Result<Option<(i64, Value)>, StoreError> {
        let client = self.pool.get().await?;
        let sql = Self::select_sql(kind);
        let cluster = scope.cluster();
        let params: Vec<&(dyn ToSql + Sync)> = match addressing(kind) {
            Addressing::Owned => vec![&scope.owner, &name],
            Addressing::Clustered => vec![&scope.owner, &cluster, &name],
            Addressing::Global => vec![&name],
        };
        let rows = client.query(sql.as_str(), &params).await?;
        Ok(rows.first().map(|row| (row.get(0), row.get(1))))
    }
}

#[async_trait]
impl Backend for PostgresBackend {
    async fn get(&self, kind: Kind, scope: &Scope, name: &str) -> Result<Value, StoreError> {
        match self.select_row(kind, scope, name).await? {
            Some((id, mut data)) => {
                if kind == Kind::Operation {
                    data["id"] = Value::from(id);
                }
                Ok(data)
            }
            None => Err(StoreError::not_found(kind.as_str(), name)),
        }
    }

    async fn list(&self, kind: Kind, scope: &Scope) -> Result<Vec<Value>, StoreError> {
        let table = kind.as_str();
        let client = self.pool.get().await?;
        let rows = match addressing(kind) {
            Addressing::Owned => {
                let sql = format!("SELECT data FROM {table} WHERE owner = $1 ORDER BY id");
                client.query(sql.as_str(), &[&scope.owner]).await?
            }
            Addressing::Clustered => {
                let sql = format!(
                    "SELECT data FROM {table} WHERE owner = $1 AND cluster = $2 ORDER BY id"
                );
                client
                    .query(sql.as_str(), &[&scope.owner, &scope.cluster()])
                    .await?
            }
            Addressing::Global => {
                let sql = format!("SELECT data FROM {table} ORDER BY id");
                client.query(sql.as_str(), &[]).await?
            }
        };
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn create(
        &self,
        kind: Kind,
        scope: &Scope,
        name: &str,
        mut value: Value,
    ) -> Result<Value, StoreError> {
        if self.select_row(kind, scope, name).await?.is_some() {
            return Err(StoreError::already_exists(kind.as_str(), name));
        }
        let table = kind.as_str();
        let client = self.pool.get().await?;
        let row = match addressing(kind) {
            Addressing::Owned => {
                let sql = format!(
                    "INSERT INTO {table} (owner, name, data) VALUES ($1, $2, $3) RETURNING id"
                );
                client
                    .query_one(sql.as_str(), &[&scope.owner, &name, &value])
                    .await?
            }
            Addressing::Clustered => {
                let sql = format!(
                    "INSERT INTO {table} (owner, cluster, name, data) VALUES ($1, $2, $3, $4) RETURNING id"
                );
                client
                    .query_one(sql.as_str(), &[&scope.owner, &scope.cluster(), &name, &value])
                    .await?
            }
            Addressing::Global => {
                let name_col = name_column(kind);
                let sql = format!(
                    "INSERT INTO {table} ({name_col}, data) VALUES ($1, $2) RETURNING id"
                );
                client.query_one(sql.as_str(), &[&name, &value]).await?
            }
        };
        if kind == Kind::Operation {
            let id: i64 = row.get(0);
            value["id"] = Value::from(id);
            client
                .execute("UPDATE operation SET data = $1 WHERE id = $2", &[&value, &id])
                .await?;
        }
        Ok(value)
    }

    async fn update(
        &self,
        kind: Kind,
        scope: &Scope,
        name: &str,
        value: Value,
    ) -> Result<Value, StoreError> {
        let Some((id, _)) = self.select_row(kind, scope, name).await? else {
            return Err(StoreError::not_found(kind.as_str(), name));
        };
        let table = kind.as_str();
        let client = self.pool.get().await?;
        let sql = format!("UPDATE {table} SET data = $1 WHERE id = $2");
        client.execute(sql.as_str(), &[&value, &id]).await?;
        Ok(value)
    }

    async fn delete(&self, kind: Kind, scope: &Scope, name: &str) -> Result<(), StoreError> {
        let Some((id, _)) = self.select_row(kind, scope, name).await? else {
            return Err(StoreError::not_found(kind.as_str(), name));
        };
        let table = kind.as_str();
        let client = self.pool.get().await?;
        let sql = format!("DELETE FROM {table} WHERE id = $1");
        client.execute(sql.as_str(), &[&id]).await?;
        Ok(())
    }

    async fn get_cert(&self, scope: &Scope, name: &str) -> Result<CertBundle, StoreError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT data FROM certificate WHERE owner = $1 AND cluster = $2 AND name = $3",
                &[&scope.owner, &scope.cluster(), &name],
            )
            .await?;
        match rows.first() {
            Some(row) => Ok(serde_json::from_value(row.get(0))?),
            None => Err(StoreError::not_found("certificate", name)),
        }
    }

    async fn create_cert(
        &self,
        scope: &Scope,
        name: &str,
        bundle: &CertBundle,
    ) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        let data = serde_json::to_value(bundle)?;
        let inserted = client
            .execute(
                r#"
                INSERT INTO certificate (owner, cluster, name, data)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (owner, cluster, name) DO NOTHING
                "#,
                &[&scope.owner, &scope.cluster(), &name, &data],
            )
            .await?;
        if inserted == 0 {
            return Err(StoreError::already_exists("certificate", name));
        }
        Ok(())
    }

    async fn get_ssh_key(&self, scope: &Scope) -> Result<SshKey, StoreError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT data FROM ssh_key WHERE owner = $1 AND cluster = $2",
                &[&scope.owner, &scope.cluster()],
            )
            .await?;
        match rows.first() {
            Some(row) => Ok(serde_json::from_value(row.get(0))?),
            None => Err(StoreError::not_found("ssh key", scope.cluster())),
        }
    }

    async fn create_ssh_key(&self, scope: &Scope, key: &SshKey) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        let data = serde_json::to_value(key)?;
        let inserted = client
            .execute(
                r#"
                INSERT INTO ssh_key (owner, cluster, data)
                VALUES ($1, $2, $3)
                ON CONFLICT (owner, cluster) DO NOTHING
                "#,
                &[&scope.owner, &scope.cluster(), &data],
            )
            .await?;
        if inserted == 0 {
            return Err(StoreError::already_exists("ssh key", scope.cluster()));
        }
        Ok(())
    }
}
