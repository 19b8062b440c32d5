use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct NatsArgs {
    #[arg(long, env = "NATS_URL", default_value = "nats://localhost:4222")]
    pub nats_url: String,

    /// Client name presented to the broker.
    #[arg(long, env = "NATS_CLIENT_ID", default_value = "worker-p")]
    pub nats_client_id: String,

    #[arg(long, env = "NATS_USER")]
    pub nats_user: Option<String>,

    #[arg(long, env = "NATS_PASSWORD")]
    pub nats_password: Option<String>,
}

impl NatsArgs {
    pub async fn connect(&self) -> anyhow::Result<async_nats::Client> {
        let mut opts = async_nats::ConnectOptions::new().name(&self.nats_client_id);
        if let (Some(user), Some(password)) = (&self.nats_user, &self.nats_password) {
            opts = opts.user_and_password(user.clone(), password.clone());
        }
        Ok(opts.connect(&self.nats_url).await?)
    }
}

#[derive(Parser, Debug, Clone)]
pub struct PostgresArgs {
    #[arg(long, env = "POSTGRES_HOST", default_value = "localhost")]
    pub postgres_host: String,

    #[arg(long, env = "POSTGRES_PORT", default_value_t = 5432)]
    pub postgres_port: u16,

    #[arg(long, env = "POSTGRES_DATABASE", default_value = "postgres")]
    pub postgres_database: String,

    #[arg(long, env = "POSTGRES_USERNAME", default_value = "postgres")]
    pub postgres_username: String,

    #[arg(long, env = "POSTGRES_PASSWORD")]
    pub postgres_password: Option<String>,
}

/// Object-store ("vfs") backend location. Any S3-compatible endpoint works.
#[derive(Parser, Debug, Clone)]
pub struct VfsArgs {
    #[arg(long, env = "VFS_BUCKET", default_value = "keel")]
    pub vfs_bucket: String,

    #[arg(long, env = "VFS_REGION", default_value = "us-east-1")]
    pub vfs_region: String,

    #[arg(long, env = "VFS_ENDPOINT")]
    pub vfs_endpoint: Option<String>,

    /// Key prefix under which all resources are stored.
    #[arg(long, env = "VFS_PREFIX", default_value = "keel")]
    pub vfs_prefix: String,
}

#[derive(Parser, Debug, Clone)]
pub struct StoreArgs {
    /// Persistence backend: "vfs" or "postgres".
    #[arg(long, env = "KEEL_STORE", default_value = "vfs")]
    pub store: String,

    #[clap(flatten)]
    pub vfs: VfsArgs,

    #[clap(flatten)]
    pub postgres: PostgresArgs,
}
