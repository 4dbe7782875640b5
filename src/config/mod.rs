use std::{borrow::Cow, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
    value::magic::RelativePathBuf,
};
use hiqlite::{Node, NodeConfig, ServerTlsConfig, s3::EncKeys};
use jwt_simple::prelude::ES256KeyPair;
use p256::ecdsa::SigningKey;
use p256::pkcs8::EncodePrivateKey;
use platform_dirs::AppDirs;
use regex::Regex;
use sec1::DecodeEcPrivateKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub(crate) mod acl;
pub(crate) mod duration;

mod base64url {
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded: String = Deserialize::deserialize(deserializer)?;
        URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VesselNode {
    pub id: u64,
    pub addr_raft: String,
    pub addr_api: String,
    pub addr_registry: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TlsConfig {
    pub key: String,
    pub chain: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RaftConfig {
    pub address: String,
    pub secret: Option<String>,
    pub tls: Option<TlsConfig>,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            secret: None,
            tls: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ApiConfig {
    pub address: String,
    pub secret: Option<String>,
    pub tls: Option<TlsConfig>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            secret: None,
            tls: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PrometheusConfig {
    pub address: String,
    pub port: u16,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 9080,
        }
    }
}

#[derive(Clone)]
pub struct KeyPair {
    pub original: String,
    pub key_pair: Arc<ES256KeyPair>,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("original", &self.original)
            .finish()
    }
}

impl Serialize for KeyPair {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.original)
    }
}

fn load_keypair(pem: &str) -> Result<ES256KeyPair> {
    let signing_key = SigningKey::from_sec1_pem(pem)?;
    let der = signing_key.to_pkcs8_der()?;
    ES256KeyPair::from_der(der.as_bytes())
}

impl<'de> Deserialize<'de> for KeyPair {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let pem: String = Deserialize::deserialize(deserializer)?;
        let key_pair = Arc::new(load_keypair(&pem).map_err(serde::de::Error::custom)?);

        Ok(KeyPair {
            original: pem,
            key_pair,
        })
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AuthenticationConfig {
    pub key_pair: KeyPair,
}

const fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_flush_interval() -> Duration {
    Duration::from_secs(5)
}

const fn default_retry_base() -> Duration {
    Duration::from_secs(5)
}

const fn default_batch_size() -> usize {
    10
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WebhookConfig {
    #[serde(with = "serde_regex")]
    pub matcher: Regex,
    pub url: String,
    #[serde(with = "crate::config::duration", default = "default_timeout")]
    pub timeout: Duration,
    #[serde(with = "crate::config::duration", default = "default_flush_interval")]
    pub flush_interval: Duration,
    #[serde(with = "crate::config::duration", default = "default_retry_base")]
    pub retry_base: Duration,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

/// Object store backend selection. The metadata store always lives under
/// `data_dir`; this only covers blobs, staged uploads, caches and logs.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    Filesystem {
        #[serde(serialize_with = "RelativePathBuf::serialize_original")]
        path: RelativePathBuf,
    },
    S3 {
        endpoint: String,
        bucket: String,
        region: String,
        access_key: String,
        secret_key: String,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: "var".to_string().into(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProxyConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(with = "crate::config::duration", default = "ProxyConfig::default_cache_ttl")]
    pub cache_ttl: Duration,
}

impl ProxyConfig {
    const fn default_cache_ttl() -> Duration {
        Duration::from_secs(120)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct QueueConfig {
    #[serde(with = "crate::config::duration")]
    pub poll_interval: Duration,
    #[serde(with = "crate::config::duration")]
    pub retry_base: Duration,
    pub max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            retry_base: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SchedulerConfig {
    #[serde(with = "crate::config::duration")]
    pub tick: Duration,
    pub max_job: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(30),
            max_job: 100,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LeaderConfig {
    #[serde(with = "crate::config::duration")]
    pub lease: Duration,
    #[serde(with = "crate::config::duration")]
    pub renew_deadline: Duration,
    #[serde(with = "crate::config::duration")]
    pub retry_period: Duration,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UploadConfig {
    #[serde(with = "crate::config::duration")]
    pub session_ttl: Duration,
    #[serde(with = "crate::config::duration")]
    pub sweep_interval: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GcConfig {
    #[serde(with = "crate::config::duration")]
    pub grace_window: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            grace_window: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BuilderDispatchConfig {
    /// Argv used to launch a runner. Environment carries the actual build
    /// contract; see the runner environment variables.
    pub command: Vec<String>,
    /// Endpoint the runner uses for cache get/put.
    pub cache_url: String,
    /// Registry domain pushed to by runners, e.g. "registry.example.com".
    pub registry_domain: String,
    pub registry_username: String,
    pub registry_password: String,
    #[serde(with = "crate::config::duration")]
    pub token_ttl: Duration,
}

impl Default for BuilderDispatchConfig {
    fn default() -> Self {
        Self {
            command: vec!["vessel-runner".to_string()],
            cache_url: "http://localhost:8080/api/v1/caches".to_string(),
            registry_domain: "localhost:8080".to_string(),
            registry_username: String::new(),
            registry_password: String::new(),
            token_ttl: Duration::from_secs(2 * 60 * 60),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BackupEncryptionKey {
    pub id: String,
    #[serde(with = "base64url")]
    pub key: Vec<u8>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BackupEncryptionConfig {
    pub keys: Vec<BackupEncryptionKey>,
    pub active: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BackupConfig {
    encryption: BackupEncryptionConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Configuration {
    pub url: String,
    pub node_id: u64,
    pub nodes: Vec<VesselNode>,
    pub raft: RaftConfig,
    pub api: ApiConfig,
    pub prometheus: PrometheusConfig,
    pub authentication: Option<AuthenticationConfig>,
    #[serde(serialize_with = "RelativePathBuf::serialize_original")]
    pub data_dir: RelativePathBuf,
    pub storage: StorageConfig,
    pub webhooks: Vec<WebhookConfig>,
    pub proxy: Option<ProxyConfig>,
    pub queue: QueueConfig,
    pub scheduler: SchedulerConfig,
    pub leader: LeaderConfig,
    pub uploads: UploadConfig,
    pub gc: GcConfig,
    pub builder: BuilderDispatchConfig,
    pub backups: BackupConfig,
}

impl Configuration {
    pub fn figment(configs: Vec<PathBuf>) -> Figment {
        let fig = Figment::from(Serialized::defaults(Configuration::default()));

        let app_dirs = AppDirs::new(Some("vessel"), true).unwrap();
        let config_dir = app_dirs.config_dir;
        let config_path = config_dir.join("config.yaml");

        let fig = match config_path.exists() {
            true => fig.admerge(Yaml::file(config_path)),
            false => fig,
        };

        let fig = configs.into_iter().fold(fig, |fig, config_path| {
            fig.admerge(Yaml::file(config_path))
        });

        fig.admerge(Env::prefixed("VESSEL_"))
    }

    pub fn config(figment: Figment) -> Result<Configuration> {
        let mut config: Configuration =
            figment.extract().context("Failed to load configuration")?;

        if config.node_id == 0 {
            let binding = hostname::get().expect("Cannot read hostname");
            let hostname = binding.to_str().expect("Invalid hostname format");

            let (_, node_id) = hostname
                .rsplit_once('-')
                .context("Hostname does not contain a dash")?;

            let node_id: u64 = node_id
                .parse()
                .context("Hostname does not end with a number")?;

            config.node_id = node_id + 1;
        }

        if config.node_id < 1 {
            bail!("node_id must be at least 1");
        }

        if config.node_id > (config.nodes.len() as u64) {
            bail!("node_id greater than number of configured nodes");
        }

        Ok(config)
    }
}

impl TryFrom<Configuration> for NodeConfig {
    type Error = anyhow::Error;

    fn try_from(value: Configuration) -> std::result::Result<Self, Self::Error> {
        let nodes = value
            .nodes
            .iter()
            .map(|n| Node {
                id: n.id,
                addr_api: n.addr_api.clone(),
                addr_raft: n.addr_raft.clone(),
            })
            .collect();

        Ok(Self {
            node_id: value.node_id,
            nodes,
            listen_addr_api: Cow::Owned(value.api.address),
            tls_api: match value.api.tls {
                Some(tls) => Some(ServerTlsConfig {
                    key: tls.key.into(),
                    cert: tls.chain.into(),
                    danger_tls_no_verify: false,
                }),
                None => None,
            },
            listen_addr_raft: Cow::Owned(value.raft.address),
            tls_raft: match value.raft.tls {
                Some(tls) => Some(ServerTlsConfig {
                    key: tls.key.into(),
                    cert: tls.chain.into(),
                    danger_tls_no_verify: false,
                }),
                None => None,
            },
            data_dir: Cow::Owned(
                value
                    .data_dir
                    .relative()
                    .join("hiqlite")
                    .to_string_lossy()
                    .into_owned(),
            ),
            secret_raft: value
                .raft
                .secret
                .context("You must provide a raft secret")?,
            secret_api: value.api.secret.context("You must provide an API secret")?,
            enc_keys: EncKeys {
                enc_key_active: value.backups.encryption.active.clone(),
                enc_keys: value
                    .backups
                    .encryption
                    .keys
                    .iter()
                    .map(|key| (key.id.clone(), key.key.clone()))
                    .collect(),
            },
            log_statements: true,
            ..Default::default()
        })
    }
}

impl Default for Configuration {
    fn default() -> Self {
        let random_keys = EncKeys::generate().unwrap();
        let first_key = random_keys.enc_keys.into_iter().next().unwrap();

        Self {
            url: "http://localhost".into(),
            node_id: 0,
            nodes: vec![],
            raft: RaftConfig::default(),
            api: ApiConfig::default(),
            prometheus: PrometheusConfig::default(),
            authentication: None,
            data_dir: "var".to_string().into(),
            storage: StorageConfig::default(),
            webhooks: vec![],
            proxy: None,
            queue: QueueConfig::default(),
            scheduler: SchedulerConfig::default(),
            leader: LeaderConfig::default(),
            uploads: UploadConfig::default(),
            gc: GcConfig::default(),
            builder: BuilderDispatchConfig::default(),
            backups: BackupConfig {
                encryption: BackupEncryptionConfig {
                    active: random_keys.enc_key_active,
                    keys: vec![BackupEncryptionKey {
                        id: first_key.0,
                        key: first_key.1,
                    }],
                },
            },
        }
    }
}
