use std::path::PathBuf;
use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(default = "127.0.0.1")]
    pub host: String,

    #[envconfig(default = "3301")]
    pub port: u16,

    /// Root directory for all embedded stores.
    #[envconfig(default = "/tmp/rule-engine")]
    pub data_dir: String,

    /// JSON file holding the rule definitions, for the file-backed runner.
    #[envconfig(default = "/etc/rule-engine/rules.json")]
    pub rules_file: String,

    /// Spool directory of stream files, for the file-backed runner.
    #[envconfig(default = "/var/spool/rule-engine")]
    pub spool_dir: String,

    /// Upper bound on streams per planned batch.
    #[envconfig(default = "1000")]
    pub max_batch_size: usize,

    /// Concurrent pipeline groups per pass.
    #[envconfig(default = "4")]
    pub worker_threads: usize,

    /// Delay between evaluation passes once a pass completes.
    #[envconfig(default = "10")]
    pub evaluation_interval_secs: u64,

    /// Name of this node, matched against per-rule node affinity.
    pub node_name: Option<String>,

    #[envconfig(default = "30")]
    pub shutdown_timeout_secs: u64,

    #[envconfig(default = "100")]
    pub dedup_max_puts_before_commit: usize,

    #[envconfig(default = "10")]
    pub dedup_commit_interval_secs: u64,
}

impl Config {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn tracker_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("trackers")
    }

    pub fn aggregate_store_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("aggregate-stores")
    }

    pub fn duplicate_check_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("duplicate-checks")
    }

    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_secs(self.evaluation_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn dedup_commit_interval(&self) -> Duration {
        Duration::from_secs(self.dedup_commit_interval_secs)
    }
}
