//! Default configuration values
//!
//! These are embedded in the binary and used when no config file exists.

/// Default configuration as TOML (for reference/documentation)
pub const DEFAULT_CONFIG_TOML: &str = r##"
# jamhub orchestrator configuration

[server]
client_addr = "127.0.0.1:8080"
control_addr = "127.0.0.1:8081"

[auth]
token_ttl_secs = 900
prune_interval_secs = 120
prune_phase_secs = 10

[workers]
# worker_bin = "/usr/local/bin/jam-worker"
host = "127.0.0.1"
discovery_attempts = 10
discovery_delay_ms = 500
pending_ttl_secs = 10
max_depth = 4
max_width = 4
default_length_secs = 3600
max_length_secs = 14400

[store]
# path = "/var/lib/jamhub/store.json"
in_memory = false
"##;
