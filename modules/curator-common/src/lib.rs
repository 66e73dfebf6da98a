pub mod config;
pub mod error;
pub mod fingerprint;
pub mod outline;
pub mod types;

pub use config::{
    load_config, parse_config, FileConfig, IndexConfig, OracleConfig, OracleProvider, RoundsConfig,
    RunConfig, Secrets, SurvivorPolicy, ThresholdsConfig,
};
pub use error::{CuratorError, Result};
pub use fingerprint::{community_fingerprint, content_hash, derived_record_id, record_set_checksum};
pub use outline::structural_outline;
pub use types::*;
