pub use config::Config;
use std::error::Error;

use crate::transactional::StoreOptions;
use crate::types::Bytes32;

/// The challenge the height-0 block's prev_hash must equal. Chain
/// validation treats any other value as corruption.
pub const GENESIS_CHALLENGE: Bytes32 = Bytes32([
    0xcc, 0xd5, 0xbb, 0x71, 0x18, 0x35, 0x32, 0xbf, 0xf2, 0x20, 0xba, 0x46, 0xc2, 0x68, 0x99,
    0x1a, 0x3f, 0xf0, 0x7e, 0xb3, 0x58, 0xe8, 0x25, 0x5a, 0x65, 0xc3, 0x0a, 0x2d, 0xce, 0x0e,
    0x5f, 0xbb,
]);

/// Load config for standalone binaries/utilities
pub fn load_config() -> Result<Config, Box<dyn Error>> {
    Config::builder()
        .add_source(config::File::with_name("config.toml"))
        .build()
        .map_err(|e| Box::new(e) as Box<dyn Error>)
}

/// Get db_path from config
pub fn get_db_path(config: &Config) -> Result<String, Box<dyn Error>> {
    config
        .get_string("paths.db_path")
        .map_err(|e| format!("Missing paths.db_path in config: {}", e).into())
}

/// Map the configured `store.db_sync` policy onto an engine synchronous
/// level. "auto" picks the WAL-safe default.
pub fn db_synchronous_on(setting: &str) -> &'static str {
    match setting {
        "off" => "OFF",
        "full" => "FULL",
        _ => "NORMAL",
    }
}

/// Pool knobs from config, with defaults suitable for a full node.
pub fn store_options(config: &Config) -> StoreOptions {
    let reader_count = config
        .get_int("store.db_readers")
        .ok()
        .and_then(|n| usize::try_from(n).ok())
        .unwrap_or(4);
    let sync_setting = config
        .get_string("store.db_sync")
        .unwrap_or_else(|_| "auto".to_string());
    StoreOptions {
        reader_count,
        synchronous: Some(db_synchronous_on(&sync_setting).to_string()),
        foreign_keys: false,
    }
}
