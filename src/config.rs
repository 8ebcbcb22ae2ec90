use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
}

#[derive(Debug, PartialEq, Deserialize)]
pub struct Config {
    pub log_level: LogLevel,
    /// Number of frames in the buffer pool.
    pub pool_size: usize,
    /// K parameter of the LRU-K replacement policy.
    pub replacer_k: usize,
    /// Maximum number of entries in a B+Tree leaf page.
    pub leaf_max_size: u32,
    /// Maximum number of entries in a B+Tree internal page.
    pub internal_max_size: u32,
}

impl Config {
    pub fn new(file: &str) -> Result<Config> {
        let mut cfg = config::Config::builder()
            .set_default("log_level", "debug")?
            .set_default("pool_size", 64_i64)?
            .set_default("replacer_k", 2_i64)?
            .set_default("leaf_max_size", 32_i64)?
            .set_default("internal_max_size", 32_i64)?;
        if !file.is_empty() {
            cfg = cfg.add_source(config::File::with_name(file))
        }
        cfg = cfg.add_source(config::Environment::with_prefix("STASHDB"));
        Ok(cfg.build()?.try_deserialize()?)
    }
}
