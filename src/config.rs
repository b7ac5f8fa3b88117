//! Command-line and environment configuration (A2), loaded the same way
//! the teacher's binary loads ProfitDLL connection settings: `clap` derive
//! for flags, with each flag also readable from the environment via
//! `env()` so a `.env` file picked up by `dotenvy` works unchanged.
use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "tallyd", about = "Concurrent sales time-series daemon")]
pub struct Config {
    /// TCP port to listen on.
    #[arg(long, env = "TALLYD_PORT", default_value_t = 12345)]
    pub port: u16,

    /// Directory holding users.dat and the timeseries/ day files.
    #[arg(long, env = "TALLYD_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Number of most-recently-completed days kept on disk (D).
    #[arg(long, env = "TALLYD_DISK_DAYS", default_value_t = 30)]
    pub disk_days: usize,

    /// Number of most-recently-completed days kept in memory (S), S <= D.
    /// Also the aggregation cache's entry bound: the cache is sized to
    /// the same S, so a small S is allowed to thrash.
    #[arg(long, env = "TALLYD_MEMORY_DAYS", default_value_t = 7)]
    pub memory_days: usize,

    /// Worker pool size.
    #[arg(long, env = "TALLYD_WORKERS", default_value_t = 8)]
    pub workers: usize,
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        if self.memory_days > self.disk_days {
            return Err(format!(
                "memory-days ({}) must not exceed disk-days ({})",
                self.memory_days, self.disk_days
            ));
        }
        if self.workers == 0 {
            return Err("workers must be at least 1".into());
        }
        Ok(())
    }
}
