//! Runtime configuration of the `candle-pipeline` binary.
//!
//! Every flag can also come from the environment (or a `.env` file), which
//! is how the service is normally deployed.
use crate::landing::LandingOptions;
use crate::record::FsyncPolicy;
use crate::store::StoreOptions;
use crate::transform::TransformOptions;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

pub const LANDING_SUBDIR: &str = "landing";
pub const CURSOR_SUBDIR: &str = "transform";
pub const FACTS_SUBDIR: &str = "facts";

#[derive(Debug, Clone, Parser)]
#[command(version, about = "Land candle events, transform them into facts and merge versions")]
pub struct PipelineConfig {
    /// Root directory holding the landing log, the cursor and the fact store
    #[arg(long, env = "CANDLE_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Newline-delimited JSON to land; reads stdin when omitted
    #[arg(long, short = 'i', env = "CANDLE_INPUT")]
    pub input: Option<PathBuf>,

    /// Keep polling the input for new lines instead of stopping at its end
    #[arg(long, env = "CANDLE_FOLLOW", default_value_t = false)]
    pub follow: bool,

    /// How often idle readers poll for new data (ms)
    #[arg(long, env = "CANDLE_POLL_MS", default_value_t = 50)]
    pub poll_ms: u64,

    /// Interval between background merges (ms)
    #[arg(long, env = "CANDLE_MERGE_INTERVAL_MS", default_value_t = 30_000)]
    pub merge_interval_ms: u64,

    /// When to fsync appends: `always`, `never` or `every:N`
    #[arg(long, env = "CANDLE_FSYNC", default_value = "always", value_parser = parse_fsync)]
    pub fsync: FsyncPolicy,

    /// Rows the active part holds before it is sealed
    #[arg(long, env = "CANDLE_MAX_ACTIVE_ROWS", default_value_t = 8192)]
    pub max_active_rows: usize,

    /// Persist the transform cursor every N facts
    #[arg(long, env = "CANDLE_COMMIT_EVERY", default_value_t = 64)]
    pub commit_every: usize,

    /// First backoff delay after a failed fact append (ms)
    #[arg(long, env = "CANDLE_RETRY_INITIAL_MS", default_value_t = 50)]
    pub retry_initial_ms: u64,

    /// Upper bound on the append backoff (ms)
    #[arg(long, env = "CANDLE_RETRY_MAX_MS", default_value_t = 5_000)]
    pub retry_max_ms: u64,

    /// Skip the merge normally run once the input is drained
    #[arg(long, env = "CANDLE_NO_FINAL_MERGE", default_value_t = false)]
    pub no_final_merge: bool,
}

pub fn parse_fsync(raw: &str) -> Result<FsyncPolicy, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "always" | "every-write" => Ok(FsyncPolicy::EveryWrite),
        "never" => Ok(FsyncPolicy::Never),
        other => {
            let n = other
                .strip_prefix("every:")
                .ok_or_else(|| format!("unknown fsync policy {raw:?} (expected always, never or every:N)"))?;
            match n.parse::<usize>() {
                Ok(n) if n > 0 => Ok(FsyncPolicy::EveryN(n)),
                _ => Err(format!("invalid fsync batch size {n:?}")),
            }
        }
    }
}

impl PipelineConfig {
    /// Parse the command line after loading `.env`, if there is one.
    pub fn load() -> Self {
        let _ = dotenvy::dotenv();
        Self::parse()
    }

    pub fn landing_dir(&self) -> PathBuf {
        self.data_dir.join(LANDING_SUBDIR)
    }

    pub fn cursor_dir(&self) -> PathBuf {
        self.data_dir.join(CURSOR_SUBDIR)
    }

    pub fn facts_dir(&self) -> PathBuf {
        self.data_dir.join(FACTS_SUBDIR)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    pub fn merge_interval(&self) -> Duration {
        Duration::from_millis(self.merge_interval_ms.max(1))
    }

    pub fn landing_options(&self) -> LandingOptions {
        LandingOptions {
            fsync: self.fsync,
            ..LandingOptions::default()
        }
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            max_active_rows: self.max_active_rows,
            fsync: self.fsync,
        }
    }

    pub fn transform_options(&self) -> TransformOptions {
        TransformOptions {
            commit_every: self.commit_every,
            retry_initial: Duration::from_millis(self.retry_initial_ms),
            retry_max: Duration::from_millis(self.retry_max_ms.max(self.retry_initial_ms)),
        }
    }
}
