use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::collision::CollisionSites;
use crate::fault::CaptureFault;
use crate::fault::CaptureResult;
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use crate::sink::SinkKind;

/// Lockstep channels are opened for this many thread ids per expected
/// thread, to cover programs that spawn more threads than they run at once.
pub const CHANNELS_PER_THREAD: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub kind: SinkKind,
    pub path: PathBuf,
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig {
            kind: SinkKind::File,
            path: PathBuf::from("trace.bin"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsFormat {
    /// `[ENQUEUE] ...` / `[DEQUEUE] ...` lines.
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CollisionConfig {
    pub park_line: u16,
    pub check_line: u16,
    pub park_delay_us: u64,
    pub check_delay_us: u64,
}

impl CollisionConfig {
    pub fn sites(&self) -> CollisionSites {
        CollisionSites {
            park_line: self.park_line,
            check_line: self.check_line,
            park_delay: Duration::from_micros(self.park_delay_us),
            check_delay: Duration::from_micros(self.check_delay_us),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sink: SinkConfig,
    /// Human-readable mirror of the binary trace.
    pub text_trace: Option<PathBuf>,
    /// Number of backend simulators acknowledging each boundary.
    pub backends: u32,
    pub lockstep: bool,
    /// Backends pause and restart themselves; skip the wait at lock releases.
    pub pausing: bool,
    /// Honour suppression scopes around library-internal routines.
    pub suppress_library_internals: bool,
    /// Expected number of concurrently running threads.
    pub min_threads: u32,
    pub channel_dir: PathBuf,
    pub channel_prefix: String,
    /// Appended to every channel name, usually the benchmark name.
    pub channel_suffix: String,
    pub queue_capacity: usize,
    pub track_stats: bool,
    pub stats_file: Option<PathBuf>,
    pub stats_format: StatsFormat,
    /// Thread whose finish event ends the drain.
    pub root_tid: u16,
    pub site_tracking: bool,
    pub source_index_file: Option<PathBuf>,
    pub routine_index_file: Option<PathBuf>,
    pub collision: Option<CollisionConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sink: SinkConfig::default(),
            text_trace: None,
            backends: 0,
            lockstep: false,
            pausing: false,
            suppress_library_internals: true,
            min_threads: 8,
            channel_dir: PathBuf::from("."),
            channel_prefix: "fifo.tid".to_string(),
            channel_suffix: String::new(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            track_stats: true,
            stats_file: None,
            stats_format: StatsFormat::Text,
            root_tid: 0,
            site_tracking: false,
            source_index_file: None,
            routine_index_file: None,
            collision: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn lockstep_channels(&self) -> usize {
        CHANNELS_PER_THREAD * self.min_threads as usize
    }

    pub fn validate(&self) -> CaptureResult<()> {
        let bad = |msg: String| Err(CaptureFault::InvalidConfig(msg));
        if self.queue_capacity == 0 {
            return bad("queue_capacity must be non-zero".into());
        }
        if self.lockstep {
            if self.backends == 0 {
                return bad("lockstep needs at least one backend".into());
            }
            if self.min_threads == 0 {
                return bad("lockstep needs min_threads > 0".into());
            }
            if self.lockstep_channels() > u16::MAX as usize + 1 {
                return bad(format!(
                    "{} lockstep channels exceed the thread id space",
                    self.lockstep_channels()
                ));
            }
        }
        if let Some(c) = &self.collision {
            if !self.site_tracking {
                return bad("collision analysis requires site_tracking".into());
            }
            if c.park_line == 0 || c.check_line == 0 || c.park_delay_us == 0 || c.check_delay_us == 0
            {
                return bad("collision analysis needs both lines and both delays set".into());
            }
        }
        Ok(())
    }
}
