use std::time::Duration;

/// Upper bounds a single job request is validated against before it is queued.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceLimits {
    pub max_cores: f64,
    /// Bytes
    pub max_memory: u64,
    /// Bytes
    pub max_disk: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cores: f64::from(u32::MAX),
            max_memory: u64::MAX,
            max_disk: u64::MAX,
        }
    }
}

/// Unit LSF expects for `rusage[mem=..]` and `-M`. Depends on `LSF_UNIT_FOR_LIMITS`
/// in the cluster's `lsf.conf`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryUnit {
    Kb,
    #[default]
    Mb,
    Gb,
}

impl MemoryUnit {
    pub fn bytes(self) -> u64 {
        match self {
            MemoryUnit::Kb => 1 << 10,
            MemoryUnit::Mb => 1 << 20,
            MemoryUnit::Gb => 1 << 30,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "KB" => Some(MemoryUnit::Kb),
            "MB" => Some(MemoryUnit::Mb),
            "GB" => Some(MemoryUnit::Gb),
            _ => None,
        }
    }
}

/// Settings for the LSF driver.
#[derive(Debug, Clone)]
pub struct LsfConfig {
    /// Prefix for the `-J` job name; the internal job ID is appended.
    pub job_name_prefix: String,
    /// Memory reservations are per core rather than per job
    /// (`RESOURCE_RESERVE_PER_TASK=Y` in `lsb.params`).
    pub per_core_reservation: bool,
    pub memory_unit: MemoryUnit,
    /// Appended verbatim to every `bsub` line.
    pub extra_args: Vec<String>,
}

impl Default for LsfConfig {
    fn default() -> Self {
        Self {
            job_name_prefix: "gridbridge_job_".to_string(),
            per_core_reservation: false,
            memory_unit: MemoryUnit::default(),
            extra_args: Vec::new(),
        }
    }
}

impl LsfConfig {
    /// Build from `GRIDBRIDGE_LSF_ARGS`, `GRIDBRIDGE_LSF_PER_CORE` and
    /// `GRIDBRIDGE_LSF_UNIT`, falling back to defaults for anything unset.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(args) = lookup("GRIDBRIDGE_LSF_ARGS") {
            cfg.extra_args = args.split_whitespace().map(str::to_string).collect();
        }
        if let Some(per_core) = lookup("GRIDBRIDGE_LSF_PER_CORE") {
            cfg.per_core_reservation = matches!(
                per_core.trim().to_ascii_lowercase().as_str(),
                "1" | "y" | "yes" | "true"
            );
        }
        if let Some(unit) = lookup("GRIDBRIDGE_LSF_UNIT") {
            match MemoryUnit::parse(&unit) {
                Some(unit) => cfg.memory_unit = unit,
                None => tracing::warn!(unit, "Unrecognised LSF memory unit, keeping default"),
            }
        }
        cfg
    }
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Minimum interval between remote status queries of the same kind. When unset
    /// the driver's own minimum wait is used.
    pub state_polling_wait: Option<Duration>,
    /// Admission ceiling for jobs simultaneously submitted to the scheduler.
    pub max_local_jobs: usize,
    /// When unset, the driver is asked for the largest machine in the cluster on
    /// first use.
    pub limits: Option<ResourceLimits>,
    /// Pause between rounds of the kill confirmation loop, and between empty reads
    /// while a caller waits for kill confirmations.
    pub kill_poll_interval: Duration,
    /// Pacing of the worker loop.
    pub worker_tick: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            state_polling_wait: None,
            max_local_jobs: 4,
            limits: None,
            kill_poll_interval: Duration::from_secs(1),
            worker_tick: Duration::from_millis(50),
        }
    }
}

impl BatchConfig {
    pub fn new(max_local_jobs: usize) -> Self {
        Self {
            max_local_jobs,
            ..Default::default()
        }
    }

    pub fn with_state_polling_wait(mut self, wait: Duration) -> Self {
        self.state_polling_wait = Some(wait);
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn with_kill_poll_interval(mut self, interval: Duration) -> Self {
        self.kill_poll_interval = interval;
        self
    }

    pub fn with_worker_tick(mut self, tick: Duration) -> Self {
        self.worker_tick = tick;
        self
    }
}
