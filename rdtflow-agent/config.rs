use std::collections::{BTreeSet, HashMap};

use crate::capability::SncMode;
use crate::common::topology::CpuTopology;
use crate::error::Result;

/// Environment switch for the L3 allocation register-probing fallback
pub const L3CA_PROBE_ENV: &str = "RDTFLOW_L3CA_PROBE";

/// How poll contexts obtain their RMID
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RmidConfig {
    /// Search the hardware for a free RMID per context
    #[default]
    Default,
    /// Fixed core to RMID assignment
    Map(HashMap<u32, u32>),
}

/// Engine-wide behaviour switches
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub allow_l3ca_probe: bool,
    pub rmid: RmidConfig,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let allow_l3ca_probe = std::env::var(L3CA_PROBE_ENV)
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        if allow_l3ca_probe {
            tracing::info!("L3 allocation register probing enabled via {}", L3CA_PROBE_ENV);
        }

        Self {
            allow_l3ca_probe,
            rmid: RmidConfig::Default,
        }
    }

    pub fn with_rmid_map(mut self, map: HashMap<u32, u32>) -> Self {
        self.rmid = RmidConfig::Map(map);
        self
    }
}

/// Optional platform reconfiguration applied by a monitoring reset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetConfig {
    pub io_monitoring: Option<bool>,
    pub snc_mode: Option<SncMode>,
}

/// Cores and sockets the agent monitors
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub sockets: Vec<u32>,
    pub cores: Vec<u32>,
    pub core_labels: HashMap<u32, String>,
}

impl MonitorConfig {
    pub fn new(sockets: Vec<u32>, cores: Vec<u32>) -> Self {
        let core_labels: HashMap<u32, String> = cores
            .iter()
            .map(|&core| (core, format!("core_{core}")))
            .collect();

        Self {
            sockets,
            cores,
            core_labels,
        }
    }

    /// Every core the topology knows about
    pub fn from_topology(topology: &CpuTopology) -> Self {
        let cores: Vec<u32> = topology.cores().iter().map(|c| c.lcore).collect();
        let sockets = topology.sockets();

        tracing::info!(
            "Auto-detected {} sockets, {} cores",
            sockets.len(),
            cores.len()
        );

        Self::new(sockets, cores)
    }

    /// The given cores and the sockets they sit on; unknown cores are rejected
    pub fn for_cores(topology: &CpuTopology, cores: Vec<u32>) -> Result<Self> {
        let mut sockets = BTreeSet::new();
        for &lcore in &cores {
            sockets.insert(topology.check_core(lcore)?.socket);
        }

        Ok(Self::new(sockets.into_iter().collect(), cores))
    }

    pub fn label(&self, core: u32) -> &str {
        self.core_labels
            .get(&core)
            .map(|s| s.as_str())
            .unwrap_or("unknown")
    }
}

/// Parse CPU list like "0-3,8-11" into a list of CPU ids
pub fn parse_cpu_list(s: &str) -> Option<Vec<u32>> {
    let mut cpus = Vec::new();
    for part in s.trim().split(',').filter(|p| !p.is_empty()) {
        if let Some((start, end)) = part.split_once('-') {
            let start: u32 = start.trim().parse().ok()?;
            let end: u32 = end.trim().parse().ok()?;
            if start > end {
                return None;
            }
            cpus.extend(start..=end);
        } else {
            cpus.push(part.trim().parse().ok()?);
        }
    }
    Some(cpus)
}

/// Parse an RMID map like "0-1=1;4=2"
pub fn parse_rmid_map(s: &str) -> Option<HashMap<u32, u32>> {
    let mut map = HashMap::new();
    for part in s.trim().split(';').filter(|p| !p.is_empty()) {
        let (cores, rmid) = part.split_once('=')?;
        let rmid: u32 = rmid.trim().parse().ok()?;
        for core in parse_cpu_list(cores)? {
            map.insert(core, rmid);
        }
    }
    Some(map)
}
