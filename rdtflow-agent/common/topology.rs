//! Read-only CPU topology snapshot
//!
//! Answers the placement questions the engine asks: which cores share a
//! socket, an L3/L2 cluster or a NUMA node, and which core stands in for a
//! domain when a per-domain register has to be read.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use crate::config::parse_cpu_list;
use crate::error::{RdtError, Result};

pub const SYSFS_CPU_ROOT: &str = "/sys/devices/system/cpu";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreInfo {
    pub lcore: u32,
    pub socket: u32,
    pub numa: u32,
    pub l3_id: u32,
    pub l2_id: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheInfo {
    pub detected: bool,
    pub num_ways: u32,
    pub total_size: u64,
}

#[derive(Debug, Clone)]
pub struct CpuTopology {
    cores: Vec<CoreInfo>,
    l3: CacheInfo,
    l2: CacheInfo,
}

impl CpuTopology {
    pub fn new(mut cores: Vec<CoreInfo>, l3: CacheInfo, l2: CacheInfo) -> Self {
        cores.sort_by_key(|c| c.lcore);
        Self { cores, l3, l2 }
    }

    pub fn cores(&self) -> &[CoreInfo] {
        &self.cores
    }

    pub fn l3(&self) -> &CacheInfo {
        &self.l3
    }

    pub fn l2(&self) -> &CacheInfo {
        &self.l2
    }

    pub fn core(&self, lcore: u32) -> Option<&CoreInfo> {
        self.cores.iter().find(|c| c.lcore == lcore)
    }

    pub fn check_core(&self, lcore: u32) -> Result<&CoreInfo> {
        self.core(lcore)
            .ok_or_else(|| RdtError::InvalidParameter(format!("Core {lcore} is not present")))
    }

    fn distinct(&self, key: impl Fn(&CoreInfo) -> u32) -> Vec<u32> {
        self.cores
            .iter()
            .map(key)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn sockets(&self) -> Vec<u32> {
        self.distinct(|c| c.socket)
    }

    pub fn numa_nodes(&self) -> Vec<u32> {
        self.distinct(|c| c.numa)
    }

    pub fn l3_ids(&self) -> Vec<u32> {
        self.distinct(|c| c.l3_id)
    }

    pub fn l2_ids(&self) -> Vec<u32> {
        self.distinct(|c| c.l2_id)
    }

    /// Bandwidth allocation domains follow the L3 clusters
    pub fn mba_ids(&self) -> Vec<u32> {
        self.l3_ids()
    }

    fn cores_where(&self, pred: impl Fn(&CoreInfo) -> bool) -> Vec<u32> {
        self.cores
            .iter()
            .filter(|c| pred(c))
            .map(|c| c.lcore)
            .collect()
    }

    pub fn cores_by_socket(&self, socket: u32) -> Vec<u32> {
        self.cores_where(|c| c.socket == socket)
    }

    pub fn cores_by_l3(&self, l3_id: u32) -> Vec<u32> {
        self.cores_where(|c| c.l3_id == l3_id)
    }

    pub fn cores_by_l2(&self, l2_id: u32) -> Vec<u32> {
        self.cores_where(|c| c.l2_id == l2_id)
    }

    pub fn cores_by_numa(&self, numa: u32) -> Vec<u32> {
        self.cores_where(|c| c.numa == numa)
    }

    fn first_where(&self, what: &str, id: u32, pred: impl Fn(&CoreInfo) -> bool) -> Result<u32> {
        self.cores
            .iter()
            .find(|c| pred(c))
            .map(|c| c.lcore)
            .ok_or_else(|| RdtError::InvalidParameter(format!("No core found for {what} {id}")))
    }

    pub fn one_by_socket(&self, socket: u32) -> Result<u32> {
        self.first_where("socket", socket, |c| c.socket == socket)
    }

    pub fn one_by_l3(&self, l3_id: u32) -> Result<u32> {
        self.first_where("L3 cluster", l3_id, |c| c.l3_id == l3_id)
    }

    pub fn one_by_l2(&self, l2_id: u32) -> Result<u32> {
        self.first_where("L2 cluster", l2_id, |c| c.l2_id == l2_id)
    }

    pub fn one_by_mba(&self, mba_id: u32) -> Result<u32> {
        self.first_where("MBA domain", mba_id, |c| c.l3_id == mba_id)
    }

    /// Position of the core's NUMA node among the nodes of its socket
    pub fn numa_domain_index(&self, lcore: u32) -> Result<u32> {
        let core = self.check_core(lcore)?;
        let nodes: BTreeSet<u32> = self
            .cores
            .iter()
            .filter(|c| c.socket == core.socket)
            .map(|c| c.numa)
            .collect();

        nodes
            .iter()
            .position(|&n| n == core.numa)
            .map(|idx| idx as u32)
            .ok_or_else(|| {
                RdtError::InvalidParameter(format!("Core {lcore} has no NUMA domain"))
            })
    }

    /// L3 size in bytes; monitoring scale depends on it
    pub fn l3_size(&self) -> Result<u64> {
        if !self.l3.detected {
            return Err(RdtError::ConfigError(
                "L3 cache information not available".to_string(),
            ));
        }
        Ok(self.l3.total_size)
    }

    pub fn from_sysfs(root: &Path) -> Result<Self> {
        let online = fs::read_to_string(root.join("online"))?;
        let lcores = parse_cpu_list(&online).ok_or_else(|| {
            RdtError::ConfigError(format!("Malformed online CPU list '{}'", online.trim()))
        })?;

        let mut cores = Vec::with_capacity(lcores.len());
        for lcore in lcores {
            let cpu_dir = root.join(format!("cpu{lcore}"));
            let socket = read_u32(&cpu_dir.join("topology/physical_package_id")).unwrap_or(0);
            let numa = numa_node_of(&cpu_dir).unwrap_or(socket);
            let l3_id = cache_id(&cpu_dir, 3).unwrap_or(socket);
            let l2_id = cache_id(&cpu_dir, 2).unwrap_or(lcore);

            cores.push(CoreInfo {
                lcore,
                socket,
                numa,
                l3_id,
                l2_id,
            });
        }

        let first = cores
            .first()
            .map(|c| root.join(format!("cpu{}", c.lcore)))
            .ok_or_else(|| RdtError::ConfigError("No online CPUs".to_string()))?;

        let l3 = cache_info(&first, 3);
        let l2 = cache_info(&first, 2);

        tracing::info!(
            "Topology: {} cores, L3 {} bytes ({} ways), L2 {} bytes ({} ways)",
            cores.len(),
            l3.total_size,
            l3.num_ways,
            l2.total_size,
            l2.num_ways
        );

        Ok(Self::new(cores, l3, l2))
    }

    pub fn detect() -> Result<Self> {
        Self::from_sysfs(Path::new(SYSFS_CPU_ROOT))
    }
}

fn read_u32(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn numa_node_of(cpu_dir: &Path) -> Option<u32> {
    fs::read_dir(cpu_dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .find_map(|entry| {
            entry
                .file_name()
                .to_str()?
                .strip_prefix("node")?
                .parse()
                .ok()
        })
}

fn cache_index_dir(cpu_dir: &Path, level: u32) -> Option<std::path::PathBuf> {
    fs::read_dir(cpu_dir.join("cache"))
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("index"))
        })
        .find(|path| {
            let unified = fs::read_to_string(path.join("type"))
                .map(|t| t.trim() != "Instruction")
                .unwrap_or(true);
            unified && read_u32(&path.join("level")) == Some(level)
        })
}

fn cache_id(cpu_dir: &Path, level: u32) -> Option<u32> {
    read_u32(&cache_index_dir(cpu_dir, level)?.join("id"))
}

/// Parse sysfs cache sizes such as "39424K" or "2M"
fn parse_cache_size(s: &str) -> Option<u64> {
    let s = s.trim();
    let (digits, multiplier) = match s.chars().last()? {
        'K' => (&s[..s.len() - 1], 1024),
        'M' => (&s[..s.len() - 1], 1024 * 1024),
        _ => (s, 1),
    };
    digits.parse::<u64>().ok().map(|v| v * multiplier)
}

fn cache_info(cpu_dir: &Path, level: u32) -> CacheInfo {
    let Some(dir) = cache_index_dir(cpu_dir, level) else {
        return CacheInfo::default();
    };

    let num_ways = read_u32(&dir.join("ways_of_associativity"));
    let total_size = fs::read_to_string(dir.join("size"))
        .ok()
        .and_then(|s| parse_cache_size(&s));

    match (num_ways, total_size) {
        (Some(num_ways), Some(total_size)) => CacheInfo {
            detected: true,
            num_ways,
            total_size,
        },
        _ => CacheInfo::default(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn core(lcore: u32, socket: u32, numa: u32) -> CoreInfo {
        CoreInfo {
            lcore,
            socket,
            numa,
            l3_id: socket,
            l2_id: lcore / 2,
        }
    }

    /// Two sockets of four cores, one NUMA node per socket, 32MiB 16-way L3
    pub(crate) fn two_socket() -> CpuTopology {
        let cores = (0..8).map(|lcore| core(lcore, lcore / 4, lcore / 4)).collect();
        CpuTopology::new(
            cores,
            CacheInfo {
                detected: true,
                num_ways: 16,
                total_size: 32 * 1024 * 1024,
            },
            CacheInfo {
                detected: true,
                num_ways: 16,
                total_size: 1024 * 1024,
            },
        )
    }

    /// One socket split into four SNC clusters of two cores each
    pub(crate) fn snc4() -> CpuTopology {
        let cores = (0..8).map(|lcore| core(lcore, 0, lcore / 2)).collect();
        CpuTopology::new(
            cores,
            CacheInfo {
                detected: true,
                num_ways: 11,
                total_size: 11 * 1024 * 1024,
            },
            CacheInfo::default(),
        )
    }

    #[test]
    fn test_domain_queries() {
        let topo = two_socket();
        assert_eq!(topo.sockets(), vec![0, 1]);
        assert_eq!(topo.numa_nodes(), vec![0, 1]);
        assert_eq!(topo.cores_by_socket(1), vec![4, 5, 6, 7]);
        assert_eq!(topo.cores_by_l3(0), vec![0, 1, 2, 3]);
        assert_eq!(topo.cores_by_l2(2), vec![4, 5]);
        assert_eq!(topo.one_by_socket(1).unwrap(), 4);
        assert_eq!(topo.one_by_mba(1).unwrap(), 4);
        assert!(topo.one_by_l2(42).is_err());
    }

    #[test]
    fn test_numa_domain_index_is_per_socket() {
        let topo = snc4();
        assert_eq!(topo.numa_domain_index(0).unwrap(), 0);
        assert_eq!(topo.numa_domain_index(5).unwrap(), 2);
        assert_eq!(topo.numa_domain_index(7).unwrap(), 3);
        assert!(matches!(
            topo.numa_domain_index(99),
            Err(RdtError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_missing_l3_is_config_error() {
        let topo = CpuTopology::new(vec![core(0, 0, 0)], CacheInfo::default(), CacheInfo::default());
        assert!(matches!(topo.l3_size(), Err(RdtError::ConfigError(_))));
    }

    #[test]
    fn test_parse_cache_size() {
        assert_eq!(parse_cache_size("39424K\n"), Some(39424 * 1024));
        assert_eq!(parse_cache_size("2M"), Some(2 * 1024 * 1024));
        assert_eq!(parse_cache_size("512"), Some(512));
        assert_eq!(parse_cache_size("big"), None);
    }

    #[test]
    fn test_from_sysfs() {
        let root = std::env::temp_dir().join(format!("rdtflow-topo-{}", std::process::id()));
        let _ = fs::remove_dir_all(&root);

        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("online"), "0-1\n").unwrap();
        for lcore in 0..2u32 {
            let cpu = root.join(format!("cpu{lcore}"));
            fs::create_dir_all(cpu.join("topology")).unwrap();
            fs::create_dir_all(cpu.join(format!("node{lcore}"))).unwrap();
            fs::write(cpu.join("topology/physical_package_id"), "0\n").unwrap();

            let l3 = cpu.join("cache/index3");
            fs::create_dir_all(&l3).unwrap();
            fs::write(l3.join("level"), "3\n").unwrap();
            fs::write(l3.join("type"), "Unified\n").unwrap();
            fs::write(l3.join("id"), "0\n").unwrap();
            fs::write(l3.join("ways_of_associativity"), "11\n").unwrap();
            fs::write(l3.join("size"), "11264K\n").unwrap();
        }

        let topo = CpuTopology::from_sysfs(&root).unwrap();
        assert_eq!(topo.cores().len(), 2);
        assert_eq!(topo.numa_nodes(), vec![0, 1]);
        assert_eq!(topo.l3_ids(), vec![0]);
        assert_eq!(topo.l3_size().unwrap(), 11264 * 1024);
        assert_eq!(topo.l3().num_ways, 11);
        assert!(!topo.l2().detected);

        let _ = fs::remove_dir_all(&root);
    }
}
