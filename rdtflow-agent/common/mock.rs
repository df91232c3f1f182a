//! Scripted register file used by unit tests

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use rdtflow_raw::MsrError;

use crate::common::channel::{ChannelAccess, ChannelId, ChannelInfo};
use crate::common::cpuid::CpuidRegs;
use crate::common::platform::Platform;
use crate::error::{RdtError, Result};
use crate::metrics::{EventSet, MonEvent};
use crate::orchestrator::backend::{EventStream, ExternalBackend};
use crate::orchestrator::session::Target;

#[derive(Default)]
struct MockState {
    cpuid: HashMap<(u32, u32), CpuidRegs>,
    msrs: HashMap<(u32, u64), u64>,
    scripted: HashMap<(u32, u64), VecDeque<u64>>,
    failing_reads: HashSet<(u32, u64)>,
    failing_writes: HashSet<(u32, u64)>,
    writes: Vec<(u32, u64, u64)>,
}

/// In-memory [`Platform`]: a CPUID table plus a per-core MSR file
///
/// Unset registers read as zero. Reads listed with [`MockPlatform::script_reads`]
/// are consumed in order before falling back to the stored value.
#[derive(Default)]
pub struct MockPlatform {
    state: Mutex<MockState>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_cpuid(&self, leaf: u32, subleaf: u32, regs: CpuidRegs) {
        self.state.lock().cpuid.insert((leaf, subleaf), regs);
    }

    pub fn set_brand_string(&self, brand: &str) {
        let mut bytes = [0u8; 48];
        let len = brand.len().min(47);
        bytes[..len].copy_from_slice(&brand.as_bytes()[..len]);

        self.set_cpuid(0x8000_0000, 0, CpuidRegs::new(0x8000_0008, 0, 0, 0));
        for (i, chunk) in bytes.chunks_exact(16).enumerate() {
            let word = |n: usize| {
                u32::from_le_bytes([
                    chunk[n * 4],
                    chunk[n * 4 + 1],
                    chunk[n * 4 + 2],
                    chunk[n * 4 + 3],
                ])
            };
            self.set_cpuid(
                0x8000_0002 + i as u32,
                0,
                CpuidRegs::new(word(0), word(1), word(2), word(3)),
            );
        }
    }

    pub fn set_msr(&self, cpu: u32, msr: u64, value: u64) {
        self.state.lock().msrs.insert((cpu, msr), value);
    }

    pub fn set_msr_all(&self, cpus: impl IntoIterator<Item = u32>, msr: u64, value: u64) {
        let mut state = self.state.lock();
        for cpu in cpus {
            state.msrs.insert((cpu, msr), value);
        }
    }

    /// Current stored value, ignoring scripts and failures
    pub fn msr(&self, cpu: u32, msr: u64) -> u64 {
        self.state
            .lock()
            .msrs
            .get(&(cpu, msr))
            .copied()
            .unwrap_or(0)
    }

    pub fn script_reads(&self, cpu: u32, msr: u64, values: impl IntoIterator<Item = u64>) {
        self.state
            .lock()
            .scripted
            .entry((cpu, msr))
            .or_default()
            .extend(values);
    }

    pub fn fail_read(&self, cpu: u32, msr: u64) {
        self.state.lock().failing_reads.insert((cpu, msr));
    }

    pub fn fail_write(&self, cpu: u32, msr: u64) {
        self.state.lock().failing_writes.insert((cpu, msr));
    }

    /// Every successful write in issue order
    pub fn writes(&self) -> Vec<(u32, u64, u64)> {
        self.state.lock().writes.clone()
    }

    pub fn writes_to(&self, msr: u64) -> Vec<(u32, u64)> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|(_, addr, _)| *addr == msr)
            .map(|&(cpu, _, value)| (cpu, value))
            .collect()
    }

    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }
}

fn denied() -> io::Error {
    io::Error::from(io::ErrorKind::PermissionDenied)
}

impl Platform for MockPlatform {
    fn read_msr(&self, cpu: u32, msr: u64) -> Result<u64> {
        let mut state = self.state.lock();
        if state.failing_reads.contains(&(cpu, msr)) {
            return Err(MsrError::ReadFailed {
                cpu,
                msr,
                source: denied(),
            }
            .into());
        }

        if let Some(value) = state.scripted.get_mut(&(cpu, msr)).and_then(|q| q.pop_front()) {
            return Ok(value);
        }

        Ok(state.msrs.get(&(cpu, msr)).copied().unwrap_or(0))
    }

    fn write_msr(&self, cpu: u32, msr: u64, value: u64) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing_writes.contains(&(cpu, msr)) {
            return Err(MsrError::WriteFailed {
                cpu,
                msr,
                source: denied(),
            }
            .into());
        }

        state.msrs.insert((cpu, msr), value);
        state.writes.push((cpu, msr, value));
        Ok(())
    }

    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidRegs {
        self.state
            .lock()
            .cpuid
            .get(&(leaf, subleaf))
            .copied()
            .unwrap_or_default()
    }
}

/// I/O channels with an in-memory RMID tag per channel
#[derive(Default)]
pub struct MockChannels {
    channels: Vec<ChannelInfo>,
    rmids: Mutex<HashMap<ChannelId, u32>>,
}

impl MockChannels {
    pub fn new(channels: Vec<ChannelInfo>) -> Self {
        Self {
            channels,
            rmids: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_rmid(&self, channel: ChannelId, rmid: u32) {
        self.rmids.lock().insert(channel, rmid);
    }

    pub fn rmid(&self, channel: ChannelId) -> u32 {
        self.rmids.lock().get(&channel).copied().unwrap_or(0)
    }
}

impl ChannelAccess for MockChannels {
    fn channels(&self) -> Vec<ChannelInfo> {
        self.channels.clone()
    }

    fn read_rmid(&self, channel: ChannelId) -> Result<u32> {
        Ok(self.rmid(channel))
    }

    fn write_rmid(&self, channel: ChannelId, rmid: u32) -> Result<()> {
        self.set_rmid(channel, rmid);
        Ok(())
    }
}

#[derive(Default)]
struct BackendState {
    started: Vec<MonEvent>,
    stopped: Vec<MonEvent>,
    counts: HashMap<MonEvent, u64>,
    failing: EventSet,
}

/// External backend serving a fixed event set from in-memory counts
///
/// Clones share their state, so a test can keep one handle while the engine
/// owns another.
#[derive(Clone)]
pub struct MockBackend {
    name: &'static str,
    supported: EventSet,
    state: Arc<Mutex<BackendState>>,
}

impl MockBackend {
    pub fn new(name: &'static str, supported: EventSet) -> Self {
        Self {
            name,
            supported,
            state: Arc::new(Mutex::new(BackendState::default())),
        }
    }

    pub fn set_count(&self, event: MonEvent, count: u64) {
        self.state.lock().counts.insert(event, count);
    }

    pub fn fail_start(&self, event: MonEvent) {
        self.state.lock().failing.insert(event);
    }

    pub fn started(&self) -> Vec<MonEvent> {
        self.state.lock().started.clone()
    }

    pub fn stopped(&self) -> Vec<MonEvent> {
        self.state.lock().stopped.clone()
    }
}

impl ExternalBackend for MockBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn fini(&self) -> Result<()> {
        Ok(())
    }

    fn is_event_supported(&self, event: MonEvent) -> bool {
        self.supported.contains(event)
    }

    fn start(&self, _target: &Target, event: MonEvent) -> Result<Box<dyn EventStream>> {
        let mut state = self.state.lock();
        if state.failing.contains(event) {
            return Err(RdtError::Unsupported(format!("{} cannot start {}", self.name, event)));
        }
        state.started.push(event);

        Ok(Box::new(MockStream {
            event,
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockStream {
    event: MonEvent,
    state: Arc<Mutex<BackendState>>,
}

impl EventStream for MockStream {
    fn poll(&mut self) -> Result<u64> {
        Ok(self.state.lock().counts.get(&self.event).copied().unwrap_or(0))
    }

    fn stop(self: Box<Self>) -> Result<()> {
        self.state.lock().stopped.push(self.event);
        Ok(())
    }
}
