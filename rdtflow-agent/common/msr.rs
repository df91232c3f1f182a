use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use rdtflow_raw::MsrDevice;

use crate::common::affinity::AffinityGuard;
use crate::error::Result;

pub struct MsrHandle {
    device: parking_lot::Mutex<MsrDevice>,
    cpu_id: u32,
}

impl MsrHandle {
    pub fn new(cpu: u32) -> Result<Self> {
        let device = MsrDevice::open(cpu)?;

        tracing::info!("Opened MSR handle for core {}", cpu);

        Ok(Self {
            device: parking_lot::Mutex::new(device),
            cpu_id: cpu,
        })
    }

    pub fn read(&self, addr: u64) -> Result<u64> {
        let _affinity = AffinityGuard::new(self.cpu_id)?;
        let value = self.device.lock().read(addr)?;

        tracing::debug!(
            "MSR read: CPU {} MSR 0x{:08x} = 0x{:016x}",
            self.cpu_id,
            addr,
            value
        );
        Ok(value)
    }

    pub fn write(&self, addr: u64, value: u64) -> Result<()> {
        let _affinity = AffinityGuard::new(self.cpu_id)?;
        self.device.lock().write(addr, value)?;

        tracing::debug!(
            "MSR write: CPU {} MSR 0x{:08x} <- 0x{:016x}",
            self.cpu_id,
            addr,
            value
        );
        Ok(())
    }

    pub fn cpu_id(&self) -> u32 {
        self.cpu_id
    }
}

/// Process-wide pool of open MSR devices, one per CPU
pub struct Msr {
    handles: RwLock<HashMap<u32, Arc<MsrHandle>>>,
}

impl Msr {
    fn new() -> Self {
        Self {
            handles: RwLock::new(HashMap::new()),
        }
    }

    pub fn instance() -> &'static Msr {
        static INSTANCE: Lazy<Msr> = Lazy::new(Msr::new);
        &INSTANCE
    }

    fn get_handle(&self, cpu: u32) -> Result<Arc<MsrHandle>> {
        {
            let handles = self.handles.read();
            if let Some(handle) = handles.get(&cpu) {
                return Ok(Arc::clone(handle));
            }
        }

        let mut handles = self.handles.write();
        if let Some(handle) = handles.get(&cpu) {
            return Ok(Arc::clone(handle));
        }

        let handle = Arc::new(MsrHandle::new(cpu)?);
        handles.insert(cpu, Arc::clone(&handle));
        Ok(handle)
    }

    pub fn read(&self, cpu: u32, addr: u64) -> Result<u64> {
        let handle = self.get_handle(cpu)?;
        handle.read(addr)
    }

    pub fn write(&self, cpu: u32, addr: u64, value: u64) -> Result<()> {
        let handle = self.get_handle(cpu)?;
        handle.write(addr, value)
    }

    /// Drop every cached handle
    pub fn close_all(&self) {
        self.handles.write().clear();
    }
}

pub fn read_msr(cpu: u32, addr: u64) -> Result<u64> {
    Msr::instance().read(cpu, addr)
}

pub fn write_msr(cpu: u32, addr: u64, value: u64) -> Result<()> {
    Msr::instance().write(cpu, addr, value)
}
