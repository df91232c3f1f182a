//! MSR (Model-Specific Register) device primitive
//!
//! This module provides low-level MSR access through `/dev/cpu/*/msr`.
//! For pooled, affinity-pinned access, use the platform layer in rdtflow-agent.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;

pub type Result<T> = std::result::Result<T, MsrError>;

/// Errors that can occur during MSR operations
#[derive(Debug, thiserror::Error)]
pub enum MsrError {
    #[error("Failed to open MSR device for CPU {cpu}: {source}")]
    OpenFailed { cpu: u32, source: std::io::Error },

    #[error("Failed to read MSR 0x{msr:X} on CPU {cpu}: {source}")]
    ReadFailed {
        cpu: u32,
        msr: u64,
        source: std::io::Error,
    },

    #[error("Failed to write MSR 0x{msr:X} on CPU {cpu}: {source}")]
    WriteFailed {
        cpu: u32,
        msr: u64,
        source: std::io::Error,
    },

    #[error("Failed to seek to MSR 0x{msr:X} on CPU {cpu}: {source}")]
    SeekFailed {
        cpu: u32,
        msr: u64,
        source: std::io::Error,
    },
}

impl MsrError {
    /// CPU the failed access was issued to
    pub fn cpu(&self) -> u32 {
        match self {
            MsrError::OpenFailed { cpu, .. }
            | MsrError::ReadFailed { cpu, .. }
            | MsrError::WriteFailed { cpu, .. }
            | MsrError::SeekFailed { cpu, .. } => *cpu,
        }
    }
}

/// An open `/dev/cpu/N/msr` device
///
/// The device is opened read-write with `O_SYNC`, so a single handle serves
/// both directions. Accesses take `&mut self` because every read and write
/// seeks the shared file offset.
#[derive(Debug)]
pub struct MsrDevice {
    file: File,
    cpu: u32,
}

impl MsrDevice {
    /// Open the MSR device of a logical CPU
    ///
    /// # Errors
    ///
    /// Returns [`MsrError::OpenFailed`] if the `msr` kernel module is not
    /// loaded or the caller lacks `CAP_SYS_RAWIO`.
    pub fn open(cpu: u32) -> Result<Self> {
        let path = format!("/dev/cpu/{cpu}/msr");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC) // Ensure synchronous writes
            .open(&path)
            .map_err(|e| MsrError::OpenFailed { cpu, source: e })?;

        Ok(Self { file, cpu })
    }

    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    /// Read a 64-bit value from an MSR
    ///
    /// # Example
    ///
    /// ```ignore
    /// use rdtflow_raw::MsrDevice;
    ///
    /// let mut dev = MsrDevice::open(0)?;
    /// let assoc = dev.read(0xC8F)?;
    /// println!("IA32_PQR_ASSOC = 0x{:016X}", assoc);
    /// ```
    pub fn read(&mut self, msr: u64) -> Result<u64> {
        let cpu = self.cpu;
        self.file
            .seek(SeekFrom::Start(msr))
            .map_err(|e| MsrError::SeekFailed {
                cpu,
                msr,
                source: e,
            })?;

        let mut buffer = [0u8; 8];
        self.file
            .read_exact(&mut buffer)
            .map_err(|e| MsrError::ReadFailed {
                cpu,
                msr,
                source: e,
            })?;

        Ok(u64::from_le_bytes(buffer))
    }

    /// Write a 64-bit value to an MSR
    ///
    /// # Safety
    ///
    /// Writing incorrect values to MSRs can cause system instability.
    /// Build values through a [`crate::RegisterLayout`] and validate them first.
    pub fn write(&mut self, msr: u64, value: u64) -> Result<()> {
        let cpu = self.cpu;
        self.file
            .seek(SeekFrom::Start(msr))
            .map_err(|e| MsrError::SeekFailed {
                cpu,
                msr,
                source: e,
            })?;

        self.file
            .write_all(&value.to_le_bytes())
            .map_err(|e| MsrError::WriteFailed {
                cpu,
                msr,
                source: e,
            })?;

        Ok(())
    }
}
