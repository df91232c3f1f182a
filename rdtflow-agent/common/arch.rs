// CPU identification: family/model/stepping and brand string

use crate::common::platform::Platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuArchitecture {
    Haswell,
    Broadwell,
    Skylake,
    CascadeLake,
    IceLake,
    Unknown,
}

impl CpuArchitecture {
    pub fn name(&self) -> &'static str {
        match self {
            CpuArchitecture::Haswell => "Haswell",
            CpuArchitecture::Broadwell => "Broadwell",
            CpuArchitecture::Skylake => "Skylake",
            CpuArchitecture::CascadeLake => "Cascade Lake",
            CpuArchitecture::IceLake => "Ice Lake",
            CpuArchitecture::Unknown => "Unknown",
        }
    }
}

/// Decoded CPUID leaf 1 signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuIdent {
    pub family: u32,
    pub model: u32,
    pub stepping: u32,
}

impl CpuIdent {
    pub fn from_signature(eax: u32) -> Self {
        let stepping = eax & 0xF;
        let base_model = (eax >> 4) & 0xF;
        let base_family = (eax >> 8) & 0xF;
        let extended_model = (eax >> 16) & 0xF;
        let extended_family = (eax >> 20) & 0xFF;

        let family = if base_family == 0xF {
            base_family + extended_family
        } else {
            base_family
        };

        let model = if base_family == 0x6 || base_family == 0xF {
            (extended_model << 4) | base_model
        } else {
            base_model
        };

        Self {
            family,
            model,
            stepping,
        }
    }

    pub fn detect(platform: &dyn Platform) -> Self {
        let ident = Self::from_signature(platform.cpuid(1, 0).eax);
        tracing::debug!(
            "CPU: Family {:X}, Model {:X}, Stepping {:X}",
            ident.family,
            ident.model,
            ident.stepping
        );
        ident
    }

    pub fn architecture(&self) -> CpuArchitecture {
        // Intel server and client parts of interest are all family 6
        if self.family != 0x6 {
            return CpuArchitecture::Unknown;
        }

        match self.model {
            0x3C | 0x3F | 0x45 | 0x46 => CpuArchitecture::Haswell,
            0x3D | 0x47 | 0x4F | 0x56 => CpuArchitecture::Broadwell,
            0x4E | 0x5E => CpuArchitecture::Skylake,
            0x55 => {
                if self.stepping >= 5 {
                    CpuArchitecture::CascadeLake
                } else {
                    CpuArchitecture::Skylake
                }
            }
            0x6A | 0x6C | 0x7D | 0x7E => CpuArchitecture::IceLake,
            _ => CpuArchitecture::Unknown,
        }
    }
}

const BRAND_LEAF_START: u32 = 0x8000_0002;
const BRAND_LEAF_END: u32 = 0x8000_0004;

/// Processor brand string from CPUID 0x80000002..=0x80000004
///
/// Returns `None` when the extended leaves are not implemented.
pub fn brand_string(platform: &dyn Platform) -> Option<String> {
    if platform.cpuid(0x8000_0000, 0).eax < BRAND_LEAF_END {
        return None;
    }

    let mut bytes = Vec::with_capacity(48);
    for leaf in BRAND_LEAF_START..=BRAND_LEAF_END {
        bytes.extend_from_slice(&platform.cpuid(leaf, 0).to_le_bytes());
    }

    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Some(String::from_utf8_lossy(&bytes[..end]).trim().to_string())
}
