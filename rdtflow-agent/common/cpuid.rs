/// Output registers of one CPUID invocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuidRegs {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

impl CpuidRegs {
    pub const fn new(eax: u32, ebx: u32, ecx: u32, edx: u32) -> Self {
        Self { eax, ebx, ecx, edx }
    }

    /// Registers in brand-string order (EAX, EBX, ECX, EDX) as bytes
    pub fn to_le_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        for (chunk, reg) in out
            .chunks_exact_mut(4)
            .zip([self.eax, self.ebx, self.ecx, self.edx])
        {
            chunk.copy_from_slice(&reg.to_le_bytes());
        }
        out
    }
}

#[cfg(target_arch = "x86_64")]
pub fn cpuid(leaf: u32, subleaf: u32) -> CpuidRegs {
    let ebx: u32;
    let edx: u32;
    let mut eax_out = leaf;
    let mut ecx_out = subleaf;

    // rbx is reserved by LLVM, so it is saved and restored around cpuid
    unsafe {
        std::arch::asm!(
            "mov {0:r}, rbx",
            "cpuid",
            "xchg {0:r}, rbx",
            out(reg) ebx,
            inout("eax") eax_out,
            inout("ecx") ecx_out,
            out("edx") edx,
            options(nostack, preserves_flags)
        );
    }

    CpuidRegs::new(eax_out, ebx, ecx_out, edx)
}

#[cfg(not(target_arch = "x86_64"))]
pub fn cpuid(_leaf: u32, _subleaf: u32) -> CpuidRegs {
    CpuidRegs::default()
}
