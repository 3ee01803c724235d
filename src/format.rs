//! Object format identification.
//!
//! An [`ObjectFormat`] condenses an input's triple down to the three fields
//! that matter for archive coherence: architecture, sub-architecture and
//! container format. A handle refuses to mix objects whose formats differ,
//! and a fat Mach-O input commits the handle to a fixed set of formats.

use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use object::{macho, Architecture, BinaryFormat, Object, SubArchitecture};

/// The (architecture, sub-architecture, container format) triple of an
/// object file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectFormat {
    /// Architecture.
    pub arch: Architecture,
    /// Sub-architecture, when one is reported (e.g. arm64e).
    pub sub_arch: Option<SubArchitecture>,
    /// Container format.
    pub format: BinaryFormat,
}

impl ObjectFormat {
    /// Reads the triple of a parsed object.
    pub fn from_object(obj: &object::File) -> Self {
        Self {
            arch: obj.architecture(),
            sub_arch: obj.sub_architecture(),
            format: obj.format(),
        }
    }

    /// Derives the format of a fat Mach-O slice from its CPU type and
    /// subtype, before the slice contents are parsed.
    pub(crate) fn from_fat_arch(arch: Architecture, cputype: u32, cpusubtype: u32) -> Self {
        let sub_arch = if cputype == macho::CPU_TYPE_ARM64
            && (cpusubtype & !macho::CPU_SUBTYPE_MASK) == macho::CPU_SUBTYPE_ARM64E
        {
            Some(SubArchitecture::Arm64E)
        } else {
            None
        };
        Self {
            arch,
            sub_arch,
            format: BinaryFormat::MachO,
        }
    }

    /// Packs the three fields into a single integer. Also used as the hash.
    pub fn pack(self) -> u64 {
        arch_code(self.arch) | sub_arch_code(self.sub_arch) << 16 | format_code(self.format) << 32
    }

    /// Whether a parsed object carries this exact format.
    pub fn matches(self, obj: &object::File) -> bool {
        Self::from_object(obj) == self
    }
}

impl Hash for ObjectFormat {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.pack());
    }
}

// The object crate marks these enums non-exhaustive, so they cannot be cast
// to integers directly; each field gets an explicit code instead. Variants
// outside the lists share a catch-all code. That only weakens the hash:
// equality always compares the fields themselves.

fn arch_code(arch: Architecture) -> u64 {
    match arch {
        Architecture::Unknown => 0,
        Architecture::Aarch64 => 1,
        Architecture::Aarch64_Ilp32 => 2,
        Architecture::Arm => 3,
        Architecture::Avr => 4,
        Architecture::Bpf => 5,
        Architecture::I386 => 6,
        Architecture::X86_64 => 7,
        Architecture::X86_64_X32 => 8,
        Architecture::Hexagon => 9,
        Architecture::LoongArch64 => 10,
        Architecture::Mips => 11,
        Architecture::Mips64 => 12,
        Architecture::Msp430 => 13,
        Architecture::PowerPc => 14,
        Architecture::PowerPc64 => 15,
        Architecture::Riscv32 => 16,
        Architecture::Riscv64 => 17,
        Architecture::S390x => 18,
        Architecture::Sparc64 => 19,
        Architecture::Wasm32 => 20,
        Architecture::Wasm64 => 21,
        _ => 0x7fff,
    }
}

fn sub_arch_code(sub_arch: Option<SubArchitecture>) -> u64 {
    match sub_arch {
        None => 0,
        Some(SubArchitecture::Arm64E) => 1,
        Some(_) => 0x7fff,
    }
}

fn format_code(format: BinaryFormat) -> u64 {
    match format {
        BinaryFormat::Coff => 1,
        BinaryFormat::Elf => 2,
        BinaryFormat::MachO => 3,
        BinaryFormat::Pe => 4,
        BinaryFormat::Wasm => 5,
        BinaryFormat::Xcoff => 6,
        _ => 0x7f,
    }
}

impl fmt::Display for ObjectFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ObjectFormat(arch={:?}, subarch={:?}, file format={:?})",
            self.arch, self.sub_arch, self.format
        )
    }
}

/// Format constraint accumulated by a handle over its inputs.
///
/// The first input decides which variant the handle commits to; every later
/// input must agree with it.
#[derive(Debug, Clone, Default)]
pub enum FormatState {
    /// No input ingested yet.
    #[default]
    Unset,
    /// All inputs share one format.
    Single(ObjectFormat),
    /// Inputs are fat Mach-O containers spanning exactly these formats.
    Fat(HashSet<ObjectFormat>),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elf_x86_64() -> ObjectFormat {
        ObjectFormat {
            arch: Architecture::X86_64,
            sub_arch: None,
            format: BinaryFormat::Elf,
        }
    }

    #[test]
    fn pack_distinguishes_fields() {
        let base = elf_x86_64();
        let other_arch = ObjectFormat {
            arch: Architecture::Aarch64,
            ..base
        };
        let other_format = ObjectFormat {
            format: BinaryFormat::MachO,
            ..base
        };
        let sub_arch = ObjectFormat {
            sub_arch: Some(SubArchitecture::Arm64E),
            ..base
        };
        assert_ne!(base.pack(), other_arch.pack());
        assert_ne!(base.pack(), other_format.pack());
        assert_ne!(base.pack(), sub_arch.pack());
    }

    #[test]
    fn equality_follows_all_three_fields() {
        assert_eq!(elf_x86_64(), elf_x86_64());
        assert_ne!(
            elf_x86_64(),
            ObjectFormat {
                format: BinaryFormat::Coff,
                ..elf_x86_64()
            }
        );
    }

    #[test]
    fn display_names_every_field() {
        let text = elf_x86_64().to_string();
        assert!(text.starts_with("ObjectFormat(arch="));
        assert!(text.contains("subarch="));
        assert!(text.contains("file format="));
    }

    #[test]
    fn fat_arch_detects_arm64e() {
        let plain = ObjectFormat::from_fat_arch(
            Architecture::Aarch64,
            macho::CPU_TYPE_ARM64,
            macho::CPU_SUBTYPE_ARM64_ALL,
        );
        assert_eq!(plain.sub_arch, None);
        // Capability bits in the high byte must not defeat the comparison.
        let arm64e = ObjectFormat::from_fat_arch(
            Architecture::Aarch64,
            macho::CPU_TYPE_ARM64,
            macho::CPU_SUBTYPE_ARM64E | 0x8100_0000,
        );
        assert_eq!(arm64e.sub_arch, Some(SubArchitecture::Arm64E));
        assert_eq!(arm64e.format, BinaryFormat::MachO);
    }
}
