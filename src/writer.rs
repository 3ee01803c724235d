//! Archive emission.
//!
//! Consumes a handle, rewrites every queued object through the rename map,
//! and hands the results to the archive writer. Handles committed to a fat
//! Mach-O format set produce a universal binary wrapping one archive per
//! slice format.
//!
//! The output bytes are fully determined by the ordered object list, their
//! contents and the rename map: members are written with zeroed
//! timestamps and ids, and the universal layout depends only on slice
//! sizes and alignments.

use std::io::Cursor;
use std::mem::size_of;
use std::path::Path;

use anyhow::{Context, Result};
use ar_archive_writer::{
    write_archive_to_stream, ArchiveKind, NewArchiveMember, DEFAULT_OBJECT_READER,
};
use object::endian::{BigEndian, U32};
use object::pod::bytes_of;
use object::{macho, Architecture, BinaryFormat, SubArchitecture};
use tracing::debug;

use crate::error::Error;
use crate::format::{FormatState, ObjectFormat};
use crate::handle::{Bartleby, ObjectEntry};
use crate::rewriter::{rewrite_object, RenameMap};

/// Builds the final archive out of a consumed handle.
pub(crate) struct ArchiveBuilder {
    handle: Bartleby,
    renames: RenameMap,
}

impl ArchiveBuilder {
    /// Consumes a handle and snapshots its pending renames.
    pub(crate) fn new(handle: Bartleby) -> Self {
        let mut renames = RenameMap::new();
        for (name, sym) in handle.symbols() {
            if let Some(new_name) = sym.overwrite_name() {
                debug!("going to rename '{}' into '{}'", name, new_name);
                renames.insert(name.clone(), new_name.to_owned());
            }
        }
        Self { handle, renames }
    }

    /// Builds the archive and writes it to a file.
    pub(crate) fn write_to_path(self, path: &Path) -> Result<()> {
        let buffer = self.write_to_buffer()?;
        std::fs::write(path, buffer)
            .with_context(|| format!("failed to write {}", path.display()))
    }

    /// Builds the archive and returns its bytes.
    pub(crate) fn write_to_buffer(self) -> Result<Vec<u8>> {
        if matches!(self.handle.format, FormatState::Fat(_)) {
            self.write_universal_buffer()
        } else {
            let kind = match &self.handle.format {
                FormatState::Single(format) => archive_kind(format.format),
                _ => ArchiveKind::Gnu,
            };
            let entries: Vec<&ObjectEntry> = self.handle.objects.iter().collect();
            self.write_archive_buffer(&entries, kind)
        }
    }

    /// Emits one archive containing the given entries in order.
    fn write_archive_buffer(&self, entries: &[&ObjectEntry], kind: ArchiveKind) -> Result<Vec<u8>> {
        debug!("processing {} object(s)", entries.len());
        let mut members = Vec::with_capacity(entries.len());
        for entry in entries {
            let bytes = self.handle.entry_bytes(entry);
            let obj = object::File::parse(bytes).map_err(|err| {
                Error::UnsupportedBinary(format!("failed to reparse {}: {err}", entry.name))
            })?;
            let data = rewrite_object(&obj, &self.renames)
                .with_context(|| format!("failed to rewrite {}", entry.name))?;
            members.push(NewArchiveMember {
                buf: Box::new(data),
                object_reader: &DEFAULT_OBJECT_READER,
                member_name: entry.name.clone(),
                mtime: 0,
                uid: 0,
                gid: 0,
                perms: 0o644,
            });
        }
        let mut cursor = Cursor::new(Vec::new());
        write_archive_to_stream(&mut cursor, &members, kind, false, false)
            .context("failed to write archive")?;
        Ok(cursor.into_inner())
    }

    /// Emits one archive per slice format and wraps them in a fat header.
    fn write_universal_buffer(&self) -> Result<Vec<u8>> {
        // Partition entries by packed format, preserving first-appearance
        // order across partitions and insertion order within each.
        let mut partitions: Vec<(ObjectFormat, Vec<&ObjectEntry>, u32)> = Vec::new();
        for entry in &self.handle.objects {
            match partitions
                .iter_mut()
                .find(|(format, _, _)| *format == entry.format)
            {
                Some((_, entries, alignment)) => {
                    entries.push(entry);
                    *alignment = entry.alignment;
                }
                None => partitions.push((entry.format, vec![entry], entry.alignment)),
            }
        }

        let mut slices = Vec::with_capacity(partitions.len());
        for (format, entries, alignment) in &partitions {
            debug!("building fat slice for {format}");
            let data = self.write_archive_buffer(entries, ArchiveKind::Darwin)?;
            let (cputype, cpusubtype) = macho_cpu(*format)?;
            slices.push(FatSlice {
                data,
                cputype,
                cpusubtype,
                align: *alignment,
            });
        }
        write_universal(&slices)
    }
}

/// One slice of a universal binary under construction.
struct FatSlice {
    data: Vec<u8>,
    cputype: u32,
    cpusubtype: u32,
    /// Alignment exponent; the slice offset is rounded up to `1 << align`.
    align: u32,
}

/// Lays the slices out behind a big-endian fat header.
fn write_universal(slices: &[FatSlice]) -> Result<Vec<u8>> {
    let header_len = size_of::<macho::FatHeader>() + slices.len() * size_of::<macho::FatArch32>();
    let mut arches = Vec::with_capacity(slices.len());
    let mut offset = header_len as u64;
    for slice in slices {
        if slice.align >= 32 {
            return Err(Error::FatMachO(format!(
                "invalid slice alignment 2^{}",
                slice.align
            ))
            .into());
        }
        offset = align_up(offset, 1 << slice.align);
        let size = slice.data.len() as u64;
        if offset + size > u64::from(u32::MAX) {
            return Err(Error::FatMachO("universal binary exceeds 4 GiB".to_owned()).into());
        }
        arches.push(macho::FatArch32 {
            cputype: U32::new(BigEndian, slice.cputype),
            cpusubtype: U32::new(BigEndian, slice.cpusubtype),
            offset: U32::new(BigEndian, offset as u32),
            size: U32::new(BigEndian, size as u32),
            align: U32::new(BigEndian, slice.align),
        });
        offset += size;
    }

    let header = macho::FatHeader {
        magic: U32::new(BigEndian, macho::FAT_MAGIC),
        nfat_arch: U32::new(BigEndian, slices.len() as u32),
    };
    let mut buffer = Vec::with_capacity(offset as usize);
    buffer.extend_from_slice(bytes_of(&header));
    for arch in &arches {
        buffer.extend_from_slice(bytes_of(arch));
    }
    for (slice, arch) in slices.iter().zip(&arches) {
        let offset = arch.offset.get(BigEndian) as usize;
        if buffer.len() < offset {
            buffer.resize(offset, 0);
        }
        buffer.extend_from_slice(&slice.data);
    }
    Ok(buffer)
}

/// Picks the archive flavor expected for a container format, mirroring how
/// the kind would be detected from the first member.
fn archive_kind(format: BinaryFormat) -> ArchiveKind {
    match format {
        BinaryFormat::MachO => ArchiveKind::Darwin,
        BinaryFormat::Coff => ArchiveKind::Coff,
        BinaryFormat::Xcoff => ArchiveKind::AixBig,
        _ => ArchiveKind::Gnu,
    }
}

/// Derives the Mach-O CPU type and subtype for a slice format.
fn macho_cpu(format: ObjectFormat) -> Result<(u32, u32)> {
    let pair = match (format.arch, format.sub_arch) {
        (Architecture::Aarch64, Some(SubArchitecture::Arm64E)) => {
            (macho::CPU_TYPE_ARM64, macho::CPU_SUBTYPE_ARM64E)
        }
        (Architecture::Aarch64, _) => (macho::CPU_TYPE_ARM64, macho::CPU_SUBTYPE_ARM64_ALL),
        (Architecture::Aarch64_Ilp32, _) => {
            (macho::CPU_TYPE_ARM64_32, macho::CPU_SUBTYPE_ARM64_32_V8)
        }
        (Architecture::Arm, _) => (macho::CPU_TYPE_ARM, macho::CPU_SUBTYPE_ARM_ALL),
        (Architecture::X86_64, _) => (macho::CPU_TYPE_X86_64, macho::CPU_SUBTYPE_X86_64_ALL),
        (Architecture::I386, _) => (macho::CPU_TYPE_X86, macho::CPU_SUBTYPE_I386_ALL),
        (Architecture::PowerPc, _) => (macho::CPU_TYPE_POWERPC, macho::CPU_SUBTYPE_POWERPC_ALL),
        (Architecture::PowerPc64, _) => {
            (macho::CPU_TYPE_POWERPC64, macho::CPU_SUBTYPE_POWERPC_ALL)
        }
        _ => {
            return Err(Error::FatMachO(format!("no Mach-O CPU type for {format}")).into());
        }
    };
    Ok(pair)
}

/// Rounds `value` up to the next multiple of `align`, a power of two.
fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_powers_of_two() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(20, 16), 32);
    }

    #[test]
    fn archive_kind_follows_container_format() {
        assert!(matches!(
            archive_kind(BinaryFormat::MachO),
            ArchiveKind::Darwin
        ));
        assert!(matches!(archive_kind(BinaryFormat::Elf), ArchiveKind::Gnu));
        assert!(matches!(archive_kind(BinaryFormat::Wasm), ArchiveKind::Gnu));
    }

    #[test]
    fn universal_layout_respects_alignment() {
        let slices = [
            FatSlice {
                data: vec![1; 10],
                cputype: macho::CPU_TYPE_ARM64,
                cpusubtype: macho::CPU_SUBTYPE_ARM64_ALL,
                align: 4,
            },
            FatSlice {
                data: vec![2; 6],
                cputype: macho::CPU_TYPE_X86_64,
                cpusubtype: macho::CPU_SUBTYPE_X86_64_ALL,
                align: 4,
            },
        ];
        let buffer = write_universal(&slices).unwrap();
        assert_eq!(&buffer[..4], macho::FAT_MAGIC.to_be_bytes().as_slice());

        let fat = object::read::macho::MachOFatFile32::parse(&*buffer).unwrap();
        let arches = fat.arches();
        assert_eq!(arches.len(), 2);
        for (arch, slice) in arches.iter().zip(&slices) {
            let offset = arch.offset.get(BigEndian) as u64;
            assert_eq!(offset % 16, 0);
            assert_eq!(arch.size.get(BigEndian) as usize, slice.data.len());
            let data = &buffer[offset as usize..][..slice.data.len()];
            assert_eq!(data, slice.data.as_slice());
        }
    }

    #[test]
    fn oversized_alignment_is_rejected() {
        let slices = [FatSlice {
            data: vec![0; 4],
            cputype: macho::CPU_TYPE_ARM64,
            cpusubtype: macho::CPU_SUBTYPE_ARM64_ALL,
            align: 40,
        }];
        assert!(write_universal(&slices).is_err());
    }
}
