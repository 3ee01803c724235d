//! Consolidation handle.
//!
//! A [`Bartleby`] handle ingests relocatable objects, archives and fat
//! Mach-O containers, merges their symbol tables, and is finally consumed
//! by the archive writer. The first input commits the handle to either a
//! single object format or, for fat Mach-O, a fixed set of per-slice
//! formats; later inputs must agree.
//!
//! After a failed `add_binary` the handle may hold partially folded state
//! and must only be dropped.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use object::read::archive::ArchiveFile;
use object::read::macho::{FatArch, MachOFatFile32, MachOFatFile64};
use object::{BinaryFormat, FileKind, Object, ObjectKind};
use tracing::debug;

use crate::error::Error;
use crate::format::{FormatState, ObjectFormat};
use crate::symbol::{Symbol, SymbolInfo};
use crate::writer::ArchiveBuilder;

/// Map of symbol name to aggregate symbol record.
pub type SymbolMap = HashMap<String, Symbol>;

/// Where the bytes of an ingested object live.
#[derive(Debug)]
pub(crate) enum ObjectData {
    /// The object spans an entire root input; index into the owned
    /// binaries list.
    Root(usize),
    /// The object was copied out of an archive member or a fat slice.
    Extracted(Vec<u8>),
}

/// One object queued for emission.
#[derive(Debug)]
pub(crate) struct ObjectEntry {
    /// Where the object bytes live.
    pub(crate) data: ObjectData,
    /// Member name inside the output archive.
    pub(crate) name: String,
    /// Format triple, the fat Mach-O partitioning key.
    pub(crate) format: ObjectFormat,
    /// Slice alignment exponent; non-zero only for fat Mach-O slices.
    pub(crate) alignment: u32,
}

/// Symbol-aware archive consolidator.
#[derive(Debug, Default)]
pub struct Bartleby {
    pub(crate) symbols: SymbolMap,
    pub(crate) objects: Vec<ObjectEntry>,
    pub(crate) owned_binaries: Vec<Vec<u8>>,
    pub(crate) format: FormatState,
}

impl Bartleby {
    /// Constructs an empty handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingests one input binary.
    ///
    /// The input must be a relocatable object file, an archive of object
    /// files, or a fat Mach-O container; anything else fails with
    /// [`Error::UnsupportedBinary`].
    pub fn add_binary(&mut self, binary: Vec<u8>) -> Result<()> {
        match FileKind::parse(&*binary) {
            Ok(FileKind::Archive) => self.add_archive(binary),
            Ok(kind @ (FileKind::MachOFat32 | FileKind::MachOFat64)) => {
                self.add_macho_universal(binary, kind)
            }
            Ok(_) => self.add_object(binary),
            Err(err) => {
                Err(Error::UnsupportedBinary(format!("unrecognized binary: {err}")).into())
            }
        }
    }

    /// Read-only view of the merged symbol table.
    pub fn symbols(&self) -> &SymbolMap {
        &self.symbols
    }

    /// Stamps a rename target on every symbol that is both global and
    /// defined, and returns how many symbols were affected.
    ///
    /// Mach-O symbol names carry a leading underscore: the first byte of
    /// the original name is stripped and the underscore is re-added in
    /// front of the prefix. Calling this again overwrites previously
    /// recorded targets.
    pub fn prefix_global_and_defined_symbols(&mut self, prefix: &str) -> usize {
        let mut count = 0;
        for (name, sym) in &mut self.symbols {
            if !(sym.is_global() && sym.is_defined()) {
                continue;
            }
            let new_name = if sym.is_macho() {
                format!("_{}{}", prefix, name.get(1..).unwrap_or(""))
            } else {
                format!("{prefix}{name}")
            };
            debug!("renaming '{}' into '{}'", name, new_name);
            sym.set_overwrite_name(new_name);
            count += 1;
        }
        count
    }

    /// Builds the final archive and writes it to a file.
    pub fn build_to_path(self, path: impl AsRef<Path>) -> Result<()> {
        ArchiveBuilder::new(self).write_to_path(path.as_ref())
    }

    /// Builds the final archive and returns its bytes.
    pub fn build_to_buffer(self) -> Result<Vec<u8>> {
        ArchiveBuilder::new(self).write_to_buffer()
    }

    /// Bytes backing one queued object.
    pub(crate) fn entry_bytes<'a>(&'a self, entry: &'a ObjectEntry) -> &'a [u8] {
        match &entry.data {
            ObjectData::Root(index) => &self.owned_binaries[*index],
            ObjectData::Extracted(data) => data,
        }
    }

    fn add_object(&mut self, binary: Vec<u8>) -> Result<()> {
        let format = {
            let obj = parse_object(&binary)?;
            let format = ObjectFormat::from_object(&obj);
            self.reconcile(format)?;
            self.fold_symbols(&obj);
            format
        };
        let index = self.owned_binaries.len();
        self.owned_binaries.push(binary);
        self.objects.push(ObjectEntry {
            data: ObjectData::Root(index),
            name: format!("{}.o", self.objects.len() + 1),
            format,
            alignment: 0,
        });
        Ok(())
    }

    fn add_archive(&mut self, binary: Vec<u8>) -> Result<()> {
        let archive = ArchiveFile::parse(&*binary)
            .map_err(|err| Error::UnsupportedBinary(format!("failed to parse archive: {err}")))?;
        for member in archive.members() {
            let member = member.context("malformed archive member")?;
            // Copied out so the member bytes are owned and aligned for
            // parsing.
            let data = member
                .data(&*binary)
                .context("failed to read archive member")?
                .to_vec();
            let format = {
                let obj = parse_object(&data)?;
                let format = ObjectFormat::from_object(&obj);
                self.reconcile(format)?;
                self.fold_symbols(&obj);
                format
            };
            let name = match member.name() {
                name if name.is_empty() => format!("{}.o", self.objects.len() + 1),
                name => String::from_utf8_lossy(name).into_owned(),
            };
            self.objects.push(ObjectEntry {
                data: ObjectData::Extracted(data),
                name,
                format,
                alignment: 0,
            });
        }
        self.owned_binaries.push(binary);
        Ok(())
    }

    fn add_macho_universal(&mut self, binary: Vec<u8>, kind: FileKind) -> Result<()> {
        if kind == FileKind::MachOFat64 {
            let arches = MachOFatFile64::parse(&*binary)
                .map_err(|err| Error::FatMachO(format!("failed to parse fat Mach-O: {err}")))?
                .arches()
                .to_vec();
            self.fold_universal(&binary, &arches)?;
        } else {
            let arches = MachOFatFile32::parse(&*binary)
                .map_err(|err| Error::FatMachO(format!("failed to parse fat Mach-O: {err}")))?
                .arches()
                .to_vec();
            self.fold_universal(&binary, &arches)?;
        }
        self.owned_binaries.push(binary);
        Ok(())
    }

    fn fold_universal<A: FatArch>(&mut self, binary: &[u8], arches: &[A]) -> Result<()> {
        if let FormatState::Single(format) = &self.format {
            return Err(Error::FatMachO(format!(
                "expected an object of type {format}, got a fat Mach-O"
            ))
            .into());
        }
        if let FormatState::Fat(set) = &self.format {
            if set.len() != arches.len() {
                return Err(Error::FatMachO(format!(
                    "expected a fat Mach-O with {} arch(s), got {} arch(s)",
                    set.len(),
                    arches.len()
                ))
                .into());
            }
        }
        if matches!(self.format, FormatState::Unset) {
            let set: HashSet<ObjectFormat> = arches
                .iter()
                .map(|arch| {
                    ObjectFormat::from_fat_arch(
                        arch.architecture(),
                        arch.cputype(),
                        arch.cpusubtype(),
                    )
                })
                .collect();
            if set.len() < 2 {
                return Err(Error::FatMachO(format!(
                    "universal binary must span at least two architectures, got {}",
                    set.len()
                ))
                .into());
            }
            self.format = FormatState::Fat(set);
        }

        for arch in arches {
            let slice_format = ObjectFormat::from_fat_arch(
                arch.architecture(),
                arch.cputype(),
                arch.cpusubtype(),
            );
            if !self.fat_set_contains(slice_format) {
                return Err(Error::FatMachO(format!(
                    "unexpected triple {slice_format} in fat Mach-O"
                ))
                .into());
            }
            let data = arch
                .data(binary)
                .map_err(|err| Error::FatMachO(format!("failed to read fat slice: {err}")))?;
            match FileKind::parse(data) {
                Ok(FileKind::Archive) => self.fold_fat_archive_slice(data, slice_format)?,
                _ => {
                    let data = data.to_vec();
                    {
                        let obj = object::File::parse(&*data).map_err(|err| {
                            Error::FatMachO(format!("failed to parse fat slice: {err}"))
                        })?;
                        if obj.kind() != ObjectKind::Relocatable {
                            return Err(Error::FatMachO(format!(
                                "expected a relocatable object in fat slice, got {:?}",
                                obj.kind()
                            ))
                            .into());
                        }
                        self.fold_symbols(&obj);
                    }
                    self.objects.push(ObjectEntry {
                        data: ObjectData::Extracted(data),
                        name: format!("{}.o", self.objects.len() + 1),
                        format: slice_format,
                        alignment: arch.align(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Folds an archive found inside a fat slice. Every member must be a
    /// Mach-O relocatable object.
    fn fold_fat_archive_slice(&mut self, data: &[u8], slice_format: ObjectFormat) -> Result<()> {
        let archive = ArchiveFile::parse(data)
            .map_err(|err| Error::FatMachO(format!("failed to parse archive slice: {err}")))?;
        for member in archive.members() {
            let member = member.context("malformed archive member in fat slice")?;
            let mdata = member
                .data(data)
                .context("failed to read archive member in fat slice")?
                .to_vec();
            {
                let obj = object::File::parse(&*mdata).map_err(|err| {
                    Error::FatMachO(format!("expected an object in the archive slice: {err}"))
                })?;
                if obj.format() != BinaryFormat::MachO || obj.kind() != ObjectKind::Relocatable {
                    return Err(Error::FatMachO(format!(
                        "expected a Mach-O object in the archive slice, got {:?} {:?}",
                        obj.format(),
                        obj.kind()
                    ))
                    .into());
                }
                self.fold_symbols(&obj);
            }
            let name = match member.name() {
                name if name.is_empty() => format!("{}.o", self.objects.len() + 1),
                name => String::from_utf8_lossy(name).into_owned(),
            };
            self.objects.push(ObjectEntry {
                data: ObjectData::Extracted(mdata),
                name,
                format: slice_format,
                alignment: 0,
            });
        }
        Ok(())
    }

    /// Checks an object's format against the committed format state.
    fn reconcile(&mut self, format: ObjectFormat) -> Result<()> {
        match &self.format {
            FormatState::Unset => {
                self.format = FormatState::Single(format);
                Ok(())
            }
            FormatState::Single(committed) if *committed == format => Ok(()),
            FormatState::Single(committed) => Err(Error::FormatMismatch {
                expected: *committed,
                found: format,
            }
            .into()),
            FormatState::Fat(_) => Err(Error::FatMachO(format!(
                "expected a fat Mach-O, got a single-arch object ({format})"
            ))
            .into()),
        }
    }

    fn fat_set_contains(&self, format: ObjectFormat) -> bool {
        matches!(&self.format, FormatState::Fat(set) if set.contains(&format))
    }

    fn fold_symbols(&mut self, obj: &object::File) {
        let format = obj.format();
        for sym in obj.symbols() {
            let Some(info) = SymbolInfo::collect(&sym, format) else {
                continue;
            };
            debug!(
                "found symbol '{}' (global={}, undefined={}, weak={})",
                info.name, info.global, info.undefined, info.weak
            );
            self.symbols.entry(info.name.clone()).or_default().update(&info);
        }
    }
}

/// Parses an input as a relocatable object file.
fn parse_object(data: &[u8]) -> Result<object::File<'_>> {
    let obj = object::File::parse(data)
        .map_err(|err| Error::UnsupportedBinary(format!("failed to parse object: {err}")))?;
    if obj.kind() != ObjectKind::Relocatable {
        return Err(
            Error::UnsupportedBinary(format!("unsupported binary kind {:?}", obj.kind())).into(),
        );
    }
    Ok(obj)
}
