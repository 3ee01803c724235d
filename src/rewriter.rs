//! In-memory object rewriting.
//!
//! Rebuilds a relocatable object while substituting symbol-table names
//! according to a rename map. Sections, symbols, relocations and COMDAT
//! groups are carried over unchanged; only the names differ. The output is
//! a freshly written object of the same format, architecture and
//! endianness as the input.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Context, Result};
use object::{
    write, Object, ObjectComdat, ObjectSection, ObjectSymbol, RelocationTarget, SectionKind,
    SymbolFlags, SymbolKind, SymbolSection,
};

/// Map from original symbol name to replacement name.
pub(crate) type RenameMap = HashMap<String, String>;

/// Rewrites one relocatable object, renaming the symbols listed in
/// `renames`. Names absent from the map pass through untouched.
pub(crate) fn rewrite_object(in_obj: &object::File, renames: &RenameMap) -> Result<Vec<u8>> {
    let mut out_obj =
        write::Object::new(in_obj.format(), in_obj.architecture(), in_obj.endianness());
    out_obj.set_sub_architecture(in_obj.sub_architecture());
    out_obj.mangling = write::Mangling::None;
    out_obj.flags = in_obj.flags();

    let mut section_ids = HashMap::new();
    for in_section in in_obj.sections() {
        if in_section.kind() == SectionKind::Metadata {
            continue;
        }
        let segment = in_section
            .segment_name()
            .context("failed to read segment name")?
            .unwrap_or("");
        let name = in_section.name().context("failed to read section name")?;
        let section_id = out_obj.add_section(
            segment.as_bytes().to_vec(),
            name.as_bytes().to_vec(),
            in_section.kind(),
        );
        let out_section = out_obj.section_mut(section_id);
        if out_section.is_bss() {
            out_section.append_bss(in_section.size(), in_section.align());
        } else {
            let data = in_section.data().context("failed to read section data")?;
            out_section.set_data(data.to_vec(), in_section.align());
        }
        out_section.flags = in_section.flags();
        section_ids.insert(in_section.index(), section_id);
    }

    let mut symbol_ids = HashMap::new();
    for in_symbol in in_obj.symbols() {
        let (section, value) = match in_symbol.section() {
            SymbolSection::None => (write::SymbolSection::None, in_symbol.address()),
            SymbolSection::Undefined => (write::SymbolSection::Undefined, in_symbol.address()),
            SymbolSection::Absolute => (write::SymbolSection::Absolute, in_symbol.address()),
            SymbolSection::Common => (write::SymbolSection::Common, in_symbol.address()),
            SymbolSection::Section(index) => match section_ids.get(&index) {
                Some(section_id) => {
                    let section_address = in_obj.section_by_index(index)?.address();
                    (
                        write::SymbolSection::Section(*section_id),
                        in_symbol.address() - section_address,
                    )
                }
                // Symbols for skipped metadata sections are dropped with
                // their section.
                None => continue,
            },
            section => bail!("unsupported symbol section {section:?}"),
        };
        let flags = match in_symbol.flags() {
            SymbolFlags::None => SymbolFlags::None,
            SymbolFlags::Elf { st_info, st_other } => SymbolFlags::Elf { st_info, st_other },
            SymbolFlags::MachO { n_desc } => SymbolFlags::MachO { n_desc },
            SymbolFlags::CoffSection {
                selection,
                associative_section,
            } => {
                let associative_section =
                    associative_section.and_then(|index| section_ids.get(&index).copied());
                SymbolFlags::CoffSection {
                    selection,
                    associative_section,
                }
            }
            flags => bail!("unsupported symbol flags {flags:?}"),
        };
        let name = in_symbol.name().unwrap_or("");
        let name = renames.get(name).map(String::as_str).unwrap_or(name);
        let symbol_id = out_obj.add_symbol(write::Symbol {
            name: name.as_bytes().to_vec(),
            value,
            size: in_symbol.size(),
            kind: in_symbol.kind(),
            scope: in_symbol.scope(),
            weak: in_symbol.is_weak(),
            section,
            flags,
        });
        symbol_ids.insert(in_symbol.index(), symbol_id);
    }

    for in_section in in_obj.sections() {
        let Some(&section_id) = section_ids.get(&in_section.index()) else {
            continue;
        };
        for (offset, in_relocation) in in_section.relocations() {
            let symbol = match in_relocation.target() {
                RelocationTarget::Symbol(index) => symbol_ids
                    .get(&index)
                    .copied()
                    .ok_or_else(|| anyhow!("relocation against a dropped symbol"))?,
                RelocationTarget::Section(index) => {
                    let target = section_ids
                        .get(&index)
                        .copied()
                        .ok_or_else(|| anyhow!("relocation against a dropped section"))?;
                    out_obj.section_symbol(target)
                }
                target => bail!("unsupported relocation target {target:?}"),
            };
            out_obj.add_relocation(
                section_id,
                write::Relocation {
                    offset,
                    symbol,
                    addend: in_relocation.addend(),
                    flags: in_relocation.flags(),
                },
            )?;
        }
    }

    for in_comdat in in_obj.comdats() {
        let symbol = symbol_ids
            .get(&in_comdat.symbol())
            .copied()
            .ok_or_else(|| anyhow!("COMDAT group against a dropped symbol"))?;
        let mut sections = Vec::new();
        for index in in_comdat.sections() {
            sections.push(
                section_ids
                    .get(&index)
                    .copied()
                    .ok_or_else(|| anyhow!("COMDAT group against a dropped section"))?,
            );
        }
        out_obj.add_comdat(write::Comdat {
            kind: in_comdat.kind(),
            symbol,
            sections,
        });
    }

    out_obj.write().context("failed to write rewritten object")
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::{
        Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationFlags,
        RelocationKind, SymbolScope,
    };

    fn sample_elf() -> Vec<u8> {
        let mut obj = write::Object::new(
            BinaryFormat::Elf,
            Architecture::X86_64,
            Endianness::Little,
        );
        obj.mangling = write::Mangling::None;
        let text = obj.section_id(write::StandardSection::Text);
        obj.append_section_data(text, &[0x90; 8], 4);
        let callee = obj.add_symbol(write::Symbol {
            name: b"callee".to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Unknown,
            scope: SymbolScope::Linkage,
            weak: false,
            section: write::SymbolSection::Undefined,
            flags: SymbolFlags::None,
        });
        obj.add_symbol(write::Symbol {
            name: b"caller".to_vec(),
            value: 0,
            size: 8,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: write::SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
        obj.add_relocation(
            text,
            write::Relocation {
                offset: 2,
                symbol: callee,
                addend: -4,
                flags: RelocationFlags::Generic {
                    kind: RelocationKind::Relative,
                    encoding: RelocationEncoding::Generic,
                    size: 32,
                },
            },
        )
        .unwrap();
        obj.write().unwrap()
    }

    #[test]
    fn renames_only_mapped_symbols() {
        let input = sample_elf();
        let in_obj = object::File::parse(&*input).unwrap();
        let mut renames = RenameMap::new();
        renames.insert("caller".to_owned(), "p_caller".to_owned());

        let output = rewrite_object(&in_obj, &renames).unwrap();
        let out_obj = object::File::parse(&*output).unwrap();
        let names: Vec<_> = out_obj
            .symbols()
            .filter(|sym| sym.kind() != SymbolKind::Section)
            .map(|sym| sym.name().unwrap().to_owned())
            .collect();
        assert!(names.contains(&"p_caller".to_owned()));
        assert!(names.contains(&"callee".to_owned()));
        assert!(!names.contains(&"caller".to_owned()));
    }

    #[test]
    fn preserves_section_data_and_relocations() {
        let input = sample_elf();
        let in_obj = object::File::parse(&*input).unwrap();

        let output = rewrite_object(&in_obj, &RenameMap::new()).unwrap();
        let out_obj = object::File::parse(&*output).unwrap();
        let text = out_obj
            .sections()
            .find(|sec| sec.name() == Ok(".text"))
            .unwrap();
        assert_eq!(text.data().unwrap(), &[0x90; 8]);
        let relocs: Vec<_> = text.relocations().collect();
        assert_eq!(relocs.len(), 1);
        assert_eq!(relocs[0].0, 2);
        assert_eq!(relocs[0].1.addend(), -4);
    }

    #[test]
    fn identical_inputs_rewrite_identically() {
        let input = sample_elf();
        let in_obj = object::File::parse(&*input).unwrap();
        let first = rewrite_object(&in_obj, &RenameMap::new()).unwrap();
        let second = rewrite_object(&in_obj, &RenameMap::new()).unwrap();
        assert_eq!(first, second);
    }
}
