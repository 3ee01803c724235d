//! Symbol tracking.
//!
//! Every distinct symbol name observed across the inputs is folded into one
//! [`Symbol`] record. The flags are monotonic: once a name has been seen
//! global or defined anywhere, it stays that way. Weak occurrences
//! contribute neither.

use object::{BinaryFormat, ObjectSymbol, SymbolKind};
use tracing::debug;

/// One observed occurrence of a symbol inside an input object.
#[derive(Debug, Clone)]
pub struct SymbolInfo {
    /// Symbol name.
    pub name: String,
    /// The occurrence is a weak definition or reference.
    pub weak: bool,
    /// The occurrence references the name without providing storage.
    pub undefined: bool,
    /// The occurrence exposes the name outside its translation unit.
    pub global: bool,
    /// Container format of the object the occurrence came from.
    pub format: BinaryFormat,
}

impl SymbolInfo {
    /// Extracts the relevant pieces of one symbol from a parsed object.
    ///
    /// Returns `None` for occurrences that carry no linkage information
    /// worth tracking: null, file, section and label markers, and symbols
    /// whose name cannot be read.
    pub fn collect(sym: &object::Symbol, format: BinaryFormat) -> Option<Self> {
        let name = match sym.name() {
            Ok(name) => name.to_owned(),
            Err(err) => {
                debug!("skipping symbol with unreadable name: {}", err);
                return None;
            }
        };
        if matches!(
            sym.kind(),
            SymbolKind::File | SymbolKind::Section | SymbolKind::Label
        ) {
            debug!("skipping '{}': not a linkable symbol", name);
            return None;
        }
        Some(Self {
            name,
            weak: sym.is_weak(),
            undefined: sym.is_undefined(),
            global: sym.is_global(),
            format,
        })
    }
}

/// Aggregate view of one symbol name across every ingested object.
#[derive(Debug, Default)]
pub struct Symbol {
    overwrite_name: Option<String>,
    format: Option<BinaryFormat>,
    global: bool,
    defined: bool,
}

impl Symbol {
    /// Folds one occurrence into the record.
    ///
    /// Weak occurrences contribute neither globalness nor definedness. The
    /// container format always tracks the most recent occurrence.
    pub fn update(&mut self, info: &SymbolInfo) {
        if !info.weak {
            if !info.undefined {
                self.defined = true;
            }
            if info.global {
                self.global = true;
            }
        }
        self.format = Some(info.format);
    }

    /// Records the name this symbol will be renamed to at emission.
    pub fn set_overwrite_name(&mut self, name: String) {
        self.overwrite_name = Some(name);
    }

    /// Name this symbol will be renamed to, if a rename is pending.
    pub fn overwrite_name(&self) -> Option<&str> {
        self.overwrite_name.as_deref()
    }

    /// True once any occurrence exposed the name with global linkage.
    pub fn is_global(&self) -> bool {
        self.global
    }

    /// True once any occurrence provided a non-weak definition.
    pub fn is_defined(&self) -> bool {
        self.defined
    }

    /// True if the most recent occurrence came from a Mach-O container.
    pub fn is_macho(&self) -> bool {
        self.format == Some(BinaryFormat::MachO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn occurrence(weak: bool, undefined: bool, global: bool) -> SymbolInfo {
        SymbolInfo {
            name: "sym".to_owned(),
            weak,
            undefined,
            global,
            format: BinaryFormat::Elf,
        }
    }

    #[test]
    fn defined_global_occurrence_sets_both_flags() {
        let mut sym = Symbol::default();
        sym.update(&occurrence(false, false, true));
        assert!(sym.is_defined());
        assert!(sym.is_global());
    }

    #[test]
    fn weak_occurrence_contributes_nothing() {
        let mut sym = Symbol::default();
        sym.update(&occurrence(true, false, true));
        assert!(!sym.is_defined());
        assert!(!sym.is_global());
    }

    #[test]
    fn flags_are_monotonic() {
        let mut sym = Symbol::default();
        sym.update(&occurrence(false, false, true));
        // A later local undefined reference must not clear anything.
        sym.update(&occurrence(false, true, false));
        assert!(sym.is_defined());
        assert!(sym.is_global());
    }

    #[test]
    fn container_is_last_writer_wins() {
        let mut sym = Symbol::default();
        sym.update(&occurrence(false, false, true));
        assert!(!sym.is_macho());
        let macho = SymbolInfo {
            format: BinaryFormat::MachO,
            // Weak occurrences still stamp the container.
            ..occurrence(true, true, false)
        };
        sym.update(&macho);
        assert!(sym.is_macho());
    }
}
