// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The host API table: the single append-only, versioned record of
//! function bindings exported to dynamically loaded images.
//!
//! Grounded on `original_source/.../app_symbol_table.h` (`symbol_entry_t`,
//! a flat name/address/kind triple) and `app_loader.h`'s `system_api_table_t`
//! (a versioned struct of function pointers handed to every loaded app).
//! Here the table is a name-indexed map rather than a fixed struct of
//! fields, so host programs can extend it without this crate changing —
//! the append-only contract (`spec.md` §4.11: "new entries are appended;
//! existing entries never change meaning") is enforced by
//! [`HostApiTableBuilder`] refusing to redefine a name, not by field order.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Data,
}

#[derive(Debug, Clone, Copy)]
pub struct HostSymbol {
    pub address: usize,
    pub kind: SymbolKind,
}

/// Constructed once at host bring-up and never modified thereafter
/// (`spec.md` §4.11). Cloning is cheap relative to rebuilding; the table is
/// typically wrapped in an `Arc` by the embedding program.
#[derive(Debug, Clone)]
pub struct HostApiTable {
    version: u32,
    symbols: HashMap<String, HostSymbol>,
}

impl HostApiTable {
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn lookup(&self, name: &str) -> Option<HostSymbol> {
        self.symbols.get(name).copied()
    }

    /// All bindings, for introspection (`spec.md` §B.6 — exported symbol
    /// listing, useful for diagnostics and for the loader's "resolved
    /// against" reporting).
    pub fn exported_symbols(&self) -> Vec<(&str, HostSymbol)> {
        self.symbols.iter().map(|(name, sym)| (name.as_str(), *sym)).collect()
    }
}

/// Builds a [`HostApiTable`]. The host program registers the bindings
/// listed in `spec.md` §4.10 (service lifecycle, event bus, allocation,
/// logging, time) in whatever order is convenient; `build()` stamps the
/// version supplied at construction.
pub struct HostApiTableBuilder {
    version: u32,
    symbols: HashMap<String, HostSymbol>,
}

impl HostApiTableBuilder {
    pub fn new(version: u32) -> Self {
        Self { version, symbols: HashMap::new() }
    }

    /// Registers a function binding. `address` is the exported function's
    /// address, typically obtained as `f as usize` for an `extern "C" fn`.
    pub fn function(mut self, name: &str, address: usize) -> Self {
        self.insert(name, HostSymbol { address, kind: SymbolKind::Function });
        self
    }

    pub fn data(mut self, name: &str, address: usize) -> Self {
        self.insert(name, HostSymbol { address, kind: SymbolKind::Data });
        self
    }

    fn insert(&mut self, name: &str, symbol: HostSymbol) {
        if self.symbols.insert(name.to_string(), symbol).is_some() {
            log::warn!("host API table: \"{name}\" redefined (append-only contract violated)");
        }
    }

    pub fn build(self) -> HostApiTable {
        HostApiTable { version: self.version, symbols: self.symbols }
    }
}
