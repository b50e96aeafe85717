// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dynamic application loader: parses a position-independent ELF image,
//! places its code/data/bss, applies relocations, resolves external symbols
//! against a [`HostApiTable`], and publishes an entry point.
//!
//! Grounded on `original_source/components/system/src/app_loader.c`'s load
//! pipeline (header validation, section walk, hybrid code/data placement,
//! relocation pass, symbol resolution) and `app_loader.h`'s `loaded_app_t`,
//! adapted from a flash/PSRAM-aware microcontroller loader to a hosted one:
//! there is no flash to execute in place from here, so every segment is a
//! heap allocation and the "identity alias" case in the source (PSRAM I/D
//! cache mirrors of the same bytes) collapses to a single buffer.

pub mod host_api;
pub mod loader;

pub use host_api::{HostApiTable, HostApiTableBuilder, HostSymbol, SymbolKind};
pub use loader::{
    AppContext, AppEntryFn, AppExitFn, AppLoader, AppManifest, CodeMemory, HeapCodeMemory, LoadedImage, LoaderError,
    RelocationKind, MANIFEST_MAGIC,
};
