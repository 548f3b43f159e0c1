//! # dexopt
//!
//! The core of an Android bytecode optimizer: a DEX codec, an interned
//! program model, an editable per-method IR with its control flow graph,
//! and whole-program analyses over method overrides, escapes and side
//! effects.
//!
use crate::config::DexOptions;
use crate::dex::error::DexError;
use crate::dex::loader::{load_classes_from_dex, DexStats};
use crate::model::DexClass;
use std::path::Path;

#[macro_use]
pub mod dex;
pub mod analysis;
pub mod config;
pub mod ir;
pub mod model;
#[cfg(test)]
mod tests;

/// Recurses a base path, typically an unpacked APK, loading every `.dex` file found
///
/// # Examples
///
/// ```no_run
///  use dexopt::config::DexOptions;
///  use dexopt::dex::loader::DexStats;
///  use dexopt::find_dex_files;
///  use std::path::Path;
///
///  let mut stats = DexStats::default();
///  let classes = find_dex_files(Path::new("apk"), &mut stats, &DexOptions::default()).unwrap();
///  println!("{:} classes loaded from {} methods.", classes.len(), stats.num_methods);
/// ```
pub fn find_dex_files(dir: &Path, stats: &mut DexStats, options: &DexOptions) -> Result<Vec<DexClass>, DexError> {
    let mut results = vec![];

    let mut entries = dir.read_dir()?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for p in entries {
        // Directory: recurse sub-directory
        if p.file_type()?.is_dir() {
            results.extend(find_dex_files(&p.path(), stats, options)?);
        } else if p.path().extension().is_some_and(|e| e == "dex") {
            results.extend(load_classes_from_dex(&p.path(), stats, options)?);
        }
    }

    Ok(results)
}
