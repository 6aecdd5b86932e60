//! `SourceArchiver` (§1: "Out of scope: Archive creation format for source
//! bundles (the core consumes a `SourceArchiver` capability)"). The ingest
//! client invokes this once a `code_paths.lst` upload has been read and its
//! paths canonicalized into a set (§4.3 file-upload subphase); the archive
//! *format* is entirely up to the implementation.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{AdaptystError, Result};

pub trait SourceArchiver: Send + Sync {
    /// Writes an archive of `paths` to `dest` (conventionally
    /// `processed/src.zip`, though the extension is the implementation's
    /// choice).
    fn archive(&self, paths: &BTreeSet<PathBuf>, dest: &Path) -> Result<()>;
}

/// A minimal stand-in archiver: a length-prefixed concatenation of every
/// path's absolute name and raw bytes, with no compression. The real
/// archive format is out of scope (§1); this exists so the binary has a
/// working default instead of leaving the file-upload manifest subphase
/// dead code.
pub struct ConcatArchiver;

impl SourceArchiver for ConcatArchiver {
    fn archive(&self, paths: &BTreeSet<PathBuf>, dest: &Path) -> Result<()> {
        let file = File::create(dest)
            .map_err(|e| AdaptystError::Connection(format!("creating {}: {e}", dest.display())))?;
        let mut out = BufWriter::new(file);
        for path in paths {
            let mut contents = Vec::new();
            File::open(path)
                .and_then(|mut f| f.read_to_end(&mut contents))
                .map_err(|e| AdaptystError::Connection(format!("reading {}: {e}", path.display())))?;
            let name = path.to_string_lossy();
            write_entry(&mut out, name.as_bytes(), &contents)?;
        }
        Ok(())
    }
}

fn write_entry(out: &mut impl Write, name: &[u8], contents: &[u8]) -> Result<()> {
    out.write_all(&(name.len() as u64).to_le_bytes())
        .and_then(|_| out.write_all(name))
        .and_then(|_| out.write_all(&(contents.len() as u64).to_le_bytes()))
        .and_then(|_| out.write_all(contents))
        .map_err(|e| AdaptystError::Connection(format!("writing archive entry: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archives_known_files_into_one_concatenated_blob() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.c");
        std::fs::write(&source, b"int main() {}").unwrap();

        let dest = dir.path().join("src.zip");
        let mut paths = BTreeSet::new();
        paths.insert(source.clone());

        ConcatArchiver.archive(&paths, &dest).unwrap();

        let mut blob = Vec::new();
        File::open(&dest).unwrap().read_to_end(&mut blob).unwrap();
        assert!(!blob.is_empty());
        // Name length prefix, then the path bytes themselves, must appear.
        let name = source.to_string_lossy();
        let name_bytes = name.as_bytes();
        assert!(blob.windows(name_bytes.len()).any(|w| w == name_bytes));
    }
}
