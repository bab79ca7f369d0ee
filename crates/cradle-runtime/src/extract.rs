use crate::RuntimeError;
use cradle_store::{CancelToken, Phase, ProgressEvent, ProgressSink};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;
use tracing::debug;

const REPORT_EVERY: usize = 200;

/// Unpacks a downloaded release archive.
pub trait Extractor: Send + Sync {
    /// Unpack `archive` into `dest`, which is created if missing.
    /// Returns the number of entries written.
    fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<usize, RuntimeError>;
}

/// Plain (uncompressed) tar archives.
#[derive(Default)]
pub struct TarExtractor;

impl Extractor for TarExtractor {
    fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<usize, RuntimeError> {
        fs::create_dir_all(dest)?;
        let file = File::open(archive)?;
        let mut ar = tar::Archive::new(BufReader::new(file));
        ar.set_preserve_permissions(true);
        ar.set_preserve_mtime(false);
        ar.set_unpack_xattrs(false);

        let mut count = 0usize;
        let entries = ar
            .entries()
            .map_err(|e| RuntimeError::Archive(format!("{}: {e}", archive.display())))?;
        for entry in entries {
            cancel.check()?;
            let mut entry = entry
                .map_err(|e| RuntimeError::Archive(format!("{}: {e}", archive.display())))?;
            // unpack_in refuses paths that would escape `dest`.
            let unpacked = entry
                .unpack_in(dest)
                .map_err(|e| RuntimeError::Archive(format!("{}: {e}", archive.display())))?;
            if !unpacked {
                return Err(RuntimeError::Archive(format!(
                    "{}: entry escapes the destination",
                    archive.display()
                )));
            }
            count += 1;
            if count % REPORT_EVERY == 0 {
                progress.emit(ProgressEvent::indeterminate(
                    Phase::Extract,
                    format!("{count} entries"),
                ));
            }
        }
        progress.emit(ProgressEvent::new(
            Phase::Extract,
            100,
            format!("{count} entries"),
        ));
        debug!("extracted {count} entries into {}", dest.display());
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cradle_store::NoProgress;

    fn build_tar(path: &Path, files: &[(&str, &str)]) {
        let mut builder = tar::Builder::new(File::create(path).unwrap());
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, content.as_bytes())
                .unwrap();
        }
        builder.finish().unwrap();
    }

    #[test]
    fn extracts_entries() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("release.tar");
        build_tar(
            &archive,
            &[
                ("ComfyUI/main.py", "print('hi')"),
                ("standalone-env/bin/python3", "elf"),
            ],
        );
        let dest = dir.path().join("out");
        let n = TarExtractor
            .extract(&archive, &dest, &NoProgress, &CancelToken::new())
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(
            fs::read_to_string(dest.join("ComfyUI/main.py")).unwrap(),
            "print('hi')"
        );
    }

    #[test]
    fn corrupt_archive_is_archive_error() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bad.tar");
        fs::write(&archive, vec![0x42u8; 1024]).unwrap();
        let err = TarExtractor
            .extract(&archive, &dir.path().join("out"), &NoProgress, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Archive(_)));
    }

    #[test]
    fn cancelled_extract_stops() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("release.tar");
        build_tar(&archive, &[("a.txt", "a")]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = TarExtractor
            .extract(&archive, &dir.path().join("out"), &NoProgress, &cancel)
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
