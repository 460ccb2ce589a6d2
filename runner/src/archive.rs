use std::io::Write;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use walkdir::WalkDir;

/// Gzips every regular file under the cell directory in place, deleting each original.
/// Best-effort: a file that can't be compressed is logged and left alone, and files that are
/// already .gz are skipped, so running this twice changes nothing.
pub fn archive_cell(dir: &Path) {
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("gz") {
            continue;
        }
        if let Err(err) = gzip_in_place(path) {
            warn!("Couldn't gzip {}: {}", path.display(), err);
        }
    }
}

fn gzip_in_place(path: &Path) -> anyhow::Result<()> {
    let contents = fs_err::read(path)?;
    let out = fs_err::File::create(format!("{}.gz", path.display()))?;
    let mut encoder = GzEncoder::new(out, Compression::default());
    encoder.write_all(&contents)?;
    encoder.finish()?;
    fs_err::remove_file(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::io::Read;

    use super::*;

    fn list_files(dir: &Path) -> BTreeSet<String> {
        WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                e.path()
                    .strip_prefix(dir)
                    .unwrap()
                    .display()
                    .to_string()
            })
            .collect()
    }

    #[test]
    fn archives_in_place_and_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("results");
        fs_err::create_dir_all(&sub).unwrap();
        fs_err::write(sub.join("outputSummary_x.xml"), "<summary/>").unwrap();

        archive_cell(dir.path());

        assert_eq!(
            list_files(dir.path()),
            vec!["results/outputSummary_x.xml.gz".to_string()]
                .into_iter()
                .collect()
        );

        let mut decoder = flate2::read::GzDecoder::new(
            fs_err::File::open(sub.join("outputSummary_x.xml.gz")).unwrap(),
        );
        let mut contents = String::new();
        decoder.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "<summary/>");
    }

    #[test]
    fn second_pass_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        fs_err::write(dir.path().join("a.xml"), "one").unwrap();
        fs_err::write(dir.path().join("b.txt"), "two").unwrap();

        archive_cell(dir.path());
        let after_first = list_files(dir.path());
        archive_cell(dir.path());
        let after_second = list_files(dir.path());

        assert_eq!(after_first, after_second);
        assert_eq!(after_first.len(), 2);
        assert!(after_first.iter().all(|name| name.ends_with(".gz")));
    }
}
