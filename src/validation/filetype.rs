//! Structural checks of staged files by type
//!
//! The type comes from the file extension. Only the start of a CSV file is parsed;
//! XML documents and zip containers are read to the end.

use std::fs::File;
use std::io::{BufRead, BufReader, Cursor, Read, Seek};
use std::path::Path;

use quick_xml::events::Event;

/// CSV records parsed before a file is accepted
const CSV_SAMPLE_RECORDS: usize = 1000;

/// Kinds of file with a structural check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    /// Comma-separated values
    Csv,
    /// XML document (also XBRL instances and XSD schemas)
    Xml,
    /// Excel workbook (an OOXML zip package)
    Xlsx,
    /// Zip archive; known member types are checked too
    Zip,
}

impl FileType {
    /// Type of a file by its extension, if it has a check
    pub fn from_name(name: &str) -> Option<Self> {
        let (_, ext) = name.rsplit_once('.')?;
        match ext.to_ascii_lowercase().as_str() {
            "csv" => Some(FileType::Csv),
            "xml" | "xbrl" | "xsd" => Some(FileType::Xml),
            "xlsx" => Some(FileType::Xlsx),
            "zip" => Some(FileType::Zip),
            _ => None,
        }
    }

    fn needs_seek(self) -> bool {
        matches!(self, FileType::Xlsx | FileType::Zip)
    }
}

/// Check the file at `path` against the structure its name implies
///
/// Files of unknown type pass.
pub fn validate_file(name: &str, path: &Path) -> Result<(), String> {
    let Some(kind) = FileType::from_name(name) else {
        return Ok(());
    };
    let file = File::open(path).map_err(|e| format!("cannot open: {e}"))?;
    validate_seekable(kind, BufReader::new(file))
}

fn validate_seekable<R: Read + Seek>(kind: FileType, reader: R) -> Result<(), String> {
    match kind {
        FileType::Csv => validate_csv(reader),
        FileType::Xml => validate_xml(BufReader::new(reader)),
        FileType::Xlsx => validate_xlsx(reader),
        FileType::Zip => validate_zip_members(reader),
    }
}

fn validate_csv<R: Read>(reader: R) -> Result<(), String> {
    let mut csv = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(false)
        .from_reader(reader);
    let mut record = csv::ByteRecord::new();

    let mut rows = 0usize;
    while rows < CSV_SAMPLE_RECORDS {
        match csv.read_byte_record(&mut record) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => return Err(format!("malformed csv: {e}")),
        }
        if rows == 0 && record.len() < 2 {
            return Err("header has a single column; delimiter is not a comma".into());
        }
        rows += 1;
    }

    if rows == 0 {
        return Err("no header row".into());
    }
    Ok(())
}

fn validate_xml<R: BufRead>(reader: R) -> Result<(), String> {
    let mut xml = quick_xml::Reader::from_reader(reader);
    xml.check_end_names(true);
    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut roots = 0usize;

    loop {
        let event = xml
            .read_event_into(&mut buf)
            .map_err(|e| format!("malformed xml at byte {}: {e}", xml.buffer_position()))?;
        match event {
            Event::Start(_) => {
                if depth == 0 {
                    roots += 1;
                }
                depth += 1;
            }
            Event::End(_) => depth = depth.saturating_sub(1),
            Event::Empty(_) if depth == 0 => roots += 1,
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    match (roots, depth) {
        (0, _) => Err("no root element".into()),
        (_, 0) if roots == 1 => Ok(()),
        (_, 0) => Err(format!("{roots} root elements")),
        (_, open) => Err(format!("{open} element(s) left open at end of document")),
    }
}

fn validate_xlsx<R: Read + Seek>(reader: R) -> Result<(), String> {
    let archive = zip::ZipArchive::new(reader).map_err(|e| format!("not a zip package: {e}"))?;
    if archive.file_names().any(|n| n == "[Content_Types].xml") {
        Ok(())
    } else {
        Err("zip package has no [Content_Types].xml".into())
    }
}

fn validate_zip_members<R: Read + Seek>(reader: R) -> Result<(), String> {
    let mut archive = zip::ZipArchive::new(reader).map_err(|e| format!("not a zip: {e}"))?;
    let mut broken = Vec::new();

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| format!("entry {index}: {e}"))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let Some(kind) = FileType::from_name(&name) else {
            continue;
        };
        let outcome = if kind.needs_seek() {
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut bytes)
                .map_err(|e| format!("entry {name}: {e}"))
                .and_then(|_| validate_seekable(kind, Cursor::new(bytes)))
        } else if kind == FileType::Csv {
            validate_csv(&mut entry)
        } else {
            validate_xml(BufReader::new(&mut entry))
        };
        if let Err(reason) = outcome {
            broken.push(format!("{name}: {reason}"));
        }
    }

    if broken.is_empty() {
        Ok(())
    } else {
        Err(broken.join("; "))
    }
}

/// Names of the file entries of the zip archive at `path`
pub fn zip_entry_names(path: &Path) -> Result<Vec<String>, String> {
    let file = File::open(path).map_err(|e| format!("cannot open: {e}"))?;
    let archive =
        zip::ZipArchive::new(BufReader::new(file)).map_err(|e| format!("not a zip: {e}"))?;
    Ok(archive
        .file_names()
        .filter(|n| !n.ends_with('/'))
        .map(str::to_string)
        .collect())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::FileOptions;

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in entries {
            writer.start_file(*name, FileOptions::default()).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn write(dir: &TempDir, name: &str, content: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn type_follows_extension() {
        assert_eq!(FileType::from_name("ds-year=2020.CSV"), Some(FileType::Csv));
        assert_eq!(FileType::from_name("filing.xbrl"), Some(FileType::Xml));
        assert_eq!(FileType::from_name("book.xlsx"), Some(FileType::Xlsx));
        assert_eq!(FileType::from_name("bundle.zip"), Some(FileType::Zip));
        assert_eq!(FileType::from_name("data.parquet"), None);
        assert_eq!(FileType::from_name("README"), None);
    }

    #[test]
    fn comma_separated_csv_passes() {
        assert!(validate_csv(&b"year,value\n2020,1\n2021,2\n"[..]).is_ok());
    }

    #[test]
    fn csv_with_ragged_rows_or_one_column_fails() {
        let ragged = validate_csv(&b"year,value\n2020,1,extra\n"[..]).unwrap_err();
        assert!(ragged.contains("malformed csv"), "{ragged}");

        let semicolons = validate_csv(&b"year;value\n2020;1\n"[..]).unwrap_err();
        assert!(semicolons.contains("single column"), "{semicolons}");

        assert!(validate_csv(&b""[..]).is_err());
    }

    #[test]
    fn well_formed_xml_passes() {
        let doc = br#"<?xml version="1.0"?><root><row year="2020">1</row><empty/></root>"#;
        assert!(validate_xml(&doc[..]).is_ok());
    }

    #[test]
    fn mismatched_or_truncated_xml_fails() {
        assert!(validate_xml(&b"<root><a></b></root>"[..]).is_err());

        let truncated = validate_xml(&b"<root><a>text</a>"[..]).unwrap_err();
        assert!(truncated.contains("left open"), "{truncated}");

        assert!(validate_xml(&b"just text"[..]).is_err());
    }

    #[test]
    fn xlsx_needs_a_content_types_part() {
        let workbook = zip_bytes(&[("[Content_Types].xml", b"<Types/>")]);
        assert!(validate_xlsx(Cursor::new(workbook)).is_ok());

        let bare = zip_bytes(&[("sheet.xml", b"<sheet/>")]);
        assert!(validate_xlsx(Cursor::new(bare)).is_err());

        assert!(validate_xlsx(Cursor::new(b"PK not really".to_vec())).is_err());
    }

    #[test]
    fn zip_members_are_checked_by_type() {
        let dir = TempDir::new().unwrap();
        let good = write(
            &dir,
            "good.zip",
            &zip_bytes(&[("a.csv", b"x,y\n1,2\n"), ("notes.txt", b"anything")]),
        );
        assert!(validate_file("good.zip", &good).is_ok());

        let bad = write(
            &dir,
            "bad.zip",
            &zip_bytes(&[("a.csv", b"x,y\n1,2\n"), ("b.xml", b"<root>")]),
        );
        let reason = validate_file("bad.zip", &bad).unwrap_err();
        assert!(reason.starts_with("b.xml:"), "{reason}");
    }

    #[test]
    fn nested_archives_are_opened() {
        let inner = zip_bytes(&[("c.csv", b"only-one-column\n")]);
        let dir = TempDir::new().unwrap();
        let outer = write(&dir, "outer.zip", &zip_bytes(&[("inner.zip", &inner)]));

        let reason = validate_file("outer.zip", &outer).unwrap_err();
        assert!(reason.contains("inner.zip: c.csv"), "{reason}");
    }

    #[test]
    fn unknown_types_pass_without_being_read() {
        let path = Path::new("/nonexistent/data.parquet");
        assert!(validate_file("data.parquet", path).is_ok());
    }

    #[test]
    fn entry_names_skip_directories() {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer.add_directory("sub/", FileOptions::default()).unwrap();
        writer.start_file("sub/a.csv", FileOptions::default()).unwrap();
        writer.write_all(b"x,y\n").unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a.zip", &bytes);
        assert_eq!(zip_entry_names(&path).unwrap(), vec!["sub/a.csv"]);
    }
}
