use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Read;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use zip::ZipArchive;

use crate::error::ReconcileError;

/// Where CORD-19 JSON parses live: an unpacked directory or the zip archive.
pub enum DocumentSource {
    Directory(Utf8PathBuf),
    Archive {
        path: Utf8PathBuf,
        archive: ZipArchive<File>,
        names: HashMap<String, String>,
    },
}

impl std::fmt::Debug for DocumentSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentSource::Directory(root) => f.debug_tuple("Directory").field(root).finish(),
            DocumentSource::Archive { path, names, .. } => f
                .debug_struct("Archive")
                .field("path", path)
                .field("entries", &names.len())
                .finish(),
        }
    }
}

impl DocumentSource {
    pub fn open(path: &Utf8Path) -> Result<Self, ReconcileError> {
        let std_path = path.as_std_path();
        if !std_path.exists() {
            return Err(ReconcileError::MissingInput(std_path.to_path_buf()));
        }
        if std_path.is_dir() {
            return Ok(DocumentSource::Directory(path.to_path_buf()));
        }
        let file = File::open(std_path)
            .map_err(|err| ReconcileError::DocumentRead(format!("open {path}: {err}")))?;
        let archive = ZipArchive::new(file)
            .map_err(|err| ReconcileError::DocumentRead(format!("{path}: {err}")))?;
        let names = entry_names(&archive);
        Ok(DocumentSource::Archive {
            path: path.to_path_buf(),
            archive,
            names,
        })
    }

    /// Raw JSON of the document at `relative`, as listed in the metadata.
    pub fn read_json(&mut self, relative: &str) -> Result<String, ReconcileError> {
        let relative = Utf8Path::new(relative.trim());
        if relative
            .components()
            .any(|part| !matches!(part, Utf8Component::Normal(_)))
        {
            return Err(ReconcileError::DocumentRead(format!(
                "{relative}: path must stay inside the document source"
            )));
        }

        match self {
            DocumentSource::Directory(root) => {
                let path = root.join(relative);
                fs::read_to_string(path.as_std_path())
                    .map_err(|err| ReconcileError::DocumentRead(format!("{path}: {err}")))
            }
            DocumentSource::Archive {
                path,
                archive,
                names,
            } => {
                let name = names.get(relative.as_str()).ok_or_else(|| {
                    ReconcileError::DocumentRead(format!("{relative} not found in {path}"))
                })?;
                let mut entry = archive
                    .by_name(name)
                    .map_err(|err| ReconcileError::DocumentRead(format!("{name}: {err}")))?;
                let mut buffer = String::new();
                entry
                    .read_to_string(&mut buffer)
                    .map_err(|err| ReconcileError::DocumentRead(format!("{name}: {err}")))?;
                Ok(buffer)
            }
        }
    }

    pub fn read_text(&mut self, relative: &str) -> Result<String, ReconcileError> {
        let json = self.read_json(relative)?;
        text_from_json(&json).map_err(|err| match err {
            ReconcileError::DocumentRead(message) => {
                ReconcileError::DocumentRead(format!("{relative}: {message}"))
            }
            other => other,
        })
    }
}

/// Maps every path suffix of every entry to the entry name. Archives often
/// wrap everything in one top-level directory; exact names win over suffixes.
fn entry_names(archive: &ZipArchive<File>) -> HashMap<String, String> {
    let mut names = archive
        .file_names()
        .map(|name| (name.to_string(), name.to_string()))
        .collect::<HashMap<_, _>>();
    for name in archive.file_names() {
        for (at, _) in name.match_indices('/') {
            let suffix = &name[at + 1..];
            if !suffix.is_empty() {
                names
                    .entry(suffix.to_string())
                    .or_insert_with(|| name.to_string());
            }
        }
    }
    names
}

#[derive(Debug, Deserialize)]
struct DocumentParse {
    #[serde(default)]
    metadata: DocumentMetadata,
    #[serde(default, rename = "abstract")]
    abstract_paragraphs: Vec<Paragraph>,
    #[serde(default)]
    body_text: Vec<Paragraph>,
    #[serde(default)]
    ref_entries: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct DocumentMetadata {
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct Paragraph {
    #[serde(default)]
    text: String,
}

/// Title, `.`, newline, then abstract, body and caption paragraphs, one per
/// line, in document order.
pub fn text_from_json(json: &str) -> Result<String, ReconcileError> {
    let doc: DocumentParse =
        serde_json::from_str(json).map_err(|err| ReconcileError::DocumentRead(err.to_string()))?;

    let mut text = String::new();
    text.push_str(&doc.metadata.title);
    text.push_str(".\n");
    for paragraph in doc.abstract_paragraphs.iter().chain(&doc.body_text) {
        text.push_str(&paragraph.text);
        text.push('\n');
    }
    for entry in doc.ref_entries.values() {
        if let Some(caption) = entry.get("text").and_then(|value| value.as_str()) {
            text.push_str(caption);
            text.push('\n');
        }
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;
    use zip::write::SimpleFileOptions;

    use super::*;

    const DOC: &str = r#"{
        "paper_id": "abc",
        "metadata": {"title": "A title", "authors": []},
        "abstract": [{"text": "Abstract one."}],
        "body_text": [{"text": "Body one."}, {"text": "Body two."}],
        "ref_entries": {"FIGREF0": {"text": "Figure caption", "type": "figure"}}
    }"#;

    #[test]
    fn text_follows_document_order() {
        let text = text_from_json(DOC).unwrap();
        assert_eq!(
            text,
            "A title.\nAbstract one.\nBody one.\nBody two.\nFigure caption\n"
        );
    }

    #[test]
    fn directory_source_reads_relative_paths() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        fs::create_dir_all(root.join("pdf_json").as_std_path()).unwrap();
        fs::write(root.join("pdf_json/abc.json").as_std_path(), DOC).unwrap();

        let mut source = DocumentSource::open(&root).unwrap();
        assert!(source.read_text("pdf_json/abc.json").unwrap().starts_with("A title."));
        assert_matches!(
            source.read_text("../escape.json"),
            Err(ReconcileError::DocumentRead(_))
        );
        assert_matches!(
            source.read_text("pdf_json/missing.json"),
            Err(ReconcileError::DocumentRead(_))
        );
    }

    #[test]
    fn archive_source_finds_nested_entries() {
        let temp = tempfile::tempdir().unwrap();
        let zip_path = temp.path().join("parses.zip");
        let file = File::create(&zip_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file("2020-04-10/pdf_json/abc.json", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(DOC.as_bytes()).unwrap();
        writer
            .start_file("pmc_json/abc.json", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(DOC.replace("A title", "PMC title").as_bytes()).unwrap();
        writer
            .start_file("2020-04-10/pmc_json/abc.json", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(DOC.as_bytes()).unwrap();
        writer.finish().unwrap();

        let zip_path = Utf8PathBuf::from_path_buf(zip_path).unwrap();
        let mut source = DocumentSource::open(&zip_path).unwrap();
        assert!(source.read_text("pdf_json/abc.json").unwrap().contains("Body two."));
        assert!(
            source
                .read_text("2020-04-10/pdf_json/abc.json")
                .unwrap()
                .starts_with("A title.")
        );
        assert!(
            source
                .read_text("pmc_json/abc.json")
                .unwrap()
                .starts_with("PMC title.")
        );
        assert_matches!(
            source.read_text("pdf_json/missing.json"),
            Err(ReconcileError::DocumentRead(_))
        );
    }
}
