/// Source document loading.
///
/// A subject's sources are one syllabus file plus a directory of notes files. Only `.mmd`
/// notes are read; anything else in the notes directory is skipped.
use std::path::Path;

use tracing::{debug, info};

use crate::error::AppError;
use crate::model::{Document, SourceTag};

const NOTES_EXTENSION: &str = ".mmd";

/// Load the syllabus followed by every notes file, ordered by file name.
pub fn load_documents(syllabus: &Path, notes_dir: &Path) -> Result<Vec<Document>, AppError> {
    if !syllabus.is_file() {
        return Err(AppError::SourceNotFound(syllabus.to_path_buf()));
    }
    if !notes_dir.is_dir() {
        return Err(AppError::SourceNotFound(notes_dir.to_path_buf()));
    }

    let mut documents = vec![Document {
        source: SourceTag::Syllabus,
        text: std::fs::read_to_string(syllabus)?,
    }];

    let mut note_files = Vec::new();
    for entry in std::fs::read_dir(notes_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.ends_with(NOTES_EXTENSION) || !entry.path().is_file() {
            debug!(file = %name, "skipping non-notes file");
            continue;
        }
        note_files.push((name, entry.path()));
    }
    note_files.sort_by(|a, b| a.0.cmp(&b.0));

    for (name, path) in note_files {
        documents.push(Document {
            source: SourceTag::Notes(name),
            text: std::fs::read_to_string(path)?,
        });
    }

    info!(
        syllabus = %syllabus.display(),
        notes = documents.len() - 1,
        "loaded source documents"
    );
    Ok(documents)
}
