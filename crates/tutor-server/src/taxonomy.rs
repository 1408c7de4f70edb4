/// The fixed level/subject taxonomy.
///
/// Every supported (level, subject) pair maps to exactly one canonical folder name, used
/// for both the source documents and the persisted index of that subject. Pairs outside
/// the table are rejected; nothing is defaulted.
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::AppError;

/// `(level, [(subject, folder)])`
const TAXONOMY: &[(&str, &[(&str, &str)])] = &[
    (
        "psle",
        &[("science", "Science"), ("mathematics", "Mathematics")],
    ),
    (
        "ib",
        &[
            ("hl_mathematics", "HL_Mathematics"),
            ("sl_mathematics", "SL_Mathematics"),
            ("hl_biology", "HL_Biology"),
            ("sl_biology", "SL_Biology"),
            ("hl_physics", "HL_Physics"),
            ("sl_physics", "SL_Physics"),
            ("hl_chemistry", "HL_Chemistry"),
            ("sl_chemistry", "SL_Chemistry"),
        ],
    ),
    (
        "a_level",
        &[
            ("h2_mathematics", "H2_Mathematics"),
            ("h1_mathematics", "H1_Mathematics"),
            ("h2_biology", "H2_Biology"),
            ("h1_biology", "H1_Biology"),
            ("h2_physics", "H2_Physics"),
            ("h1_physics", "H1_Physics"),
            ("h2_chemistry", "H2_Chemistry"),
            ("h1_chemistry", "H1_Chemistry"),
        ],
    ),
    (
        "o_level",
        &[
            ("combined_physics", "Combined_Physics"),
            ("combined_chemistry", "Combined_Chemistry"),
            ("combined_biology", "Combined_Biology"),
            ("pure_physics", "Pure_Physics"),
            ("pure_chemistry", "Pure_Chemistry"),
            ("pure_biology", "Pure_Biology"),
            ("add_math", "Additional_Mathematics"),
            ("elem_math", "Elementary_Mathematics"),
        ],
    ),
];

/// A validated (level, subject) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubjectKey {
    pub level: &'static str,
    pub subject: &'static str,
    /// Canonical folder name, e.g. "Additional_Mathematics"
    pub folder: &'static str,
}

/// Filesystem locations derived from a [`SubjectKey`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectPaths {
    pub syllabus: PathBuf,
    pub notes_dir: PathBuf,
    pub index_dir: PathBuf,
}

impl SubjectKey {
    /// Resolve user input against the taxonomy. Matching is case-insensitive and ignores
    /// surrounding whitespace.
    pub fn resolve(level: &str, subject: &str) -> Result<Self, AppError> {
        let level_norm = level.trim().to_lowercase();
        let subject_norm = subject.trim().to_lowercase();

        TAXONOMY
            .iter()
            .find(|(l, _)| *l == level_norm)
            .and_then(|(l, subjects)| {
                subjects
                    .iter()
                    .find(|(s, _)| *s == subject_norm)
                    .map(|(s, folder)| SubjectKey {
                        level: *l,
                        subject: *s,
                        folder: *folder,
                    })
            })
            .ok_or(AppError::InvalidKey {
                level: level_norm,
                subject: subject_norm,
            })
    }

    /// Cache key, `"{level}:{subject}"`.
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.level, self.subject)
    }

    pub fn paths(&self, data_root: &Path, index_root: &Path) -> SubjectPaths {
        let base = data_root.join(self.level).join(self.folder);
        SubjectPaths {
            syllabus: base.join(format!("{} Syllabus.mmd", self.folder)),
            notes_dir: base.join("notes"),
            index_dir: index_root.join(self.level).join(self.folder),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LevelListing {
    pub level: &'static str,
    pub subjects: Vec<&'static str>,
}

/// All supported levels with their subjects, in table order.
pub fn taxonomy() -> Vec<LevelListing> {
    TAXONOMY
        .iter()
        .map(|(level, subjects)| LevelListing {
            level: *level,
            subjects: subjects.iter().map(|(s, _)| *s).collect(),
        })
        .collect()
}
