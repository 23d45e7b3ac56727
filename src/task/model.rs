#![forbid(unsafe_code)]

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SegtaskError};

pub const STATUS_FILE: &str = "status.txt";
pub const RESULT_FILE: &str = "mask.png";
pub const IMAGE_STEM: &str = "image";
pub const CLAIM_FILE: &str = ".claim";

/// Unique task identifier: a random UUID rendered in canonical hyphenated form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    #[must_use]
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for TaskId {
    type Err = SegtaskError;

    /// Only the canonical form is accepted, so an id always maps to exactly one
    /// directory name and can never smuggle path separators.
    fn from_str(s: &str) -> Result<Self> {
        let uuid = Uuid::try_parse(s).map_err(|_| SegtaskError::TaskNotFound(s.to_owned()))?;
        let id = Self(uuid);
        if id.to_string() != s {
            return Err(SegtaskError::TaskNotFound(s.to_owned()));
        }
        Ok(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    Queued,
    Processing,
    Done,
    Failed,
}

impl TaskState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Processing => "PROCESSING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// States only move forward; terminal states are final.
    #[must_use]
    pub fn can_advance_to(self, next: Self) -> bool {
        match self {
            Self::Queued => next != Self::Queued,
            Self::Processing => next.is_terminal(),
            Self::Done | Self::Failed => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = SegtaskError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "QUEUED" => Ok(Self::Queued),
            "PROCESSING" => Ok(Self::Processing),
            "DONE" => Ok(Self::Done),
            "FAILED" => Ok(Self::Failed),
            other => Err(SegtaskError::UnknownState(other.to_owned())),
        }
    }
}

/// Resolves the storage extension for an uploaded image's MIME type.
///
/// Parameters such as `; charset=...` are ignored and only `image/*` types are
/// accepted. When the registry lists several extensions the subtype itself is
/// preferred (`image/jpeg` -> `jpeg`), otherwise the first listed one.
pub fn extension_for_content_type(content_type: &str) -> Result<&'static str> {
    let unsupported = || SegtaskError::UnsupportedContentType(content_type.to_owned());

    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let Some((top, sub)) = essence.split_once('/') else {
        return Err(unsupported());
    };
    if top != "image" || sub.is_empty() || sub.contains('*') {
        return Err(unsupported());
    }

    let exts = mime_guess::get_mime_extensions_str(&essence).ok_or_else(unsupported)?;
    exts.iter()
        .copied()
        .find(|ext| *ext == sub)
        .or_else(|| exts.first().copied())
        .ok_or_else(unsupported)
}

/// Guesses an image MIME type from a file name, for callers that only have a path.
#[must_use]
pub fn content_type_for_path(path: &Path) -> Option<String> {
    mime_guess::from_path(path)
        .iter()
        .find(|m| m.type_() == mime_guess::mime::IMAGE)
        .map(|m| m.essence_str().to_owned())
}

/// Where each task's files live under the storage root.
#[derive(Debug, Clone)]
pub struct TaskLayout {
    root: PathBuf,
}

impl TaskLayout {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn task_dir(&self, id: &TaskId) -> PathBuf {
        self.root.join(id.to_string())
    }

    #[must_use]
    pub fn image_path(&self, id: &TaskId, ext: &str) -> PathBuf {
        self.task_dir(id).join(format!("{IMAGE_STEM}.{ext}"))
    }

    #[must_use]
    pub fn status_path(&self, id: &TaskId) -> PathBuf {
        self.task_dir(id).join(STATUS_FILE)
    }

    #[must_use]
    pub fn result_path(&self, id: &TaskId) -> PathBuf {
        self.task_dir(id).join(RESULT_FILE)
    }

    /// Marker held by the worker currently processing the task.
    #[must_use]
    pub fn claim_path(&self, id: &TaskId) -> PathBuf {
        self.task_dir(id).join(CLAIM_FILE)
    }

    /// Finds the uploaded image; the extension is not recorded anywhere else.
    pub async fn find_image(&self, id: &TaskId) -> Result<Option<PathBuf>> {
        let dir = self.task_dir(id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SegtaskError::TaskNotFound(id.to_string()));
            }
            Err(e) => return Err(SegtaskError::storage(&dir)(e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(SegtaskError::storage(&dir))?
        {
            let path = entry.path();
            if path.file_stem().and_then(|s| s.to_str()) == Some(IMAGE_STEM)
                && path.extension().is_some()
            {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_render_canonically_and_parse_back() {
        let id = TaskId::new_random();
        let s = id.to_string();
        assert_eq!(s.len(), 36);
        assert_eq!(s.parse::<TaskId>().unwrap(), id);
    }

    #[test]
    fn non_canonical_ids_are_unknown() {
        let id = TaskId::new_random();
        let upper = id.to_string().to_uppercase();
        let simple = id.as_uuid().simple().to_string();

        for bad in [upper.as_str(), simple.as_str(), "unknown-id", "../etc", ""] {
            assert!(
                matches!(bad.parse::<TaskId>(), Err(SegtaskError::TaskNotFound(_))),
                "{bad} should not parse"
            );
        }
    }

    #[test]
    fn states_parse_their_tokens() {
        for state in [
            TaskState::Queued,
            TaskState::Processing,
            TaskState::Done,
            TaskState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<TaskState>().unwrap(), state);
        }
        assert_eq!("DONE\n".parse::<TaskState>().unwrap(), TaskState::Done);
        assert!("done".parse::<TaskState>().is_err());
        assert!("".parse::<TaskState>().is_err());
    }

    #[test]
    fn states_only_move_forward() {
        use TaskState::*;

        assert!(Queued.can_advance_to(Processing));
        assert!(Queued.can_advance_to(Done));
        assert!(Queued.can_advance_to(Failed));
        assert!(Processing.can_advance_to(Done));
        assert!(Processing.can_advance_to(Failed));

        assert!(!Queued.can_advance_to(Queued));
        assert!(!Processing.can_advance_to(Queued));
        assert!(!Processing.can_advance_to(Processing));
        for terminal in [Done, Failed] {
            for next in [Queued, Processing, Done, Failed] {
                assert!(!terminal.can_advance_to(next));
            }
        }
    }

    #[test]
    fn maps_image_content_types_to_extensions() {
        assert_eq!(extension_for_content_type("image/png").unwrap(), "png");
        assert_eq!(extension_for_content_type("IMAGE/PNG").unwrap(), "png");
        assert_eq!(
            extension_for_content_type("image/png; charset=binary").unwrap(),
            "png"
        );
        assert_eq!(extension_for_content_type("image/jpeg").unwrap(), "jpeg");
        assert_eq!(extension_for_content_type("image/tiff").unwrap(), "tiff");
    }

    #[test]
    fn rejects_unmappable_content_types() {
        for ct in [
            "application/octet-stream",
            "text/plain",
            "image/x-definitely-not-registered",
            "image/",
            "image/*",
            "png",
            "",
        ] {
            assert!(
                matches!(
                    extension_for_content_type(ct),
                    Err(SegtaskError::UnsupportedContentType(_))
                ),
                "{ct} should be rejected"
            );
        }
    }

    #[test]
    fn guesses_content_type_from_file_name() {
        assert_eq!(
            content_type_for_path(Path::new("scan.png")).as_deref(),
            Some("image/png")
        );
        assert_eq!(content_type_for_path(Path::new("notes.txt")), None);
        assert_eq!(content_type_for_path(Path::new("noext")), None);
    }

    #[test]
    fn layout_places_files_under_task_dir() {
        let layout = TaskLayout::new(PathBuf::from("/data/tasks"));
        let id = TaskId::new_random();
        let dir = PathBuf::from("/data/tasks").join(id.to_string());

        assert_eq!(layout.task_dir(&id), dir);
        assert_eq!(layout.image_path(&id, "png"), dir.join("image.png"));
        assert_eq!(layout.status_path(&id), dir.join("status.txt"));
        assert_eq!(layout.result_path(&id), dir.join("mask.png"));
        assert_eq!(layout.claim_path(&id), dir.join(".claim"));
    }
}
