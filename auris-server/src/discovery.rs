//! Audio file discovery
//!
//! Used by the batch CLI to resolve a directory into the stable, sorted
//! file list a job is built from. Discovery order is the processing order.

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Extensions the pipeline accepts as input
pub const SUPPORTED_EXTENSIONS: &[&str] = &["wav", "mp3", "m4a", "flac", "ogg", "aac", "mp4"];

/// Names that mark a file as an intermediate or a previous run's output
const SKIP_STEM_MARKERS: &[&str] = &["_enhanced", "_hq", "temp"];
const SKIP_DIRS: &[&str] = &["tmp", "enhanced-audios"];

/// Find supported audio files under `input_dir`, sorted by path.
///
/// Skips files that look like previous outputs or scratch data so reruns
/// over the same tree don't re-enhance enhanced audio.
pub fn find_audio_files(input_dir: &Path, recursive: bool) -> Vec<PathBuf> {
    let max_depth = if recursive { usize::MAX } else { 1 };

    let mut files: Vec<PathBuf> = WalkDir::new(input_dir)
        .max_depth(max_depth)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|path| is_supported(path) && !is_excluded(path))
        .collect();

    files.sort();
    files
}

fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .is_some_and(|e| SUPPORTED_EXTENSIONS.contains(&e.as_str()))
}

fn is_excluded(path: &Path) -> bool {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    if SKIP_STEM_MARKERS.iter().any(|m| stem.contains(m)) {
        return true;
    }

    path.parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .is_some_and(|dir| SKIP_DIRS.contains(&dir))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(path, b"x").expect("write");
    }

    #[test]
    fn finds_supported_files_sorted() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(&dir.path().join("b.mp3"));
        touch(&dir.path().join("a.wav"));
        touch(&dir.path().join("notes.txt"));

        let files = find_audio_files(dir.path(), false);
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a.wav", "b.mp3"]);
    }

    #[test]
    fn recursion_is_opt_in() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(&dir.path().join("top.mp3"));
        touch(&dir.path().join("nested/deep.mp3"));

        assert_eq!(find_audio_files(dir.path(), false).len(), 1);
        assert_eq!(find_audio_files(dir.path(), true).len(), 2);
    }

    #[test]
    fn previous_outputs_and_scratch_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(&dir.path().join("take.mp3"));
        touch(&dir.path().join("take_enhanced.mp3"));
        touch(&dir.path().join("take_hq.mp3"));
        touch(&dir.path().join("tmp/scratch.wav"));
        touch(&dir.path().join("enhanced-audios/old.mp3"));

        let files = find_audio_files(dir.path(), true);
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("take.mp3"));
    }
}
