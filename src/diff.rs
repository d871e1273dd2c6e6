// src/diff.rs

use crate::model::*;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::debug;

/// Whether `path` carries the recognized source extension (without the dot)
pub fn is_source(path: &str, extension: &str) -> bool {
    Path::new(path).extension().map_or(false, |ext| ext == extension)
}

fn source_patches<'a>(diff: &'a [Patch], extension: &'a str) -> impl Iterator<Item = &'a Patch> {
    diff.iter().filter(move |patch| {
        if patch.binary {
            debug!(path = %patch.new_path, "skipping binary patch");
            return false;
        }
        is_source(&patch.new_path, extension)
    })
}

/// Splits every hunk line of the source patches into old-version and new-version line sets.
///
/// Old line numbers are filed under the old path, new line numbers under the new path,
/// so a rename lands each side under its own name.
pub fn modified_lines(diff: &[Patch], extension: &str) -> ModifiedLines {
    let mut lines = ModifiedLines::default();

    for patch in source_patches(diff, extension) {
        for hunk in &patch.hunks {
            for line in &hunk.lines {
                if let Some(old) = line.old_lineno {
                    lines.old.insert(&patch.old_path, old);
                }
                if let Some(new) = line.new_lineno {
                    lines.new.insert(&patch.new_path, new);
                }
            }
        }
    }

    lines
}

/// A commit is a bug-fix candidate when its diff touches both a known test file and
/// some other source file.
pub fn is_bugfix_candidate(diff: &[Patch], test_files: &BTreeSet<String>, extension: &str) -> bool {
    let mut touches_test = false;
    let mut touches_code = false;

    for patch in source_patches(diff, extension) {
        if test_files.contains(&patch.new_path) {
            debug!(path = %patch.new_path, "modifies test file");
            touches_test = true;
        } else {
            debug!(path = %patch.new_path, "modifies code file");
            touches_code = true;
        }
        if touches_test && touches_code {
            return true;
        }
    }

    false
}

/// Source files the diff adds; any of these forces test re-discovery
pub fn added_source_files<'a>(diff: &'a [Patch], extension: &'a str) -> Vec<&'a str> {
    source_patches(diff, extension)
        .filter(|patch| matches!(patch.status, PatchStatus::Added | PatchStatus::Copied))
        .map(|patch| patch.new_path.as_str())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch(old: &str, new: &str, status: PatchStatus, lines: Vec<DiffLine>) -> Patch {
        Patch {
            old_path: old.to_string(),
            new_path: new.to_string(),
            status,
            binary: false,
            hunks: vec![Hunk { lines }],
        }
    }

    fn tests(files: &[&str]) -> BTreeSet<String> {
        files.iter().map(|f| f.to_string()).collect()
    }

    #[test]
    fn added_lines_only_reach_new_and_deleted_only_old() {
        let diff = vec![patch(
            "foo.py",
            "foo.py",
            PatchStatus::Modified,
            vec![
                DiffLine::context(2, 2),
                DiffLine::deleted(3),
                DiffLine::added(3),
                DiffLine::added(4),
                DiffLine::context(4, 5),
            ],
        )];

        let lines = modified_lines(&diff, "py");
        assert_eq!(lines.old.lines("foo.py").unwrap(), &BTreeSet::from([2, 3, 4]));
        assert_eq!(lines.new.lines("foo.py").unwrap(), &BTreeSet::from([2, 3, 4, 5]));
    }

    #[test]
    fn every_recorded_line_comes_from_a_present_number() {
        let diff = vec![
            patch("a.py", "a.py", PatchStatus::Modified, vec![DiffLine::deleted(10), DiffLine::deleted(11)]),
            patch("b.py", "b.py", PatchStatus::Added, vec![DiffLine::added(1), DiffLine::added(2)]),
        ];

        let lines = modified_lines(&diff, "py");
        for (version, spec) in [(Version::Old, &lines.old), (Version::New, &lines.new)] {
            for (file, numbers) in spec.iter() {
                for n in numbers {
                    let found = diff.iter().any(|p| {
                        p.hunks.iter().flat_map(|h| &h.lines).any(|l| match version {
                            Version::Old => p.old_path == *file && l.old_lineno == Some(*n),
                            Version::New => p.new_path == *file && l.new_lineno == Some(*n),
                        })
                    });
                    assert!(found, "{file}:{n} not backed by a hunk line");
                }
            }
        }
        assert!(lines.old.lines("b.py").is_none());
        assert!(lines.new.lines("a.py").is_none());
    }

    #[test]
    fn renamed_file_keeps_each_side_under_its_own_path() {
        let diff = vec![patch(
            "old_name.py",
            "new_name.py",
            PatchStatus::Renamed,
            vec![DiffLine::deleted(1), DiffLine::added(1)],
        )];
        let lines = modified_lines(&diff, "py");
        assert!(lines.old.lines("old_name.py").is_some());
        assert!(lines.new.lines("new_name.py").is_some());
    }

    #[test]
    fn non_source_and_binary_patches_are_skipped() {
        let mut binary = patch("img.py", "img.py", PatchStatus::Modified, vec![DiffLine::added(1)]);
        binary.binary = true;
        let diff = vec![
            patch("README.md", "README.md", PatchStatus::Modified, vec![DiffLine::added(1)]),
            binary,
        ];
        let lines = modified_lines(&diff, "py");
        assert!(lines.old.is_empty());
        assert!(lines.new.is_empty());
    }

    #[test]
    fn candidate_needs_both_test_and_code() {
        let known = tests(&["tests/test_foo.py"]);
        let code = patch("foo.py", "foo.py", PatchStatus::Modified, vec![DiffLine::added(1)]);
        let test = patch(
            "tests/test_foo.py",
            "tests/test_foo.py",
            PatchStatus::Modified,
            vec![DiffLine::added(1)],
        );
        let docs = patch("NOTES.md", "NOTES.md", PatchStatus::Modified, vec![DiffLine::added(1)]);

        assert!(is_bugfix_candidate(&[code.clone(), test.clone()], &known, "py"));
        assert!(is_bugfix_candidate(&[docs.clone(), test.clone(), code.clone()], &known, "py"));
        assert!(!is_bugfix_candidate(&[test.clone()], &known, "py"));
        assert!(!is_bugfix_candidate(&[code.clone()], &known, "py"));
        assert!(!is_bugfix_candidate(&[docs, test], &known, "py"));
        assert!(!is_bugfix_candidate(&[], &known, "py"));
    }

    #[test]
    fn unknown_test_file_counts_as_code() {
        let code = patch("foo.py", "foo.py", PatchStatus::Modified, vec![DiffLine::added(1)]);
        let test = patch("test_foo.py", "test_foo.py", PatchStatus::Modified, vec![DiffLine::added(1)]);
        assert!(!is_bugfix_candidate(&[code, test], &BTreeSet::new(), "py"));
    }

    #[test]
    fn added_source_files_ignores_modifications() {
        let diff = vec![
            patch("new.py", "new.py", PatchStatus::Added, vec![DiffLine::added(1)]),
            patch("old.py", "old.py", PatchStatus::Modified, vec![DiffLine::added(1)]),
            patch("data.csv", "data.csv", PatchStatus::Added, vec![DiffLine::added(1)]),
        ];
        assert_eq!(added_source_files(&diff, "py"), vec!["new.py"]);
    }
}
