//! Home-tree traversal and file predicates

use std::collections::BTreeSet;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local, NaiveDate};
use log::debug;
use walkdir::{DirEntry, WalkDir};

use crate::command::{Command, CommandError, Verb};
use crate::error::{Error, Result};
use crate::protocol::MAX_FIND_DEPTH;

/// Predicate a file must satisfy to be collected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchCriterion {
    NameEquals(String),
    SizeBetween { min: u64, max: u64 },
    DateBetween { from: NaiveDate, to: NaiveDate },
    ExtensionIn(BTreeSet<String>),
    NameSetIn(Vec<String>),
}

impl MatchCriterion {
    /// Build the criterion for a parsed command; `quit` has none
    pub fn from_command(cmd: &Command) -> std::result::Result<Option<Self>, CommandError> {
        let criterion = match cmd.verb {
            Verb::FindFile => MatchCriterion::NameEquals(cmd.args[0].clone()),
            Verb::SearchBySize => {
                let (min, max) = cmd.size_range()?;
                MatchCriterion::SizeBetween { min, max }
            }
            Verb::SearchByDate => {
                let (from, to) = cmd.date_range()?;
                MatchCriterion::DateBetween { from, to }
            }
            Verb::SearchByExtension => MatchCriterion::ExtensionIn(cmd.extensions()?),
            Verb::SearchByName => MatchCriterion::NameSetIn(cmd.args.clone()),
            Verb::Quit => return Ok(None),
        };
        Ok(Some(criterion))
    }

    /// Check a single regular file against a per-file predicate
    fn matches_file(&self, path: &Path, metadata: &Metadata) -> bool {
        match self {
            MatchCriterion::NameEquals(name) => base_name(path) == Some(name.as_str()),
            MatchCriterion::SizeBetween { min, max } => {
                let size = metadata.len();
                *min <= size && size <= *max
            }
            MatchCriterion::DateBetween { from, to } => match metadata.modified() {
                Ok(mtime) => {
                    let day = local_date(mtime);
                    *from <= day && day <= *to
                }
                Err(_) => false,
            },
            // Suffix match on the base name, so `.bashrc` carries extension `bashrc`
            MatchCriterion::ExtensionIn(exts) => base_name(path).is_some_and(|name| {
                exts.iter().any(|ext| {
                    name.len() > ext.len()
                        && name.ends_with(ext.as_str())
                        && name.as_bytes()[name.len() - ext.len() - 1] == b'.'
                })
            }),
            MatchCriterion::NameSetIn(names) => {
                base_name(path).is_some_and(|n| names.iter().any(|want| want == n))
            }
        }
    }
}

/// Matched absolute paths, plus which requested names were located (name-set search only)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchResult {
    pub paths: Vec<PathBuf>,
    pub found: Vec<bool>,
}

impl MatchResult {
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Details reported for a `findfile` hit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundFile {
    pub path: PathBuf,
    pub size: u64,
    pub changed: DateTime<Local>,
}

impl FoundFile {
    /// Reply text sent to the client
    pub fn render(&self) -> String {
        format!(
            "File found: {}\nSize: {} bytes\nDate created: {}\n",
            self.path.display(),
            self.size,
            self.changed.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

fn base_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

fn local_date(t: SystemTime) -> NaiveDate {
    DateTime::<Local>::from(t).date_naive()
}

/// Inode change time where the platform has one, else modification time
#[cfg(unix)]
fn change_time(metadata: &Metadata) -> DateTime<Local> {
    use chrono::TimeZone;
    use std::os::unix::fs::MetadataExt;
    Local
        .timestamp_opt(metadata.ctime(), metadata.ctime_nsec() as u32)
        .single()
        .unwrap_or_else(|| DateTime::<Local>::from(SystemTime::UNIX_EPOCH))
}

#[cfg(not(unix))]
fn change_time(metadata: &Metadata) -> DateTime<Local> {
    let t = metadata
        .created()
        .or_else(|_| metadata.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH);
    DateTime::<Local>::from(t)
}

/// Fail early when the home root itself cannot be listed
fn check_root(home: &Path) -> Result<()> {
    std::fs::read_dir(home)
        .map(|_| ())
        .map_err(|source| Error::FilesystemAccess {
            path: home.to_path_buf(),
            source,
        })
}

/// Deterministic walk over regular files below `home`
fn regular_files(home: &Path, max_depth: Option<usize>) -> impl Iterator<Item = DirEntry> {
    let mut walker = WalkDir::new(home).follow_links(false).sort_by_file_name();
    if let Some(depth) = max_depth {
        walker = walker.max_depth(depth);
    }
    walker
        .into_iter()
        .filter_map(|e| match e {
            Ok(entry) => Some(entry),
            Err(err) => {
                debug!("skipping unreadable entry: {}", err);
                None
            }
        })
        .filter(|e| e.file_type().is_file())
}

/// Locate the first regular file named `name`, stopping the walk on the hit
pub fn find_first(home: &Path, name: &str) -> Result<Option<FoundFile>> {
    check_root(home)?;
    let criterion = MatchCriterion::NameEquals(name.to_string());
    let hit = regular_files(home, Some(MAX_FIND_DEPTH)).find_map(|entry| {
        let metadata = entry.metadata().ok()?;
        if !criterion.matches_file(entry.path(), &metadata) {
            return None;
        }
        Some(FoundFile {
            path: entry.into_path(),
            size: metadata.len(),
            changed: change_time(&metadata),
        })
    });
    Ok(hit)
}

/// Visit the whole tree, keeping the first file found for each requested name
pub fn search_names(home: &Path, names: &[String]) -> Result<MatchResult> {
    check_root(home)?;
    let mut slots: Vec<Option<PathBuf>> = vec![None; names.len()];
    for entry in regular_files(home, None) {
        let Some(file_name) = base_name(entry.path()) else {
            continue;
        };
        for (i, want) in names.iter().enumerate() {
            if slots[i].is_none() && want == file_name {
                slots[i] = Some(entry.path().to_path_buf());
            }
        }
    }

    let found = slots.iter().map(Option::is_some).collect();
    let mut paths: Vec<PathBuf> = Vec::new();
    for path in slots.into_iter().flatten() {
        // Repeated names in the request point at the same file
        if !paths.contains(&path) {
            paths.push(path);
        }
    }
    Ok(MatchResult { paths, found })
}

/// Collect every regular file satisfying a per-file criterion
pub fn collect(home: &Path, criterion: &MatchCriterion) -> Result<MatchResult> {
    check_root(home)?;
    let mut paths = Vec::new();
    for entry in regular_files(home, None) {
        match entry.metadata() {
            Ok(metadata) => {
                if criterion.matches_file(entry.path(), &metadata) {
                    paths.push(entry.into_path());
                }
            }
            Err(err) => debug!("skipping {}: {}", entry.path().display(), err),
        }
    }
    Ok(MatchResult {
        paths,
        found: Vec::new(),
    })
}

/// Run any criterion against the home tree
pub fn run(home: &Path, criterion: &MatchCriterion) -> Result<MatchResult> {
    match criterion {
        MatchCriterion::NameSetIn(names) => search_names(home, names),
        MatchCriterion::NameEquals(name) => {
            let hit = find_first(home, name)?;
            Ok(MatchResult {
                found: vec![hit.is_some()],
                paths: hit.map(|f| f.path).into_iter().collect(),
            })
        }
        other => collect(home, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, size: usize) -> PathBuf {
        let p = root.join(rel);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(&p, vec![b'x'; size]).unwrap();
        p
    }

    fn tree() -> TempDir {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.txt", 10);
        write(tmp.path(), "b.txt", 1000);
        write(tmp.path(), "docs/report.md", 50);
        write(tmp.path(), "docs/deep/a.txt", 5);
        write(tmp.path(), "src/main.rs", 120);
        write(tmp.path(), "archive.tar.gz", 300);
        tmp
    }

    #[test]
    fn size_filter_only_returns_in_range_files() {
        let tmp = tree();
        let res = collect(tmp.path(), &MatchCriterion::SizeBetween { min: 5, max: 100 }).unwrap();
        for p in &res.paths {
            let size = fs::metadata(p).unwrap().len();
            assert!((5..=100).contains(&size), "{} has size {}", p.display(), size);
        }
        // Every in-range file is present
        for entry in WalkDir::new(tmp.path()).into_iter().flatten() {
            if entry.file_type().is_file() {
                let size = entry.metadata().unwrap().len();
                assert_eq!(res.paths.contains(&entry.path().to_path_buf()), (5..=100).contains(&size));
            }
        }
    }

    #[test]
    fn size_scenario_a() {
        let tmp = TempDir::new().unwrap();
        let a = write(tmp.path(), "a.txt", 10);
        write(tmp.path(), "b.txt", 1000);
        let res = collect(tmp.path(), &MatchCriterion::SizeBetween { min: 5, max: 100 }).unwrap();
        assert_eq!(res.paths, vec![a]);
    }

    #[test]
    fn size_bounds_are_inclusive() {
        let tmp = TempDir::new().unwrap();
        let lo = write(tmp.path(), "lo", 5);
        let hi = write(tmp.path(), "hi", 100);
        write(tmp.path(), "over", 101);
        let res = collect(tmp.path(), &MatchCriterion::SizeBetween { min: 5, max: 100 }).unwrap();
        assert_eq!(res.paths, vec![hi, lo]);
    }

    #[test]
    fn extension_filter() {
        let tmp = tree();
        let exts: BTreeSet<String> = ["rs", "md"].iter().map(|s| s.to_string()).collect();
        let res = collect(tmp.path(), &MatchCriterion::ExtensionIn(exts)).unwrap();
        let names: Vec<_> = res
            .paths
            .iter()
            .map(|p| p.strip_prefix(tmp.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(names, vec![PathBuf::from("docs/report.md"), PathBuf::from("src/main.rs")]);

        // Only the last extension counts
        let gz: BTreeSet<String> = ["gz".to_string()].into();
        let res = collect(tmp.path(), &MatchCriterion::ExtensionIn(gz)).unwrap();
        assert_eq!(res.paths.len(), 1);
        let tar: BTreeSet<String> = ["tar".to_string()].into();
        assert!(collect(tmp.path(), &MatchCriterion::ExtensionIn(tar)).unwrap().is_empty());
    }

    #[test]
    fn extension_filter_matches_dotfiles() {
        let tmp = TempDir::new().unwrap();
        let rc = write(tmp.path(), ".bashrc", 3);
        write(tmp.path(), "bashrc", 3);
        write(tmp.path(), "notes.bashrc.bak", 3);
        let exts: BTreeSet<String> = ["bashrc".to_string()].into();
        let res = collect(tmp.path(), &MatchCriterion::ExtensionIn(exts)).unwrap();
        assert_eq!(res.paths, vec![rc]);
    }

    #[test]
    fn find_first_stops_at_lexicographic_first_hit() {
        let tmp = tree();
        let hit = find_first(tmp.path(), "a.txt").unwrap().unwrap();
        assert_eq!(hit.path, tmp.path().join("a.txt"));
        assert_eq!(hit.size, 10);
        let text = hit.render();
        assert!(text.starts_with(&format!("File found: {}\n", hit.path.display())));
        assert!(text.contains("Size: 10 bytes\n"));
        assert!(text.contains("Date created: "));
    }

    #[test]
    fn find_first_is_case_sensitive_and_reports_missing() {
        let tmp = tree();
        assert!(find_first(tmp.path(), "A.TXT").unwrap().is_none());
        assert!(find_first(tmp.path(), "report.pdf").unwrap().is_none());
        // Directories never match
        assert!(find_first(tmp.path(), "docs").unwrap().is_none());
    }

    #[test]
    fn find_first_respects_depth_bound() {
        let tmp = TempDir::new().unwrap();
        let mut rel = PathBuf::new();
        for i in 0..MAX_FIND_DEPTH {
            rel.push(format!("d{i}"));
        }
        // Depth MAX_FIND_DEPTH + 1 below the root
        write(tmp.path(), &rel.join("buried.txt").to_string_lossy(), 1);
        assert!(find_first(tmp.path(), "buried.txt").unwrap().is_none());

        rel.pop();
        write(tmp.path(), &rel.join("shallow.txt").to_string_lossy(), 1);
        assert!(find_first(tmp.path(), "shallow.txt").unwrap().is_some());
    }

    #[test]
    fn search_names_marks_found_and_skips_missing() {
        let tmp = tree();
        let names = vec!["report.md".to_string(), "nope.txt".to_string(), "main.rs".to_string()];
        let res = search_names(tmp.path(), &names).unwrap();
        assert_eq!(res.found, vec![true, false, true]);
        assert_eq!(
            res.paths,
            vec![tmp.path().join("docs/report.md"), tmp.path().join("src/main.rs")]
        );
    }

    #[test]
    fn search_names_keeps_first_occurrence() {
        let tmp = tree();
        let res = search_names(tmp.path(), &["a.txt".to_string(), "a.txt".to_string()]).unwrap();
        assert_eq!(res.found, vec![true, true]);
        assert_eq!(res.paths, vec![tmp.path().join("a.txt")]);
    }

    fn set_mtime(path: &Path, date: NaiveDate, hour: u32) {
        use chrono::TimeZone;
        let local = Local
            .from_local_datetime(&date.and_hms_opt(hour, 0, 0).unwrap())
            .single()
            .unwrap();
        let ft = filetime::FileTime::from_unix_time(local.timestamp(), 0);
        filetime::set_file_mtime(path, ft).unwrap();
    }

    #[test]
    fn date_filter_bounds_are_inclusive_days() {
        let tmp = TempDir::new().unwrap();
        let day = |d| NaiveDate::from_ymd_opt(2024, 1, d).unwrap();
        let before = write(tmp.path(), "before.txt", 1);
        let first = write(tmp.path(), "first.txt", 1);
        let last = write(tmp.path(), "last.txt", 1);
        let after = write(tmp.path(), "after.txt", 1);
        set_mtime(&before, NaiveDate::from_ymd_opt(2023, 12, 31).unwrap(), 23);
        set_mtime(&first, day(1), 0);
        set_mtime(&last, day(10), 23);
        set_mtime(&after, day(11), 0);

        let c = MatchCriterion::DateBetween {
            from: day(1),
            to: day(10),
        };
        let res = collect(tmp.path(), &c).unwrap();
        assert_eq!(res.paths, vec![first, last]);
        for p in &res.paths {
            let t = local_date(fs::metadata(p).unwrap().modified().unwrap());
            assert!(day(1) <= t && t <= day(10));
        }
    }

    #[test]
    fn repeated_filters_are_identical() {
        let tmp = tree();
        let c = MatchCriterion::SizeBetween { min: 0, max: 500 };
        assert_eq!(collect(tmp.path(), &c).unwrap(), collect(tmp.path(), &c).unwrap());
    }

    #[test]
    fn missing_home_is_a_filesystem_error() {
        let tmp = TempDir::new().unwrap();
        let gone = tmp.path().join("missing");
        assert!(matches!(
            collect(&gone, &MatchCriterion::SizeBetween { min: 0, max: 1 }),
            Err(Error::FilesystemAccess { .. })
        ));
        assert!(matches!(find_first(&gone, "x"), Err(Error::FilesystemAccess { .. })));
    }

    #[test]
    fn criterion_from_command() {
        let cmd = Command::parse("sgetfiles 1 9 -u").unwrap();
        assert_eq!(
            MatchCriterion::from_command(&cmd).unwrap(),
            Some(MatchCriterion::SizeBetween { min: 1, max: 9 })
        );
        let quit = Command::parse("quit").unwrap();
        assert_eq!(MatchCriterion::from_command(&quit).unwrap(), None);
    }
}
