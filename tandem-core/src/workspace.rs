//! Per-room workspace directories.
//!
//! Each room gets a directory named after its description, seeded from a
//! template tree when one is installed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use walkdir::WalkDir;

const MAX_SLUG_LEN: usize = 30;
const MAX_NAME_ATTEMPTS: usize = 1000;

const ADJECTIVES: &[&str] = &["swift", "happy", "clever", "brave", "cosmic", "bright", "mystic", "golden"];
const NOUNS: &[&str] = &["phoenix", "dragon", "tiger", "falcon", "wolf", "eagle", "panda", "orca"];

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("failed to create workspace {}: {source}", path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Lowercase, collapse every run of characters outside `[a-z0-9]` into one
/// `-`, and cap the result at 30 characters without a dangling `-`.
pub fn slugify(s: &str) -> String {
    let lowered = s.trim().to_lowercase();
    let mut slug = String::with_capacity(lowered.len());
    let mut pending_dash = false;
    for ch in lowered.chars() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch);
        } else {
            pending_dash = true;
        }
    }
    slug.truncate(MAX_SLUG_LEN);
    slug.trim_end_matches('-').to_string()
}

/// A readable `adjective-noun` name.
pub fn random_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("swift");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("phoenix");
    format!("{}-{}", adjective, noun)
}

/// Directory name for a room: the slugged description, or a random name when
/// the description has nothing usable.
pub fn workspace_name(description: &str) -> String {
    let slug = slugify(description);
    if slug.is_empty() {
        random_name()
    } else {
        slug
    }
}

/// `/app/workspaces` when it exists, otherwise a directory under the system
/// temp dir.
pub fn default_root() -> PathBuf {
    let app = Path::new("/app/workspaces");
    if app.is_dir() {
        app.to_path_buf()
    } else {
        std::env::temp_dir().join("duet-workspaces")
    }
}

pub fn default_template() -> PathBuf {
    PathBuf::from("/app/workspace-template")
}

/// Every `adjective-noun` combination.
fn readable_names() -> Vec<String> {
    ADJECTIVES
        .iter()
        .flat_map(|adjective| NOUNS.iter().map(move |noun| format!("{}-{}", adjective, noun)))
        .collect()
}

fn create_root(root: &Path) -> Result<(), WorkspaceError> {
    fs::create_dir_all(root).map_err(|source| WorkspaceError::Create {
        path: root.to_path_buf(),
        source,
    })
}

/// Provision the workspace for a room described by `description`.
///
/// A usable description becomes the directory name via [`provision`]. An
/// empty one gets a free `adjective-noun` name picked at random; numeric
/// suffixes are only used once every combination is taken.
pub fn provision_room(
    root: &Path,
    description: &str,
    template: Option<&Path>,
) -> Result<PathBuf, WorkspaceError> {
    let slug = slugify(description);
    if !slug.is_empty() {
        return provision(root, &slug, template);
    }

    create_root(root)?;
    let mut names = readable_names();
    names.shuffle(&mut rand::thread_rng());
    for name in names {
        let dir = root.join(name);
        match fs::create_dir(&dir) {
            Ok(()) => return Ok(seed(dir, template)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(source) => return Err(WorkspaceError::Create { path: dir, source }),
        }
    }

    log::warn!("Every readable workspace name is taken under {}", root.display());
    provision(root, &random_name(), template)
}

/// Create a fresh directory for `name` under `root` and seed it from
/// `template`. A taken name gets a numeric suffix (`name-2`, `name-3`, ...).
/// Only directory creation can fail; a broken template copy leaves whatever
/// was copied so far.
pub fn provision(root: &Path, name: &str, template: Option<&Path>) -> Result<PathBuf, WorkspaceError> {
    create_root(root)?;

    let mut dir = root.join(name);
    let mut attempt = 1;
    loop {
        match fs::create_dir(&dir) {
            Ok(()) => break,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempt < MAX_NAME_ATTEMPTS => {
                attempt += 1;
                dir = root.join(format!("{}-{}", name, attempt));
            }
            Err(source) => return Err(WorkspaceError::Create { path: dir, source }),
        }
    }

    Ok(seed(dir, template))
}

fn seed(dir: PathBuf, template: Option<&Path>) -> PathBuf {
    match template {
        Some(template) if template.is_dir() => {
            if let Err(e) = copy_tree(template, &dir) {
                log::warn!(
                    "Failed to copy workspace template {} into {}: {}",
                    template.display(),
                    dir.display(),
                    e
                );
            }
        }
        Some(template) => {
            log::debug!("No workspace template at {}, starting empty", template.display());
        }
        None => {}
    }

    log::info!("Provisioned workspace {}", dir.display());
    dir
}

fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    for entry in WalkDir::new(from).min_depth(1).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let target = to.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Delete a workspace tree. Failures are logged, never returned.
pub fn remove(path: &Path) {
    match fs::remove_dir_all(path) {
        Ok(()) => log::info!("Removed workspace {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to remove workspace {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Fix Auth Bug"), "fix-auth-bug");
        assert_eq!(slugify("  --Hello,   World!!  "), "hello-world");
        assert_eq!(slugify("v2.0 release"), "v2-0-release");
        assert_eq!(slugify("!!!"), "");
        assert_eq!(slugify("Ünïcode"), "n-code");
    }

    #[test]
    fn test_slugify_truncates_without_trailing_dash() {
        let slug = slugify("abcdefghijklmnopqrstuvwxyz abcd efgh");
        assert_eq!(slug, "abcdefghijklmnopqrstuvwxyz-abc");
        let slug = slugify("abcdefghijklmnopqrstuvwxyz abc defg");
        assert_eq!(slug, "abcdefghijklmnopqrstuvwxyz-abc");
        let slug = slugify("abcdefghijklmnopqrstuvwxyzabc defg");
        assert_eq!(slug, "abcdefghijklmnopqrstuvwxyzabc");
        assert!(slug.len() <= 30);
    }

    #[test]
    fn test_empty_description_gets_random_name() {
        for _ in 0..20 {
            let name = workspace_name("  ");
            let (adjective, noun) = name.split_once('-').unwrap();
            assert!(ADJECTIVES.contains(&adjective));
            assert!(NOUNS.contains(&noun));
        }
    }

    #[test]
    fn test_provision_copies_template() {
        let root = tempfile::tempdir().unwrap();
        let template = tempfile::tempdir().unwrap();
        fs::create_dir(template.path().join("src")).unwrap();
        fs::write(template.path().join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(template.path().join("README"), "hello").unwrap();

        let dir = provision(root.path(), "fix-auth-bug", Some(template.path())).unwrap();
        assert_eq!(dir, root.path().join("fix-auth-bug"));
        assert_eq!(fs::read_to_string(dir.join("src/main.rs")).unwrap(), "fn main() {}");
        assert_eq!(fs::read_to_string(dir.join("README")).unwrap(), "hello");
    }

    #[test]
    fn test_provision_missing_template_is_empty() {
        let root = tempfile::tempdir().unwrap();
        let dir = provision(root.path(), "demo", Some(Path::new("/nonexistent/template"))).unwrap();
        assert!(dir.is_dir());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[test]
    fn test_provision_suffixes_taken_names() {
        let root = tempfile::tempdir().unwrap();
        let first = provision(root.path(), "demo", None).unwrap();
        let second = provision(root.path(), "demo", None).unwrap();
        let third = provision(root.path(), "demo", None).unwrap();
        assert_eq!(first, root.path().join("demo"));
        assert_eq!(second, root.path().join("demo-2"));
        assert_eq!(third, root.path().join("demo-3"));
    }

    fn is_readable_name(name: &str) -> bool {
        match name.split_once('-') {
            Some((adjective, noun)) => {
                !adjective.is_empty()
                    && !noun.is_empty()
                    && adjective.chars().all(|c| c.is_ascii_lowercase())
                    && noun.chars().all(|c| c.is_ascii_lowercase())
            }
            None => false,
        }
    }

    #[test]
    fn test_provision_room_uses_slug() {
        let root = tempfile::tempdir().unwrap();
        let first = provision_room(root.path(), "Fix Auth Bug", None).unwrap();
        let second = provision_room(root.path(), "fix auth bug!", None).unwrap();
        assert_eq!(first, root.path().join("fix-auth-bug"));
        assert_eq!(second, root.path().join("fix-auth-bug-2"));
    }

    #[test]
    fn test_unnamed_rooms_keep_readable_names() {
        let root = tempfile::tempdir().unwrap();
        let total = ADJECTIVES.len() * NOUNS.len();
        let mut names = std::collections::HashSet::new();
        for _ in 0..total {
            let dir = provision_room(root.path(), "", None).unwrap();
            let name = dir.file_name().unwrap().to_string_lossy().into_owned();
            assert!(is_readable_name(&name), "unexpected workspace name {name}");
            assert!(names.insert(name));
        }

        // Only once every combination is taken does a suffix appear.
        let dir = provision_room(root.path(), "  ", None).unwrap();
        let name = dir.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("-2"), "unexpected workspace name {name}");
    }

    #[test]
    fn test_provision_fails_when_root_is_a_file() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("blocker");
        fs::write(&file, "x").unwrap();
        let err = provision(&file, "demo", None).unwrap_err();
        assert!(matches!(err, WorkspaceError::Create { .. }));
    }

    #[test]
    fn test_remove_deletes_tree() {
        let root = tempfile::tempdir().unwrap();
        let dir = provision(root.path(), "gone", None).unwrap();
        fs::write(dir.join("file"), "x").unwrap();
        remove(&dir);
        assert!(!dir.exists());
        remove(&dir);
    }
}
