//! The TOML files a project's configuration is layered from.

use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub const PROJECT_CONFIG_FILE: &str = "hdb.toml";

/// Written by `set_configuration`; read after [`PROJECT_CONFIG_FILE`].
pub const LOCAL_CONFIG_FILE: &str = "hdb.local.toml";

/// Configuration files of one project, lowest precedence first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFiles {
    /// `~/.config/hdb/config.toml` or the platform equivalent. `None` when
    /// the user directory is unknown or was skipped.
    pub user: Option<PathBuf>,
    pub project: PathBuf,
    pub local: PathBuf,
}

impl ConfigFiles {
    pub fn for_project(project_dir: impl AsRef<Path>) -> Self {
        let project_dir = project_dir.as_ref();
        Self {
            user: ProjectDirs::from("io", "hdb", "hdb")
                .map(|dirs| dirs.config_dir().join("config.toml")),
            project: project_dir.join(PROJECT_CONFIG_FILE),
            local: project_dir.join(LOCAL_CONFIG_FILE),
        }
    }

    pub fn without_user(mut self) -> Self {
        self.user = None;
        self
    }

    /// Files that exist, in merge order.
    pub fn existing(&self) -> impl Iterator<Item = &Path> {
        self.user
            .iter()
            .chain([&self.project, &self.local])
            .map(PathBuf::as_path)
            .filter(|path| path.is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn files_are_named_after_the_project_dir() {
        let files = ConfigFiles::for_project("/srv/hdb");
        assert_eq!(files.project, Path::new("/srv/hdb/hdb.toml"));
        assert_eq!(files.local, Path::new("/srv/hdb/hdb.local.toml"));
        if let Some(user) = &files.user {
            assert!(user.ends_with("config.toml"));
        }
    }

    #[test]
    fn only_present_files_are_merged() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let files = ConfigFiles::for_project(temp_dir.path()).without_user();
        assert_eq!(files.existing().count(), 0);

        fs::write(&files.local, "").expect("Failed to write local config");
        let existing: Vec<_> = files.existing().collect();
        assert_eq!(existing, vec![files.local.as_path()]);
    }
}
