//! Candidate path resolution
//!
//! Every artifact kind carries an ordered list of path templates. Templates
//! are expanded for a site and checked in order; the first regular file wins
//! and later candidates are never looked at.

use crate::sites::SiteDescriptor;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Values substituted into candidate templates
#[derive(Debug, Clone)]
pub struct PathContext {
    pub site: String,
    pub runtime: String,
    pub root: PathBuf,
    pub log_dir: PathBuf,
}

impl PathContext {
    pub fn new(site: &SiteDescriptor, log_dir: &Path) -> Self {
        Self {
            site: site.name.clone(),
            runtime: site.runtime_version.clone(),
            root: site.root_path.clone(),
            log_dir: log_dir.to_path_buf(),
        }
    }

    /// Expand `{site}`, `{runtime}`, `{root}`, `{log_dir}`
    pub fn expand(&self, template: &str) -> PathBuf {
        let root = self.root.to_string_lossy();
        let log_dir = self.log_dir.to_string_lossy();
        PathBuf::from(
            template
                .replace("{site}", &self.site)
                .replace("{runtime}", &self.runtime)
                .replace("{root}", root.trim_end_matches('/'))
                .replace("{log_dir}", log_dir.trim_end_matches('/')),
        )
    }
}

/// Outcome of resolving one artifact kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// The winning path, if any
    pub found: Option<PathBuf>,
    /// Paths checked, in order, up to and including the winner
    pub tried: Vec<PathBuf>,
}

/// Return the first candidate that exists as a regular file
pub fn resolve_first(ctx: &PathContext, candidates: &[String]) -> Resolution {
    let mut tried = Vec::new();
    for template in candidates {
        let path = ctx.expand(template);
        tried.push(path.clone());
        if path.is_file() {
            return Resolution {
                found: Some(path),
                tried,
            };
        }
    }
    Resolution { found: None, tried }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn ctx(root: &Path) -> PathContext {
        PathContext {
            site: "app1".to_string(),
            runtime: "8.2".to_string(),
            root: root.to_path_buf(),
            log_dir: root.join("logs"),
        }
    }

    #[test]
    fn test_expand_placeholders() {
        let c = PathContext {
            site: "app1".to_string(),
            runtime: "8.2".to_string(),
            root: PathBuf::from("/srv/app1/"),
            log_dir: PathBuf::from("/home/runcloud/logs"),
        };
        assert_eq!(
            c.expand("/etc/php-rc/{runtime}/fpm/pool.d/{site}.conf"),
            PathBuf::from("/etc/php-rc/8.2/fpm/pool.d/app1.conf")
        );
        assert_eq!(c.expand("{root}/.user.ini"), PathBuf::from("/srv/app1/.user.ini"));
        assert_eq!(
            c.expand("{log_dir}/{site}_nginx_error.log"),
            PathBuf::from("/home/runcloud/logs/app1_nginx_error.log")
        );
    }

    #[test]
    fn test_first_existing_candidate_wins() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.conf"), "a").unwrap();
        fs::write(dir.path().join("b.conf"), "b").unwrap();
        let candidates = vec![
            "{root}/missing.conf".to_string(),
            "{root}/a.conf".to_string(),
            "{root}/b.conf".to_string(),
        ];

        let res = resolve_first(&ctx(dir.path()), &candidates);
        assert_eq!(res.found, Some(dir.path().join("a.conf")));
        // b.conf is never consulted
        assert_eq!(res.tried.len(), 2);
    }

    #[test]
    fn test_directories_do_not_count() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("app1.conf")).unwrap();
        let res = resolve_first(&ctx(dir.path()), &["{root}/{site}.conf".to_string()]);
        assert!(res.found.is_none());
        assert_eq!(res.tried, vec![dir.path().join("app1.conf")]);
    }
}
