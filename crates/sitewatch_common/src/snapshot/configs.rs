//! Configuration file collector
//!
//! One verbatim copy per config kind, taken from the first existing candidate.

use super::{ArtifactStatus, CONFIGS_DIR};
use crate::config::ConfigSourceDef;
use crate::resolver::{resolve_first, PathContext};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub fn collect_configs(
    sources: &[ConfigSourceDef],
    ctx: &PathContext,
    report_dir: &Path,
) -> BTreeMap<String, ArtifactStatus> {
    let mut results = BTreeMap::new();
    for def in sources {
        let status = collect_one(def, ctx, report_dir);
        match &status {
            ArtifactStatus::Collected { source, .. } => info!(
                "[SNAPSHOT] Copied {} from {}",
                def.kind,
                source.as_ref().map(|p| p.display().to_string()).unwrap_or_default()
            ),
            ArtifactStatus::NotFound { tried, .. } => {
                warn!("[SNAPSHOT] {} not found ({} candidate(s) tried)", def.kind, tried.len())
            }
            ArtifactStatus::Failed { error } => {
                warn!("[SNAPSHOT] {} copy failed: {}", def.kind, error)
            }
        }
        results.insert(def.kind.clone(), status);
    }
    results
}

fn collect_one(def: &ConfigSourceDef, ctx: &PathContext, report_dir: &Path) -> ArtifactStatus {
    let resolution = resolve_first(ctx, &def.candidates);
    let Some(found) = resolution.found else {
        return ArtifactStatus::NotFound {
            reason: "no candidate path exists".to_string(),
            tried: resolution.tried,
        };
    };

    let file_name = found
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| def.kind.clone().into());
    let relative = PathBuf::from(CONFIGS_DIR).join(&def.kind).join(file_name);
    let dest = report_dir.join(&relative);

    let copied = fs::create_dir_all(report_dir.join(CONFIGS_DIR).join(&def.kind))
        .and_then(|_| fs::copy(&found, &dest));
    match copied {
        Ok(bytes) => ArtifactStatus::Collected {
            location: relative,
            source: Some(found),
            bytes,
            lines: None,
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => ArtifactStatus::NotFound {
            reason: format!("config disappeared before copy: {}", e),
            tried: resolution.tried,
        },
        Err(e) => ArtifactStatus::failed(format!("copying {}: {}", found.display(), e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
    fn test_higher_priority_candidate_copied() {
        let etc = TempDir::new().unwrap();
        let report = TempDir::new().unwrap();
        fs::create_dir_all(etc.path().join("nginx-rc")).unwrap();
        fs::create_dir_all(etc.path().join("nginx")).unwrap();
        fs::write(etc.path().join("nginx-rc/app1.conf"), "server { listen 80; }").unwrap();
        fs::write(etc.path().join("nginx/app1.conf"), "other").unwrap();

        let sources = vec![ConfigSourceDef {
            kind: "nginx_config".to_string(),
            candidates: vec![
                "{root}/nginx-rc/{site}.conf".to_string(),
                "{root}/nginx/{site}.conf".to_string(),
            ],
        }];
        let results = collect_configs(&sources, &ctx(etc.path()), report.path());

        match &results["nginx_config"] {
            ArtifactStatus::Collected { location, source, bytes, .. } => {
                assert_eq!(source.as_deref(), Some(etc.path().join("nginx-rc/app1.conf").as_path()));
                assert_eq!(location, &PathBuf::from("configs/nginx_config/app1.conf"));
                assert_eq!(*bytes, 21);
                assert_eq!(
                    fs::read_to_string(report.path().join(location)).unwrap(),
                    "server { listen 80; }"
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_no_candidate_is_not_found() {
        let etc = TempDir::new().unwrap();
        let report = TempDir::new().unwrap();
        let sources = vec![ConfigSourceDef {
            kind: "php_fpm_config".to_string(),
            candidates: vec![
                "{root}/php-rc/{runtime}/fpm/pool.d/{site}.conf".to_string(),
                "{root}/php/{runtime}/fpm/pool.d/{site}.conf".to_string(),
            ],
        }];
        let results = collect_configs(&sources, &ctx(etc.path()), report.path());
        match &results["php_fpm_config"] {
            ArtifactStatus::NotFound { tried, .. } => assert_eq!(tried.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!report.path().join("configs").exists());
    }
}
