//! Child process environment

use isorun_core::{
    EnvironmentVariables, Error, Result, CONTEXT_FILE_VAR, PACKAGE_CACHE_DIR_VAR, PATH_VAR,
    TEMP_DIR_VARS,
};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Inputs to [`build_environment`] besides the ambient environment
#[derive(Debug, Clone, Copy)]
pub struct EnvironmentSpec<'a> {
    pub run_dir: &'a Path,
    pub tmp_dir: &'a Path,
    /// `None` deletes the variable
    pub overrides: &'a [(String, Option<String>)],
    /// Run-relative paths prepended to a variable, in declaration order
    pub prefixes: &'a [(String, Vec<String>)],
    /// Package client directory, prepended to `PATH`
    pub package_bin_dir: Option<&'a Path>,
    pub package_cache_dir: Option<&'a Path>,
    /// Account context file exported to the task
    pub context_file: Option<&'a Path>,
}

impl<'a> EnvironmentSpec<'a> {
    pub fn new(run_dir: &'a Path, tmp_dir: &'a Path) -> Self {
        Self {
            run_dir,
            tmp_dir,
            overrides: &[],
            prefixes: &[],
            package_bin_dir: None,
            package_cache_dir: None,
            context_file: None,
        }
    }
}

/// Build the environment for the child starting from `base`
pub fn build_environment(base: EnvironmentVariables, spec: &EnvironmentSpec<'_>) -> Result<EnvironmentVariables> {
    let mut env = base;

    for (key, value) in spec.overrides {
        match value {
            Some(value) => {
                env.insert(key.clone(), value.clone());
            }
            None => {
                env.remove(key);
            }
        }
    }

    let tmp = spec.tmp_dir.to_string_lossy().into_owned();
    for var in TEMP_DIR_VARS {
        env.insert(*var, tmp.clone());
    }

    if let Some(bin_dir) = spec.package_bin_dir {
        prepend_paths(&mut env, PATH_VAR, &[bin_dir.to_path_buf()])?;
    }
    if let Some(cache_dir) = spec.package_cache_dir {
        env.insert(PACKAGE_CACHE_DIR_VAR, cache_dir.to_string_lossy().into_owned());
    }
    if let Some(context_file) = spec.context_file {
        env.insert(CONTEXT_FILE_VAR, context_file.to_string_lossy().into_owned());
    }

    for (key, relative_paths) in spec.prefixes {
        let paths: Vec<PathBuf> = relative_paths
            .iter()
            .map(|p| spec.run_dir.join(p))
            .collect();
        prepend_paths(&mut env, key, &paths)?;
    }

    Ok(env)
}

/// Put `paths` in front of the existing value of `key`
fn prepend_paths(env: &mut EnvironmentVariables, key: &str, paths: &[PathBuf]) -> Result<()> {
    let mut entries: Vec<OsString> = paths.iter().map(|p| p.as_os_str().to_owned()).collect();
    if let Some(old) = env.get(key) {
        entries.extend(std::env::split_paths(old).map(PathBuf::into_os_string));
    }
    let joined = std::env::join_paths(entries)
        .map_err(|e| Error::validation(format!("cannot build {key}: {e}")))?;
    env.insert(key, joined.to_string_lossy().into_owned());
    Ok(())
}

/// Marks which account the task runs as, for as long as it is alive
#[derive(Debug)]
pub struct AccountContext {
    path: PathBuf,
}

/// File name of the account context inside the tmp directory
pub const CONTEXT_FILE_NAME: &str = "account_context.json";

impl AccountContext {
    /// Write the context file for `account` into `tmp_dir`
    pub fn activate(tmp_dir: &Path, account: &str) -> Result<Self> {
        let path = tmp_dir.join(CONTEXT_FILE_NAME);
        isorun_utils::write_json_atomic(&path, &serde_json::json!({ "account": account }))?;
        tracing::debug!(account = %account, path = %path.display(), "activated account context");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for AccountContext {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(path = %self.path.display(), error = %e, "failed to remove account context");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn base() -> EnvironmentVariables {
        let mut env = EnvironmentVariables::new();
        env.insert("KEEP", "1");
        env.insert("DROP", "1");
        env.insert(PATH_VAR, "/usr/bin");
        env.insert("PYTHONPATH", "/old");
        env
    }

    #[test]
    fn test_overrides_and_temp_dir() {
        let overrides = vec![
            ("DROP".to_string(), None),
            ("NEW".to_string(), Some("x".to_string())),
        ];
        let spec = EnvironmentSpec {
            overrides: &overrides,
            ..EnvironmentSpec::new(Path::new("/run"), Path::new("/tmp/it1"))
        };
        let env = build_environment(base(), &spec).unwrap();

        assert_eq!(env.get("KEEP").map(String::as_str), Some("1"));
        assert!(env.get("DROP").is_none());
        assert_eq!(env.get("NEW").map(String::as_str), Some("x"));
        for var in TEMP_DIR_VARS {
            assert_eq!(env.get(var).map(String::as_str), Some("/tmp/it1"));
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_prefixes_keep_declaration_order_then_old_value() {
        let prefixes = vec![(
            "PYTHONPATH".to_string(),
            vec!["a".to_string(), "b/c".to_string()],
        )];
        let spec = EnvironmentSpec {
            prefixes: &prefixes,
            package_bin_dir: Some(Path::new("/pkg/bin")),
            package_cache_dir: Some(Path::new("/pkg/cache")),
            ..EnvironmentSpec::new(Path::new("/run"), Path::new("/tmp"))
        };
        let env = build_environment(base(), &spec).unwrap();

        assert_eq!(env.get("PYTHONPATH").unwrap(), "/run/a:/run/b/c:/old");
        assert_eq!(env.get(PATH_VAR).unwrap(), "/pkg/bin:/usr/bin");
        assert_eq!(env.get(PACKAGE_CACHE_DIR_VAR).unwrap(), "/pkg/cache");
    }

    #[test]
    fn test_account_context_lifecycle() {
        let temp_dir = TempDir::new().unwrap();
        let path = {
            let context = AccountContext::activate(temp_dir.path(), "builder@example").unwrap();
            let content: serde_json::Value =
                serde_json::from_slice(&std::fs::read(context.path()).unwrap()).unwrap();
            assert_eq!(content["account"], "builder@example");

            let spec = EnvironmentSpec {
                context_file: Some(context.path()),
                ..EnvironmentSpec::new(temp_dir.path(), temp_dir.path())
            };
            let env = build_environment(EnvironmentVariables::new(), &spec).unwrap();
            assert!(env.get(CONTEXT_FILE_VAR).is_some());
            context.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
