//! Worker process environment.
//!
//! The coordinator detects these values once and passes them to every worker
//! it spawns as `SQLWIRE_*` environment variables.

use std::path::PathBuf;

pub const PLATFORM_VAR: &str = "SQLWIRE_PLATFORM";
pub const LOCALE_VAR: &str = "SQLWIRE_LOCALE";
pub const DATA_DIR_VAR: &str = "SQLWIRE_DATA_DIR";
pub const OS_USER_VAR: &str = "SQLWIRE_OS_USER";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEnv {
    pub platform: String,
    pub locale: Option<String>,
    pub data_dir: Option<PathBuf>,
    /// Login name used as the default database user. `create` fails without it.
    pub os_user: Option<String>,
}

impl Default for WorkerEnv {
    fn default() -> Self {
        Self {
            platform: std::env::consts::OS.to_string(),
            locale: None,
            data_dir: None,
            os_user: None,
        }
    }
}

impl WorkerEnv {
    /// Detect from the current (supervisor) process.
    pub fn detect() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        let locale = var("LC_ALL")
            .or_else(|| var("LANG"))
            .map(|l| l.split('.').next().unwrap_or_default().replace('_', "-"));

        let data_dir = var(DATA_DIR_VAR).map(PathBuf::from).or_else(|| {
            var("XDG_DATA_HOME")
                .map(PathBuf::from)
                .or_else(|| var("HOME").map(|h| PathBuf::from(h).join(".local").join("share")))
                .map(|base| base.join("sqlwire"))
        });

        Self {
            platform: std::env::consts::OS.to_string(),
            locale,
            data_dir,
            os_user: detect_os_user().or_else(|| var("USER")).or_else(|| var("USERNAME")),
        }
    }

    /// Read what the coordinator passed to this (worker) process.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(name).filter(|v| !v.is_empty());
        Self {
            platform: var(PLATFORM_VAR).unwrap_or_else(|| std::env::consts::OS.to_string()),
            locale: var(LOCALE_VAR),
            data_dir: var(DATA_DIR_VAR).map(PathBuf::from),
            os_user: var(OS_USER_VAR),
        }
    }

    pub fn to_env_vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![(PLATFORM_VAR, self.platform.clone())];
        if let Some(locale) = &self.locale {
            vars.push((LOCALE_VAR, locale.clone()));
        }
        if let Some(dir) = &self.data_dir {
            vars.push((DATA_DIR_VAR, dir.display().to_string()));
        }
        if let Some(user) = &self.os_user {
            vars.push((OS_USER_VAR, user.clone()));
        }
        vars
    }

    pub fn with_os_user(mut self, user: impl Into<String>) -> Self {
        self.os_user = Some(user.into());
        self
    }
}

#[cfg(unix)]
fn detect_os_user() -> Option<String> {
    let uid = nix::unistd::getuid();
    match nix::unistd::User::from_uid(uid) {
        Ok(Some(user)) => Some(user.name),
        Ok(None) => None,
        Err(e) => {
            tracing::debug!(%uid, error = %e, "Failed to look up OS user");
            None
        }
    }
}

#[cfg(not(unix))]
fn detect_os_user() -> Option<String> {
    None
}
