use std::path::PathBuf;

use crate::workspace;

/// Shell launched inside each room's terminal.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment entries, applied after `TERM`.
    pub env: Vec<(String, String)>,
}

impl ShellConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        let program = std::env::var("SHELL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string());
        Self::new(program)
    }
}

/// Room manager configuration.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Directory under which per-room workspaces are created.
    pub workspace_root: PathBuf,
    /// Tree copied into each new workspace, when present.
    pub template_dir: Option<PathBuf>,
    /// Base URL of the worker notified when a room is torn down.
    pub worker_url: Option<String>,
    pub default_cols: u16,
    pub default_rows: u16,
    pub shell: ShellConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            workspace_root: workspace::default_root(),
            template_dir: Some(workspace::default_template()),
            worker_url: None,
            default_cols: 80,
            default_rows: 24,
            shell: ShellConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Defaults overridden by `TANDEM_WORKSPACE_ROOT`, `TANDEM_TEMPLATE_DIR`,
    /// `TANDEM_WORKER_URL` and `TANDEM_SHELL`. Empty values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(root) = env_value("TANDEM_WORKSPACE_ROOT") {
            config.workspace_root = PathBuf::from(root);
        }
        if let Some(template) = env_value("TANDEM_TEMPLATE_DIR") {
            config.template_dir = Some(PathBuf::from(template));
        }
        if let Some(url) = env_value("TANDEM_WORKER_URL") {
            config.worker_url = Some(url);
        }
        if let Some(shell) = env_value("TANDEM_SHELL") {
            config.shell.program = shell;
        }
        config
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.default_cols, 80);
        assert_eq!(config.default_rows, 24);
        assert!(config.worker_url.is_none());
        assert!(!config.shell.program.is_empty());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: ManagerConfig = serde_json::from_str(
            r#"{"workspace_root": "/srv/rooms", "shell": {"program": "/bin/bash", "args": ["-l"]}}"#,
        )
        .unwrap();
        assert_eq!(config.workspace_root, PathBuf::from("/srv/rooms"));
        assert_eq!(config.shell.program, "/bin/bash");
        assert_eq!(config.shell.args, vec!["-l".to_string()]);
        assert!(config.shell.env.is_empty());
        assert_eq!(config.default_rows, 24);
    }

    #[test]
    fn test_from_env_reads_worker_url() {
        std::env::set_var("TANDEM_WORKER_URL", "http://worker.internal:8787");
        let config = ManagerConfig::from_env();
        std::env::remove_var("TANDEM_WORKER_URL");
        assert_eq!(config.worker_url.as_deref(), Some("http://worker.internal:8787"));
    }

    #[test]
    fn test_shell_builder() {
        let shell = ShellConfig::new("/bin/zsh")
            .with_args(["-i"])
            .with_env("LANG", "C.UTF-8");
        assert_eq!(shell.args, vec!["-i".to_string()]);
        assert_eq!(shell.env, vec![("LANG".to_string(), "C.UTF-8".to_string())]);
    }
}
