//! Reusable script objects and their resolution.
//!
//! Steps reference scripts and script groups by `(name, section)`. A
//! `ScriptResolver` turns such a reference into something executable; the
//! default `ScriptLibrary` reads them from a directory tree:
//!
//! ```text
//! scripts/
//!   <section>/
//!     <name>.rhai      single script
//!     <name>.yaml      group manifest
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::runner::RunHooks;
use crate::core::sandbox::{SandboxScript, ScriptSandbox};
use crate::domain::recipe::{exit_code, EXEC_TARGET};
use crate::domain::{sanitize_component, ExecuteEnvironment, ExecuteRecipe, Variables};

const SCRIPT_EXTENSION: &str = "rhai";
const GROUP_EXTENSION: &str = "yaml";

/// Something a step can execute
#[async_trait]
pub trait ExecutableScript: Send + Sync {
    /// `section/name`, for logs
    fn label(&self) -> String;

    async fn execute(&self, environment: ExecuteEnvironment, hooks: &RunHooks) -> ExecuteRecipe;
}

/// Looks up executable objects by reference
pub trait ScriptResolver: Send + Sync {
    fn resolve_script(&self, name: &str, section: &str) -> Option<Arc<dyn ExecutableScript>>;

    fn resolve_group(&self, name: &str, section: &str) -> Option<Arc<dyn ExecutableScript>>;
}

/// Errors loading scripts from disk
#[derive(Debug, Error)]
pub enum ScriptLibraryError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid group manifest {path}: {source}")]
    InvalidManifest {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Group {group} references missing script {member}")]
    MissingMember { group: String, member: String },
}

/// A script evaluated in the sandbox
pub struct SandboxedScript {
    name: String,
    section: String,
    code: String,
    timeout_seconds: i64,
    sandbox: Arc<ScriptSandbox>,
}

impl SandboxedScript {
    pub fn new(
        name: impl Into<String>,
        section: impl Into<String>,
        code: impl Into<String>,
        sandbox: Arc<ScriptSandbox>,
    ) -> Self {
        Self {
            name: name.into(),
            section: section.into(),
            code: code.into(),
            timeout_seconds: 0,
            sandbox,
        }
    }

    /// Seconds; `<= 0` keeps the sandbox ceiling
    pub fn with_timeout(mut self, seconds: i64) -> Self {
        self.timeout_seconds = seconds;
        self
    }
}

#[async_trait]
impl ExecutableScript for SandboxedScript {
    fn label(&self) -> String {
        format!("{}/{}", self.section, self.name)
    }

    async fn execute(&self, environment: ExecuteEnvironment, hooks: &RunHooks) -> ExecuteRecipe {
        let ExecuteEnvironment {
            mut payload,
            target,
        } = environment;
        if let Some(target) = target {
            payload.insert(EXEC_TARGET.to_string(), target);
        }

        let script = SandboxScript::new(self.code.clone(), payload).with_timeout(self.timeout_seconds);
        let result = self.sandbox.evaluate(script).await;
        if !result.output.is_empty() {
            hooks.emit_output(&result.output);
        }

        debug!(script = %self.label(), code = result.code, "Script finished");
        result.into()
    }
}

/// Scripts run in order as one unit.
///
/// Each member sees the variables of the members before it. A negative code
/// stops the group.
pub struct ScriptGroup {
    name: String,
    section: String,
    members: Vec<Arc<dyn ExecutableScript>>,
}

impl ScriptGroup {
    pub fn new(
        name: impl Into<String>,
        section: impl Into<String>,
        members: Vec<Arc<dyn ExecutableScript>>,
    ) -> Self {
        Self {
            name: name.into(),
            section: section.into(),
            members,
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[async_trait]
impl ExecutableScript for ScriptGroup {
    fn label(&self) -> String {
        format!("{}/{}", self.section, self.name)
    }

    async fn execute(&self, environment: ExecuteEnvironment, hooks: &RunHooks) -> ExecuteRecipe {
        let mut environment = environment;
        let mut vars = Variables::new();
        let mut output = String::new();
        let mut last = ExecuteRecipe::success(Variables::new());

        for (index, member) in self.members.iter().enumerate() {
            if hooks.should_terminate() {
                let mut recipe = ExecuteRecipe::failure(
                    exit_code::TERMINATED,
                    format!("Group {} terminated before member {index}", self.label()),
                );
                vars.append(&mut recipe.vars);
                recipe.vars = vars;
                recipe.output = output;
                return recipe;
            }

            let recipe = member.execute(environment.clone(), hooks).await;
            environment.merge(&recipe.vars);
            vars.extend(recipe.vars.iter().map(|(k, v)| (k.clone(), v.clone())));
            output.push_str(&recipe.output);

            if recipe.code < 0 {
                debug!(group = %self.label(), member = %member.label(), code = recipe.code, "Group stopped");
                return ExecuteRecipe {
                    vars,
                    output,
                    ..recipe
                };
            }
            last = recipe;
        }

        ExecuteRecipe {
            code: last.code,
            output,
            vars,
            error: last.error,
        }
    }
}

/// On-disk group manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupManifest {
    #[serde(default)]
    pub description: String,

    pub scripts: Vec<GroupMember>,
}

/// One entry of a group manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMember {
    pub name: String,

    /// Defaults to the group's own section
    #[serde(default)]
    pub section: Option<String>,

    #[serde(default)]
    pub timeout_seconds: i64,
}

/// Directory-backed script library executed through the sandbox
pub struct ScriptLibrary {
    root: PathBuf,
    sandbox: Arc<ScriptSandbox>,
}

impl ScriptLibrary {
    pub fn new(root: impl Into<PathBuf>, sandbox: Arc<ScriptSandbox>) -> Self {
        Self {
            root: root.into(),
            sandbox,
        }
    }

    /// `<root>/<section>/<name>.<extension>`, never outside `root`
    fn entry_path(&self, name: &str, section: &str, extension: &str) -> PathBuf {
        self.root
            .join(sanitize_component(section))
            .join(format!("{}.{extension}", sanitize_component(name)))
    }

    /// Load a single script; `Ok(None)` if it does not exist
    pub fn load_script(
        &self,
        name: &str,
        section: &str,
    ) -> Result<Option<SandboxedScript>, ScriptLibraryError> {
        let path = self.entry_path(name, section, SCRIPT_EXTENSION);
        let Some(code) = read_optional(&path)? else {
            return Ok(None);
        };
        Ok(Some(SandboxedScript::new(
            name,
            section,
            code,
            Arc::clone(&self.sandbox),
        )))
    }

    /// Load a group and all its members; `Ok(None)` if the manifest does not exist
    pub fn load_group(
        &self,
        name: &str,
        section: &str,
    ) -> Result<Option<ScriptGroup>, ScriptLibraryError> {
        let path = self.entry_path(name, section, GROUP_EXTENSION);
        let Some(content) = read_optional(&path)? else {
            return Ok(None);
        };
        let manifest: GroupManifest = serde_yaml::from_str(&content)
            .map_err(|source| ScriptLibraryError::InvalidManifest { path, source })?;

        let mut members: Vec<Arc<dyn ExecutableScript>> = Vec::with_capacity(manifest.scripts.len());
        for member in &manifest.scripts {
            let member_section = member.section.as_deref().unwrap_or(section);
            let script = self.load_script(&member.name, member_section)?.ok_or_else(|| {
                ScriptLibraryError::MissingMember {
                    group: format!("{section}/{name}"),
                    member: format!("{member_section}/{}", member.name),
                }
            })?;
            members.push(Arc::new(script.with_timeout(member.timeout_seconds)));
        }

        Ok(Some(ScriptGroup::new(name, section, members)))
    }
}

impl ScriptResolver for ScriptLibrary {
    fn resolve_script(&self, name: &str, section: &str) -> Option<Arc<dyn ExecutableScript>> {
        match self.load_script(name, section) {
            Ok(script) => script.map(|s| Arc::new(s) as Arc<dyn ExecutableScript>),
            Err(e) => {
                warn!(name, section, error = %e, "Failed to load script");
                None
            }
        }
    }

    fn resolve_group(&self, name: &str, section: &str) -> Option<Arc<dyn ExecutableScript>> {
        match self.load_group(name, section) {
            Ok(group) => group.map(|g| Arc::new(g) as Arc<dyn ExecutableScript>),
            Err(e) => {
                warn!(name, section, error = %e, "Failed to load script group");
                None
            }
        }
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, ScriptLibraryError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ScriptLibraryError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sandbox::SandboxLimits;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn library(temp: &TempDir) -> ScriptLibrary {
        ScriptLibrary::new(
            temp.path(),
            Arc::new(ScriptSandbox::new(SandboxLimits::default())),
        )
    }

    fn write(temp: &TempDir, relative: &str, content: &str) {
        let path = temp.path().join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn test_script_sees_target_and_env() {
        let temp = TempDir::new().unwrap();
        write(
            &temp,
            "net/ping.rhai",
            r#"print("pinging " + env.ExecTarget);
               #{ code: 0, value: #{ host: env.ExecTarget, region: env.REGION } }"#,
        );

        let lib = library(&temp);
        let script = lib.resolve_script("ping", "net").unwrap();
        assert_eq!(script.label(), "net/ping");

        let captured = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&captured);
        let hooks = RunHooks::silent().with_output(move |text| sink.lock().unwrap().push_str(text));

        let mut env = ExecuteEnvironment::default().with_target(Some("web-1".to_string()));
        env.set("REGION", "eu");
        let recipe = script.execute(env, &hooks).await;

        assert_eq!(recipe.code, 0);
        assert_eq!(recipe.vars.get("host"), Some(&"web-1".to_string()));
        assert_eq!(recipe.vars.get("region"), Some(&"eu".to_string()));
        assert!(captured.lock().unwrap().contains("pinging web-1"));
    }

    #[tokio::test]
    async fn test_missing_references_resolve_to_none() {
        let temp = TempDir::new().unwrap();
        let lib = library(&temp);

        assert!(lib.resolve_script("nope", "net").is_none());
        assert!(lib.resolve_group("nope", "net").is_none());
    }

    #[tokio::test]
    async fn test_references_cannot_leave_the_library() {
        let temp = TempDir::new().unwrap();
        write(&temp, "outside.rhai", "#{}");
        write(&temp, "outside.yaml", "scripts: []\n");
        write(&temp, "lib/net/ping.rhai", "#{}");

        let lib = ScriptLibrary::new(
            temp.path().join("lib"),
            Arc::new(ScriptSandbox::new(SandboxLimits::default())),
        );

        assert!(lib.resolve_script("ping", "net").is_some());
        assert!(lib.resolve_script("../outside", "net").is_none());
        assert!(lib.resolve_script("outside", "..").is_none());
        assert!(lib.resolve_group("../../outside", "net").is_none());
    }

    #[tokio::test]
    async fn test_group_chains_variables() {
        let temp = TempDir::new().unwrap();
        write(&temp, "deploy/fetch.rhai", r#"#{ value: #{ version: "1.4.2" } }"#);
        write(
            &temp,
            "deploy/install.rhai",
            r#"#{ code: 0, value: #{ installed: "pkg-" + env.version } }"#,
        );
        write(
            &temp,
            "deploy/release.yaml",
            "description: fetch then install\nscripts:\n  - name: fetch\n  - name: install\n    timeout_seconds: 30\n",
        );

        let lib = library(&temp);
        let group = lib.load_group("release", "deploy").unwrap().unwrap();
        assert_eq!(group.len(), 2);

        let recipe = group
            .execute(ExecuteEnvironment::default(), &RunHooks::silent())
            .await;
        assert_eq!(recipe.code, 0);
        assert_eq!(recipe.vars.get("version"), Some(&"1.4.2".to_string()));
        assert_eq!(recipe.vars.get("installed"), Some(&"pkg-1.4.2".to_string()));
    }

    #[tokio::test]
    async fn test_group_stops_on_negative_code() {
        let temp = TempDir::new().unwrap();
        write(&temp, "ops/fail.rhai", r#"#{ code: -3, error: "disk full" }"#);
        write(&temp, "ops/after.rhai", r#"#{ value: #{ reached: "yes" } }"#);
        write(&temp, "ops/chain.yaml", "scripts:\n  - name: fail\n  - name: after\n");

        let lib = library(&temp);
        let group = lib.resolve_group("chain", "ops").unwrap();
        let recipe = group
            .execute(ExecuteEnvironment::default(), &RunHooks::silent())
            .await;

        assert_eq!(recipe.code, -3);
        assert!(!recipe.vars.contains_key("reached"));
        assert_eq!(recipe.error.as_deref(), Some("disk full"));
    }

    #[tokio::test]
    async fn test_group_with_missing_member_fails_to_load() {
        let temp = TempDir::new().unwrap();
        write(&temp, "ops/broken.yaml", "scripts:\n  - name: ghost\n");

        let lib = library(&temp);
        assert!(matches!(
            lib.load_group("broken", "ops"),
            Err(ScriptLibraryError::MissingMember { .. })
        ));
        assert!(lib.resolve_group("broken", "ops").is_none());
    }
}
