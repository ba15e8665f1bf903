//! Plan model & loader (C3).
//!
//! A plan file is parsed into [`RawPlan`] and resolved into a [`LoadedPlan`] — the
//! validated, compiled model the executor (C5) drives. Resolution injects the built-in
//! `success`/`fail` terminals, confines file paths to the workspace root, applies
//! `{{NAME}}` template substitution to inline prompts, and compiles every `when`.

use crate::condlang::{self, CompiledExpr};
use crate::error::{Error, Result};
use crate::template;
use crate::types::TerminalStatus;
use serde::de::{Error as DeError, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

pub const PLAN_VERSION: &str = "v2";

#[derive(Debug, Deserialize)]
struct RawPlan {
    version: String,
    entry: String,
    #[serde(default)]
    defaults: RawDefaults,
    #[serde(default)]
    limits: RawLimits,
    nodes: NodesMap,
}

/// A `{node_id: RawNode}` object that rejects a repeated key (§3 invariant: node ids are
/// unique). `serde_json`'s generic map deserialization silently keeps the last value for
/// a duplicate key, so this walks the map entries itself instead of deserializing
/// straight into a `HashMap`.
#[derive(Debug)]
struct NodesMap(HashMap<String, RawNode>);

impl<'de> Deserialize<'de> for NodesMap {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct NodesVisitor;

        impl<'de> Visitor<'de> for NodesVisitor {
            type Value = NodesMap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of node id to node definition")
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut out = HashMap::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((id, node)) = map.next_entry::<String, RawNode>()? {
                    if out.insert(id.clone(), node).is_some() {
                        return Err(A::Error::custom(format!("duplicate node id `{id}`")));
                    }
                }
                Ok(NodesMap(out))
            }
        }

        deserializer.deserialize_map(NodesVisitor)
    }
}

#[derive(Debug, Deserialize)]
struct RawDefaults {
    #[serde(default = "default_agent_idle_timeout")]
    agent_idle_timeout_sec: u64,
    #[serde(default = "default_command_timeout")]
    command_timeout_sec: u64,
}

fn default_agent_idle_timeout() -> u64 {
    120
}
fn default_command_timeout() -> u64 {
    60
}

impl Default for RawDefaults {
    fn default() -> Self {
        Self {
            agent_idle_timeout_sec: default_agent_idle_timeout(),
            command_timeout_sec: default_command_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawLimits {
    #[serde(default = "default_max_iterations")]
    max_iterations: u64,
    #[serde(default = "default_max_same_node_hits")]
    max_same_node_hits: u64,
}

fn default_max_iterations() -> u64 {
    100
}
fn default_max_same_node_hits() -> u64 {
    10
}

impl Default for RawLimits {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_same_node_hits: default_max_same_node_hits(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawNode {
    #[serde(default)]
    terminal: bool,
    terminal_status: Option<String>,
    exit_code: Option<u8>,
    message: Option<String>,
    run: Option<RawRun>,
    #[serde(default)]
    transitions: Vec<RawTransition>,
}

#[derive(Debug, Deserialize)]
struct RawRun {
    kind: String,
    model: Option<String>,
    prompt: Option<String>,
    prompt_file: Option<String>,
    idle_timeout_sec: Option<u64>,
    schema_file: Option<String>,
    cmd: Option<String>,
    cwd: Option<String>,
    timeout_sec: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawTransition {
    when: String,
    to: String,
}

// ---- resolved model ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptSource {
    Prompt,
    PromptFile,
    None,
}

#[derive(Debug, Clone)]
pub struct AgentRun {
    pub model: String,
    pub prompt_source: PromptSource,
    pub prompt_file: Option<PathBuf>,
    pub resolved_prompt: String,
    pub idle_timeout_sec: u64,
    pub decision_schema: Value,
    pub schema_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CommandRun {
    pub cmd: String,
    pub cwd: PathBuf,
    pub timeout_sec: u64,
}

#[derive(Debug, Clone)]
pub enum RunSpec {
    Agent(AgentRun),
    Command(CommandRun),
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub when_source: String,
    pub when: CompiledExpr,
    pub to: String,
}

#[derive(Debug, Clone)]
pub struct ExecutableNode {
    pub run: RunSpec,
    pub transitions: Vec<Transition>,
}

#[derive(Debug, Clone)]
pub struct TerminalNode {
    pub terminal_status: TerminalStatus,
    pub exit_code: u8,
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Node {
    Terminal(TerminalNode),
    Executable(ExecutableNode),
}

#[derive(Debug, Clone)]
pub struct Defaults {
    pub agent_idle_timeout_sec: u64,
    pub command_timeout_sec: u64,
}

#[derive(Debug, Clone)]
pub struct Limits {
    pub max_iterations: u64,
    pub max_same_node_hits: u64,
}

/// The validated, compiled plan the executor drives. Immutable after load.
#[derive(Debug, Clone)]
pub struct LoadedPlan {
    pub version: String,
    pub entry: String,
    pub nodes: HashMap<String, Node>,
    pub defaults: Defaults,
    pub limits: Limits,
}

impl LoadedPlan {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

fn parse_terminal_status(s: &str) -> Result<TerminalStatus> {
    match s {
        "success" => Ok(TerminalStatus::Success),
        "blocked" => Ok(TerminalStatus::Blocked),
        "failed" => Ok(TerminalStatus::Failed),
        "canceled" => Ok(TerminalStatus::Canceled),
        other => Err(Error::Plan(format!("unknown terminal_status `{other}`"))),
    }
}

/// Resolve `path` relative to `root` and ensure it doesn't escape it. The path must
/// already exist (callers read the file immediately after confining it).
fn confine(root: &Path, relative: &str) -> Result<PathBuf> {
    let candidate = root.join(relative);
    let canon_root = root
        .canonicalize()
        .map_err(|e| Error::Plan(format!("workspace root `{}`: {e}", root.display())))?;
    let canon = candidate
        .canonicalize()
        .map_err(|e| Error::Plan(format!("path `{relative}` does not exist: {e}")))?;
    if !canon.starts_with(&canon_root) {
        return Err(Error::Plan(format!(
            "path `{relative}` escapes the workspace root"
        )));
    }
    Ok(canon)
}

pub struct PlanLoader;

impl PlanLoader {
    /// Parse and fully resolve a plan file. `workspace_root` confines every
    /// `prompt_file`/`schema_file`/`cwd`. `variables` are the template substitution
    /// inputs for inline prompts (§4.3).
    pub fn load(
        plan_json: &str,
        workspace_root: &Path,
        variables: &HashMap<String, String>,
    ) -> Result<LoadedPlan> {
        let raw: RawPlan = serde_json::from_str(plan_json)?;

        if raw.version != PLAN_VERSION {
            return Err(Error::Plan(format!(
                "unsupported plan version `{}`, expected `{PLAN_VERSION}`",
                raw.version
            )));
        }

        // Plan-scoped template validation (§4.3): a variable counts as "used" if any
        // inline prompt in the plan references it, not just the one being resolved.
        let inline_prompts: Vec<&str> = raw
            .nodes
            .0
            .values()
            .filter_map(|n| n.run.as_ref())
            .filter(|r| r.kind == "agent")
            .filter_map(|r| r.prompt.as_deref())
            .collect();
        template::validate(&inline_prompts, variables)?;

        let mut nodes: HashMap<String, Node> = HashMap::new();

        for (id, raw_node) in &raw.nodes.0 {
            let node = Self::resolve_node(raw_node, workspace_root, variables)
                .map_err(|e| Error::Plan(format!("node `{id}`: {e}")))?;
            nodes.insert(id.clone(), node);
        }

        // Inject or verify the built-in success/fail terminals (§3, Open Question:
        // always present regardless of whether the plan references them).
        Self::ensure_builtin_terminal(&mut nodes, "success", TerminalStatus::Success, 0)?;
        Self::ensure_builtin_terminal(&mut nodes, "fail", TerminalStatus::Failed, 1)?;

        if !nodes.contains_key(&raw.entry) {
            return Err(Error::Plan(format!(
                "entry node `{}` is not defined",
                raw.entry
            )));
        }

        for (id, node) in &nodes {
            if let Node::Executable(exec) = node {
                if exec.transitions.is_empty() {
                    return Err(Error::Plan(format!(
                        "node `{id}` has no transitions (every executable node must \
                         declare at least one)"
                    )));
                }
                for t in &exec.transitions {
                    if !nodes.contains_key(&t.to) {
                        return Err(Error::Plan(format!(
                            "node `{id}` transitions to unknown node `{}`",
                            t.to
                        )));
                    }
                }
            }
        }

        Ok(LoadedPlan {
            version: raw.version,
            entry: raw.entry,
            nodes,
            defaults: Defaults {
                agent_idle_timeout_sec: raw.defaults.agent_idle_timeout_sec,
                command_timeout_sec: raw.defaults.command_timeout_sec,
            },
            limits: Limits {
                max_iterations: raw.limits.max_iterations,
                max_same_node_hits: raw.limits.max_same_node_hits,
            },
        })
    }

    fn ensure_builtin_terminal(
        nodes: &mut HashMap<String, Node>,
        name: &str,
        default_status: TerminalStatus,
        default_exit_code: u8,
    ) -> Result<()> {
        match nodes.get(name) {
            None => {
                nodes.insert(
                    name.to_string(),
                    Node::Terminal(TerminalNode {
                        terminal_status: default_status,
                        exit_code: default_exit_code,
                        message: None,
                    }),
                );
                Ok(())
            }
            Some(Node::Terminal(_)) => Ok(()),
            Some(Node::Executable(_)) => Err(Error::Plan(format!(
                "built-in node `{name}` must be terminal"
            ))),
        }
    }

    fn resolve_node(
        raw: &RawNode,
        workspace_root: &Path,
        variables: &HashMap<String, String>,
    ) -> Result<Node> {
        if raw.terminal {
            let status = match &raw.terminal_status {
                Some(s) => parse_terminal_status(s)?,
                None => return Err(Error::Plan("terminal node missing terminal_status".into())),
            };
            return Ok(Node::Terminal(TerminalNode {
                terminal_status: status,
                exit_code: raw.exit_code.unwrap_or(0),
                message: raw.message.clone(),
            }));
        }

        if raw.terminal_status.is_some() || raw.exit_code.is_some() {
            return Err(Error::Plan(
                "terminal_status/exit_code set on a non-terminal node".into(),
            ));
        }

        let raw_run = raw
            .run
            .as_ref()
            .ok_or_else(|| Error::Plan("executable node missing `run`".into()))?;

        let run = match raw_run.kind.as_str() {
            "agent" => {
                let model = raw_run
                    .model
                    .clone()
                    .ok_or_else(|| Error::Plan("agent run missing `model`".into()))?;
                let schema_file_rel = raw_run
                    .schema_file
                    .clone()
                    .ok_or_else(|| Error::Plan("agent run missing `schema_file`".into()))?;
                let schema_file = confine(workspace_root, &schema_file_rel)?;
                let schema_text = std::fs::read_to_string(&schema_file)?;
                let decision_schema: Value = serde_json::from_str(&schema_text)?;

                let (prompt_source, prompt_file, resolved_prompt) =
                    match (&raw_run.prompt, &raw_run.prompt_file) {
                        (Some(_), Some(_)) => {
                            return Err(Error::Plan(
                                "agent run has both `prompt` and `prompt_file`".into(),
                            ))
                        }
                        (Some(inline), None) => {
                            let resolved = template::apply(inline, variables);
                            (PromptSource::Prompt, None, resolved)
                        }
                        (None, Some(file_rel)) => {
                            let file = confine(workspace_root, file_rel)?;
                            let text = std::fs::read_to_string(&file)?;
                            (PromptSource::PromptFile, Some(file), text)
                        }
                        (None, None) => {
                            return Err(Error::Plan(
                                "agent run has neither `prompt` nor `prompt_file`".into(),
                            ))
                        }
                    };

                RunSpec::Agent(AgentRun {
                    model,
                    prompt_source,
                    prompt_file,
                    resolved_prompt,
                    idle_timeout_sec: raw_run.idle_timeout_sec.unwrap_or(0),
                    decision_schema,
                    schema_file,
                })
            }
            "command" => {
                let cmd = raw_run
                    .cmd
                    .clone()
                    .ok_or_else(|| Error::Plan("command run missing `cmd`".into()))?;
                let cwd_rel = raw_run.cwd.clone().unwrap_or_else(|| ".".to_string());
                let cwd = confine(workspace_root, &cwd_rel)?;
                RunSpec::Command(CommandRun {
                    cmd,
                    cwd,
                    timeout_sec: raw_run.timeout_sec.unwrap_or(0),
                })
            }
            other => return Err(Error::Plan(format!("unknown run kind `{other}`"))),
        };

        let mut seen_to = HashSet::new();
        let mut transitions = Vec::with_capacity(raw.transitions.len());
        for t in &raw.transitions {
            let when = condlang::compile(&t.when)?;
            seen_to.insert(t.to.clone());
            transitions.push(Transition {
                when_source: t.when.clone(),
                when,
                to: t.to.clone(),
            });
        }

        Ok(Node::Executable(ExecutableNode { run, transitions }))
    }
}

pub fn resolve_idle_timeout(agent: &AgentRun, defaults: &Defaults) -> u64 {
    if agent.idle_timeout_sec > 0 {
        agent.idle_timeout_sec
    } else {
        defaults.agent_idle_timeout_sec
    }
}

pub fn resolve_command_timeout(cmd: &CommandRun, defaults: &Defaults) -> u64 {
    if cmd.timeout_sec > 0 {
        cmd.timeout_sec
    } else {
        defaults.command_timeout_sec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn write_fixture(dir: &Path) {
        std::fs::write(
            dir.join("decision.schema.json"),
            r#"{"type":"object","required":["next"],"properties":{"next":{"type":"string"}}}"#,
        )
        .unwrap();
    }

    fn minimal_plan_json() -> &'static str {
        r#"{
            "version": "v2",
            "entry": "main",
            "nodes": {
                "main": {
                    "run": {"kind": "agent", "model": "opus", "prompt": "go", "schema_file": "decision.schema.json"},
                    "transitions": [{"when": "decision.next == \"success\"", "to": "success"}]
                }
            }
        }"#
    }

    #[test]
    fn injects_missing_builtin_terminals() {
        let dir = tempdir();
        write_fixture(dir.path());
        let plan = PlanLoader::load(minimal_plan_json(), dir.path(), &HashMap::new()).unwrap();
        assert!(matches!(plan.nodes.get("success"), Some(Node::Terminal(_))));
        assert!(matches!(plan.nodes.get("fail"), Some(Node::Terminal(_))));
    }

    #[test]
    fn rejects_unknown_transition_target() {
        let dir = tempdir();
        write_fixture(dir.path());
        let json = r#"{
            "version": "v2",
            "entry": "main",
            "nodes": {
                "main": {
                    "run": {"kind": "agent", "model": "opus", "prompt": "go", "schema_file": "decision.schema.json"},
                    "transitions": [{"when": "true", "to": "nowhere"}]
                }
            }
        }"#;
        assert!(PlanLoader::load(json, dir.path(), &HashMap::new()).is_err());
    }

    #[test]
    fn rejects_empty_transitions() {
        let dir = tempdir();
        write_fixture(dir.path());
        let json = r#"{
            "version": "v2",
            "entry": "main",
            "nodes": {
                "main": {
                    "run": {"kind": "agent", "model": "opus", "prompt": "go", "schema_file": "decision.schema.json"},
                    "transitions": []
                }
            }
        }"#;
        assert!(PlanLoader::load(json, dir.path(), &HashMap::new()).is_err());
    }

    #[test]
    fn rejects_path_escaping_workspace_root() {
        let dir = tempdir();
        write_fixture(dir.path());
        let json = r#"{
            "version": "v2",
            "entry": "main",
            "nodes": {
                "main": {
                    "run": {"kind": "agent", "model": "opus", "prompt": "go", "schema_file": "../../../etc/passwd"},
                    "transitions": [{"when": "true", "to": "success"}]
                }
            }
        }"#;
        assert!(PlanLoader::load(json, dir.path(), &HashMap::new()).is_err());
    }

    #[test]
    fn existing_builtin_terminal_must_stay_terminal() {
        let dir = tempdir();
        write_fixture(dir.path());
        let json = r#"{
            "version": "v2",
            "entry": "main",
            "nodes": {
                "main": {
                    "run": {"kind": "agent", "model": "opus", "prompt": "go", "schema_file": "decision.schema.json"},
                    "transitions": [{"when": "true", "to": "success"}]
                },
                "success": {
                    "run": {"kind": "command", "cmd": "echo hi"},
                    "transitions": [{"when": "true", "to": "fail"}]
                }
            }
        }"#;
        assert!(PlanLoader::load(json, dir.path(), &HashMap::new()).is_err());
    }

    #[test]
    fn rejects_duplicate_node_id() {
        let dir = tempdir();
        write_fixture(dir.path());
        let json = r#"{
            "version": "v2",
            "entry": "main",
            "nodes": {
                "main": {
                    "run": {"kind": "agent", "model": "opus", "prompt": "go", "schema_file": "decision.schema.json"},
                    "transitions": [{"when": "true", "to": "success"}]
                },
                "main": {
                    "run": {"kind": "command", "cmd": "echo hi"},
                    "transitions": [{"when": "true", "to": "fail"}]
                }
            }
        }"#;
        assert!(PlanLoader::load(json, dir.path(), &HashMap::new()).is_err());
    }

    #[test]
    fn template_variable_used_by_one_node_does_not_reject_others() {
        let dir = tempdir();
        write_fixture(dir.path());
        let json = r#"{
            "version": "v2",
            "entry": "main",
            "nodes": {
                "main": {
                    "run": {"kind": "agent", "model": "opus", "prompt": "plain prompt, no vars", "schema_file": "decision.schema.json"},
                    "transitions": [{"when": "true", "to": "other"}]
                },
                "other": {
                    "run": {"kind": "agent", "model": "opus", "prompt": "uses {{REPO}}", "schema_file": "decision.schema.json"},
                    "transitions": [{"when": "true", "to": "success"}]
                }
            }
        }"#;
        let mut vars = HashMap::new();
        vars.insert("REPO".to_string(), "acme/widgets".to_string());
        assert!(PlanLoader::load(json, dir.path(), &vars).is_ok());
    }

    struct TempDir(PathBuf);
    impl TempDir {
        fn path(&self) -> &Path {
            &self.0
        }
    }
    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }
    fn tempdir() -> TempDir {
        let mut p = std::env::temp_dir();
        p.push(format!(
            "pipeline-core-test-{}-{}",
            std::process::id(),
            nanos()
        ));
        std::fs::create_dir_all(&p).unwrap();
        TempDir(p)
    }
    fn nanos() -> u128 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos()
    }
}
