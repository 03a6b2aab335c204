//! Content collaborators for the orchestrator.
//!
//! The arena does not know where identity, facts, or task state live. Hosts
//! implement [`ContextSources`]; [`collect_candidates`] turns what they return
//! into zone-tagged [`InjectionCandidate`]s.

use crate::context::arena::{InjectionCandidate, InjectionPriority};
use crate::context::zone::Zone;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Most recent tool failures offered per turn.
pub const RECENT_FAILURE_LIMIT: usize = 5;

// ── Source data ───────────────────────────────────────────────────

/// A fact the agent has established about its environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TruthFact {
    pub id: String,
    /// One-line statement, used in the ledger.
    pub summary: String,
    /// Supporting detail, used in the facts block.
    #[serde(default)]
    pub detail: Option<String>,
    /// Resolved facts are no longer injected.
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TruthState {
    #[serde(default)]
    pub facts: Vec<TruthFact>,
}

impl TruthState {
    pub fn active(&self) -> impl Iterator<Item = &TruthFact> {
        self.facts.iter().filter(|f| f.active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Blocked,
    Done,
}

impl TaskStatus {
    fn marker(self) -> &'static str {
        match self {
            TaskStatus::Pending => "[ ]",
            TaskStatus::InProgress => "[~]",
            TaskStatus::Blocked => "[!]",
            TaskStatus::Done => "[x]",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TaskItem {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TaskState {
    #[serde(default)]
    pub goal: Option<String>,
    #[serde(default)]
    pub items: Vec<TaskItem>,
    #[serde(default)]
    pub blockers: Vec<String>,
}

impl TaskState {
    pub fn is_empty(&self) -> bool {
        self.goal.is_none() && self.items.is_empty() && self.blockers.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ToolFailure {
    pub tool_name: String,
    pub error: String,
    #[serde(default)]
    pub turn: Option<u32>,
}

// ── Collaborator trait ────────────────────────────────────────────

/// Host-provided content for each zone.
///
/// Only the truth, task, and failure accessors are required. The remaining
/// zones are empty unless overridden.
pub trait ContextSources {
    /// Clean the raw user prompt before it is used as a recall query.
    fn sanitize_input(&self, prompt: &str) -> String {
        sanitize_prompt(prompt)
    }

    fn truth_state(&self, session_id: &str) -> TruthState;

    fn task_state(&self, session_id: &str) -> TaskState;

    /// Most recent failures first, at most `limit`.
    fn recent_tool_failures(&self, session_id: &str, limit: usize) -> Vec<ToolFailure>;

    fn build_task_state_block(&self, state: &TaskState) -> String {
        format_task_state(state)
    }

    fn identity(&self, _session_id: &str) -> Option<String> {
        None
    }

    fn working_memory(&self, _session_id: &str, _prompt: &str) -> Option<String> {
        None
    }

    fn external_recall(&self, _session_id: &str, _prompt: &str) -> Option<String> {
        None
    }
}

/// Strip control characters (keeping newlines and tabs) and trim.
pub fn sanitize_prompt(prompt: &str) -> String {
    prompt
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect::<String>()
        .trim()
        .to_string()
}

// ── Block formatting ──────────────────────────────────────────────

fn section(heading: &str, body: &str) -> String {
    format!("## {heading}\n\n{body}")
}

/// Default task state block: goal, checklist, blockers.
pub fn format_task_state(state: &TaskState) -> String {
    if state.is_empty() {
        return String::new();
    }
    let mut lines = Vec::new();
    if let Some(goal) = &state.goal {
        lines.push(format!("Goal: {goal}"));
    }
    for item in &state.items {
        lines.push(format!("{} {} ({})", item.status.marker(), item.title, item.id));
    }
    for blocker in &state.blockers {
        lines.push(format!("Blocker: {blocker}"));
    }
    section("Task State", &lines.join("\n"))
}

fn format_ledger(truth: &TruthState) -> String {
    let lines: Vec<String> = truth
        .active()
        .map(|f| format!("- [{}] {}", f.id, f.summary))
        .collect();
    if lines.is_empty() {
        return String::new();
    }
    section("Truth Ledger", &lines.join("\n"))
}

fn format_facts(truth: &TruthState) -> String {
    let lines: Vec<String> = truth
        .active()
        .filter_map(|f| f.detail.as_ref().map(|d| format!("- [{}] {d}", f.id)))
        .collect();
    if lines.is_empty() {
        return String::new();
    }
    section("Truth Facts", &lines.join("\n"))
}

fn format_failures(failures: &[ToolFailure]) -> String {
    if failures.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = failures
        .iter()
        .map(|f| match f.turn {
            Some(turn) => format!("- {} (turn {turn}): {}", f.tool_name, f.error),
            None => format!("- {}: {}", f.tool_name, f.error),
        })
        .collect();
    section("Recent Tool Failures", &lines.join("\n"))
}

/// Build this turn's candidates from the collaborators. Empty blocks are
/// left out.
pub fn collect_candidates(
    sources: &dyn ContextSources,
    session_id: &str,
    prompt: &str,
) -> Vec<InjectionCandidate> {
    let truth = sources.truth_state(session_id);
    let task = sources.task_state(session_id);
    let failures = sources.recent_tool_failures(session_id, RECENT_FAILURE_LIMIT);

    let mut out = Vec::new();
    let mut push = |candidate: InjectionCandidate| {
        if !candidate.content.trim().is_empty() {
            out.push(candidate);
        }
    };

    if let Some(identity) = sources.identity(session_id) {
        push(
            InjectionCandidate::new("identity", "main", Zone::Identity, identity)
                .with_priority(InjectionPriority::Critical)
                .once_per_session(),
        );
    }
    push(
        InjectionCandidate::new("truth", "ledger", Zone::TruthLedger, format_ledger(&truth))
            .with_priority(InjectionPriority::Critical),
    );
    push(
        InjectionCandidate::new("truth", "facts", Zone::TruthFacts, format_facts(&truth))
            .with_priority(InjectionPriority::High),
    );
    push(
        InjectionCandidate::new(
            "task",
            "state",
            Zone::TaskState,
            sources.build_task_state_block(&task),
        )
        .with_priority(InjectionPriority::High),
    );
    push(
        InjectionCandidate::new(
            "tool_failures",
            "recent",
            Zone::RecentFailures,
            format_failures(&failures),
        )
        .with_priority(InjectionPriority::High),
    );
    if let Some(memory) = sources.working_memory(session_id, prompt) {
        push(InjectionCandidate::new(
            "memory",
            "working",
            Zone::WorkingMemory,
            section("Working Memory", &memory),
        ));
    }
    if let Some(recall) = sources.external_recall(session_id, prompt) {
        push(InjectionCandidate::new(
            "recall",
            "external",
            Zone::ExternalRecall,
            section("Recalled Context", &recall),
        ));
    }
    out
}

// ── Static sources ────────────────────────────────────────────────

/// Fixed content for every session. Used by the CLI simulator and tests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct StaticSources {
    pub identity: Option<String>,
    pub truth: TruthState,
    pub task: TaskState,
    /// Oldest first.
    pub failures: Vec<ToolFailure>,
    pub working_memory: Option<String>,
    pub external_recall: Option<String>,
}

impl ContextSources for StaticSources {
    fn truth_state(&self, _session_id: &str) -> TruthState {
        self.truth.clone()
    }

    fn task_state(&self, _session_id: &str) -> TaskState {
        self.task.clone()
    }

    fn recent_tool_failures(&self, _session_id: &str, limit: usize) -> Vec<ToolFailure> {
        self.failures.iter().rev().take(limit).cloned().collect()
    }

    fn identity(&self, _session_id: &str) -> Option<String> {
        self.identity.clone()
    }

    fn working_memory(&self, _session_id: &str, _prompt: &str) -> Option<String> {
        self.working_memory.clone()
    }

    fn external_recall(&self, _session_id: &str, _prompt: &str) -> Option<String> {
        self.external_recall.clone()
    }
}
