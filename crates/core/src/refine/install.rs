use super::{to_prompt_json, Candidate, Refinement};
use crate::error::{PlanError, SpecError};
use crate::install_spec::{InstallSpec, ModeSelection, Precondition, Step, StepCategory};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const INSTALL_PLANNER_VERSION: &str = "p1.1";

/// Ordered steps for one install mode.
#[derive(Debug, Clone, PartialEq)]
pub struct InstallPlan {
    pub mode: String,
    pub steps: Vec<Step>,
}

impl InstallPlan {
    /// Every step of the selected mode, in document order.
    pub fn baseline(module: &str, spec: &InstallSpec, selection: &ModeSelection) -> Result<Self, SpecError> {
        let steps = spec.steps_for(&selection.mode);
        if steps.is_empty() {
            return Err(SpecError::EmptyMode {
                module: module.to_string(),
                mode: selection.mode.clone(),
            });
        }
        Ok(Self {
            mode: selection.mode.clone(),
            steps: steps.to_vec(),
        })
    }

    pub fn step_ids(&self) -> Vec<&str> {
        self.steps
            .iter()
            .map(|s| s.id.trim())
            .filter(|id| !id.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstallCandidate {
    #[serde(default)]
    pub mode: String,
    #[serde(default, alias = "selected_steps")]
    pub steps: Vec<String>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub risk_level: String,
    #[serde(default)]
    pub fallback_hint: String,
}

impl Candidate for InstallCandidate {
    fn reason(&self) -> &str {
        &self.reason
    }
}

impl InstallCandidate {
    pub fn risk(&self) -> &'static str {
        match self.risk_level.trim().to_lowercase().as_str() {
            "low" => "low",
            "high" => "high",
            _ => "medium",
        }
    }

    /// Trimmed ids, blanks and duplicates dropped, first occurrence kept.
    pub fn step_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.steps
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty() && seen.insert(*id))
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Serialize)]
pub struct StepHint {
    pub id: String,
    pub category: StepCategory,
    pub tool: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub intent: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub command: String,
}

impl From<&Step> for StepHint {
    fn from(step: &Step) -> Self {
        Self {
            id: step.id.trim().to_string(),
            category: step.category(),
            tool: step.tool.trim().to_string(),
            intent: step.intent.trim().to_string(),
            command: step.command.trim().to_string(),
        }
    }
}

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct CategorySummary {
    pub dependency: usize,
    pub download: usize,
    pub binary_install: usize,
    pub source_build: usize,
    pub configure: usize,
    pub service: usize,
    pub verify: usize,
}

impl CategorySummary {
    fn of(hints: &[StepHint]) -> Self {
        let mut summary = Self::default();
        for hint in hints {
            let slot = match hint.category {
                StepCategory::Dependency => &mut summary.dependency,
                StepCategory::Download => &mut summary.download,
                StepCategory::BinaryInstall => &mut summary.binary_install,
                StepCategory::SourceBuild => &mut summary.source_build,
                StepCategory::Configure => &mut summary.configure,
                StepCategory::Service => &mut summary.service,
                StepCategory::Verify => &mut summary.verify,
            };
            *slot += 1;
        }
        summary
    }
}

#[derive(Debug, Serialize)]
pub struct ModeHint {
    pub mode: String,
    pub steps: Vec<StepHint>,
    pub summary: CategorySummary,
    pub step_ids: Vec<String>,
    pub step_size: usize,
}

#[derive(Debug, Serialize)]
pub struct ConditionHint {
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub intent: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tool: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub command: String,
}

impl From<&Precondition> for ConditionHint {
    fn from(pre: &Precondition) -> Self {
        Self {
            id: pre.id.trim().to_string(),
            intent: pre.intent.trim().to_string(),
            tool: pre.tool.trim().to_string(),
            command: pre.command.trim().to_string(),
        }
    }
}

/// Read-only description of the install document handed to the planner.
#[derive(Debug, Serialize)]
pub struct PlannerHints {
    pub module_name: String,
    pub current_mode: String,
    pub available_modes: Vec<String>,
    pub current_mode_steps: Vec<StepHint>,
    pub current_mode_summary: CategorySummary,
    pub mode_catalog: Vec<ModeHint>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub preconditions: Vec<ConditionHint>,
    pub planner_version: &'static str,
}

pub struct InstallRefinement<'a> {
    pub module: &'a str,
    pub spec: &'a InstallSpec,
    pub selection: &'a ModeSelection,
}

impl<'a> InstallRefinement<'a> {
    pub fn new(module: &'a str, spec: &'a InstallSpec, selection: &'a ModeSelection) -> Self {
        Self { module, spec, selection }
    }

    pub fn hints(&self, baseline: &InstallPlan) -> PlannerHints {
        let current: Vec<StepHint> = baseline.steps.iter().map(StepHint::from).collect();
        let available_modes = self.spec.available_modes();
        let mode_catalog = available_modes
            .iter()
            .map(|mode| {
                let steps: Vec<StepHint> = self.spec.steps_for(mode).iter().map(StepHint::from).collect();
                let step_ids: Vec<String> = steps.iter().map(|h| h.id.clone()).collect();
                ModeHint {
                    mode: mode.clone(),
                    summary: CategorySummary::of(&steps),
                    step_size: step_ids.len(),
                    step_ids,
                    steps,
                }
            })
            .collect();

        PlannerHints {
            module_name: self.module.to_string(),
            current_mode: baseline.mode.clone(),
            available_modes,
            current_mode_summary: CategorySummary::of(&current),
            current_mode_steps: current,
            mode_catalog,
            preconditions: self.spec.preconditions.iter().map(ConditionHint::from).collect(),
            planner_version: INSTALL_PLANNER_VERSION,
        }
    }
}

impl Refinement for InstallRefinement<'_> {
    type Plan = InstallPlan;
    type Candidate = InstallCandidate;
    const PLANNER: &'static str = "install planner";

    fn prompt(&self, baseline: &InstallPlan) -> Result<String, PlanError> {
        let input = to_prompt_json(&self.hints(baseline))?;
        Ok(format!(
            r#"You are an install planner for LocalAIStack.
Only return valid JSON and nothing else.
Required JSON schema:
{{"mode":"<mode>","steps":["<step-id>"],"reason":"<short reason>","risk_level":"low|medium|high","fallback_hint":"<optional>"}}
Rules:
- mode must be one of available_modes.
- steps must only contain IDs listed for that selected mode.
- preserve service-related steps when relevant.
- prefer safe, idempotent execution.
- prioritize complete install path if applicable: dependency -> download -> binary_install or source_build -> configure -> verify.
Planner input:
{}"#,
            input
        ))
    }

    fn merge(&self, baseline: &InstallPlan, candidate: InstallCandidate) -> Result<InstallPlan, PlanError> {
        let mut mode = baseline.mode.clone();
        let suggested = candidate.mode.trim();
        if !suggested.is_empty() {
            let suggested = if self.selection.forced && suggested != baseline.mode {
                tracing::debug!(
                    "install planner suggested mode {} but {} is forced",
                    suggested,
                    baseline.mode
                );
                baseline.mode.as_str()
            } else {
                suggested
            };
            if !self.spec.install.contains_key(suggested) {
                return Err(PlanError::UnsupportedMode(suggested.to_string()));
            }
            mode = suggested.to_string();
        }

        let mode_steps: &[Step] = if mode == baseline.mode {
            &baseline.steps
        } else {
            self.spec.steps_for(&mode)
        };
        if mode_steps.is_empty() {
            return Err(PlanError::invalid("mode", format!("resolved mode {:?} has no steps", mode)));
        }

        let ids = candidate.step_ids();
        let known: HashSet<&str> = mode_steps.iter().map(|s| s.id.trim()).collect();
        let unknown: Vec<String> = ids.iter().filter(|id| !known.contains(id.as_str())).cloned().collect();
        if !unknown.is_empty() {
            return Err(PlanError::UnknownSteps(unknown));
        }

        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut selected: Vec<Step> = mode_steps
            .iter()
            .filter(|s| wanted.contains(s.id.trim()))
            .cloned()
            .collect();
        if selected.is_empty() {
            selected = mode_steps.to_vec();
        }

        tracing::debug!(
            "install planner candidate risk={} fallback_hint={:?}",
            candidate.risk(),
            candidate.fallback_hint
        );

        Ok(InstallPlan {
            mode,
            steps: ensure_service_steps(selected, mode_steps),
        })
    }
}

/// Re-appends any load-bearing step from `all` missing in `selected`.
pub fn ensure_service_steps(mut selected: Vec<Step>, all: &[Step]) -> Vec<Step> {
    let included: HashSet<String> = selected.iter().map(|s| s.id.clone()).collect();
    for step in all {
        if step.is_load_bearing() && !included.contains(&step.id) {
            selected.push(step.clone());
        }
    }
    selected
}
