//! The per-module `INSTALL.yaml` document and the deterministic choices made
//! from it: default mode, hardware-forced mode, step categories.

use crate::error::SpecError;
use crate::hardware::HardwareSummary;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

pub const INSTALL_SPEC_FILE: &str = "INSTALL.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallSpec {
    #[serde(default)]
    pub install_modes: Vec<String>,
    #[serde(default)]
    pub decision_matrix: DecisionMatrix,
    #[serde(default)]
    pub preconditions: Vec<Precondition>,
    #[serde(default)]
    pub install: BTreeMap<String, Vec<Step>>,
    #[serde(default)]
    pub configuration: Configuration,
    #[serde(default)]
    pub update: ScriptHook,
    #[serde(default)]
    pub uninstall: ScriptHook,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionMatrix {
    #[serde(default)]
    pub default: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub defaults: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptHook {
    #[serde(default)]
    pub script: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Precondition {
    pub id: String,
    #[serde(default)]
    pub intent: String,
    #[serde(default)]
    pub tool: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub expected: Expected,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(default)]
    pub intent: String,
    #[serde(default)]
    pub tool: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub edit: Edit,
    #[serde(default)]
    pub expected: Expected,
    #[serde(default)]
    pub idempotent: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Edit {
    #[serde(default)]
    pub template: String,
    #[serde(default)]
    pub destination: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Expected {
    #[serde(default)]
    pub equals: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub bin: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub service: String,
}

impl Expected {
    pub fn has_postcondition(&self) -> bool {
        !self.bin.trim().is_empty() || !self.unit.trim().is_empty() || !self.service.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepCategory {
    Dependency,
    Download,
    BinaryInstall,
    SourceBuild,
    Configure,
    Service,
    Verify,
}

const DEPENDENCY_MARKERS: &[&str] = &[
    "apt-get install",
    "apt install",
    "yum install",
    "dnf install",
    "apk add",
    "pip install",
    "npm install",
    "pnpm install",
    "brew install",
    "pacman -s",
    "install deps",
    "dependency",
];
const DOWNLOAD_MARKERS: &[&str] = &[
    "wget ",
    "curl ",
    "git clone",
    "git fetch",
    "gh release download",
    "aria2c",
    "rsync",
    "hf download",
    "ollama pull",
    "modelscope download",
    "download",
];
const SOURCE_BUILD_MARKERS: &[&str] = &[
    "cmake",
    "make ",
    "go build",
    "cargo build",
    "cargo install",
    "python -m build",
    "python setup.py",
    "meson compile",
    "ninja",
    "source",
];
const BINARY_MARKERS: &[&str] = &["binary", ".deb", ".rpm", "dpkg -i", "rpm -i", "install_binary"];
const VERIFY_MARKERS: &[&str] = &["verify", "health", "check ", "is-active"];

impl Step {
    /// Steps that bring up or describe a system service. Never dropped by
    /// partial step selection.
    pub fn is_load_bearing(&self) -> bool {
        !self.expected.unit.trim().is_empty() || !self.expected.service.trim().is_empty()
    }

    /// Keyword heuristic used only to describe steps to the planner.
    pub fn category(&self) -> StepCategory {
        if self.is_load_bearing() {
            return StepCategory::Service;
        }
        if self.tool.trim().eq_ignore_ascii_case("template") {
            return StepCategory::Configure;
        }

        let combined = format!("{} {} {}", self.id, self.intent, self.command)
            .trim()
            .to_lowercase();
        let matches = |markers: &[&str]| markers.iter().any(|m| combined.contains(m));

        if matches(DEPENDENCY_MARKERS) {
            StepCategory::Dependency
        } else if matches(DOWNLOAD_MARKERS) {
            StepCategory::Download
        } else if matches(SOURCE_BUILD_MARKERS) {
            StepCategory::SourceBuild
        } else if matches(BINARY_MARKERS) {
            StepCategory::BinaryInstall
        } else if matches(VERIFY_MARKERS) {
            StepCategory::Verify
        } else {
            StepCategory::Configure
        }
    }
}

/// A module directory together with its parsed install document.
#[derive(Debug, Clone)]
pub struct ModuleSpec {
    pub name: String,
    pub dir: PathBuf,
    pub spec: InstallSpec,
}

impl ModuleSpec {
    pub fn load(modules_dir: &Path, module: &str) -> Result<Self, SpecError> {
        let name = normalize_module_name(module);
        let dir = modules_dir.join(&name);
        let path = dir.join(INSTALL_SPEC_FILE);

        let raw = std::fs::read_to_string(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                SpecError::NotFound(name.clone())
            } else {
                SpecError::Io {
                    path: path.clone(),
                    source,
                }
            }
        })?;

        let spec = InstallSpec::parse(&raw).map_err(|source| SpecError::Yaml { path, source })?;
        tracing::debug!("loaded install plan for {} ({} modes)", name, spec.install.len());

        Ok(Self { name, dir, spec })
    }
}

pub fn normalize_module_name(module: &str) -> String {
    module.trim().to_lowercase()
}

impl InstallSpec {
    pub fn parse(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    /// `decision_matrix.default`, then the first listed mode, then any mode.
    pub fn default_mode(&self) -> String {
        let declared = self.decision_matrix.default.trim();
        if !declared.is_empty() {
            return declared.to_string();
        }
        if let Some(first) = self.install_modes.first() {
            return first.trim().to_string();
        }
        self.install.keys().next().cloned().unwrap_or_default()
    }

    pub fn available_modes(&self) -> Vec<String> {
        self.install_modes
            .iter()
            .chain(self.install.keys())
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn steps_for(&self, mode: &str) -> &[Step] {
        self.install.get(mode).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Template variables from `configuration.defaults`, rendered as strings.
    pub fn template_vars(&self) -> BTreeMap<String, String> {
        self.configuration
            .defaults
            .iter()
            .filter_map(|(key, value)| {
                let rendered = match value {
                    serde_yaml::Value::Null => return None,
                    serde_yaml::Value::String(s) => s.clone(),
                    serde_yaml::Value::Bool(b) => b.to_string(),
                    serde_yaml::Value::Number(n) => n.to_string(),
                    other => serde_yaml::to_string(other).ok()?.trim().to_string(),
                };
                Some((key.clone(), rendered))
            })
            .collect()
    }
}

/// The mode chosen before any refinement, plus step environment.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModeSelection {
    pub mode: String,
    pub env: BTreeMap<String, String>,
    /// Set when hardware detection pinned the mode; refinement may not change it.
    pub forced: bool,
}

/// Picks the install mode. llama.cpp on a GPU host is pinned to the source
/// build with CUDA enabled.
pub fn select_mode(module: &str, spec: &InstallSpec, hw: &HardwareSummary) -> ModeSelection {
    let mut selection = ModeSelection {
        mode: spec.default_mode(),
        ..Default::default()
    };

    if module != "llama.cpp" || hw.gpu_name.trim().is_empty() || !spec.install.contains_key("source") {
        return selection;
    }

    selection.mode = "source".to_string();
    selection.forced = true;
    selection.env.insert("LLAMA_CUDA".to_string(), "1".to_string());
    if let Some(archs) = detect_cuda_archs(&hw.gpu_name) {
        selection.env.insert("LLAMA_CUDA_ARCHS".to_string(), archs.to_string());
    }
    tracing::info!("GPU {} detected, forcing source build for {}", hw.gpu_name, module);
    selection
}

pub fn detect_cuda_archs(gpu_name: &str) -> Option<&'static str> {
    let name = gpu_name.trim().to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| name.contains(m));
    if has(&["v100"]) {
        Some("70")
    } else if has(&["a100"]) {
        Some("80")
    } else if has(&["h100"]) {
        Some("90")
    } else if has(&["a10"]) {
        Some("86")
    } else if has(&["4090", "4080", "4070"]) {
        Some("89")
    } else if has(&["3090", "3080", "3070"]) {
        Some("86")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: &str = r#"
install_modes: [binary, source]
decision_matrix:
  default: binary
preconditions:
  - id: has-bash
    tool: shell
    command: "echo ok"
    expected:
      equals: ok
install:
  binary:
    - id: fetch
      tool: shell
      command: "curl -L -o llama.tgz https://example.com/llama.tgz"
    - id: unpack
      tool: shell
      command: "tar xzf llama.tgz"
      expected:
        bin: llama-server
    - id: unit
      tool: template
      edit:
        template: templates/llama.service.tmpl
        destination: out/llama.service
      expected:
        unit: out/llama.service
  source:
    - id: deps
      tool: shell
      command: "apt-get install -y cmake"
    - id: build
      tool: shell
      command: "cmake -B build && cmake --build build"
configuration:
  defaults:
    port: 8080
    host: 0.0.0.0
    empty: ~
"#;

    #[test]
    fn test_parse_and_default_mode() {
        let spec = InstallSpec::parse(SPEC).unwrap();
        assert_eq!(spec.default_mode(), "binary");
        assert_eq!(spec.available_modes(), vec!["binary", "source"]);
        assert_eq!(spec.steps_for("binary").len(), 3);
        assert!(spec.steps_for("docker").is_empty());
        assert_eq!(spec.preconditions[0].expected.equals, "ok");
    }

    #[test]
    fn test_default_mode_fallbacks() {
        let mut spec = InstallSpec::parse(SPEC).unwrap();
        spec.decision_matrix.default.clear();
        assert_eq!(spec.default_mode(), "binary");
        spec.install_modes.clear();
        assert_eq!(spec.default_mode(), "binary");
    }

    #[test]
    fn test_template_vars() {
        let spec = InstallSpec::parse(SPEC).unwrap();
        let vars = spec.template_vars();
        assert_eq!(vars.get("port").map(String::as_str), Some("8080"));
        assert_eq!(vars.get("host").map(String::as_str), Some("0.0.0.0"));
        assert!(!vars.contains_key("empty"));
    }

    #[test]
    fn test_step_categories() {
        let spec = InstallSpec::parse(SPEC).unwrap();
        let binary = spec.steps_for("binary");
        assert_eq!(binary[0].category(), StepCategory::Download);
        assert_eq!(binary[2].category(), StepCategory::Service);
        assert!(binary[2].is_load_bearing());
        let source = spec.steps_for("source");
        assert_eq!(source[0].category(), StepCategory::Dependency);
        assert_eq!(source[1].category(), StepCategory::SourceBuild);
    }

    #[test]
    fn test_forced_source_mode_for_gpu_llama() {
        let spec = InstallSpec::parse(SPEC).unwrap();
        let hw = HardwareSummary {
            gpu_name: "Tesla V100-SXM2-16GB".to_string(),
            gpu_count: 1,
            ..Default::default()
        };
        let selection = select_mode("llama.cpp", &spec, &hw);
        assert!(selection.forced);
        assert_eq!(selection.mode, "source");
        assert_eq!(selection.env.get("LLAMA_CUDA_ARCHS").map(String::as_str), Some("70"));

        let selection = select_mode("vllm", &spec, &hw);
        assert!(!selection.forced);
        assert_eq!(selection.mode, "binary");
    }

    #[test]
    fn test_cuda_archs() {
        assert_eq!(detect_cuda_archs("NVIDIA A10"), Some("86"));
        assert_eq!(detect_cuda_archs("NVIDIA GeForce RTX 4090"), Some("89"));
        assert_eq!(detect_cuda_archs("AMD MI300"), None);
    }

    #[test]
    fn test_missing_module_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = ModuleSpec::load(dir.path(), "Nope").unwrap_err();
        assert!(matches!(err, SpecError::NotFound(ref m) if m == "nope"));
        assert!(err.to_string().contains("not found"));
    }
}
