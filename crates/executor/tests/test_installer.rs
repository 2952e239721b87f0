use async_trait::async_trait;
use las_core::{HardwareSummary, PlanSource, PlannerOptions};
use las_executor::{InstallError, Installer};
use las_providers::{GenerateRequest, GenerateResponse, LLMProvider, ProviderError};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

struct FixedProvider {
    reply: Result<String, u16>,
}

#[async_trait]
impl LLMProvider for FixedProvider {
    async fn generate(&self, _request: &GenerateRequest) -> Result<GenerateResponse, ProviderError> {
        match &self.reply {
            Ok(text) => Ok(GenerateResponse { text: text.clone() }),
            Err(status) => Err(ProviderError::Api {
                status: *status,
                body: "unavailable".to_string(),
            }),
        }
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

const DEMO: &str = r#"
install_modes: [native]
decision_matrix:
  default: native
preconditions:
  - id: has-bash
    tool: shell
    command: "echo ok"
    expected:
      equals: ok
install:
  native:
    - id: first
      tool: shell
      command: "mkdir -p out && echo one > out/first"
    - id: second
      tool: shell
      command: "echo two > out/second"
    - id: unit
      tool: template
      edit:
        template: unit.tmpl
        destination: out/demo.service
      expected:
        unit: out/demo.service
configuration:
  defaults:
    port: 9000
"#;

fn write_module(root: &Path, name: &str, spec: &str) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("INSTALL.yaml"), spec).unwrap();
    std::fs::write(dir.join("unit.tmpl"), "port={{port}} host={{host|default(\"0.0.0.0\")}}\n").unwrap();
}

fn setup(spec: &str) -> TempDir {
    let temp = TempDir::new().unwrap();
    write_module(temp.path(), "demo", spec);
    temp
}

fn enabled(strict: bool) -> PlannerOptions {
    PlannerOptions {
        enabled: true,
        strict,
        timeout_seconds: 5,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_missing_module_is_not_found() {
    let temp = TempDir::new().unwrap();
    let installer = Installer::new(temp.path(), HardwareSummary::default());
    let err = installer.install("ghost").await.unwrap_err();
    assert!(matches!(err, InstallError::Spec(_)));
    assert!(err.to_string().contains("not found"));

    assert!(matches!(installer.install("  ").await.unwrap_err(), InstallError::EmptyName));
}

#[tokio::test]
async fn test_static_install_runs_every_step() {
    let temp = setup(DEMO);
    let installer = Installer::new(temp.path(), HardwareSummary::default());

    let report = installer.install("Demo").await.unwrap();
    assert_eq!(report.module, "demo");
    assert_eq!(report.mode, "native");
    assert_eq!(report.source, PlanSource::Static);
    assert_eq!(report.steps, vec!["first", "second", "unit"]);

    let out = temp.path().join("demo/out");
    assert!(out.join("first").exists());
    assert!(out.join("second").exists());
    assert_eq!(
        std::fs::read_to_string(out.join("demo.service")).unwrap(),
        "port=9000 host=0.0.0.0\n"
    );
}

#[tokio::test]
async fn test_failed_precondition_runs_nothing() {
    let temp = setup(&DEMO.replace("equals: ok", "equals: ready"));
    let installer = Installer::new(temp.path(), HardwareSummary::default());

    let err = installer.install("demo").await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "precondition has-bash failed: expected \"ready\" but got \"ok\""
    );
    assert!(!temp.path().join("demo/out").exists());
}

#[tokio::test]
async fn test_failed_step_aborts_with_step_id() {
    let temp = setup(&DEMO.replace("echo two > out/second", "echo broken >&2; exit 7"));
    let installer = Installer::new(temp.path(), HardwareSummary::default());

    let err = installer.install("demo").await.unwrap_err();
    assert_eq!(err.to_string(), "install step second failed: exit status 7: broken");
    assert!(temp.path().join("demo/out/first").exists());
    assert!(!temp.path().join("demo/out/demo.service").exists());
}

#[tokio::test]
async fn test_declared_exit_code_is_compared_exactly() {
    let spec = r#"
install:
  native:
    - id: probe
      tool: shell
      command: "exit 3"
      expected:
        exit_code: 3
    - id: strict-zero
      tool: shell
      command: "true"
      expected:
        exit_code: 1
"#;
    let temp = setup(spec);
    let installer = Installer::new(temp.path(), HardwareSummary::default());
    let err = installer.install("demo").await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "install step strict-zero failed: expected exit code 1 but got 0"
    );
}

#[tokio::test]
async fn test_unsupported_tool() {
    let spec = r#"
install:
  native:
    - id: pkg
      tool: apt
      command: "llama"
"#;
    let temp = setup(spec);
    let installer = Installer::new(temp.path(), HardwareSummary::default());
    let err = installer.install("demo").await.unwrap_err();
    assert_eq!(err.to_string(), "install step pkg uses unsupported tool \"apt\"");
}

#[tokio::test]
async fn test_refined_subset_keeps_service_step() {
    let temp = setup(DEMO);
    let provider: Arc<dyn LLMProvider> = Arc::new(FixedProvider {
        reply: Ok(r#"Sure: {"mode":"native","steps":["first"],"reason":"skip second"}"#.to_string()),
    });
    let installer =
        Installer::new(temp.path(), HardwareSummary::default()).with_planner(Some(provider), enabled(false));

    let resolved = installer.plan("demo").await.unwrap();
    assert_eq!(resolved.plan.source, PlanSource::Llm);
    assert_eq!(resolved.step_ids(), "first,unit");

    let report = installer.install("demo").await.unwrap();
    assert_eq!(report.steps, vec!["first", "unit"]);
    assert!(!temp.path().join("demo/out/second").exists());
    assert!(temp.path().join("demo/out/demo.service").exists());
}

#[tokio::test]
async fn test_unknown_step_falls_back_to_baseline() {
    let temp = setup(DEMO);
    let provider: Arc<dyn LLMProvider> = Arc::new(FixedProvider {
        reply: Ok(r#"{"steps":["first","rm-rf"]}"#.to_string()),
    });
    let installer =
        Installer::new(temp.path(), HardwareSummary::default()).with_planner(Some(provider), enabled(false));

    let resolved = installer.plan("demo").await.unwrap();
    assert_eq!(resolved.plan.source, PlanSource::Static);
    assert_eq!(resolved.step_ids(), "first,second,unit");
    assert!(resolved.plan.reason.contains("rm-rf"));
}

#[tokio::test]
async fn test_strict_planner_failure_is_fatal() {
    let temp = setup(DEMO);
    let provider: Arc<dyn LLMProvider> = Arc::new(FixedProvider { reply: Err(503) });
    let installer =
        Installer::new(temp.path(), HardwareSummary::default()).with_planner(Some(provider), enabled(true));

    let err = installer.install("demo").await.unwrap_err();
    let message = err.to_string();
    assert!(message.starts_with("install planner strict mode:"), "{}", message);
    assert!(message.contains("status 503"));
    assert!(!temp.path().join("demo/out").exists());
}

#[tokio::test]
async fn test_update_and_uninstall_scripts() {
    let spec = format!("{}update:\n  script: update.sh\nuninstall:\n  script: missing.sh\n", DEMO);
    let temp = setup(&spec);
    std::fs::write(temp.path().join("demo/update.sh"), "echo updated > updated.txt\n").unwrap();
    let installer = Installer::new(temp.path(), HardwareSummary::default());

    installer.update("demo").await.unwrap();
    assert!(temp.path().join("demo/updated.txt").exists());
    assert!(!temp.path().join("demo/out").exists());

    let err = installer.uninstall("demo").await.unwrap_err();
    assert_eq!(err.to_string(), "uninstall script not found for module \"demo\"");

    std::fs::write(temp.path().join("demo/update.sh"), "echo nope; exit 2\n").unwrap();
    let err = installer.update("demo").await.unwrap_err();
    assert_eq!(err.to_string(), "module \"demo\" update failed: exit status 2: nope");
}

#[tokio::test]
async fn test_update_without_script_reinstalls() {
    let temp = setup(DEMO);
    let installer = Installer::new(temp.path(), HardwareSummary::default());
    installer.update("demo").await.unwrap();
    assert!(temp.path().join("demo/out/demo.service").exists());
}

#[tokio::test]
async fn test_check_validates_postconditions_only() {
    let temp = setup(DEMO);
    let installer = Installer::new(temp.path(), HardwareSummary::default());

    let err = installer.check("demo").await.unwrap_err();
    assert!(err.to_string().contains("check failed at step unit"));
    assert!(!temp.path().join("demo/out/first").exists());

    installer.install("demo").await.unwrap();
    let report = installer.check("demo").await.unwrap();
    assert_eq!(report.mode, "native");
    assert_eq!(report.checked, vec!["unit"]);
}
