//! Planning engine for the local AI stack: hardware-derived baselines, the
//! install document model, optional LLM refinement of all three plan kinds,
//! and model-directory inspection for the serving runtimes.

pub mod baseline;
pub mod error;
pub mod hardware;
pub mod install_spec;
pub mod refine;
pub mod runtime;

pub use error::{ModelError, PersistError, PlanError, SpecError};
pub use hardware::HardwareSummary;
pub use install_spec::{select_mode, InstallSpec, ModeSelection, ModuleSpec, Step, StepCategory};
pub use refine::config::{build_static_plan, ConfigPlan, ConfigRefinement};
pub use refine::install::{ensure_service_steps, InstallPlan, InstallRefinement};
pub use refine::run::{LlamaRefinement, RunContext, VllmRefinement};
pub use refine::{refine, PlanSource, PlannerOptions, Refined, Refinement};
pub use runtime::{ModelFiles, RuntimeKind};
