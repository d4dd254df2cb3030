//! Pipeline definitions (TOML).
//!
//! ```toml
//! name = "mcn-subpipe"
//! required_env = ["FREESURFER_HOME"]
//!
//! [vars]
//! out_stem = "asl"
//!
//! [[stage]]
//! name = "mask"
//! command = "mris_calc -o {{ out_stem }}B0Mask.nii b0.nii gt 0"
//! preconditions = [{ kind = "files_exist", paths = ["b0.nii"] }]
//! postconditions = [{ kind = "files_exist", paths = ["{{ out_stem }}B0Mask.nii"] }]
//!
//! [[stage]]
//! name = "convert"
//! command = "mri_convert {{ out_stem }}B0Mask.nii {{ out_stem }}B0Mask.img"
//! preconditions = { after = "mask" }
//! ```
//!
//! String arguments of predicates are rendered against the vars when the
//! pipeline is built; commands are rendered when they run.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::core::template::TemplateVars;
use crate::core::types::DispatchMode;
use crate::error::FatalError;
use crate::fanout::TemplateDispatch;
use crate::pipeline::Pipeline;
use crate::predicate::Predicate;
use crate::stage::Stage;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineDef {
    pub name: String,
    /// Pipeline-wide fatal policy.
    #[serde(default = "default_fatal")]
    pub fatal: bool,
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub required_env: Vec<String>,
    #[serde(default)]
    pub required_executables: Vec<String>,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default, rename = "stage")]
    pub stages: Vec<StageDef>,
}

fn default_fatal() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageDef {
    pub name: String,
    pub command: Option<String>,
    pub fan_out: Option<FanOutDef>,
    #[serde(default)]
    pub preconditions: Conditions,
    #[serde(default)]
    pub postconditions: Conditions,
    pub fatal: Option<bool>,
    pub log_file: Option<PathBuf>,
    pub echo: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FanOutDef {
    pub command: String,
    #[serde(default)]
    pub mode: DispatchMode,
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    pub outdir: Option<String>,
    /// Cluster tag; the stage name when unset.
    pub tag: Option<String>,
    /// Targets for this stage only.
    pub targets: Option<Vec<String>>,
}

impl FanOutDef {
    fn dispatch(&self) -> TemplateDispatch {
        TemplateDispatch {
            command: self.command.clone(),
            mode: self.mode,
            inputs: self.inputs.clone(),
            outdir: self.outdir.clone(),
        }
    }
}

/// A predicate list, or a reference to an earlier stage's postconditions.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Conditions {
    List(Vec<Predicate>),
    After { after: String },
}

impl Default for Conditions {
    fn default() -> Self {
        Conditions::List(Vec::new())
    }
}

/// Read and parse a definition file.
pub fn load_definition(path: &Path) -> Result<PipelineDef> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read pipeline definition {}", path.display()))?;
    let def: PipelineDef = toml::from_str(&contents)
        .with_context(|| format!("parse pipeline definition {}", path.display()))?;
    debug!(name = %def.name, stages = def.stages.len(), "definition loaded");
    Ok(def)
}

impl PipelineDef {
    /// Build the pipeline. `overrides` replace definition vars of the same name.
    pub fn build(self, overrides: &BTreeMap<String, String>) -> Result<Pipeline, FatalError> {
        let mut vars = self.vars;
        vars.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        let template_vars = TemplateVars::from_strings(&vars);

        let mut pipeline = Pipeline::new(self.name)
            .with_fatal_on_failure(self.fatal)
            .with_vars(vars)
            .with_targets(self.targets);
        if let Some(workdir) = self.workdir {
            pipeline = pipeline.with_workdir(workdir);
        }
        for var in self.required_env {
            pipeline = pipeline.require_env(var);
        }
        for exe in self.required_executables {
            pipeline = pipeline.require_executable(exe);
        }

        for def in self.stages {
            let stage = build_stage(def, &pipeline, &template_vars)?;
            pipeline.add_stage(stage)?;
        }
        Ok(pipeline)
    }
}

fn build_stage(def: StageDef, built: &Pipeline, vars: &TemplateVars) -> Result<Stage, FatalError> {
    let mut stage = match (def.command, def.fan_out) {
        (Some(command), None) => Stage::command(&def.name, command),
        (None, Some(fan_out)) => {
            let mut stage = Stage::fan_out(&def.name, fan_out.dispatch());
            if let Some(tag) = fan_out.tag {
                stage = stage.with_tag(tag);
            }
            if let Some(targets) = fan_out.targets {
                stage = stage.with_targets(targets);
            }
            stage
        }
        (Some(_), Some(_)) => {
            return Err(FatalError::configuration(format!(
                "stage '{}' has both command and fan_out",
                def.name
            )));
        }
        (None, None) => {
            return Err(FatalError::configuration(format!(
                "stage '{}' has no action",
                def.name
            )));
        }
    };

    stage = match def.preconditions {
        Conditions::List(list) => stage.with_preconditions(render_all(&list, vars)?),
        Conditions::After { after } => {
            let upstream = built.stage(&after).ok_or_else(|| {
                FatalError::configuration(format!(
                    "stage '{}' chains after unknown stage '{after}'",
                    def.name
                ))
            })?;
            stage.preconditions_from(upstream)?
        }
    };
    stage = match def.postconditions {
        Conditions::List(list) => stage.with_postconditions(render_all(&list, vars)?),
        Conditions::After { after } => {
            return Err(FatalError::configuration(format!(
                "stage '{}': postconditions cannot chain after '{after}'",
                def.name
            )));
        }
    };

    if let Some(fatal) = def.fatal {
        stage = stage.fatal(fatal);
    }
    if let Some(path) = def.log_file {
        stage = stage.log_to(path);
    }
    if let Some(echo) = def.echo {
        stage = stage.echo(echo);
    }
    Ok(stage)
}

fn render_all(predicates: &[Predicate], vars: &TemplateVars) -> Result<Vec<Predicate>, FatalError> {
    predicates.iter().map(|p| p.render(vars)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FatalKind;
    use crate::stage::Action;

    const MCN: &str = r#"
name = "mcn-subpipe"
required_env = ["FREESURFER_HOME"]

[vars]
out_stem = "asl"

[[stage]]
name = "mask"
command = "mris_calc -o {{ out_stem }}B0Mask.nii b0.nii gt 0"
preconditions = [{ kind = "files_exist", paths = ["b0.nii", "{{ out_stem }}.nii"] }]
postconditions = [{ kind = "files_exist", paths = ["{{ out_stem }}B0Mask.nii"] }]

[[stage]]
name = "convert"
command = "mri_convert {{ out_stem }}B0Mask.nii {{ out_stem }}B0Mask.img"
preconditions = { after = "mask" }
fatal = false

[[stage]]
name = "bet"
fan_out = { command = "bet.py {{ inputs.b0 }}", mode = "cluster", inputs = { b0 = "b0.nii" }, tag = "bet-batch" }
postconditions = [{ kind = "barrier", tag = "bet-batch" }]
"#;

    fn parse(text: &str) -> PipelineDef {
        toml::from_str(text).expect("parse definition")
    }

    #[test]
    fn builds_stages_in_order_with_rendered_predicates() {
        let pipeline = parse(MCN).build(&BTreeMap::new()).expect("build");

        let names: Vec<&str> = pipeline.stages().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["mask", "convert", "bet"]);
        assert_eq!(
            pipeline.stages()[0].preconditions(),
            &[Predicate::files_exist(["b0.nii", "asl.nii"])]
        );
        assert_eq!(
            pipeline.stages()[0].postconditions(),
            &[Predicate::files_exist(["aslB0Mask.nii"])]
        );
    }

    #[test]
    fn after_reuses_upstream_postconditions() {
        let pipeline = parse(MCN).build(&BTreeMap::new()).expect("build");
        let mask = pipeline.stage("mask").expect("mask");
        let convert = pipeline.stage("convert").expect("convert");
        assert_eq!(convert.preconditions(), mask.postconditions());
        assert_eq!(convert.fatal_override(), Some(false));
    }

    #[test]
    fn fan_out_keeps_tag_and_dispatch() {
        let pipeline = parse(MCN).build(&BTreeMap::new()).expect("build");
        let bet = pipeline.stage("bet").expect("bet");
        assert_eq!(bet.tag(), "bet-batch");
        assert!(matches!(bet.action(), Action::FanOut(_)));
    }

    #[test]
    fn overrides_replace_vars() {
        let overrides = BTreeMap::from([("out_stem".to_string(), "pcasl".to_string())]);
        let pipeline = parse(MCN).build(&overrides).expect("build");
        assert_eq!(
            pipeline.stages()[0].postconditions(),
            &[Predicate::files_exist(["pcaslB0Mask.nii"])]
        );
    }

    #[test]
    fn after_unknown_stage_is_configuration_error() {
        let def = parse(
            r#"
name = "p"
[[stage]]
name = "convert"
command = "true"
preconditions = { after = "mask" }
"#,
        );
        let err = def.build(&BTreeMap::new()).unwrap_err();
        assert_eq!(err.kind, FatalKind::ConfigurationError);
    }

    #[test]
    fn stage_needs_exactly_one_action() {
        let none = parse("name = \"p\"\n[[stage]]\nname = \"a\"\n");
        assert_eq!(
            none.build(&BTreeMap::new()).unwrap_err().kind,
            FatalKind::ConfigurationError
        );
        let both = parse(
            "name = \"p\"\n[[stage]]\nname = \"a\"\ncommand = \"x\"\nfan_out = { command = \"y\" }\n",
        );
        assert_eq!(
            both.build(&BTreeMap::new()).unwrap_err().kind,
            FatalKind::ConfigurationError
        );
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let def = parse(
            "name = \"p\"\n[[stage]]\nname = \"a\"\ncommand = \"x\"\n[[stage]]\nname = \"a\"\ncommand = \"y\"\n",
        );
        assert_eq!(
            def.build(&BTreeMap::new()).unwrap_err().kind,
            FatalKind::ConfigurationError
        );
    }

    #[test]
    fn undefined_var_in_predicate_is_configuration_error() {
        let def = parse(
            r#"
name = "p"
[[stage]]
name = "a"
command = "x"
preconditions = [{ kind = "files_exist", paths = ["{{ nope }}.nii"] }]
"#,
        );
        assert_eq!(
            def.build(&BTreeMap::new()).unwrap_err().kind,
            FatalKind::ConfigurationError
        );
    }

    #[test]
    fn fan_out_mode_defaults_to_local() {
        let def = parse("name = \"p\"\n[[stage]]\nname = \"a\"\nfan_out = { command = \"y\" }\n");
        let fan_out = def.stages[0].fan_out.as_ref().expect("fan_out");
        assert_eq!(fan_out.dispatch().mode, DispatchMode::Local);
    }

    #[test]
    fn load_reads_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("pipeline.toml");
        fs::write(&path, MCN).expect("write");
        let def = load_definition(&path).expect("load");
        assert_eq!(def.name, "mcn-subpipe");
        assert_eq!(def.required_env, vec!["FREESURFER_HOME"]);
    }
}
