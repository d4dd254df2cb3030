//! End-to-end pipeline scenarios against the real shell runner.
//!
//! Commands run through `sh -c` inside a temp directory; the scheduler,
//! clock and environment are scripted.

use std::fs;
use std::time::Duration;

use stagepipe::context::RunContext;
use stagepipe::core::types::{DispatchMode, StageState};
use stagepipe::error::FatalKind;
use stagepipe::fanout::TemplateDispatch;
use stagepipe::io::barrier::CancellationToken;
use stagepipe::io::config::Settings;
use stagepipe::io::log_sink::DETAIL;
use stagepipe::io::process::ShellRunner;
use stagepipe::pipeline::Pipeline;
use stagepipe::predicate::Predicate;
use stagepipe::stage::Stage;
use stagepipe::test_support::{
    Harness, ManualClock, MapEnvironment, MemorySink, ScriptedCounter, ScriptedRunner,
    tempdir_with,
};

struct ShellFixture {
    runner: ShellRunner,
    counter: ScriptedCounter,
    clock: ManualClock,
    cancel: CancellationToken,
    env: MapEnvironment,
    log: MemorySink,
    settings: Settings,
}

impl ShellFixture {
    fn new() -> Self {
        Self {
            runner: ShellRunner,
            counter: ScriptedCounter::default(),
            clock: ManualClock::new(),
            cancel: CancellationToken::new(),
            env: MapEnvironment::new(),
            log: MemorySink::new(DETAIL),
            settings: Settings::default(),
        }
    }

    fn ctx(&self) -> RunContext<'_> {
        RunContext {
            runner: &self.runner,
            counter: &self.counter,
            clock: &self.clock,
            cancel: &self.cancel,
            env: &self.env,
            log: &self.log,
            settings: &self.settings,
        }
    }
}

#[test]
fn present_inputs_run_the_action_once() {
    let temp = tempdir_with(&["b0.nii", "asl.nii"]);
    let mut pipeline = Pipeline::new("mcn-subpipe").with_workdir(temp.path());
    pipeline
        .add_stage(
            Stage::command("mask", "touch outB0Mask.nii")
                .precondition(Predicate::files_exist(["b0.nii", "asl.nii"])),
        )
        .expect("add");
    pipeline.select("0").expect("select");
    let fixture = ShellFixture::new();

    let report = pipeline.run(&fixture.ctx()).expect("run");

    assert_eq!(report.stages[0].call_count, 1);
    assert_eq!(report.stages[0].exit_code, Some(0));
    assert!(temp.path().join("outB0Mask.nii").exists());
}

#[test]
fn missing_input_is_fatal_before_the_action() {
    let temp = tempdir_with(&["b0.nii"]);
    let mut pipeline = Pipeline::new("mcn-subpipe").with_workdir(temp.path());
    pipeline
        .add_stage(
            Stage::command("mask", "touch ran")
                .precondition(Predicate::files_exist(["b0.nii", "asl.nii"])),
        )
        .expect("add");
    pipeline.select("0").expect("select");
    let fixture = ShellFixture::new();

    let err = pipeline.run(&fixture.ctx()).unwrap_err();

    assert_eq!(err.kind, FatalKind::MissingInput);
    assert_eq!(err.exit_code(), 10);
    assert_eq!(pipeline.stages()[0].call_count(), 0);
    assert!(!temp.path().join("ran").exists());
}

#[test]
fn vanished_intermediate_stops_the_chain() {
    let temp = tempdir_with(&["b0.nii"]);
    let mask = Stage::command("mask", "touch outB0Mask.nii && rm outB0Mask.nii")
        .precondition(Predicate::files_exist(["b0.nii"]))
        .postcondition(Predicate::exit_code("mask", 0));
    let convert = Stage::command("convert", "cp outB0Mask.nii outB0Mask.img")
        .precondition(Predicate::files_exist(["outB0Mask.nii"]))
        .postcondition(Predicate::files_exist(["outB0Mask.img"]));
    let filter = Stage::command("filter", "cp outB0Mask.img filtered.img")
        .preconditions_from(&convert)
        .expect("chain")
        .postcondition(Predicate::files_exist(["filtered.img"]));
    let normalize = Stage::command("normalize", "cp filtered.img normalized.img")
        .preconditions_from(&filter)
        .expect("chain");

    let mut pipeline = Pipeline::new("mcn-subpipe").with_workdir(temp.path());
    for stage in [mask, convert, filter, normalize] {
        pipeline.add_stage(stage).expect("add");
    }
    pipeline.select("0123").expect("select");
    let fixture = ShellFixture::new();

    let err = pipeline.run(&fixture.ctx()).unwrap_err();

    assert_eq!(err.kind, FatalKind::MissingInput);
    assert!(err.detail.contains("convert"));
    let report = pipeline.report();
    assert_eq!(report.stages[0].state, StageState::Complete);
    assert_eq!(report.stages[0].call_count, 1);
    assert_eq!(report.stages[1].state, StageState::PreconditionFailed);
    assert_eq!(report.stages[1].call_count, 0);
    assert_eq!(report.stages[2].call_count, 0);
    assert_eq!(report.stages[3].call_count, 0);
    assert_eq!(report.stages[2].state, StageState::Pending);
}

#[test]
fn stage_log_file_receives_child_output() {
    let temp = tempdir_with(&[]);
    let mut pipeline = Pipeline::new("p").with_workdir(temp.path());
    pipeline
        .add_stage(Stage::command("mask", "echo masking").log_to("logs/mask.log"))
        .expect("add");
    pipeline.select("all").expect("select");
    let fixture = ShellFixture::new();

    pipeline.run(&fixture.ctx()).expect("run");

    let log = fs::read_to_string(temp.path().join("logs/mask.log")).expect("read log");
    assert!(log.contains("masking"));
    assert!(fixture.log.text().contains("masking"));
}

#[test]
fn cluster_fan_out_blocks_until_scheduler_drains() {
    let temp = tempdir_with(&["s1/b0.nii", "s2/b0.nii", "s3/b0.nii"]);
    let harness = Harness::with_parts(
        ScriptedRunner::default(),
        ScriptedCounter::new(vec![3, 3, 1, 0]),
    );
    let mut pipeline = Pipeline::new("p")
        .with_workdir(temp.path())
        .with_targets(["s1", "s2", "s3"]);
    pipeline
        .add_stage(
            Stage::fan_out(
                "bet",
                TemplateDispatch::new("bet.py {{ inputs.b0 }}", DispatchMode::Cluster)
                    .with_input("b0", "b0.nii"),
            )
            .postcondition(Predicate::barrier("bet", 0)),
        )
        .expect("add");
    pipeline
        .add_stage(
            Stage::command("report", "report.sh").precondition(Predicate::barrier("bet", 0)),
        )
        .expect("add");
    pipeline.select("all").expect("select");

    let report = pipeline.run(&harness.ctx()).expect("run");

    let events = harness.events.events();
    let first_poll = events
        .iter()
        .position(|event| event.starts_with("poll"))
        .expect("polled");
    assert_eq!(first_poll, 3);
    assert!(events[..3].iter().all(|event| event.contains("mosbatch -q -Jbet bet.py")));
    assert_eq!(harness.clock.sleeps(), vec![Duration::from_secs(10); 3]);
    assert_eq!(report.stages[0].call_count, 3);
    assert_eq!(report.stages[1].state, StageState::Complete);
    assert!(
        harness
            .log
            .text()
            .contains("Postconditions are still running")
    );
}

#[test]
fn rejected_submission_fails_fatal_cluster_fan_out() {
    let temp = tempdir_with(&["s1/b0.nii", "s2/b0.nii"]);
    let mut fixture = ShellFixture::new();
    fixture.settings.cluster.submit = "exit 7 # {{ tag }} {{ command }}".to_string();
    let mut pipeline = Pipeline::new("p")
        .with_workdir(temp.path())
        .with_targets(["s1", "s2"]);
    pipeline
        .add_stage(
            Stage::fan_out(
                "bet",
                TemplateDispatch::new("bet.py {{ inputs.b0 }}", DispatchMode::Cluster)
                    .with_input("b0", "b0.nii"),
            )
            .postcondition(Predicate::barrier("bet", 0)),
        )
        .expect("add");
    pipeline.select("all").expect("select");

    let err = pipeline.run(&fixture.ctx()).unwrap_err();

    assert_eq!(err.kind, FatalKind::ActionFailure);
    assert!(err.detail.contains("target 's1' exited with 7"));
    assert_eq!(pipeline.stages()[0].state(), StageState::Failed);
    assert_eq!(pipeline.stages()[0].call_count(), 1);
    assert!(fixture.counter.queries().is_empty());
}
