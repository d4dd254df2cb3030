//! Scripted collaborators for driving the engine without spawning processes,
//! touching a scheduler or sleeping.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::context::RunContext;
use crate::core::format::{Pad, pad_text};
use crate::io::barrier::{CancellationToken, Clock};
use crate::io::cluster::JobCounter;
use crate::io::config::Settings;
use crate::io::environment::Environment;
use crate::io::log_sink::LogSink;
use crate::io::process::{ProcessRunner, RunOptions, RunOutput};

/// Ordered record of side effects shared between fakes.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Rc<RefCell<Vec<String>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: impl Into<String>) {
        self.events.borrow_mut().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.borrow().clone()
    }
}

/// Returns queued outputs in order, then successful empty output.
///
/// Commands containing a registered pattern exit with its code instead.
#[derive(Default)]
pub struct ScriptedRunner {
    outputs: RefCell<VecDeque<RunOutput>>,
    failures: Vec<(String, i32)>,
    calls: RefCell<Vec<(String, RunOptions)>>,
    events: Option<EventLog>,
}

impl ScriptedRunner {
    pub fn new(outputs: Vec<RunOutput>) -> Self {
        Self {
            outputs: RefCell::new(outputs.into()),
            ..Self::default()
        }
    }

    pub fn fail_when(mut self, pattern: &str, exit_code: i32) -> Self {
        self.failures.push((pattern.to_string(), exit_code));
        self
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|(cmd, _)| cmd.clone()).collect()
    }

    pub fn options(&self) -> Vec<RunOptions> {
        self.calls.borrow().iter().map(|(_, opts)| opts.clone()).collect()
    }
}

impl ProcessRunner for ScriptedRunner {
    fn run(&self, command: &str, opts: &RunOptions) -> Result<RunOutput> {
        self.calls
            .borrow_mut()
            .push((command.to_string(), opts.clone()));
        if let Some(events) = &self.events {
            events.push(format!("run {command}"));
        }
        if let Some((_, code)) = self
            .failures
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
        {
            return Ok(RunOutput::with_exit_code(*code));
        }
        let mut output = self.outputs.borrow_mut().pop_front().unwrap_or_default();
        output.detached = !opts.wait;
        Ok(output)
    }
}

/// Replays a count sequence, repeating the last value once exhausted.
#[derive(Default)]
pub struct ScriptedCounter {
    values: RefCell<VecDeque<u64>>,
    last: Cell<u64>,
    queries: RefCell<Vec<String>>,
    events: Option<EventLog>,
}

impl ScriptedCounter {
    pub fn new(values: Vec<u64>) -> Self {
        Self {
            values: RefCell::new(values.into()),
            ..Self::default()
        }
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    /// Tags queried so far, one entry per poll.
    pub fn queries(&self) -> Vec<String> {
        self.queries.borrow().clone()
    }
}

impl JobCounter for ScriptedCounter {
    fn outstanding(&self, tag: &str) -> Result<u64> {
        self.queries.borrow_mut().push(tag.to_string());
        if let Some(events) = &self.events {
            events.push(format!("poll {tag}"));
        }
        if let Some(next) = self.values.borrow_mut().pop_front() {
            self.last.set(next);
        }
        Ok(self.last.get())
    }
}

/// Clock that advances only when slept on.
pub struct ManualClock {
    start: Instant,
    elapsed: Cell<Duration>,
    sleeps: RefCell<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            elapsed: Cell::new(Duration::ZERO),
            sleeps: RefCell::new(Vec::new()),
        }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.borrow().clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed.get()
    }

    fn sleep(&self, duration: Duration) {
        self.elapsed.set(self.elapsed.get() + duration);
        self.sleeps.borrow_mut().push(duration);
    }
}

/// Collects log lines in memory.
pub struct MemorySink {
    verbosity: u8,
    lines: RefCell<Vec<(u8, String)>>,
}

impl MemorySink {
    pub fn new(verbosity: u8) -> Self {
        Self {
            verbosity,
            lines: RefCell::new(Vec::new()),
        }
    }

    /// Everything that would have reached the console.
    pub fn text(&self) -> String {
        self.lines
            .borrow()
            .iter()
            .filter(|(level, _)| *level <= self.verbosity)
            .map(|(_, text)| text.as_str())
            .collect()
    }
}

impl LogSink for MemorySink {
    fn log(&self, level: u8, text: &str, pad: Pad) {
        self.lines.borrow_mut().push((level, pad_text(text, pad)));
    }
}

/// Environment backed by in-memory maps.
#[derive(Debug, Clone, Default)]
pub struct MapEnvironment {
    vars: BTreeMap<String, String>,
    executables: BTreeSet<String>,
}

impl MapEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_var(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_executable(mut self, name: &str) -> Self {
        self.executables.insert(name.to_string());
        self
    }
}

impl Environment for MapEnvironment {
    fn var(&self, key: &str) -> Option<String> {
        self.vars.get(key).filter(|value| !value.is_empty()).cloned()
    }

    fn executable(&self, name: &str) -> Option<PathBuf> {
        self.executables
            .contains(name)
            .then(|| PathBuf::from("/usr/bin").join(name))
    }
}

/// Owns one of every fake and lends them out as a [`RunContext`].
///
/// The runner and counter share [`Harness::events`], so tests can assert
/// that every dispatch happened before the first poll.
pub struct Harness {
    pub runner: ScriptedRunner,
    pub counter: ScriptedCounter,
    pub clock: ManualClock,
    pub cancel: CancellationToken,
    pub env: MapEnvironment,
    pub log: MemorySink,
    pub settings: Settings,
    pub events: EventLog,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_parts(ScriptedRunner::default(), ScriptedCounter::default())
    }

    pub fn with_parts(runner: ScriptedRunner, counter: ScriptedCounter) -> Self {
        let events = EventLog::new();
        Self {
            runner: runner.with_events(events.clone()),
            counter: counter.with_events(events.clone()),
            clock: ManualClock::new(),
            cancel: CancellationToken::new(),
            env: MapEnvironment::new(),
            log: MemorySink::new(crate::io::log_sink::DETAIL),
            settings: Settings::default(),
            events,
        }
    }

    pub fn ctx(&self) -> RunContext<'_> {
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

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// A temporary directory holding empty files at the given relative paths.
pub fn tempdir_with(files: &[&str]) -> tempfile::TempDir {
    let temp = tempfile::tempdir().expect("tempdir");
    for file in files {
        let path = temp.path().join(file);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create fixture dir");
        }
        std::fs::write(&path, b"").expect("write fixture file");
    }
    temp
}
