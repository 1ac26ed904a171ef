//! Spec execution engine.
//!
//! Drives one sandbox session per concrete test case through
//! setup → steps → cleanup, matching each step's captured output against
//! its expectation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::engine::SandboxEngine;
use crate::matcher::{Matcher, normalize_output};
use crate::schema::{FailStep, PassStep, Spec, Step};
use crate::session::{SandboxSession, SessionError};

/// Shell options prepended to setup and cleanup command lines.
const COMMON_SHELL_OPTS: &str = "set -o pipefail;";

/// Error type for runner configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// No sandbox image reference available.
    MissingImage,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingImage => write!(f, "no sandbox image reference provided"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Runner configuration, built once and passed in explicitly so independent
/// runners can coexist in one process.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Sandbox image reference.
    pub image: String,
    /// Environment variable names forwarded from the host into sandboxes.
    pub passthrough_env: Vec<String>,
}

impl RunnerConfig {
    pub fn new(image: Option<String>, passthrough_env: Vec<String>) -> Result<Self, ConfigError> {
        match image {
            Some(image) if !image.is_empty() => Ok(RunnerConfig {
                image,
                passthrough_env,
            }),
            _ => Err(ConfigError::MissingImage),
        }
    }
}

/// Result of one concrete test case.
#[derive(Debug, serde::Serialize)]
pub struct TestResult {
    pub name: String,
    pub passed: bool,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
    pub failures: Vec<String>,
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Execution phases of one concrete test case, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    SessionStarting,
    RunningSetup,
    RunningSteps,
    RunningCleanup,
    Stopped,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Created => "created",
            Phase::SessionStarting => "session start",
            Phase::RunningSetup => "setup",
            Phase::RunningSteps => "steps",
            Phase::RunningCleanup => "cleanup",
            Phase::Stopped => "stopped",
        };
        write!(f, "{name}")
    }
}

/// A condition that aborts the rest of a test case.
enum CaseAbort {
    /// A session/protocol failure, fatal to the case.
    Protocol(Phase, SessionError),
    /// A setup command exited nonzero; no steps run.
    Setup { stderr: String },
    /// A cleanup command exited nonzero; remaining cleanup is skipped.
    Cleanup { stderr: String },
}

impl std::fmt::Display for CaseAbort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaseAbort::Protocol(phase, e) => write!(f, "{phase} aborted: {e}"),
            CaseAbort::Setup { stderr } => {
                write!(f, "setup command failed: {}", stderr.trim_end())
            }
            CaseAbort::Cleanup { stderr } => {
                write!(f, "cleanup command failed: {}", stderr.trim_end())
            }
        }
    }
}

/// Runs specs against a sandbox engine.
pub struct SpecRunner {
    engine: Arc<dyn SandboxEngine>,
    config: RunnerConfig,
}

impl SpecRunner {
    pub fn new(engine: Arc<dyn SandboxEngine>, config: RunnerConfig) -> Self {
        SpecRunner { engine, config }
    }

    /// Run a spec, expanding `foreach` into concrete cases. Returns one
    /// result per case.
    pub fn run_spec(&self, spec: &Spec) -> Vec<TestResult> {
        spec.concrete_cases()
            .iter()
            .map(|case| self.run_case(case))
            .collect()
    }

    /// Run one concrete test case in its own sandbox session.
    ///
    /// The session is stopped unconditionally at the end, whatever the
    /// outcome, so no sandbox outlives its test.
    pub fn run_case(&self, case: &Spec) -> TestResult {
        let start = Instant::now();
        let mut failures = Vec::new();
        let mut phase = Phase::Created;
        let mut session = SandboxSession::new(Arc::clone(&self.engine), &self.config.image);

        debug!(test = %case.test, "running test case");
        if let Err(abort) = self.drive(case, &mut session, &mut phase, &mut failures) {
            failures.push(abort.to_string());
        }
        session.stop();
        phase = Phase::Stopped;
        debug!(test = %case.test, %phase, failed = failures.len(), "test case finished");

        TestResult {
            name: case.test.clone(),
            passed: failures.is_empty(),
            duration: start.elapsed(),
            failures,
        }
    }

    fn drive(
        &self,
        case: &Spec,
        session: &mut SandboxSession,
        phase: &mut Phase,
        failures: &mut Vec<String>,
    ) -> Result<(), CaseAbort> {
        *phase = Phase::SessionStarting;
        session
            .start(&passthrough_env(&self.config.passthrough_env))
            .map_err(|e| CaseAbort::Protocol(*phase, e))?;

        *phase = Phase::RunningSetup;
        for line in &case.setup {
            let result = session
                .send_command(&format!("{COMMON_SHELL_OPTS} {line}"))
                .map_err(|e| CaseAbort::Protocol(*phase, e))?;
            if result.exit_code != 0 {
                return Err(CaseAbort::Setup {
                    stderr: result.stderr,
                });
            }
        }

        // A match failure never aborts: every step runs and reports.
        *phase = Phase::RunningSteps;
        for step in &case.steps {
            let result = session
                .send_command(step.input())
                .map_err(|e| CaseAbort::Protocol(*phase, e))?;
            match step {
                Step::Pass(pass) => check_pass_step(pass, &result.stdout, failures),
                Step::Fail(fail) => {
                    check_fail_step(fail, &result.stderr, result.exit_code, failures)
                }
            }
        }

        // The cleanup list is in effect only once setup completed; a setup
        // abort above skips it.
        *phase = Phase::RunningCleanup;
        for line in &case.cleanup {
            let result = session
                .send_command(&format!("{COMMON_SHELL_OPTS} {line}"))
                .map_err(|e| CaseAbort::Protocol(*phase, e))?;
            if result.exit_code != 0 {
                return Err(CaseAbort::Cleanup {
                    stderr: result.stderr,
                });
            }
        }

        Ok(())
    }
}

fn check_pass_step(step: &PassStep, stdout: &str, failures: &mut Vec<String>) {
    let actual = normalize_output(stdout);
    match Matcher::compile(&step.out) {
        Ok(matcher) => {
            if !matcher.is_match(&actual) {
                failures.push(format!(
                    "stdout mismatch for `{}`\n  expected: {:?}\n  got: {:?}",
                    step.input, step.out, actual
                ));
            }
        }
        Err(e) => failures.push(format!("invalid pattern {:?}: {e}", step.out)),
    }
}

fn check_fail_step(step: &FailStep, stderr: &str, exit_code: i32, failures: &mut Vec<String>) {
    let actual = normalize_output(stderr);
    match Matcher::compile(&step.err) {
        Ok(matcher) => {
            if !matcher.is_match(&actual) {
                failures.push(format!(
                    "stderr mismatch for `{}`\n  expected: {:?}\n  got: {:?}",
                    step.input, step.err, actual
                ));
            }
        }
        Err(e) => failures.push(format!("invalid pattern {:?}: {e}", step.err)),
    }
    if exit_code != step.exit {
        failures.push(format!(
            "exit code for `{}`: expected {}, got {}",
            step.input, step.exit, exit_code
        ));
    }
}

/// Collect `KEY=VALUE` entries for the passthrough keys set in the host
/// environment.
fn passthrough_env(keys: &[String]) -> Vec<String> {
    keys.iter()
        .filter_map(|key| std::env::var(key).ok().map(|value| format!("{key}={value}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Attachment, EngineError, ProcessEngine, SandboxHandle};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn runner() -> SpecRunner {
        SpecRunner::new(
            Arc::new(ProcessEngine::new()),
            RunnerConfig {
                image: "local".to_string(),
                passthrough_env: vec![],
            },
        )
    }

    fn pass_step(input: &str, out: &str) -> Step {
        Step::Pass(PassStep {
            input: input.to_string(),
            out: out.to_string(),
        })
    }

    fn fail_step(input: &str, err: &str, exit: i32) -> Step {
        Step::Fail(FailStep {
            input: input.to_string(),
            err: err.to_string(),
            exit,
        })
    }

    fn make_spec(name: &str, steps: Vec<Step>) -> Spec {
        Spec {
            test: name.to_string(),
            setup: vec![],
            cleanup: vec![],
            steps,
            foreach: None,
        }
    }

    #[test]
    fn config_requires_an_image() {
        assert!(matches!(
            RunnerConfig::new(None, vec![]),
            Err(ConfigError::MissingImage)
        ));
        assert!(matches!(
            RunnerConfig::new(Some(String::new()), vec![]),
            Err(ConfigError::MissingImage)
        ));
        assert!(RunnerConfig::new(Some("img".to_string()), vec![]).is_ok());
    }

    #[test]
    fn digit_pattern_spec_passes() {
        let spec = make_spec("digits", vec![pass_step("echo 42", "#")]);
        let results = runner().run_spec(&spec);
        assert_eq!(results.len(), 1);
        assert!(results[0].passed, "failures: {:?}", results[0].failures);
    }

    #[test]
    fn star_pattern_spans_lines() {
        let spec = make_spec(
            "multiline",
            vec![pass_step("printf 'a\\nb\\nc\\n'", "a*c")],
        );
        let results = runner().run_spec(&spec);
        assert!(results[0].passed, "failures: {:?}", results[0].failures);
    }

    #[test]
    fn fail_step_with_explicit_exit_passes() {
        let spec = make_spec("fails", vec![fail_step("false", "", 1)]);
        let results = runner().run_spec(&spec);
        assert!(results[0].passed, "failures: {:?}", results[0].failures);
    }

    #[test]
    fn fail_step_default_exit_expects_clean_exit() {
        // stderr text with a zero exit: the fail-step default.
        let spec = make_spec("warns", vec![fail_step("echo warn 1>&2", "warn", 0)]);
        let results = runner().run_spec(&spec);
        assert!(results[0].passed, "failures: {:?}", results[0].failures);
    }

    #[test]
    fn match_failure_is_recorded_with_expected_and_actual() {
        let spec = make_spec("mismatch", vec![pass_step("echo hello", "goodbye")]);
        let results = runner().run_spec(&spec);
        assert!(!results[0].passed);
        assert!(results[0].failures[0].contains("goodbye"));
        assert!(results[0].failures[0].contains("hello"));
    }

    #[test]
    fn match_failure_does_not_stop_later_steps() {
        let spec = make_spec(
            "continues",
            vec![
                pass_step("echo one", "wrong"),
                pass_step("echo two", "two"),
            ],
        );
        let results = runner().run_spec(&spec);
        assert!(!results[0].passed);
        // Only the first step failed; the second ran and matched.
        assert_eq!(results[0].failures.len(), 1);
    }

    #[test]
    fn exit_code_mismatch_is_recorded() {
        let spec = make_spec("wrong_exit", vec![fail_step("false", "", 0)]);
        let results = runner().run_spec(&spec);
        assert!(!results[0].passed);
        assert!(results[0].failures[0].contains("expected 0, got 1"));
    }

    #[test]
    fn setup_failure_aborts_before_steps() {
        let mut spec = make_spec("bad_setup", vec![pass_step("echo hi", "hi")]);
        spec.setup = vec!["false".to_string()];
        let results = runner().run_spec(&spec);
        assert!(!results[0].passed);
        assert_eq!(results[0].failures.len(), 1);
        assert!(results[0].failures[0].contains("setup command failed"));
    }

    #[test]
    fn setup_state_is_visible_to_steps() {
        let mut spec = make_spec("setup_env", vec![pass_step("echo $SANDTEST_SETUP", "ready")]);
        spec.setup = vec!["SANDTEST_SETUP=ready".to_string()];
        let results = runner().run_spec(&spec);
        assert!(results[0].passed, "failures: {:?}", results[0].failures);
    }

    #[test]
    fn cleanup_failure_is_reported() {
        let mut spec = make_spec("bad_cleanup", vec![pass_step("echo hi", "hi")]);
        spec.cleanup = vec!["false".to_string()];
        let results = runner().run_spec(&spec);
        assert!(!results[0].passed);
        assert!(results[0].failures[0].contains("cleanup command failed"));
    }

    #[test]
    fn cleanup_stops_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("after");
        let mut spec = make_spec("halt_cleanup", vec![pass_step("echo hi", "hi")]);
        spec.cleanup = vec![
            "false".to_string(),
            format!("touch {}", marker.display()),
        ];
        let results = runner().run_spec(&spec);
        assert!(!results[0].passed);
        assert!(results[0].failures[0].contains("cleanup command failed"));
        assert!(!marker.exists(), "cleanup continued past a failing command");
    }

    #[test]
    fn cleanup_runs_after_match_failure() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("cleaned");
        let mut spec = make_spec("cleanup_after_fail", vec![pass_step("echo x", "y")]);
        spec.cleanup = vec![format!("touch {}", marker.display())];
        let results = runner().run_spec(&spec);
        assert!(!results[0].passed);
        assert!(marker.exists(), "cleanup did not run after a match failure");
    }

    #[test]
    fn foreach_expands_to_one_case_per_map() {
        let yaml = r#"
- test: "echo {name}"
  steps:
    - in: "echo {name}"
      out: "{name}"
  foreach:
    - name: a
    - name: b
"#;
        let specs: Vec<Spec> = serde_yaml::from_str(yaml).unwrap();
        let results = runner().run_spec(&specs[0]);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].name, "echo a");
        assert_eq!(results[1].name, "echo b");
        assert!(results.iter().all(|r| r.passed));
    }

    #[test]
    fn passthrough_env_reaches_the_sandbox() {
        // SAFETY: test-only env mutation; no other test reads this key.
        unsafe { std::env::set_var("SANDTEST_PASSTHROUGH_PROBE", "carried") };
        let runner = SpecRunner::new(
            Arc::new(ProcessEngine::new()),
            RunnerConfig {
                image: "local".to_string(),
                passthrough_env: vec!["SANDTEST_PASSTHROUGH_PROBE".to_string()],
            },
        );
        let spec = make_spec(
            "env",
            vec![pass_step("echo $SANDTEST_PASSTHROUGH_PROBE", "carried")],
        );
        let results = runner.run_spec(&spec);
        assert!(results[0].passed, "failures: {:?}", results[0].failures);
    }

    #[test]
    fn shell_death_mid_test_fails_the_case() {
        let spec = make_spec(
            "dies",
            vec![
                fail_step("exit 3", "", 3),
                // The session is dead; this step cannot be issued.
                pass_step("echo unreachable", "unreachable"),
            ],
        );
        let results = runner().run_spec(&spec);
        assert!(!results[0].passed);
        assert!(
            results[0]
                .failures
                .iter()
                .any(|f| f.contains("session is not started")),
            "failures: {:?}",
            results[0].failures
        );
    }

    // Engine wrapper counting stop calls, to pin down the stop-exactly-once
    // teardown guarantee.

    struct CountingEngine {
        inner: ProcessEngine,
        stops: Arc<AtomicUsize>,
    }

    struct CountingHandle {
        inner: Box<dyn SandboxHandle>,
        stops: Arc<AtomicUsize>,
    }

    impl SandboxEngine for CountingEngine {
        fn create(
            &self,
            image: &str,
            env: &[String],
        ) -> Result<Box<dyn SandboxHandle>, EngineError> {
            let inner = self.inner.create(image, env)?;
            Ok(Box::new(CountingHandle {
                inner,
                stops: Arc::clone(&self.stops),
            }))
        }
    }

    impl SandboxHandle for CountingHandle {
        fn attach(&mut self) -> Result<Attachment, EngineError> {
            self.inner.attach()
        }
        fn start(&mut self) -> Result<(), EngineError> {
            self.inner.start()
        }
        fn stop(&mut self) -> Result<(), EngineError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.inner.stop()
        }
        fn remove(&mut self) -> Result<(), EngineError> {
            self.inner.remove()
        }
        fn exit_status(&mut self) -> Option<i32> {
            self.inner.exit_status()
        }
    }

    fn counting_runner() -> (SpecRunner, Arc<AtomicUsize>) {
        let stops = Arc::new(AtomicUsize::new(0));
        let runner = SpecRunner::new(
            Arc::new(CountingEngine {
                inner: ProcessEngine::new(),
                stops: Arc::clone(&stops),
            }),
            RunnerConfig {
                image: "local".to_string(),
                passthrough_env: vec![],
            },
        );
        (runner, stops)
    }

    #[test]
    fn session_is_stopped_exactly_once_on_success() {
        let (runner, stops) = counting_runner();
        let spec = make_spec("ok", vec![pass_step("echo hi", "hi")]);
        let results = runner.run_spec(&spec);
        assert!(results[0].passed);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn session_is_stopped_exactly_once_on_setup_failure() {
        let (runner, stops) = counting_runner();
        let mut spec = make_spec("bad", vec![pass_step("echo hi", "hi")]);
        spec.setup = vec!["false".to_string()];
        let results = runner.run_spec(&spec);
        assert!(!results[0].passed);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn each_foreach_case_gets_its_own_session() {
        let (runner, stops) = counting_runner();
        let yaml = r#"
- test: "case {n}"
  steps:
    - in: "echo {n}"
      out: "{n}"
  foreach:
    - n: "1"
    - n: "2"
"#;
        let specs: Vec<Spec> = serde_yaml::from_str(yaml).unwrap();
        let results = runner.run_spec(&specs[0]);
        assert_eq!(results.len(), 2);
        assert_eq!(stops.load(Ordering::SeqCst), 2);
    }
}
