use crate::analyzer::{Analysis, ResponseAnalyzer};
use crate::config::Config;
use crate::enforcer::TaskEnforcer;
use crate::error::{ForemanError, Result};
use crate::events::{EventSink, ProgressEvent};
use crate::session::{SessionBackend, SessionError, SessionHandle};
use crate::state::{IterationOutcome, RunState, RunStatus, StateStore};
use crate::step::StepCatalog;
use crate::vcs::{commit_message, PushOutcome, VersionControl};
use crate::watchdog::{Watchdog, WatchdogSignal};
use tokio::sync::watch;
use tokio::time::Instant;

/// Consecutive no-change confirmations required before a step is considered
/// done. Two keeps a single flaky classification from ending a step early.
pub const CONFIRMATIONS_TO_ADVANCE: u32 = 2;

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// The orchestrator's view of the outside world. Everything it touches that
/// is not pure state goes through these three objects.
pub struct Collaborators {
    pub session: Box<dyn SessionBackend>,
    pub vcs: Box<dyn VersionControl>,
    pub sink: Box<dyn EventSink>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives one pipeline run: prompt, wait, classify, commit, advance. Every
/// iteration ends with a persisted snapshot so a crash at any point resumes
/// from known state.
pub struct Orchestrator {
    config: Config,
    catalog: StepCatalog,
    analyzer: ResponseAnalyzer,
    session: Box<dyn SessionBackend>,
    vcs: Box<dyn VersionControl>,
    sink: Box<dyn EventSink>,
    store: StateStore,
    enforcer: TaskEnforcer,
    watchdog: Watchdog,
    abort: watch::Receiver<bool>,
}

enum Settled {
    Output(String),
    TimedOut,
    Aborted,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        catalog: StepCatalog,
        analyzer: ResponseAnalyzer,
        collaborators: Collaborators,
        store: StateStore,
        abort: watch::Receiver<bool>,
    ) -> Self {
        let enforcer = TaskEnforcer::new(&config.enforcer);
        let watchdog = Watchdog::new(&config.watchdog);
        Self {
            config,
            catalog,
            analyzer,
            session: collaborators.session,
            vcs: collaborators.vcs,
            sink: collaborators.sink,
            store,
            enforcer,
            watchdog,
            abort,
        }
    }

    /// Run until the pipeline completes, escalates, or is aborted.
    /// `initial_prompt` replaces the first step prompt, which lets a resumed
    /// run open with a recovery directive instead of the plain step text.
    pub async fn run(
        &mut self,
        state: &mut RunState,
        initial_prompt: Option<String>,
    ) -> Result<RunStatus> {
        let Self {
            config,
            catalog,
            analyzer,
            session,
            vcs,
            sink,
            store,
            enforcer,
            watchdog,
            abort,
        } = self;
        let session: &dyn SessionBackend = session.as_ref();
        let vcs: &dyn VersionControl = vcs.as_ref();
        let sink: &dyn EventSink = sink.as_ref();

        sink.emit(&ProgressEvent::RunStarted {
            run_id: state.run_id.clone(),
            steps: catalog.len(),
        });

        let mut handle = session.start().await?;
        let mut pending_prompt = initial_prompt;
        let mut prev_output: Option<String> = None;

        while state.status == RunStatus::Running {
            if *abort.borrow() {
                finish_aborted(state, store);
                break;
            }

            let Some(step) = catalog.get(state.step_index) else {
                state.status = RunStatus::Completed;
                store.save(state)?;
                break;
            };

            let snapshot = state.clone();
            state.iteration += 1;
            sink.emit(&ProgressEvent::IterationStarted {
                step: state.step_display(),
                step_name: step.name.clone(),
                iteration: state.iteration,
            });

            let prompt = match pending_prompt.take() {
                Some(p) => p,
                None => step.render_prompt(&state.vars)?,
            };
            session.send(&handle, &prompt).await?;
            let deadline = Instant::now() + config.watchdog.iteration_timeout();

            // Race the session's own quiet detection against the watchdog.
            // Recycles re-send the prompt but keep the original deadline.
            let settled = loop {
                tokio::select! {
                    changed = abort.changed() => {
                        if changed.is_err() || *abort.borrow() {
                            break Settled::Aborted;
                        }
                    }
                    quiet = session.await_quiet(&handle, deadline) => match quiet {
                        Ok(delta) => break Settled::Output(delta),
                        Err(SessionError::Deadline) => break Settled::TimedOut,
                        Err(SessionError::Gone(_)) => {
                            recycle(
                                session,
                                &mut handle,
                                sink,
                                state,
                                "agent session disappeared",
                                &prompt,
                                true,
                            )
                            .await?;
                        }
                        Err(e) => return Err(e.into()),
                    },
                    signal = watchdog.monitor(session, &handle, deadline) => match signal? {
                        WatchdogSignal::Timeout => break Settled::TimedOut,
                        WatchdogSignal::Crashed => {
                            recycle(
                                session,
                                &mut handle,
                                sink,
                                state,
                                "agent process crashed",
                                &prompt,
                                true,
                            )
                            .await?;
                        }
                        WatchdogSignal::Errored { marker, context } => {
                            state.error_count += 1;
                            tracing::warn!(%marker, %context, "restarting session after error");
                            let reason = format!("error marker '{marker}' in output");
                            recycle(session, &mut handle, sink, state, &reason, &prompt, true)
                                .await?;
                        }
                        WatchdogSignal::SuspectLoop { repeats } => {
                            let reason =
                                format!("output repeated {repeats} polls, resetting context");
                            recycle(session, &mut handle, sink, state, &reason, &prompt, false)
                                .await?;
                        }
                    },
                }
            };

            match settled {
                Settled::Aborted => {
                    finish_aborted(state, store);
                    break;
                }
                Settled::TimedOut => {
                    state.record_iteration(IterationOutcome::Timeout);
                    state.no_change_streak = 0;
                    state.enforcement_attempts += 1;
                    if enforcer.should_escalate(state.enforcement_attempts) {
                        let reason = enforcer.escalation_reason(step, state.enforcement_attempts);
                        state.escalate(reason.clone());
                        sink.emit(&ProgressEvent::Escalated {
                            step: state.step_display(),
                            reason,
                        });
                    } else {
                        let timeout_analysis = Analysis {
                            has_change: false,
                            severity: None,
                            step_satisfied: false,
                            claims_complete: false,
                            summary: "iteration timed out".to_string(),
                            issues: vec![format!(
                                "no stable response within {}s",
                                config.watchdog.iteration_timeout_secs
                            )],
                        };
                        session.new_session(&handle).await?;
                        sink.emit(&ProgressEvent::SessionRecycled {
                            step: state.step_display(),
                            iteration: state.iteration,
                            reason: "iteration timed out".to_string(),
                        });
                        pending_prompt = Some(enforcer.enforcement_prompt(
                            step,
                            state.enforcement_attempts,
                            &timeout_analysis,
                        ));
                        sink.emit(&ProgressEvent::EnforcementSent {
                            step: state.step_display(),
                            attempt: state.enforcement_attempts,
                        });
                        prev_output = None;
                    }
                }
                Settled::Output(output) => {
                    sink.emit(&ProgressEvent::OutputStable {
                        step: state.step_display(),
                        iteration: state.iteration,
                        bytes: output.len(),
                    });

                    // Classification must succeed before the loop moves on;
                    // an unreachable analyzer pauses the run rather than
                    // letting unreviewed work pile up.
                    let mut held_recorded = false;
                    let analysis = loop {
                        match analyzer.classify(step, prev_output.as_deref(), &output).await {
                            Ok(a) => break Some(a),
                            Err(
                                e @ (ForemanError::AnalysisUnavailable(_)
                                | ForemanError::MalformedStructuredResponse { .. }),
                            ) => {
                                tracing::warn!(error = %e, "analysis unavailable, holding iteration");
                                sink.emit(&ProgressEvent::AnalysisHeld {
                                    step: state.step_display(),
                                    iteration: state.iteration,
                                    reason: e.to_string(),
                                });
                                if !held_recorded {
                                    held_recorded = true;
                                    state.record_iteration(IterationOutcome::Held);
                                    if let Err(save_err) = store.save(state) {
                                        tracing::error!(error = %save_err, "could not persist held state");
                                    }
                                }
                                tokio::select! {
                                    changed = abort.changed() => {
                                        if changed.is_err() || *abort.borrow() {
                                            break None;
                                        }
                                    }
                                    _ = tokio::time::sleep(config.watchdog.poll_interval()) => {}
                                }
                            }
                            Err(other) => return Err(other),
                        }
                    };
                    let Some(analysis) = analysis else {
                        finish_aborted(state, store);
                        break;
                    };

                    sink.emit(&ProgressEvent::Classified {
                        step: state.step_display(),
                        iteration: state.iteration,
                        has_change: analysis.has_change,
                        substantive: analysis.substantive(),
                        step_satisfied: analysis.step_satisfied,
                    });
                    prev_output = Some(output);

                    let mut outcome = IterationOutcome::NoChange;
                    let mut recorded = false;
                    if analysis.has_change {
                        state.no_change_streak = 0;
                        if analysis.substantive() {
                            outcome = IterationOutcome::Substantive;
                            if vcs.status().await?.is_clean() {
                                tracing::warn!(
                                    "substantive change reported but the tree is clean, nothing to commit"
                                );
                            } else {
                                let message = commit_message(
                                    state.step_display(),
                                    state.iteration,
                                    &analysis.summary,
                                );
                                let id = vcs.commit(&message).await?;
                                state.record_commit(id.clone(), analysis.summary.clone());
                                sink.emit(&ProgressEvent::Committed {
                                    step: state.step_display(),
                                    iteration: state.iteration,
                                    commit_id: id,
                                    summary: analysis.summary.clone(),
                                });
                                if config.git.auto_push {
                                    match vcs.push().await? {
                                        PushOutcome::Pushed => {}
                                        PushOutcome::NeedsHuman(why) => {
                                            let reason = format!("push needs attention: {why}");
                                            state.escalate(reason.clone());
                                            sink.emit(&ProgressEvent::Escalated {
                                                step: state.step_display(),
                                                reason,
                                            });
                                        }
                                        PushOutcome::Retryable(detail) => {
                                            tracing::warn!(
                                                %detail,
                                                "push failed, commits ride along with the next push"
                                            );
                                        }
                                    }
                                }
                                if state.status == RunStatus::Running {
                                    session.new_session(&handle).await?;
                                    sink.emit(&ProgressEvent::SessionRecycled {
                                        step: state.step_display(),
                                        iteration: state.iteration,
                                        reason: "fresh context after commit".to_string(),
                                    });
                                }
                            }
                        } else {
                            outcome = IterationOutcome::Cosmetic;
                        }
                    }

                    if state.status == RunStatus::Running {
                        if !analysis.has_change && analysis.step_satisfied {
                            state.no_change_streak += 1;
                            if state.no_change_streak >= CONFIRMATIONS_TO_ADVANCE {
                                // Record under the step being confirmed;
                                // advancing resets the iteration counter.
                                state.record_iteration(outcome);
                                recorded = true;
                                sink.emit(&ProgressEvent::StepAdvanced {
                                    completed_step: state.step_display(),
                                    iterations: state.iteration,
                                });
                                state.advance_step();
                                pending_prompt = None;
                                prev_output = None;
                                if state.step_index >= catalog.len() {
                                    state.status = RunStatus::Completed;
                                } else {
                                    session.new_session(&handle).await?;
                                    sink.emit(&ProgressEvent::SessionRecycled {
                                        step: state.step_display(),
                                        iteration: state.iteration,
                                        reason: "starting next step".to_string(),
                                    });
                                }
                            }
                        } else if !analysis.step_satisfied
                            && (analysis.claims_complete || !analysis.has_change)
                        {
                            // Stalled, or declaring victory early. Push back.
                            state.no_change_streak = 0;
                            state.enforcement_attempts += 1;
                            if !analysis.has_change {
                                outcome = IterationOutcome::Enforced;
                            }
                            if enforcer.should_escalate(state.enforcement_attempts) {
                                let reason =
                                    enforcer.escalation_reason(step, state.enforcement_attempts);
                                state.escalate(reason.clone());
                                sink.emit(&ProgressEvent::Escalated {
                                    step: state.step_display(),
                                    reason,
                                });
                            } else {
                                pending_prompt = Some(enforcer.enforcement_prompt(
                                    step,
                                    state.enforcement_attempts,
                                    &analysis,
                                ));
                                sink.emit(&ProgressEvent::EnforcementSent {
                                    step: state.step_display(),
                                    attempt: state.enforcement_attempts,
                                });
                            }
                        }
                    }

                    if !recorded {
                        state.record_iteration(outcome);
                    }
                }
            }

            if let Err(e) = store.save(state) {
                tracing::error!(error = %e, "state save failed, rolling back iteration");
                *state = snapshot;
                pending_prompt = None;
                tokio::select! {
                    changed = abort.changed() => {
                        if changed.is_err() || *abort.borrow() {
                            finish_aborted(state, store);
                            break;
                        }
                    }
                    _ = tokio::time::sleep(config.watchdog.poll_interval()) => {}
                }
            }
        }

        if let Err(e) = session.stop(handle).await {
            tracing::debug!(error = %e, "session stop failed");
        }
        sink.emit(&ProgressEvent::RunFinished {
            status: state.status,
            total_commits: state.total_commits,
        });
        Ok(state.status)
    }
}

fn finish_aborted(state: &mut RunState, store: &StateStore) {
    state.status = RunStatus::Aborted;
    if let Err(e) = store.save(state) {
        tracing::error!(error = %e, "could not persist aborted state");
    }
}

/// Replace or reset the agent session and re-send the iteration prompt.
/// `fresh_process` restarts the process; otherwise only the conversation
/// context is discarded.
async fn recycle(
    session: &dyn SessionBackend,
    handle: &mut SessionHandle,
    sink: &dyn EventSink,
    state: &RunState,
    reason: &str,
    prompt: &str,
    fresh_process: bool,
) -> Result<()> {
    if fresh_process {
        let fresh = session.restart(handle).await?;
        *handle = fresh;
    } else {
        session.new_session(handle).await?;
    }
    sink.emit(&ProgressEvent::SessionRecycled {
        step: state.step_display(),
        iteration: state.iteration,
        reason: reason.to_string(),
    });
    session.send(handle, prompt).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        EnforcerConfig, GitConfig, ProviderConfig, ProviderKind, RouterConfig, SessionConfig,
        WatchdogConfig,
    };
    use crate::events::ChannelSink;
    use crate::paths;
    use crate::router::{CompletionBackend, LlmRequest, LlmRouter, ProviderError};
    use crate::step::PipelineStep;
    use crate::vcs::{StatusEntry, TreeStatus};
    use async_trait::async_trait;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;

    // --- session double ----------------------------------------------------

    #[derive(Clone)]
    enum QuietStep {
        Output(&'static str),
        DeadlineHit,
        SessionGone,
    }

    #[derive(Clone, Default)]
    struct SessionSpy {
        sent: Arc<Mutex<Vec<String>>>,
        new_sessions: Arc<AtomicUsize>,
        restarts: Arc<AtomicUsize>,
        stopped: Arc<AtomicBool>,
    }

    struct TestSession {
        quiet: Vec<QuietStep>,
        qidx: AtomicUsize,
        spy: SessionSpy,
    }

    impl TestSession {
        fn new(quiet: Vec<QuietStep>) -> (Box<Self>, SessionSpy) {
            let spy = SessionSpy::default();
            let session = Box::new(Self {
                quiet,
                qidx: AtomicUsize::new(0),
                spy: spy.clone(),
            });
            (session, spy)
        }
    }

    #[async_trait]
    impl SessionBackend for TestSession {
        async fn start(&self) -> std::result::Result<SessionHandle, SessionError> {
            Ok(SessionHandle::new("test-session"))
        }

        async fn send(
            &self,
            _handle: &SessionHandle,
            text: &str,
        ) -> std::result::Result<(), SessionError> {
            self.spy.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn capture_output(
            &self,
            _handle: &SessionHandle,
        ) -> std::result::Result<String, SessionError> {
            Ok(String::new())
        }

        async fn is_alive(&self, _handle: &SessionHandle) -> bool {
            true
        }

        async fn await_quiet(
            &self,
            _handle: &SessionHandle,
            _deadline: Instant,
        ) -> std::result::Result<String, SessionError> {
            let i = self.qidx.fetch_add(1, Ordering::SeqCst);
            match &self.quiet[i.min(self.quiet.len() - 1)] {
                QuietStep::Output(s) => Ok(s.to_string()),
                QuietStep::DeadlineHit => Err(SessionError::Deadline),
                QuietStep::SessionGone => Err(SessionError::Gone("test-session".to_string())),
            }
        }

        async fn new_session(
            &self,
            _handle: &SessionHandle,
        ) -> std::result::Result<(), SessionError> {
            self.spy.new_sessions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn restart(
            &self,
            _handle: &SessionHandle,
        ) -> std::result::Result<SessionHandle, SessionError> {
            self.spy.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(SessionHandle::new("test-session-restarted"))
        }

        async fn stop(&self, _handle: SessionHandle) -> std::result::Result<(), SessionError> {
            self.spy.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    // --- vcs double --------------------------------------------------------

    #[derive(Clone, Default)]
    struct VcsSpy {
        commits: Arc<Mutex<Vec<String>>>,
        pushes: Arc<AtomicUsize>,
    }

    struct TestVcs {
        push_script: Mutex<VecDeque<PushOutcome>>,
        spy: VcsSpy,
    }

    impl TestVcs {
        fn new() -> (Box<Self>, VcsSpy) {
            let spy = VcsSpy::default();
            let vcs = Box::new(Self {
                push_script: Mutex::new(VecDeque::new()),
                spy: spy.clone(),
            });
            (vcs, spy)
        }

        fn with_push_outcome(self: Box<Self>, outcome: PushOutcome) -> Box<Self> {
            self.push_script.lock().unwrap().push_back(outcome);
            self
        }
    }

    #[async_trait]
    impl VersionControl for TestVcs {
        async fn status(&self) -> Result<TreeStatus> {
            // The tree always reads dirty so substantive verdicts commit.
            Ok(TreeStatus {
                entries: vec![StatusEntry {
                    code: " M".to_string(),
                    path: "src/lib.rs".to_string(),
                }],
            })
        }

        async fn stash(&self, label: &str) -> Result<String> {
            Ok(label.to_string())
        }

        async fn stash_pop(&self, _label: &str) -> Result<()> {
            Ok(())
        }

        async fn stash_drop(&self, _label: &str) -> Result<()> {
            Ok(())
        }

        async fn commit(&self, message: &str) -> Result<String> {
            let mut commits = self.spy.commits.lock().unwrap();
            commits.push(message.to_string());
            Ok(format!("sha{:04}", commits.len()))
        }

        async fn push(&self) -> Result<PushOutcome> {
            self.spy.pushes.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .push_script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(PushOutcome::Pushed))
        }
    }

    // --- analyzer scripting ------------------------------------------------

    struct ScriptedBackend {
        script: Mutex<VecDeque<std::result::Result<String, ProviderError>>>,
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        fn model(&self) -> &str {
            "scripted-model"
        }

        async fn complete(
            &self,
            _request: &LlmRequest,
            _credential: &str,
        ) -> std::result::Result<String, ProviderError> {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(ProviderError::Timeout))
        }
    }

    fn verdict(has_change: bool, severity: &str, satisfied: bool, claims: bool) -> String {
        format!(
            "{{\"has_change\": {has_change}, \"severity\": \"{severity}\", \
             \"step_satisfied\": {satisfied}, \"claims_complete\": {claims}, \
             \"summary\": \"scripted verdict\", \"issues\": []}}"
        )
    }

    fn analyzer_with(script: Vec<std::result::Result<String, ProviderError>>) -> ResponseAnalyzer {
        let mut router = LlmRouter::new();
        router.push(
            Box::new(ScriptedBackend {
                script: Mutex::new(script.into()),
            }),
            vec!["key".to_string()],
            3,
            Duration::from_millis(10),
            Duration::from_secs(60),
        );
        ResponseAnalyzer::new(router)
    }

    // --- fixtures ----------------------------------------------------------

    fn test_config(enforcer_ceiling: u32) -> Config {
        Config {
            state_dir: ".foreman".to_string(),
            steps_file: "steps.yaml".to_string(),
            vars: BTreeMap::new(),
            providers: vec![ProviderConfig {
                kind: ProviderKind::OpenaiCompat,
                name: "test".to_string(),
                model: "test-model".to_string(),
                base_url: None,
                api_key_env: vec![],
                api_keys: vec!["k".to_string()],
                max_attempts: 3,
                backoff_ms: 10,
            }],
            model_denylist: Vec::new(),
            router: RouterConfig::default(),
            watchdog: WatchdogConfig::default(),
            enforcer: EnforcerConfig {
                max_attempts: enforcer_ceiling,
            },
            git: GitConfig::default(),
            session: SessionConfig::default(),
            notify: None,
        }
    }

    fn catalog(names: &[&str]) -> StepCatalog {
        StepCatalog {
            steps: names
                .iter()
                .enumerate()
                .map(|(i, name)| PipelineStep {
                    id: i as u32 + 1,
                    name: name.to_string(),
                    prompt: format!("Do the work for {name}."),
                    completion_criteria: vec![format!("{name} is done")],
                })
                .collect(),
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        state: RunState,
        session: SessionSpy,
        vcs: VcsSpy,
        events: tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>,
        abort_tx: watch::Sender<bool>,
        dir: TempDir,
    }

    fn harness(
        config: Config,
        catalog: StepCatalog,
        quiet: Vec<QuietStep>,
        script: Vec<std::result::Result<String, ProviderError>>,
    ) -> Harness {
        harness_with_vcs(config, catalog, quiet, script, TestVcs::new())
    }

    fn harness_with_vcs(
        config: Config,
        catalog: StepCatalog,
        quiet: Vec<QuietStep>,
        script: Vec<std::result::Result<String, ProviderError>>,
        (vcs, vcs_spy): (Box<TestVcs>, VcsSpy),
    ) -> Harness {
        let dir = TempDir::new().unwrap();
        let (session, session_spy) = TestSession::new(quiet);
        let (sink, events) = ChannelSink::new();
        let (abort_tx, abort_rx) = watch::channel(false);
        let store = StateStore::new(dir.path());
        let state = RunState::new(BTreeMap::new());
        let orchestrator = Orchestrator::new(
            config,
            catalog,
            analyzer_with(script),
            Collaborators {
                session,
                vcs,
                sink: Box::new(sink),
            },
            store,
            abort_rx,
        );
        Harness {
            orchestrator,
            state,
            session: session_spy,
            vcs: vcs_spy,
            events,
            abort_tx,
            dir,
        }
    }

    fn drain(
        events: &mut tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>,
    ) -> Vec<ProgressEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = events.try_recv() {
            out.push(ev);
        }
        out
    }

    // --- tests -------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn advances_after_two_consecutive_confirmations() {
        let mut h = harness(
            test_config(5),
            catalog(&["build parser"]),
            vec![
                QuietStep::Output("wrote the parser"),
                QuietStep::Output("all done"),
                QuietStep::Output("all done"),
            ],
            vec![
                Ok(verdict(true, "substantive", false, false)),
                Ok(verdict(false, "cosmetic", true, true)),
                // the third iteration is byte-identical, no router call
            ],
        );
        let status = h.orchestrator.run(&mut h.state, None).await.unwrap();

        assert_eq!(status, RunStatus::Completed);
        assert_eq!(h.state.total_commits, 1);
        assert_eq!(h.vcs.commits.lock().unwrap().len(), 1);
        assert!(h.session.stopped.load(Ordering::SeqCst));

        // The confirming iteration is recorded under the step it confirmed,
        // not the one the run advanced into.
        let trail: Vec<(u32, u32)> = h
            .state
            .iterations
            .iter()
            .map(|r| (r.step, r.iteration))
            .collect();
        assert_eq!(trail, vec![(1, 1), (1, 2), (1, 3)]);

        let events = drain(&mut h.events);
        assert!(events
            .iter()
            .any(|e| matches!(e, ProgressEvent::StepAdvanced { completed_step: 1, .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            ProgressEvent::RunFinished {
                status: RunStatus::Completed,
                ..
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn single_confirmation_does_not_advance() {
        // Satisfied once, then fresh work arrives. The streak must restart.
        let mut h = harness(
            test_config(5),
            catalog(&["build parser"]),
            vec![
                QuietStep::Output("waiting"),
                QuietStep::Output("more work happened"),
                QuietStep::Output("settled"),
                QuietStep::Output("settled"),
            ],
            vec![
                Ok(verdict(false, "cosmetic", true, false)),
                Ok(verdict(true, "substantive", false, false)),
                Ok(verdict(false, "cosmetic", true, true)),
            ],
        );
        let status = h.orchestrator.run(&mut h.state, None).await.unwrap();
        assert_eq!(status, RunStatus::Completed);

        let events = drain(&mut h.events);
        assert!(events
            .iter()
            .any(|e| matches!(e, ProgressEvent::StepAdvanced { iterations: 4, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn cosmetic_change_neither_commits_nor_recycles() {
        let mut h = harness(
            test_config(5),
            catalog(&["tidy docs"]),
            vec![
                QuietStep::Output("reworded a comment"),
                QuietStep::Output("quiet now"),
                QuietStep::Output("quiet now"),
            ],
            vec![
                Ok(verdict(true, "cosmetic", false, false)),
                Ok(verdict(false, "cosmetic", true, true)),
            ],
        );
        let status = h.orchestrator.run(&mut h.state, None).await.unwrap();
        assert_eq!(status, RunStatus::Completed);
        assert_eq!(h.state.total_commits, 0);
        assert!(h.vcs.commits.lock().unwrap().is_empty());
        // No mid-run context reset for cosmetic iterations.
        assert_eq!(h.session.new_sessions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn substantive_commit_resets_context_and_pushes() {
        let mut h = harness(
            test_config(5),
            catalog(&["implement feature"]),
            vec![
                QuietStep::Output("implemented the thing"),
                QuietStep::Output("done"),
                QuietStep::Output("done"),
            ],
            vec![
                Ok(verdict(true, "substantive", false, false)),
                Ok(verdict(false, "cosmetic", true, true)),
            ],
        );
        let status = h.orchestrator.run(&mut h.state, None).await.unwrap();
        assert_eq!(status, RunStatus::Completed);

        let commits = h.vcs.commits.lock().unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0], "Step 1, iteration 1: scripted verdict");
        assert_eq!(h.vcs.pushes.load(Ordering::SeqCst), 1);
        assert_eq!(h.session.new_sessions.load(Ordering::SeqCst), 1);
        assert_eq!(h.state.commits.len(), 1);
        assert_eq!(h.state.commits[0].step, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn enforcement_escalates_past_the_ceiling() {
        let mut h = harness(
            test_config(2),
            catalog(&["stuck step"]),
            vec![
                QuietStep::Output("try one"),
                QuietStep::Output("try two"),
                QuietStep::Output("try three"),
            ],
            vec![
                Ok(verdict(false, "cosmetic", false, false)),
                Ok(verdict(false, "cosmetic", false, false)),
                Ok(verdict(false, "cosmetic", false, false)),
            ],
        );
        let status = h.orchestrator.run(&mut h.state, None).await.unwrap();
        assert_eq!(status, RunStatus::AwaitingHuman);
        assert_eq!(h.state.enforcement_attempts, 3);
        assert!(h
            .state
            .escalation_reason
            .as_deref()
            .unwrap()
            .contains("stuck step"));

        let events = drain(&mut h.events);
        let enforcements = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::EnforcementSent { .. }))
            .count();
        assert_eq!(enforcements, 2);
        assert!(events
            .iter()
            .any(|e| matches!(e, ProgressEvent::Escalated { .. })));

        // Enforcement prompts firm up along the ladder.
        let sent = h.session.sent.lock().unwrap();
        assert!(sent[1].starts_with("The step is not finished yet."));
        assert!(sent[2].starts_with("The step is still not finished."));
    }

    #[tokio::test(start_paused = true)]
    async fn early_completion_claim_is_enforced_but_work_is_kept() {
        let mut h = harness(
            test_config(5),
            catalog(&["half done"]),
            vec![
                QuietStep::Output("did part, claiming done"),
                QuietStep::Output("finished the rest"),
                QuietStep::Output("idle"),
                QuietStep::Output("idle"),
            ],
            vec![
                Ok(verdict(true, "substantive", false, true)),
                Ok(verdict(true, "substantive", false, false)),
                Ok(verdict(false, "cosmetic", true, true)),
            ],
        );
        let status = h.orchestrator.run(&mut h.state, None).await.unwrap();
        assert_eq!(status, RunStatus::Completed);
        // Both substantive iterations committed despite the enforcement.
        assert_eq!(h.state.total_commits, 2);
        let sent = h.session.sent.lock().unwrap();
        assert!(sent[1].starts_with("The step is not finished yet."));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_enforcement_attempt() {
        let mut h = harness(
            test_config(1),
            catalog(&["slow step"]),
            vec![QuietStep::DeadlineHit, QuietStep::DeadlineHit],
            vec![],
        );
        let status = h.orchestrator.run(&mut h.state, None).await.unwrap();
        assert_eq!(status, RunStatus::AwaitingHuman);
        assert_eq!(h.state.enforcement_attempts, 2);
        assert!(h
            .state
            .iterations
            .iter()
            .all(|r| r.outcome == IterationOutcome::Timeout));
        // The first timeout reset the context before re-prompting.
        assert_eq!(h.session.new_sessions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_session_is_restarted_and_the_prompt_resent() {
        let mut h = harness(
            test_config(5),
            catalog(&["build parser"]),
            vec![
                QuietStep::SessionGone,
                QuietStep::Output("all done"),
                QuietStep::Output("all done"),
            ],
            vec![Ok(verdict(false, "cosmetic", true, true))],
        );
        let status = h.orchestrator.run(&mut h.state, None).await.unwrap();

        assert_eq!(status, RunStatus::Completed);
        assert_eq!(h.session.restarts.load(Ordering::SeqCst), 1);
        // Same step prompt, once on send and once after the restart.
        let sent = h.session.sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0], sent[1]);

        let events = drain(&mut h.events);
        assert!(events
            .iter()
            .any(|e| matches!(e, ProgressEvent::SessionRecycled { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn held_analysis_resumes_once_a_provider_recovers() {
        let mut h = harness(
            test_config(5),
            catalog(&["observed step"]),
            vec![
                QuietStep::Output("work happened"),
                QuietStep::Output("settled"),
                QuietStep::Output("settled"),
            ],
            vec![
                // Full provider outage on the first classification, then
                // recovery on the retry.
                Err(ProviderError::Timeout),
                Err(ProviderError::Timeout),
                Err(ProviderError::Timeout),
                Ok(verdict(true, "substantive", false, false)),
                Ok(verdict(false, "cosmetic", true, true)),
            ],
        );
        let status = h.orchestrator.run(&mut h.state, None).await.unwrap();
        assert_eq!(status, RunStatus::Completed);
        assert!(h
            .state
            .iterations
            .iter()
            .any(|r| r.outcome == IterationOutcome::Held));

        let events = drain(&mut h.events);
        assert!(events
            .iter()
            .any(|e| matches!(e, ProgressEvent::AnalysisHeld { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, ProgressEvent::Committed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn push_divergence_escalates() {
        let (vcs, spy) = TestVcs::new();
        let vcs = vcs.with_push_outcome(PushOutcome::NeedsHuman("remote has diverged".to_string()));
        let mut h = harness_with_vcs(
            test_config(5),
            catalog(&["pushing step"]),
            vec![QuietStep::Output("committed work")],
            vec![Ok(verdict(true, "substantive", false, false))],
            (vcs, spy),
        );
        let status = h.orchestrator.run(&mut h.state, None).await.unwrap();
        assert_eq!(status, RunStatus::AwaitingHuman);
        assert!(h
            .state
            .escalation_reason
            .as_deref()
            .unwrap()
            .contains("push needs attention"));
        // The commit itself survived.
        assert_eq!(h.state.total_commits, 1);
        assert_eq!(h.session.new_sessions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_signal_finishes_the_run_as_aborted() {
        let mut h = harness(
            test_config(5),
            catalog(&["endless step"]),
            vec![
                QuietStep::Output("output one"),
                QuietStep::Output("output two"),
                QuietStep::Output("output three"),
            ],
            vec![
                Ok(verdict(true, "cosmetic", false, false)),
                Ok(verdict(true, "cosmetic", false, false)),
                Ok(verdict(true, "cosmetic", false, false)),
            ],
        );
        h.abort_tx.send(true).unwrap();
        let status = h.orchestrator.run(&mut h.state, None).await.unwrap();
        assert_eq!(status, RunStatus::Aborted);
        assert!(h.session.stopped.load(Ordering::SeqCst));
        assert!(h.state.iterations.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn every_iteration_is_persisted() {
        let mut h = harness(
            test_config(5),
            catalog(&["persisted step"]),
            vec![
                QuietStep::Output("worked"),
                QuietStep::Output("done"),
                QuietStep::Output("done"),
            ],
            vec![
                Ok(verdict(true, "substantive", false, false)),
                Ok(verdict(false, "cosmetic", true, true)),
            ],
        );
        let run_id = h.state.run_id.clone();
        let status = h.orchestrator.run(&mut h.state, None).await.unwrap();
        assert_eq!(status, RunStatus::Completed);

        let reloaded = StateStore::new(h.dir.path()).load(&run_id).unwrap();
        assert_eq!(reloaded.status, RunStatus::Completed);
        assert_eq!(reloaded.total_commits, 1);
        assert_eq!(reloaded.iterations.len(), h.state.iterations.len());
    }

    #[tokio::test(start_paused = true)]
    async fn save_failure_rolls_back_and_retries_the_iteration() {
        let mut h = harness(
            test_config(5),
            catalog(&["durable step"]),
            vec![
                QuietStep::Output("first pass"),
                QuietStep::Output("second pass"),
                QuietStep::Output("second pass"),
                QuietStep::Output("second pass"),
            ],
            vec![
                Ok(verdict(true, "cosmetic", false, false)),
                Ok(verdict(false, "cosmetic", true, true)),
            ],
        );
        // A directory squatting on the backup path makes the second save
        // fail; the first save never touches the backup.
        let backup = paths::backup_path(h.dir.path(), &h.state.run_id);
        std::fs::create_dir_all(&backup).unwrap();

        let events = &mut h.events;
        let unblock = async {
            let mut second_starts = 0;
            let mut seen = Vec::new();
            loop {
                let Some(ev) = events.recv().await else { break };
                // The failed save has already happened by the time this
                // event is observable, so clearing the path here unblocks
                // exactly the retry.
                if matches!(ev, ProgressEvent::IterationStarted { iteration: 2, .. }) {
                    second_starts += 1;
                    if second_starts == 1 {
                        std::fs::remove_dir_all(&backup).unwrap();
                    }
                }
                let finished = matches!(ev, ProgressEvent::RunFinished { .. });
                seen.push(ev);
                if finished {
                    break;
                }
            }
            seen
        };

        let (status, seen) = tokio::join!(h.orchestrator.run(&mut h.state, None), unblock);
        assert_eq!(status.unwrap(), RunStatus::Completed);

        // Iteration 2 ran twice: once rolled back, once persisted.
        let second_starts = seen
            .iter()
            .filter(|e| matches!(e, ProgressEvent::IterationStarted { iteration: 2, .. }))
            .count();
        assert_eq!(second_starts, 2);
        let numbers: Vec<u32> = h.state.iterations.iter().map(|r| r.iteration).collect();
        assert_eq!(numbers, vec![1, 2, 3]);

        let reloaded = StateStore::new(h.dir.path())
            .load(&h.state.run_id)
            .unwrap();
        assert_eq!(reloaded.status, RunStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn first_prompt_override_is_used_once() {
        let mut h = harness(
            test_config(5),
            catalog(&["resumed step"]),
            vec![
                QuietStep::Output("caught up"),
                QuietStep::Output("steady"),
                QuietStep::Output("steady"),
            ],
            vec![
                Ok(verdict(true, "substantive", false, false)),
                Ok(verdict(false, "cosmetic", true, true)),
            ],
        );
        let status = h
            .orchestrator
            .run(
                &mut h.state,
                Some("You were interrupted. Reassess before continuing.".to_string()),
            )
            .await
            .unwrap();
        assert_eq!(status, RunStatus::Completed);
        let sent = h.session.sent.lock().unwrap();
        assert_eq!(sent[0], "You were interrupted. Reassess before continuing.");
        assert!(sent[1].starts_with("Do the work for resumed step."));
    }
}
