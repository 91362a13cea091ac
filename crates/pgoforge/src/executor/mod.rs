use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Instant;

use crate::builder::{CommandBuilder, ExternalBuilder};
use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::gate::{ConfirmGate, TerminalPrompt};
use crate::log_sanitize::sanitize_line;
use crate::planner::Plan;
use crate::profile::BuildPlan;
use crate::verify::VerificationReport;
use crate::workspace::{CleanMode, WorkspaceConfig, WorkspacePaths};

pub type TaskExecFn = fn(&ConfigDoc, &mut ExecCtx) -> Result<()>;

/// Values one task produces for later ones in the same run.
#[derive(Default)]
struct SharedExecState {
    workspace_paths: Mutex<Option<WorkspacePaths>>,
    build_plan: Mutex<Option<BuildPlan>>,
    intended: Mutex<Option<BTreeMap<String, String>>>,
    verification: Mutex<Option<VerificationReport>>,
    artifacts: Mutex<Vec<PathBuf>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Failed,
    Cancelled,
}

impl Outcome {
    fn of(res: &Result<()>) -> Self {
        match res {
            Ok(()) => Outcome::Ok,
            Err(e) if e.is_cancelled() => Outcome::Cancelled,
            Err(_) => Outcome::Failed,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::Failed => "failed",
            Outcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ExecEvent {
    TaskStarted {
        id: String,
    },
    TaskLog {
        id: String,
        line: String,
    },
    TaskFinished {
        id: String,
        outcome: Outcome,
        error: Option<String>,
        elapsed_ms: u128,
    },
    ExecutorDone {
        outcome: Outcome,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

/// Plain-text progress on stdout; a failed task also gets its buffered log
/// written to disk.
#[derive(Default)]
pub struct StdoutSink {
    error_logs_root: Option<PathBuf>,
    tally: Mutex<RunTally>,
}

/// Counters and per-task log buffers for the run in progress.
#[derive(Default)]
struct RunTally {
    first_start: Option<Instant>,
    started: usize,
    ok: usize,
    failed: Vec<String>,
    cancelled: Vec<String>,
    lines: usize,
    busy_ms: u128,
    buffers: BTreeMap<String, VecDeque<String>>,
    log_dir: Option<PathBuf>,
    written_logs: Vec<PathBuf>,
}

impl RunTally {
    const MAX_BUFFERED_LINES: usize = 4000;

    fn buffer(&mut self, id: &str, line: &str) {
        self.lines += 1;
        let q = self.buffers.entry(id.to_string()).or_default();
        if q.len() == Self::MAX_BUFFERED_LINES {
            q.pop_front();
        }
        q.push_back(sanitize_line(line));
    }

    fn render_summary(&self, outcome: Outcome) -> String {
        let wall = self.first_start.map(|t| t.elapsed()).unwrap_or_default();
        let mut out = String::from("SUMMARY:\n");
        let _ = writeln!(out, "  status: {}", outcome.as_str());
        let _ = writeln!(
            out,
            "  tasks: started={} ok={} failed={} cancelled={}",
            self.started,
            self.ok,
            self.failed.len(),
            self.cancelled.len()
        );
        let _ = writeln!(out, "  log lines: {}", self.lines);
        let _ = writeln!(
            out,
            "  elapsed: {} (in tasks: {})",
            hms(wall.as_secs()),
            hms((self.busy_ms / 1000) as u64)
        );
        if !self.failed.is_empty() {
            let _ = writeln!(out, "  failed: {}", self.failed.join(", "));
        }
        for p in &self.written_logs {
            let _ = writeln!(out, "  error log: {}", p.display());
        }
        out
    }

    /// `<root>/<timestamp>/<task>.log`; the timestamped directory is shared by the run.
    fn write_error_log(
        &mut self,
        root: Option<&Path>,
        id: &str,
        error: &str,
        elapsed_ms: u128,
    ) -> Result<PathBuf> {
        let dir = match &self.log_dir {
            Some(d) => d.clone(),
            None => {
                let root = root
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("build").join("error-logs"));
                let d = root.join(chrono::Local::now().format("%Y%m%d-%H%M%S").to_string());
                fs::create_dir_all(&d).map_err(|e| {
                    Error::msg(format!("failed to create error logs dir {}: {e}", d.display()))
                })?;
                self.log_dir = Some(d.clone());
                d
            }
        };

        let file_name: String = id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        let path = dir.join(format!("{file_name}.log"));

        let mut body = format!("task: {id}\nelapsed_ms: {elapsed_ms}\nerror: {error}\n\n");
        for line in self.buffers.remove(id).unwrap_or_default() {
            body.push_str(&line);
            body.push('\n');
        }
        fs::write(&path, body)
            .map_err(|e| Error::msg(format!("failed to write {}: {e}", path.display())))?;
        self.written_logs.push(path.clone());
        Ok(path)
    }
}

impl StdoutSink {
    /// Error logs go to `<root>/<timestamp>/<task>.log`.
    pub fn with_error_logs_root(root: PathBuf) -> Self {
        Self {
            error_logs_root: Some(root),
            tally: Mutex::default(),
        }
    }
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        let Ok(mut t) = self.tally.lock() else {
            return;
        };
        match ev {
            ExecEvent::TaskStarted { id } => {
                t.started += 1;
                t.first_start.get_or_insert_with(Instant::now);
                println!("RUN: {id}");
            }
            ExecEvent::TaskLog { id, line } => {
                t.buffer(&id, &line);
                println!("[{id}] {line}");
            }
            ExecEvent::TaskFinished {
                id,
                outcome,
                error,
                elapsed_ms,
            } => {
                t.busy_ms += elapsed_ms;
                let error = error.unwrap_or_default();
                match outcome {
                    Outcome::Ok => {
                        t.ok += 1;
                        t.buffers.remove(&id);
                        println!("DONE: {id} ({elapsed_ms}ms)");
                    }
                    Outcome::Cancelled => {
                        t.buffers.remove(&id);
                        t.cancelled.push(id.clone());
                        println!("CANCELLED: {id} {error}");
                    }
                    Outcome::Failed => {
                        t.failed.push(id.clone());
                        println!("FAIL: {id} ({elapsed_ms}ms) {error}");
                        let root = self.error_logs_root.as_deref();
                        match t.write_error_log(root, &id, &error, elapsed_ms) {
                            Ok(path) => println!("ERROR_LOG: {id} => {}", path.display()),
                            Err(e) => println!("WARN: no error log for {id}: {e}"),
                        }
                    }
                }
            }
            ExecEvent::ExecutorDone { outcome, error } => {
                print!("{}", t.render_summary(outcome));
                if outcome == Outcome::Failed
                    && let Some(e) = error
                {
                    println!("  error: {e}");
                }
                *t = RunTally::default();
            }
        }
    }
}

#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    pub sink: Arc<dyn ExecSink>,
    pub gate: Arc<dyn ConfirmGate>,
    pub builder: Arc<dyn ExternalBuilder>,
    pub current_task_id: Option<String>,
    shared: Arc<SharedExecState>,
}

impl ExecCtx {
    /// Interactive gate and the command builder; swap them with the `with_*` methods.
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>) -> Self {
        Self {
            dry_run,
            sink,
            gate: Arc::new(TerminalPrompt),
            builder: Arc::new(CommandBuilder),
            current_task_id: None,
            shared: Arc::new(SharedExecState::default()),
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn ConfirmGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_builder(mut self, builder: Arc<dyn ExternalBuilder>) -> Self {
        self.builder = builder;
        self
    }

    pub fn set_task(&mut self, id: impl Into<String>) {
        self.current_task_id = Some(id.into());
    }

    pub fn set_workspace_paths(&self, paths: WorkspacePaths) {
        if let Ok(mut g) = self.shared.workspace_paths.lock() {
            *g = Some(paths);
        }
    }

    pub fn workspace_paths(&self) -> Option<WorkspacePaths> {
        self.shared
            .workspace_paths
            .lock()
            .ok()
            .and_then(|g| g.clone())
    }

    // Cleaning is only applied by core.init.
    pub fn workspace_paths_or_init(&self, doc: &ConfigDoc) -> Result<WorkspacePaths> {
        if let Some(p) = self.workspace_paths() {
            return Ok(p);
        }
        let mut ws: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
        ws.clean = CleanMode::None;
        let paths = crate::workspace::init_dirs(&ws, &doc.base_dir())?;
        self.set_workspace_paths(paths.clone());
        Ok(paths)
    }

    pub fn set_build_plan(&self, plan: BuildPlan) {
        if let Ok(mut g) = self.shared.build_plan.lock() {
            *g = Some(plan);
        }
    }

    pub fn build_plan(&self) -> Option<BuildPlan> {
        self.shared.build_plan.lock().ok().and_then(|g| g.clone())
    }

    pub fn set_intended(&self, vars: BTreeMap<String, String>) {
        if let Ok(mut g) = self.shared.intended.lock() {
            *g = Some(vars);
        }
    }

    pub fn intended(&self) -> Option<BTreeMap<String, String>> {
        self.shared.intended.lock().ok().and_then(|g| g.clone())
    }

    pub fn set_verification(&self, report: VerificationReport) {
        if let Ok(mut g) = self.shared.verification.lock() {
            *g = Some(report);
        }
    }

    pub fn verification(&self) -> Option<VerificationReport> {
        self.shared.verification.lock().ok().and_then(|g| g.clone())
    }

    pub fn set_artifacts(&self, artifacts: Vec<PathBuf>) {
        if let Ok(mut g) = self.shared.artifacts.lock() {
            *g = artifacts;
        }
    }

    pub fn artifacts(&self) -> Vec<PathBuf> {
        self.shared
            .artifacts
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default()
    }

    pub fn log(&self, msg: &str) {
        let id = self
            .current_task_id
            .clone()
            .unwrap_or_else(|| "<none>".into());
        self.sink.emit(ExecEvent::TaskLog {
            id,
            line: msg.to_string(),
        });
    }

    /// Runs `cmd` to completion, forwarding sanitized stdout/stderr lines to the sink.
    pub fn run_cmd(&self, mut cmd: Command) -> Result<()> {
        if self.dry_run {
            self.log(&format!("DRY-RUN: {cmd:?}"));
            return Ok(());
        }

        // An attached stdin would let the builder block on a prompt nobody sees.
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::msg(format!("spawn failed: {e}")))?;

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(out, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(err, tx));
        }
        drop(tx);

        for line in rx {
            let line = sanitize_line(&line);
            if !line.is_empty() {
                self.log(&line);
            }
        }

        let status = child
            .wait()
            .map_err(|e| Error::msg(format!("wait failed: {e}")))?;
        if !status.success() {
            return Err(Error::msg(format!("command failed: {status}")));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    exec: BTreeMap<&'static str, TaskExecFn>,
}

impl TaskRegistry {
    pub fn add(&mut self, id: &'static str, f: TaskExecFn) -> Result<()> {
        if self.exec.contains_key(id) {
            return Err(Error::msg(format!("duplicate task executor for '{id}'")));
        }
        self.exec.insert(id, f);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<TaskExecFn> {
        self.exec.get(id).copied()
    }
}

pub trait ModuleExec {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()>;
}

/// Runs the plan in order and stops at the first failing or cancelled task.
pub fn execute_plan(
    doc: &ConfigDoc,
    plan: &Plan,
    reg: &TaskRegistry,
    ctx: &mut ExecCtx,
) -> Result<()> {
    for task in plan.ordered()? {
        let Some(exec) = reg.get(&task.id) else {
            return Err(Error::msg(format!(
                "no executor registered for task '{}'",
                task.id
            )));
        };
        ctx.sink.emit(ExecEvent::TaskStarted {
            id: task.id.clone(),
        });
        ctx.set_task(task.id.clone());
        let start = Instant::now();
        let res = exec(doc, ctx);
        let elapsed_ms = start.elapsed().as_millis();
        let outcome = Outcome::of(&res);
        match res {
            Ok(()) => ctx.sink.emit(ExecEvent::TaskFinished {
                id: task.id.clone(),
                outcome,
                error: None,
                elapsed_ms,
            }),
            Err(e) => {
                ctx.sink.emit(ExecEvent::TaskFinished {
                    id: task.id.clone(),
                    outcome,
                    error: Some(e.to_string()),
                    elapsed_ms,
                });
                let e = if e.is_cancelled() {
                    e
                } else {
                    e.context(format!("task '{}' failed", task.id))
                };
                ctx.sink.emit(ExecEvent::ExecutorDone {
                    outcome,
                    error: Some(e.to_string()),
                });
                return Err(e);
            }
        }
    }
    ctx.sink.emit(ExecEvent::ExecutorDone {
        outcome: Outcome::Ok,
        error: None,
    });
    Ok(())
}

pub fn builtin_registry() -> Result<TaskRegistry> {
    let mut reg = TaskRegistry::default();
    reg.add(crate::modules::core::INIT_TASK_ID, crate::modules::core::exec_init)?;
    crate::modules::kernel::KernelModule::register_tasks(&mut reg)?;
    crate::modules::overlay::OverlayModule::register_tasks(&mut reg)?;
    Ok(reg)
}

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    let flush = |pending: &mut Vec<u8>| {
        if !pending.is_empty() {
            let _ = tx.send(String::from_utf8_lossy(pending).into_owned());
            pending.clear();
        }
    };
    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &b in &buf[..n] {
            if b == b'\n' || b == b'\r' {
                flush(&mut pending);
            } else {
                pending.push(b);
                if pending.len() >= MAX_PENDING_BYTES {
                    flush(&mut pending);
                }
            }
        }
    }
    flush(&mut pending);
}

fn hms(total_secs: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        total_secs / 3600,
        (total_secs % 3600) / 60,
        total_secs % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::Task;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl ExecSink for Recorder {
        fn emit(&self, ev: ExecEvent) {
            let line = match ev {
                ExecEvent::TaskStarted { id } => format!("start {id}"),
                ExecEvent::TaskLog { id, line } => format!("log {id} {line}"),
                ExecEvent::TaskFinished { id, outcome, .. } => {
                    format!("finish {id} {}", outcome.as_str())
                }
                ExecEvent::ExecutorDone { outcome, .. } => format!("done {}", outcome.as_str()),
            };
            if let Ok(mut g) = self.0.lock() {
                g.push(line);
            }
        }
    }

    fn task(id: &str, after: &[&str]) -> Task {
        Task {
            id: id.into(),
            label: id.into(),
            module: "test".into(),
            phase: "test".into(),
            after: after.iter().map(|s| s.to_string()).collect(),
            provides: vec![],
        }
    }

    fn ok_task(_doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        ctx.log("hello");
        Ok(())
    }

    fn cancel_task(_doc: &ConfigDoc, _ctx: &mut ExecCtx) -> Result<()> {
        Err(Error::cancelled())
    }

    fn never_task(_doc: &ConfigDoc, _ctx: &mut ExecCtx) -> Result<()> {
        panic!("must not run after cancellation");
    }

    #[test]
    fn cancellation_stops_the_run_and_is_reported_as_cancelled() {
        let doc = ConfigDoc::from_toml("<mem>", "").expect("doc");
        let mut plan = Plan::default();
        plan.add(task("a", &[])).expect("a");
        plan.add(task("b", &["a"])).expect("b");
        plan.add(task("c", &["b"])).expect("c");
        let mut reg = TaskRegistry::default();
        reg.add("a", ok_task).expect("reg a");
        reg.add("b", cancel_task).expect("reg b");
        reg.add("c", never_task).expect("reg c");

        let sink = Arc::new(Recorder::default());
        let mut ctx = ExecCtx::new(false, sink.clone());
        let err = execute_plan(&doc, &plan, &reg, &mut ctx).expect_err("cancelled");
        assert!(err.is_cancelled());

        let events = sink.0.lock().expect("lock").clone();
        assert_eq!(
            events,
            [
                "start a",
                "log a hello",
                "finish a ok",
                "start b",
                "finish b cancelled",
                "done cancelled"
            ]
        );
    }

    #[test]
    fn failures_keep_their_kind_through_context() {
        fn structural(_doc: &ConfigDoc, _ctx: &mut ExecCtx) -> Result<()> {
            Err(crate::error::ConfigError::StructuralMismatch {
                sources: 3,
                checksums: 2,
            }
            .into())
        }
        let doc = ConfigDoc::from_toml("<mem>", "").expect("doc");
        let mut plan = Plan::default();
        plan.add(task("v", &[])).expect("v");
        let mut reg = TaskRegistry::default();
        reg.add("v", structural).expect("reg");
        let mut ctx = ExecCtx::new(false, Arc::new(Recorder::default()));
        let err = execute_plan(&doc, &plan, &reg, &mut ctx).expect_err("fails");
        assert_eq!(err.kind(), crate::error::ErrorKind::StructuralMismatch);
        assert!(err.to_string().starts_with("task 'v' failed: "));
    }

    #[test]
    fn run_cmd_streams_output_lines() {
        let sink = Arc::new(Recorder::default());
        let mut ctx = ExecCtx::new(false, sink.clone());
        ctx.set_task("t");
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "printf 'one\\n\\033[31mtwo\\033[0m\\n'; exit 3"]);
        let err = ctx.run_cmd(cmd).expect_err("non-zero exit");
        assert!(err.to_string().contains("command failed"));
        let events = sink.0.lock().expect("lock").clone();
        assert!(events.contains(&"log t one".to_string()));
        assert!(events.contains(&"log t two".to_string()));
    }

    #[test]
    fn failed_task_log_keeps_its_buffered_lines() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let sink = StdoutSink::with_error_logs_root(tmp.path().to_path_buf());
        sink.emit(ExecEvent::TaskStarted {
            id: "kernel.build".into(),
        });
        sink.emit(ExecEvent::TaskLog {
            id: "kernel.build".into(),
            line: "make: *** [all] Error 2".into(),
        });
        sink.emit(ExecEvent::TaskFinished {
            id: "kernel.build".into(),
            outcome: Outcome::Failed,
            error: Some("makepkg: command failed".into()),
            elapsed_ms: 5,
        });

        let run_dir = fs::read_dir(tmp.path())
            .expect("read root")
            .next()
            .expect("one run dir")
            .expect("entry")
            .path();
        let body = fs::read_to_string(run_dir.join("kernel.build.log")).expect("log");
        assert!(body.contains("error: makepkg: command failed"));
        assert!(body.contains("make: *** [all] Error 2"));
    }
}
