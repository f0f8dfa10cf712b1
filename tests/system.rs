//! Library-level tests driving BuildSystem with a recording delegate, for
//! scenarios that need to observe delegate traffic directly.

use llb::buildsystem::{BuildSystem, BuildSystemDelegate, Token};
use llb::command::{Command, CommandInfo, CommandKind};
use llb::fileinfo::{real_file_system, FileSystem};
use llb::key::BuildKey;
use llb::queue::{ExecutionQueue, JobContext, LaneBasedExecutionQueue};
use llb::tools::{CustomCommand, Tool};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct RecordingDelegate {
    errors: Mutex<Vec<String>>,
    started: Mutex<Vec<String>>,
    failures: AtomicUsize,
    /// When set, the first command to start flips is_cancelled.
    cancel_on_first_command: bool,
    cancelled: AtomicBool,
    tools_dir: Option<PathBuf>,
}

impl RecordingDelegate {
    fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }
}

impl BuildSystemDelegate for RecordingDelegate {
    fn name(&self) -> &str {
        "llb"
    }
    fn version(&self) -> u32 {
        0
    }
    fn file_system(&self) -> Arc<dyn FileSystem> {
        real_file_system()
    }
    fn lookup_tool(&self, name: &str) -> Option<Box<dyn Tool>> {
        match (name, &self.tools_dir) {
            ("touchtool", Some(dir)) => Some(Box::new(TouchTool { dir: dir.clone() })),
            _ => None,
        }
    }
    fn create_execution_queue(&self) -> Box<dyn ExecutionQueue> {
        Box::new(LaneBasedExecutionQueue::new(2))
    }
    fn error(&self, _filename: &str, _at: &Token, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }
    fn set_file_contents_being_parsed(&self, _buf: &[u8]) {}
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
    fn command_started(&self, command: &CommandInfo) {
        self.started.lock().unwrap().push(command.name.clone());
        if self.cancel_on_first_command {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }
    fn command_finished(&self, _command: &CommandInfo) {}
    fn had_command_failure(&self) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}

/// A host tool whose commands touch a file named after themselves, and
/// which accepts `plan` custom-task keys.
struct TouchTool {
    dir: PathBuf,
}

struct TouchCommand {
    path: PathBuf,
    /// Keys to request beyond declared inputs.
    wants: Vec<BuildKey>,
}

impl CustomCommand for TouchCommand {
    fn description(&self) -> String {
        format!("TOUCH {}", self.path.display())
    }
    fn requested_keys(&self) -> Vec<BuildKey> {
        self.wants.clone()
    }
    fn execute(&self, _ctx: &JobContext, _fs: &Arc<dyn FileSystem>) -> bool {
        std::fs::write(&self.path, b"").is_ok()
    }
}

impl Tool for TouchTool {
    fn create_command(&self, name: &str) -> Command {
        Command::new(
            name,
            CommandKind::Custom(Arc::new(TouchCommand {
                path: self.dir.join(format!("{}.touched", name)),
                wants: vec![BuildKey::CustomTask {
                    name: "plan".to_string(),
                    payload: name.as_bytes().to_vec(),
                }],
            })),
        )
    }
    fn create_custom_command(&self, key: &BuildKey) -> Option<Command> {
        match key {
            BuildKey::CustomTask { name, .. } if name == "plan" => Some(Command::new(
                name,
                CommandKind::Custom(Arc::new(TouchCommand {
                    path: self.dir.join("plan.touched"),
                    wants: Vec::new(),
                })),
            )),
            _ => None,
        }
    }
}

struct Fixture {
    dir: tempfile::TempDir,
    delegate: Arc<RecordingDelegate>,
    system: BuildSystem,
}

fn fixture_with(manifest: &str, configure: impl FnOnce(&Path, &mut RecordingDelegate)) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    // Node names in the manifest are paths relative to the temp dir; expand
    // the {dir} placeholder so the build runs against absolute paths.
    let manifest = manifest.replace("{dir}", dir.path().to_str().unwrap());
    let path = dir.path().join("build.llb");
    std::fs::write(&path, manifest).unwrap();

    let mut delegate = RecordingDelegate::default();
    configure(dir.path(), &mut delegate);
    let delegate = Arc::new(delegate);
    let system = BuildSystem::new(delegate.clone(), path.to_str().unwrap());
    Fixture {
        dir,
        delegate,
        system,
    }
}

fn fixture(manifest: &str) -> Fixture {
    fixture_with(manifest, |_, _| {})
}

#[test]
fn missing_input_reports_and_fails() {
    let mut f = fixture("target all: {dir}/missing.c\n");
    assert!(!f.system.build("all"));

    let errors = f.delegate.errors();
    assert!(
        errors.iter().any(|e| e.contains("missing input '")
            && e.contains("missing.c' and no rule to build it")),
        "{:?}",
        errors
    );
    assert!(
        errors
            .iter()
            .any(|e| e.contains("cannot build target 'all' due to missing input")),
        "{:?}",
        errors
    );
    assert!(f.delegate.failures.load(Ordering::SeqCst) >= 1);
}

#[test]
fn ambiguous_producer_reports_both_producers() {
    let mut f = fixture(
        "target all: {dir}/out

command c1
  tool = shell
  outputs = {dir}/out
  args = touch {dir}/out

command c2
  tool = shell
  outputs = {dir}/out
  args = touch {dir}/out
",
    );
    assert!(!f.system.build("all"));

    let errors = f.delegate.errors();
    assert!(
        errors.iter().any(|e| e.contains("unable to build node:")
            && e.contains("produced by multiple commands; e.g., 'c1' and 'c2'")),
        "{:?}",
        errors
    );
    // Neither producer ran.
    assert_eq!(f.delegate.started(), Vec::<String>::new());
}

#[test]
fn failure_cascades_to_consumers() {
    let mut f = fixture(
        "target all: {dir}/o2

command c1
  tool = shell
  outputs = {dir}/o1
  args = exit 1

command c2
  tool = shell
  inputs = {dir}/o1
  outputs = {dir}/o2
  args = touch {dir}/o2
",
    );
    assert!(!f.system.build("all"));

    // c1 ran and failed; c2 skipped its body entirely.
    assert_eq!(f.delegate.started(), ["c1"]);
    assert!(!f.dir.path().join("o2").exists());
    assert!(f.delegate.failures.load(Ordering::SeqCst) >= 1);
}

#[test]
fn cancellation_skips_pending_commands() {
    let mut f = fixture_with(
        "target all: {dir}/o2

command c1
  tool = shell
  outputs = {dir}/o1
  args = touch {dir}/o1

command c2
  tool = shell
  inputs = {dir}/o1
  outputs = {dir}/o2
  args = touch {dir}/o2
",
        |_, delegate| delegate.cancel_on_first_command = true,
    );
    assert!(!f.system.build("all"));

    // c1 was already running and finished; c2 observed the cancellation
    // before scheduling and completed as skipped.
    assert_eq!(f.delegate.started(), ["c1"]);
    assert!(f.dir.path().join("o1").exists());
    assert!(!f.dir.path().join("o2").exists());
}

#[test]
fn second_build_in_session_runs_nothing() {
    let mut f = fixture(
        "target all: {dir}/out

command c1
  tool = shell
  inputs = {dir}/in
  outputs = {dir}/out
  args = cat {dir}/in > {dir}/out
",
    );
    std::fs::write(f.dir.path().join("in"), "data").unwrap();

    assert!(f.system.build("all"));
    assert_eq!(f.delegate.started(), ["c1"]);

    // The target re-evaluates (its result is never cached) but no command
    // body runs again.
    assert!(f.system.build("all"));
    assert_eq!(f.delegate.started(), ["c1"]);
}

#[test]
fn database_carries_results_across_instances() {
    let manifest = "target all: {dir}/out

command c1
  tool = shell
  inputs = {dir}/in
  outputs = {dir}/out
  args = cat {dir}/in > {dir}/out
";
    let mut f = fixture(manifest);
    std::fs::write(f.dir.path().join("in"), "data").unwrap();
    let db_path = f.dir.path().join("db");
    let db_path = db_path.to_str().unwrap();

    f.system.attach_db(db_path).unwrap();
    assert!(f.system.build("all"));
    assert_eq!(f.delegate.started(), ["c1"]);

    // A fresh instance over the same database sees everything up to date.
    let delegate = Arc::new(RecordingDelegate::default());
    let manifest_path = f.dir.path().join("build.llb");
    let mut system = BuildSystem::new(delegate.clone(), manifest_path.to_str().unwrap());
    system.attach_db(db_path).unwrap();
    assert!(system.build("all"));
    assert_eq!(delegate.started(), Vec::<String>::new());
}

#[test]
fn removed_command_forces_dependents_to_rebuild() {
    let manifest_v1 = "target all: {dir}/out

command c1
  tool = shell
  outputs = {dir}/out
  args = touch {dir}/out
";
    // Same graph shape, but the producing command was renamed.
    let manifest_v2 = "target all: {dir}/out

command c2
  tool = shell
  outputs = {dir}/out
  args = touch {dir}/out
";
    let mut f = fixture(manifest_v1);
    let db_path = f.dir.path().join("db");
    let db_path = db_path.to_str().unwrap();
    f.system.attach_db(db_path).unwrap();
    assert!(f.system.build("all"));
    assert_eq!(f.delegate.started(), ["c1"]);

    // The node's recorded producer key now resolves to a missing command,
    // which completes Invalid with force_change, so the node re-binds to
    // the new producer and runs it.
    let manifest = manifest_v2.replace("{dir}", f.dir.path().to_str().unwrap());
    std::fs::write(f.dir.path().join("build.llb"), manifest).unwrap();
    let delegate = Arc::new(RecordingDelegate::default());
    let manifest_path = f.dir.path().join("build.llb");
    let mut system = BuildSystem::new(delegate.clone(), manifest_path.to_str().unwrap());
    system.attach_db(db_path).unwrap();
    assert!(system.build("all"));
    assert_eq!(delegate.started(), ["c2"]);
}

#[test]
fn custom_tool_commands_and_custom_tasks() {
    let mut f = fixture_with(
        "tool touchtool
target all: {dir}/c1.touched

command c1
  tool = touchtool
  outputs = {dir}/c1.touched
",
        |dir, delegate| delegate.tools_dir = Some(dir.to_path_buf()),
    );
    assert!(f.system.build("all"), "{:?}", f.delegate.errors());

    // The manifest command ran, and the custom task it requested was built
    // by the tool's create_custom_command path.
    assert!(f.dir.path().join("c1.touched").exists());
    assert!(f.dir.path().join("plan.touched").exists());
    let started = f.delegate.started();
    assert!(started.contains(&"c1".to_string()), "{:?}", started);
    assert!(started.contains(&"plan".to_string()), "{:?}", started);
}

#[test]
fn schema_mismatch_fails_attach() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("db");
    let db_path = db_path.to_str().unwrap();

    // Seed the database under a different client version.
    struct V2Delegate(RecordingDelegate);
    impl BuildSystemDelegate for V2Delegate {
        fn name(&self) -> &str {
            "llb"
        }
        fn version(&self) -> u32 {
            2
        }
        fn file_system(&self) -> Arc<dyn FileSystem> {
            self.0.file_system()
        }
        fn lookup_tool(&self, name: &str) -> Option<Box<dyn Tool>> {
            self.0.lookup_tool(name)
        }
        fn create_execution_queue(&self) -> Box<dyn ExecutionQueue> {
            self.0.create_execution_queue()
        }
        fn error(&self, filename: &str, at: &Token, message: &str) {
            self.0.error(filename, at, message)
        }
        fn set_file_contents_being_parsed(&self, buf: &[u8]) {
            self.0.set_file_contents_being_parsed(buf)
        }
        fn is_cancelled(&self) -> bool {
            false
        }
        fn command_started(&self, command: &CommandInfo) {
            self.0.command_started(command)
        }
        fn command_finished(&self, command: &CommandInfo) {
            self.0.command_finished(command)
        }
        fn had_command_failure(&self) {
            self.0.had_command_failure()
        }
    }

    let manifest_path = dir.path().join("build.llb");
    std::fs::write(&manifest_path, "target all:\n").unwrap();

    let v2 = Arc::new(V2Delegate(RecordingDelegate::default()));
    let mut system = BuildSystem::new(v2, manifest_path.to_str().unwrap());
    system.attach_db(db_path).unwrap();

    // A client at a different version must not reuse that database.
    let v0 = Arc::new(RecordingDelegate::default());
    let mut system = BuildSystem::new(v0, manifest_path.to_str().unwrap());
    let err = system.attach_db(db_path).unwrap_err();
    assert!(err.contains("schema version"), "{}", err);
}
