use crate::buildsystem::{BuildSystem, BuildSystemDelegate, Token};
use crate::command::CommandInfo;
use crate::fileinfo::{real_file_system, FileSystem};
use crate::queue::{ExecutionQueue, LaneBasedExecutionQueue};
use crate::tools::Tool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(argh::FromArgs)] // this struct generates the flags and --help output
/// llb, a low-level build system
struct Opts {
    /// chdir before running
    #[argh(option, short = 'C')]
    chdir: Option<String>,

    /// input build file [default=build.llb]
    #[argh(option, short = 'f', default = "(\"build.llb\".into())")]
    build_file: String,

    /// build database path [default=.llb_db]
    #[argh(option, default = "(\".llb_db\".into())")]
    db: String,

    /// parallelism [default uses system thread count]
    #[argh(option, short = 'j')]
    parallelism: Option<usize>,

    /// generate a chrome trace at this path
    #[argh(option)]
    trace: Option<String>,

    /// print verbose command lines
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// target to build
    #[argh(positional)]
    target: String,
}

/// Console-facing delegate used by the CLI.
struct ConsoleDelegate {
    file_system: Arc<dyn FileSystem>,
    parallelism: usize,
    verbose: bool,
    tasks_run: AtomicUsize,
}

impl BuildSystemDelegate for ConsoleDelegate {
    fn name(&self) -> &str {
        "llb"
    }

    fn version(&self) -> u32 {
        0
    }

    fn file_system(&self) -> Arc<dyn FileSystem> {
        Arc::clone(&self.file_system)
    }

    fn lookup_tool(&self, _name: &str) -> Option<Box<dyn Tool>> {
        None
    }

    fn create_execution_queue(&self) -> Box<dyn ExecutionQueue> {
        Box::new(LaneBasedExecutionQueue::new(self.parallelism))
    }

    fn error(&self, filename: &str, _at: &Token, message: &str) {
        if filename.is_empty() {
            eprintln!("llb: error: {}", message);
        } else {
            eprintln!("llb: error: {}: {}", filename, message);
        }
    }

    fn set_file_contents_being_parsed(&self, _buf: &[u8]) {}

    fn is_cancelled(&self) -> bool {
        false
    }

    fn command_started(&self, command: &CommandInfo) {
        if !command.show_status {
            return;
        }
        self.tasks_run.fetch_add(1, Ordering::SeqCst);
        if self.verbose {
            println!("{}", command.verbose_description);
        } else {
            println!("{}", command.short_description);
        }
    }

    fn command_finished(&self, _command: &CommandInfo) {}

    fn had_command_failure(&self) {}
}

fn default_parallelism() -> anyhow::Result<usize> {
    let par = std::thread::available_parallelism()?;
    Ok(usize::from(par))
}

pub fn run() -> anyhow::Result<i32> {
    let opts: Opts = argh::from_env();

    if let Some(dir) = &opts.chdir {
        std::env::set_current_dir(dir)
            .map_err(|err| anyhow::anyhow!("chdir {:?}: {}", dir, err))?;
    }

    let delegate = Arc::new(ConsoleDelegate {
        file_system: real_file_system(),
        parallelism: match opts.parallelism {
            Some(parallelism) => parallelism,
            None => default_parallelism()?,
        },
        verbose: opts.verbose,
        tasks_run: AtomicUsize::new(0),
    });

    let mut system = BuildSystem::new(delegate.clone(), &opts.build_file);
    if let Err(err) = system.attach_db(&opts.db) {
        // Build cold rather than refuse to build at all.
        eprintln!("llb: warning: {}; building without the database", err);
    }
    if let Some(path) = &opts.trace {
        system
            .enable_tracing(path)
            .map_err(|err| anyhow::anyhow!("enable tracing: {}", err))?;
    }

    if !system.build(&opts.target) {
        eprintln!("llb: build failed");
        return Ok(1);
    }
    match delegate.tasks_run.load(Ordering::SeqCst) {
        0 => println!("llb: no work to do"),
        n => println!("llb: ran {} task{}", n, if n == 1 { "" } else { "s" }),
    }
    Ok(0)
}
