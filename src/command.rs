//! Commands and the shared behavior of every command that reduces to a job
//! on the execution queue: signatures, cached-result validity, failure
//! encoding, and scheduling.

use crate::buildsystem::{BuildSystemDelegate, Token};
use crate::engine::{TaskCompletion, TaskInterface};
use crate::fileinfo::{FileInfo, FileSystem};
use crate::graph::{BuildGraph, NodeId};
use crate::hash::{Signature, SignatureHasher};
use crate::key::BuildKey;
use crate::queue::{ExecutionQueue, QueueJob};
use crate::smallmap::SmallMap;
use crate::tools::{CommandBody, CustomCommand};
use crate::value::BuildValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A unit of work producing zero or more node outputs from zero or more
/// node inputs.
pub struct Command {
    pub name: String,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
    pub description: Option<String>,
    pub kind: CommandKind,
}

/// The closed set of built-in command kinds, plus the host escape hatch.
pub enum CommandKind {
    Phony,
    Shell {
        /// Full argv; a scalar `args` is wrapped to `/bin/sh -c <value>`
        /// at configuration time.
        args: Vec<String>,
        /// Empty means inherit the parent environment.
        env: SmallMap<String, String>,
    },
    Clang {
        /// Command line, run through the shell.
        args: String,
        /// Optional makefile-format dependency output to ingest on success.
        deps_path: Option<String>,
    },
    Mkdir,
    Custom(Arc<dyn CustomCommand>),
}

/// Snapshot of a command's identity handed to delegate status callbacks,
/// including from worker lanes.
#[derive(Debug, Clone)]
pub struct CommandInfo {
    pub name: String,
    pub short_description: String,
    pub verbose_description: String,
    pub show_status: bool,
}

/// Per-run state for a command task.
#[derive(Default)]
pub struct CommandRunState {
    /// An input failed or was missing; do not run the body.
    pub should_skip: bool,
    /// A declared leaf input was missing, which is reported as a command
    /// failure in its own right.
    pub has_missing_input: bool,
}

/// What command lifecycle callbacks get to see of the build system.
pub struct CommandContext<'a> {
    pub graph: &'a BuildGraph,
    pub delegate: &'a Arc<dyn BuildSystemDelegate>,
    pub failed: &'a Arc<AtomicBool>,
    pub main_filename: &'a str,
}

impl CommandContext<'_> {
    pub fn error(&self, message: &str) {
        self.failed.store(true, Ordering::SeqCst);
        self.delegate
            .error(self.main_filename, &Token::default(), message);
    }
}

impl Command {
    pub fn new(name: &str, kind: CommandKind) -> Command {
        Command {
            name: name.to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            description: None,
            kind,
        }
    }

    pub fn should_show_status(&self) -> bool {
        !matches!(self.kind, CommandKind::Phony)
    }

    pub fn short_description(&self) -> String {
        match &self.kind {
            CommandKind::Custom(custom) => custom.description(),
            _ => self
                .description
                .clone()
                .unwrap_or_else(|| self.name.clone()),
        }
    }

    pub fn verbose_description(&self, graph: &BuildGraph) -> String {
        match &self.kind {
            CommandKind::Phony => self.name.clone(),
            CommandKind::Shell { args, .. } => args
                .iter()
                .map(|arg| {
                    if arg.contains(' ') {
                        format!("\"{}\"", arg)
                    } else {
                        arg.clone()
                    }
                })
                .collect::<Vec<_>>()
                .join(" "),
            CommandKind::Clang { args, .. } => args.clone(),
            CommandKind::Mkdir => format!("mkdir {}", self.output_name(graph)),
            CommandKind::Custom(custom) => custom.description(),
        }
    }

    pub fn info(&self, graph: &BuildGraph) -> CommandInfo {
        CommandInfo {
            name: self.name.clone(),
            short_description: self.short_description(),
            verbose_description: self.verbose_description(graph),
            show_status: self.should_show_status(),
        }
    }

    fn output_name<'a>(&self, graph: &'a BuildGraph) -> &'a str {
        match self.outputs.first() {
            Some(&id) => &graph.node(id).name,
            None => "",
        }
    }

    /// The 64-bit summary of everything outside declared inputs that can
    /// change this command's behavior.
    pub fn signature(&self, graph: &BuildGraph) -> Signature {
        let mut h = SignatureHasher::new();
        if let CommandKind::Mkdir = self.kind {
            // Only the directory path matters.
            h.write_str(self.output_name(graph));
            return h.finish();
        }
        for &id in &self.inputs {
            h.write_str(&graph.node(id).name);
        }
        h.write_separator();
        for &id in &self.outputs {
            h.write_str(&graph.node(id).name);
        }
        h.write_separator();
        match &self.kind {
            CommandKind::Phony | CommandKind::Mkdir => {}
            CommandKind::Shell { args, env: _ } => {
                // The environment is deliberately not folded in; a changed
                // env does not re-run a shell command.  Known soundness gap.
                for arg in args {
                    h.write_str(arg);
                }
            }
            CommandKind::Clang { args, deps_path } => {
                h.write_str(args);
                if let Some(path) = deps_path {
                    h.write_str(path);
                }
            }
            CommandKind::Custom(custom) => h.write_u64(custom.extra_signature()),
        }
        h.finish()
    }

    /// Whether a cached outcome may stand in for re-running this command.
    pub fn is_result_valid(
        &self,
        graph: &BuildGraph,
        fs: &dyn FileSystem,
        value: &BuildValue,
    ) -> bool {
        let BuildValue::SuccessfulCommand { outputs, signature } = value else {
            return false;
        };
        if let CommandKind::Mkdir = self.kind {
            // The stored FileInfo is not compared: directory metadata
            // churns without the output needing to be recreated.
            let info = fs.file_info(self.output_name(graph));
            return !info.is_missing() && info.is_directory();
        }
        if *signature != self.signature(graph) {
            return false;
        }
        if outputs.len() != self.outputs.len() {
            return false;
        }
        for (&id, stored) in self.outputs.iter().zip(outputs) {
            let node = graph.node(id);
            if node.is_virtual {
                continue;
            }
            // A missing output also fails this: the stat is the sentinel
            // and stored infos of real outputs never are.
            if fs.file_info(&node.name) != *stored {
                return false;
            }
        }
        true
    }

    /// Project this command's outcome onto one of its output nodes.
    pub fn result_for_output(
        &self,
        graph: &BuildGraph,
        node: NodeId,
        value: &BuildValue,
    ) -> BuildValue {
        match value {
            BuildValue::FailedCommand | BuildValue::SkippedCommand => BuildValue::FailedInput,
            BuildValue::SuccessfulCommand { outputs, .. } => {
                if graph.node(node).is_virtual {
                    return BuildValue::VirtualInput;
                }
                let info = self
                    .outputs
                    .iter()
                    .position(|&out| out == node)
                    .and_then(|i| outputs.get(i));
                match info {
                    Some(info) => BuildValue::ExistingInput(*info),
                    None => {
                        debug_assert!(false, "asked for a result of an undeclared output");
                        BuildValue::FailedInput
                    }
                }
            }
            _ => {
                debug_assert!(false, "unexpected producer value {:?}", value);
                BuildValue::FailedInput
            }
        }
    }

    /// Engine protocol: request every declared input, plus whatever extra
    /// keys a custom command wants.
    pub fn start(&self, ti: &mut TaskInterface, graph: &BuildGraph) {
        for (i, &input) in self.inputs.iter().enumerate() {
            ti.needs_input(BuildKey::Node(graph.node(input).name.clone()).to_data(), i);
        }
        if let CommandKind::Custom(custom) = &self.kind {
            for (i, key) in custom.requested_keys().into_iter().enumerate() {
                ti.needs_input(key.to_data(), self.inputs.len() + i);
            }
        }
    }

    pub fn provide_prior_value(&self, _value: &BuildValue) {}

    pub fn provide_value(
        &self,
        ctx: &CommandContext,
        state: &mut CommandRunState,
        input_id: usize,
        value: &BuildValue,
    ) {
        match value {
            BuildValue::MissingInput if input_id < self.inputs.len() => {
                state.should_skip = true;
                state.has_missing_input = true;
                let name = &ctx.graph.node(self.inputs[input_id]).name;
                ctx.error(&format!(
                    "missing input '{}' and no rule to build it",
                    name
                ));
            }
            BuildValue::FailedInput => state.should_skip = true,
            _ => {}
        }
    }

    /// Engine protocol: all inputs delivered.  Either complete immediately
    /// (cancelled, or skipping due to bad inputs) or schedule the body on
    /// the execution queue and complete from the worker.
    pub fn inputs_available(
        &self,
        ti: &mut TaskInterface,
        ctx: &CommandContext,
        queue: &mut dyn ExecutionQueue,
        state: &CommandRunState,
    ) {
        if ctx.delegate.is_cancelled() {
            ti.complete(BuildValue::SkippedCommand.to_data(), false);
            return;
        }
        if state.should_skip {
            if state.has_missing_input {
                ctx.failed.store(true, Ordering::SeqCst);
                ctx.delegate.had_command_failure();
            }
            ti.complete(BuildValue::FailedCommand.to_data(), false);
            return;
        }

        // Snapshot everything the worker needs; it cannot touch the graph.
        let info = self.info(ctx.graph);
        let body = self.body(ctx.graph);
        let outputs: Vec<(String, bool)> = self
            .outputs
            .iter()
            .map(|&id| {
                let node = ctx.graph.node(id);
                (node.name.clone(), node.is_virtual)
            })
            .collect();
        let signature = self.signature(ctx.graph);
        let delegate = Arc::clone(ctx.delegate);
        let fs = ctx.delegate.file_system();
        let failed = Arc::clone(ctx.failed);
        let sender = ti.completion_sender();

        queue.add_job(QueueJob::new(move |jctx| {
            let started = Instant::now();
            delegate.command_started(&info);
            let mut discovered = Vec::new();
            let mut success = body.execute(jctx, &fs, &delegate, &mut discovered);
            delegate.command_finished(&info);

            let mut output_infos = Vec::new();
            if success {
                for (name, is_virtual) in &outputs {
                    if *is_virtual {
                        output_infos.push(FileInfo::missing());
                        continue;
                    }
                    let file_info = fs.file_info(name);
                    if file_info.is_missing() {
                        delegate.error(
                            "",
                            &Token::default(),
                            &format!("missing output '{}' from command '{}'", name, info.name),
                        );
                        success = false;
                        break;
                    }
                    output_infos.push(file_info);
                }
            }

            let value = if success {
                BuildValue::SuccessfulCommand {
                    outputs: output_infos,
                    signature,
                }
            } else {
                failed.store(true, Ordering::SeqCst);
                delegate.had_command_failure();
                BuildValue::FailedCommand
            };
            let mut completion = TaskCompletion::new(value.to_data());
            completion.discovered = discovered;
            completion.span = Some((started, Instant::now()));
            completion.lane = jctx.lane;
            sender.send(completion);
        }));
    }

    fn body(&self, graph: &BuildGraph) -> CommandBody {
        match &self.kind {
            CommandKind::Phony => CommandBody::Phony,
            CommandKind::Shell { args, env } => CommandBody::Shell {
                argv: args.clone(),
                env: env.clone(),
            },
            CommandKind::Clang { args, deps_path } => CommandBody::Clang {
                args: args.clone(),
                deps_path: deps_path.clone(),
            },
            CommandKind::Mkdir => CommandBody::Mkdir {
                output: self.output_name(graph).to_string(),
            },
            CommandKind::Custom(custom) => CommandBody::Custom(Arc::clone(custom)),
        }
    }
}
