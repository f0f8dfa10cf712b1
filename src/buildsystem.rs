//! The build system: binds manifest targets, nodes, and commands to engine
//! rules, and drives builds on behalf of a host delegate.

use crate::command::{CommandContext, CommandInfo, CommandRunState};
use crate::db::BuildDb;
use crate::engine::{Engine, EngineDelegate, TaskInterface};
use crate::fileinfo::FileSystem;
use crate::graph::{BuildGraph, CommandId, NodeId};
use crate::key::BuildKey;
use crate::manifest;
use crate::queue::ExecutionQueue;
use crate::tools::Tool;
use crate::value::BuildValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Source location for delegate error reports, as byte offsets into the
/// file named alongside it.
#[derive(Debug, Default, Clone, Copy)]
pub struct Token {
    pub start: usize,
    pub length: usize,
}

/// The host side of the build system.  Worker lanes invoke the status
/// subset (`is_cancelled`, `command_started`, `command_finished`,
/// `had_command_failure`, `error`) concurrently, so implementations must be
/// thread-safe throughout.
pub trait BuildSystemDelegate: Send + Sync {
    /// Client name the manifest's `client` declaration must match.
    fn name(&self) -> &str;
    /// Client schema version; folded into the database schema version.
    fn version(&self) -> u32;

    fn file_system(&self) -> Arc<dyn FileSystem>;

    /// First crack at resolving a tool name; built-in tools are consulted
    /// after.
    fn lookup_tool(&self, name: &str) -> Option<Box<dyn Tool>>;

    fn create_execution_queue(&self) -> Box<dyn ExecutionQueue>;

    /// Advisory human-facing diagnostics; correctness is carried by build
    /// values, never by this channel.
    fn error(&self, filename: &str, at: &Token, message: &str);

    fn set_file_contents_being_parsed(&self, buf: &[u8]);

    /// Polled before each command is scheduled.
    fn is_cancelled(&self) -> bool;

    fn command_started(&self, command: &CommandInfo);
    fn command_finished(&self, command: &CommandInfo);
    fn had_command_failure(&self);
}

const INTERNAL_SCHEMA_VERSION: u32 = 1;

/// Low 16 bits internal schema, high 16 bits the client's version; bumping
/// either invalidates the entire persistent cache.
pub fn merged_schema_version(client_version: u32) -> u32 {
    debug_assert!(client_version <= 1 << 16, "unsupported client version");
    INTERNAL_SCHEMA_VERSION + client_version.wrapping_shl(16)
}

/// What a key resolved to; tasks are minted from this on demand.
pub struct Rule {
    pub key: BuildKey,
    binding: RuleBinding,
}

#[derive(Clone, Copy)]
enum RuleBinding {
    Command(CommandId),
    InputNode(NodeId),
    ProducedNode(NodeId),
    Target(usize),
    /// Key no longer corresponds to anything buildable; completes Invalid
    /// with force_change so dependents re-evaluate.
    Missing,
}

pub struct TargetTask {
    target: usize,
    has_missing_input: bool,
}

pub struct InputNodeTask {
    node: NodeId,
}

pub struct ProducedNodeTask {
    node: NodeId,
    producer: Option<CommandId>,
    node_result: BuildValue,
    is_invalid: bool,
}

pub struct CommandTask {
    command: CommandId,
    state: CommandRunState,
}

pub enum BuildTask {
    Target(TargetTask),
    InputNode(InputNodeTask),
    ProducedNode(ProducedNodeTask),
    Command(CommandTask),
    MissingCommand,
}

/// The engine-facing half of the system: owns the graph, the tool list,
/// and the queue while a build is in flight.
struct SystemDelegate {
    delegate: Arc<dyn BuildSystemDelegate>,
    main_filename: String,
    graph: BuildGraph,
    tools: Vec<(String, Box<dyn Tool>)>,
    /// None until the first build attempts a load.
    loaded: Option<bool>,
    queue: Option<Box<dyn ExecutionQueue>>,
    failed: Arc<AtomicBool>,
}

impl SystemDelegate {
    fn report_error(&self, message: &str) {
        self.report_error_in(&self.main_filename, message);
    }

    fn report_error_in(&self, filename: &str, message: &str) {
        self.failed.store(true, Ordering::SeqCst);
        self.delegate.error(filename, &Token::default(), message);
    }

    fn ensure_loaded(&mut self) -> bool {
        if let Some(ok) = self.loaded {
            return ok;
        }
        let ok = match manifest::load(&self.main_filename, &self.delegate) {
            Some(manifest) => {
                self.graph = manifest.graph;
                self.tools = manifest.tools;
                true
            }
            None => false,
        };
        self.loaded = Some(ok);
        ok
    }

    fn command_context(&self) -> CommandContext<'_> {
        CommandContext {
            graph: &self.graph,
            delegate: &self.delegate,
            failed: &self.failed,
            main_filename: &self.main_filename,
        }
    }
}

impl EngineDelegate for SystemDelegate {
    type Rule = Rule;
    type Task = BuildTask;

    fn lookup_rule(&mut self, key_data: &[u8]) -> Rule {
        let key = BuildKey::from_data(key_data);
        let binding = match &key {
            BuildKey::Command(name) => match self.graph.lookup_command(name) {
                Some(id) => RuleBinding::Command(id),
                None => RuleBinding::Missing,
            },
            BuildKey::CustomTask { .. } => {
                // First declared tool that understands the key owns it.
                let mut binding = RuleBinding::Missing;
                for i in 0..self.tools.len() {
                    if let Some(command) = self.tools[i].1.create_custom_command(&key) {
                        binding = RuleBinding::Command(self.graph.add_custom_command(command));
                        break;
                    }
                }
                binding
            }
            BuildKey::Node(name) => {
                let id = self.graph.lookup_or_create_dynamic(name);
                if self.graph.node(id).producers.is_empty() {
                    RuleBinding::InputNode(id)
                } else {
                    RuleBinding::ProducedNode(id)
                }
            }
            BuildKey::Target(name) => match self.graph.targets.iter().position(|t| &t.name == name)
            {
                Some(index) => RuleBinding::Target(index),
                None => {
                    self.report_error(&format!("unknown target '{}'", name));
                    RuleBinding::Missing
                }
            },
            BuildKey::Unknown => {
                self.report_error("unknown key demanded");
                RuleBinding::Missing
            }
        };
        Rule { key, binding }
    }

    fn rule_is_valid(&mut self, rule: &Rule, value_data: &[u8]) -> bool {
        let value = BuildValue::from_data(value_data);
        match rule.binding {
            RuleBinding::Command(id) => {
                let fs = self.delegate.file_system();
                self.graph
                    .command(id)
                    .is_result_valid(&self.graph, fs.as_ref(), &value)
            }
            RuleBinding::InputNode(id) => {
                let node = self.graph.node(id);
                if node.is_virtual {
                    return matches!(value, BuildValue::VirtualInput);
                }
                let info = self.delegate.file_system().file_info(&node.name);
                if info.is_missing() {
                    matches!(value, BuildValue::MissingInput)
                } else {
                    matches!(value, BuildValue::ExistingInput(stored) if stored == info)
                }
            }
            // Freshness of a produced node flows from its producing
            // command; only a failure forces a revisit.
            RuleBinding::ProducedNode(_) => !value.is_failed_input(),
            RuleBinding::Target(_) => false,
            RuleBinding::Missing => false,
        }
    }

    fn create_task(&mut self, rule: &Rule) -> BuildTask {
        match rule.binding {
            RuleBinding::Target(target) => BuildTask::Target(TargetTask {
                target,
                has_missing_input: false,
            }),
            RuleBinding::InputNode(node) => BuildTask::InputNode(InputNodeTask { node }),
            RuleBinding::ProducedNode(node) => BuildTask::ProducedNode(ProducedNodeTask {
                node,
                producer: None,
                node_result: BuildValue::Invalid,
                is_invalid: false,
            }),
            RuleBinding::Command(command) => BuildTask::Command(CommandTask {
                command,
                state: CommandRunState::default(),
            }),
            RuleBinding::Missing => BuildTask::MissingCommand,
        }
    }

    fn task_start(&mut self, ti: &mut TaskInterface, task: &mut BuildTask) {
        match task {
            BuildTask::Target(t) => {
                for (i, &node) in self.graph.targets[t.target].nodes.iter().enumerate() {
                    ti.needs_input(
                        BuildKey::Node(self.graph.node(node).name.clone()).to_data(),
                        i,
                    );
                }
            }
            BuildTask::InputNode(t) => {
                debug_assert!(self.graph.node(t.node).producers.is_empty());
            }
            BuildTask::ProducedNode(t) => {
                let producers = &self.graph.node(t.node).producers;
                if producers.len() == 1 {
                    let producer = producers[0];
                    t.producer = Some(producer);
                    ti.needs_input(
                        BuildKey::Command(self.graph.command(producer).name.clone()).to_data(),
                        0,
                    );
                } else {
                    // Multiple producers are unsupported; no merge attempt.
                    let first = self.graph.command(producers[0]).name.clone();
                    let second = self.graph.command(producers[1]).name.clone();
                    let node = self.graph.node(t.node).name.clone();
                    self.report_error_in(
                        "",
                        &format!(
                            "unable to build node: '{}' (node is produced by multiple \
                             commands; e.g., '{}' and '{}')",
                            node, first, second
                        ),
                    );
                    t.is_invalid = true;
                }
            }
            BuildTask::Command(t) => {
                self.graph.command(t.command).start(ti, &self.graph);
            }
            BuildTask::MissingCommand => {}
        }
    }

    fn task_provide_prior_value(
        &mut self,
        _ti: &mut TaskInterface,
        task: &mut BuildTask,
        value_data: &[u8],
    ) {
        if let BuildTask::Command(t) = task {
            let value = BuildValue::from_data(value_data);
            self.graph.command(t.command).provide_prior_value(&value);
        }
    }

    fn task_provide_value(
        &mut self,
        _ti: &mut TaskInterface,
        task: &mut BuildTask,
        input_id: usize,
        value_data: &[u8],
    ) {
        let value = BuildValue::from_data(value_data);
        match task {
            BuildTask::Target(t) => {
                if value.is_missing_input() {
                    t.has_missing_input = true;
                    let node = self.graph.targets[t.target].nodes[input_id];
                    self.report_error(&format!(
                        "missing input '{}' and no rule to build it",
                        self.graph.node(node).name
                    ));
                }
            }
            BuildTask::ProducedNode(t) => {
                if let Some(producer) = t.producer {
                    t.node_result = self.graph.command(producer).result_for_output(
                        &self.graph,
                        t.node,
                        &value,
                    );
                }
            }
            BuildTask::Command(t) => {
                let ctx = self.command_context();
                self.graph
                    .command(t.command)
                    .provide_value(&ctx, &mut t.state, input_id, &value);
            }
            _ => {}
        }
    }

    fn task_inputs_available(&mut self, ti: &mut TaskInterface, task: &mut BuildTask) {
        match task {
            BuildTask::Target(t) => {
                if t.has_missing_input {
                    self.report_error(&format!(
                        "cannot build target '{}' due to missing input",
                        self.graph.targets[t.target].name
                    ));
                    self.delegate.had_command_failure();
                }
                // Complete regardless; the target key itself is never a
                // valid cached result, so it re-evaluates every build.
                ti.complete(BuildValue::Target.to_data(), false);
            }
            BuildTask::InputNode(t) => {
                let node = self.graph.node(t.node);
                let value = if node.is_virtual {
                    BuildValue::VirtualInput
                } else {
                    let info = self.delegate.file_system().file_info(&node.name);
                    if info.is_missing() {
                        BuildValue::MissingInput
                    } else {
                        BuildValue::ExistingInput(info)
                    }
                };
                ti.complete(value.to_data(), false);
            }
            BuildTask::ProducedNode(t) => {
                if t.is_invalid {
                    ti.complete(BuildValue::FailedInput.to_data(), false);
                } else {
                    debug_assert!(!t.node_result.is_invalid());
                    ti.complete(t.node_result.to_data(), false);
                }
            }
            BuildTask::Command(t) => {
                let command = t.command;
                let state = std::mem::take(&mut t.state);
                let Some(mut queue) = self.queue.take() else {
                    ti.complete(BuildValue::SkippedCommand.to_data(), false);
                    return;
                };
                let ctx = self.command_context();
                self.graph
                    .command(command)
                    .inputs_available(ti, &ctx, &mut *queue, &state);
                drop(ctx);
                self.queue = Some(queue);
            }
            BuildTask::MissingCommand => {
                ti.complete(BuildValue::Invalid.to_data(), true);
            }
        }
    }

    fn cycle_detected(&mut self, cycle: &[Vec<u8>]) {
        let path = cycle
            .iter()
            .map(|key| BuildKey::from_data(key).describe())
            .collect::<Vec<_>>()
            .join(" -> ");
        self.report_error(&format!("cycle detected while building: {}", path));
    }

    fn error(&mut self, message: &str) {
        self.report_error(message);
    }

    fn describe_key(&self, key: &[u8]) -> String {
        BuildKey::from_data(key).describe()
    }
}

/// The public face of the core.
pub struct BuildSystem {
    engine: Engine<SystemDelegate>,
}

impl BuildSystem {
    pub fn new(delegate: Arc<dyn BuildSystemDelegate>, main_filename: &str) -> BuildSystem {
        BuildSystem {
            engine: Engine::new(SystemDelegate {
                delegate,
                main_filename: main_filename.to_string(),
                graph: BuildGraph::new(),
                tools: Vec::new(),
                loaded: None,
                queue: None,
                failed: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    /// Attach the persistent cache.  Must be called before `build`; a
    /// schema mismatch fails, leaving the caller to choose between a cold
    /// rebuild (don't attach) and aborting.
    pub fn attach_db(&mut self, path: &str) -> Result<(), String> {
        let version = merged_schema_version(self.engine.delegate.delegate.version());
        let db = BuildDb::open(path, version)?;
        self.engine.attach_db(db);
        Ok(())
    }

    pub fn enable_tracing(&mut self, path: &str) -> Result<(), String> {
        self.engine.enable_tracing(path)
    }

    /// Build the named target.  Returns false if the manifest failed to
    /// load, any command failed, any error was reported, the build was
    /// cancelled, or a cycle stalled it.
    pub fn build(&mut self, target: &str) -> bool {
        if !self.engine.delegate.ensure_loaded() {
            self.engine.delegate.report_error("unable to load build file");
            return false;
        }
        self.engine.delegate.failed.store(false, Ordering::SeqCst);
        self.engine.delegate.queue =
            Some(self.engine.delegate.delegate.create_execution_queue());

        let key = BuildKey::Target(target.to_string()).to_data();
        let result = self.engine.build(&key);

        // Dropping the queue joins every lane; by the time it returns, any
        // in-flight completion records have been consumed by the loop above
        // or sit in the channel for the next build's reset to discard.
        self.engine.delegate.queue = None;

        result.is_some()
            && !self.engine.delegate.failed.load(Ordering::SeqCst)
            && !self.engine.delegate.delegate.is_cancelled()
    }
}
