//! The built-in tools (phony, shell, clang, mkdir), their execution bodies,
//! and the extension points a host uses to plug in its own tools.

use crate::buildsystem::{BuildSystemDelegate, Token};
use crate::command::{Command, CommandKind};
use crate::depfile;
use crate::fileinfo::FileSystem;
use crate::key::BuildKey;
use crate::queue::JobContext;
use crate::smallmap::SmallMap;
use std::sync::Arc;

/// An attribute value from a manifest command block.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Scalar(String),
    List(Vec<String>),
}

/// Creates commands.  Hosts provide implementations via
/// `BuildSystemDelegate::lookup_tool`; the built-in tools live here.
pub trait Tool {
    /// Create a command for a manifest command block naming this tool.
    fn create_command(&self, name: &str) -> Command;

    /// Create a command for a demanded custom-task key, if this tool
    /// understands it.  Built-in tools do not.
    fn create_custom_command(&self, _key: &BuildKey) -> Option<Command> {
        None
    }
}

/// A host-defined command body.  Runs on a worker lane, so implementations
/// must be thread-safe.
pub trait CustomCommand: Send + Sync {
    fn description(&self) -> String;

    /// Folded into the command signature.
    fn extra_signature(&self) -> u64 {
        0
    }

    /// Extra keys to request beyond the declared inputs, e.g. custom-task
    /// keys this command fans out to.
    fn requested_keys(&self) -> Vec<BuildKey> {
        Vec::new()
    }

    /// Accept a manifest attribute; false reports it as unexpected.
    fn configure_attribute(&self, _name: &str, _value: &AttrValue) -> bool {
        false
    }

    fn execute(&self, ctx: &JobContext, fs: &Arc<dyn FileSystem>) -> bool;
}

struct PhonyTool;
struct ShellTool;
struct ClangTool;
struct MkdirTool;

impl Tool for PhonyTool {
    fn create_command(&self, name: &str) -> Command {
        Command::new(name, CommandKind::Phony)
    }
}

impl Tool for ShellTool {
    fn create_command(&self, name: &str) -> Command {
        Command::new(
            name,
            CommandKind::Shell {
                args: Vec::new(),
                env: SmallMap::new(),
            },
        )
    }
}

impl Tool for ClangTool {
    fn create_command(&self, name: &str) -> Command {
        Command::new(
            name,
            CommandKind::Clang {
                args: String::new(),
                deps_path: None,
            },
        )
    }
}

impl Tool for MkdirTool {
    fn create_command(&self, name: &str) -> Command {
        Command::new(name, CommandKind::Mkdir)
    }
}

pub fn lookup_builtin(name: &str) -> Option<Box<dyn Tool>> {
    match name {
        "phony" => Some(Box::new(PhonyTool)),
        "shell" => Some(Box::new(ShellTool)),
        "clang" => Some(Box::new(ClangTool)),
        "mkdir" => Some(Box::new(MkdirTool)),
        _ => None,
    }
}

/// Apply one manifest attribute to a command.  Inputs, outputs, and the
/// tool name are handled by the manifest loader; everything else lands
/// here.
pub fn configure_attribute(
    command: &mut Command,
    name: &str,
    value: AttrValue,
) -> Result<(), String> {
    let command_name = command.name.clone();
    if name == "description" {
        return match value {
            AttrValue::Scalar(text) => {
                command.description = Some(text);
                Ok(())
            }
            AttrValue::List(_) => Err("expected scalar value for 'description'".to_string()),
        };
    }
    match &mut command.kind {
        CommandKind::Phony | CommandKind::Mkdir => {
            Err(format!("unexpected attribute: '{}'", name))
        }
        CommandKind::Shell { args, env } => match (name, value) {
            ("args", AttrValue::Scalar(text)) => {
                // A scalar runs via the shell.
                *args = vec!["/bin/sh".to_string(), "-c".to_string(), text];
                Ok(())
            }
            ("args", AttrValue::List(list)) => {
                if list.is_empty() {
                    return Err(format!("invalid arguments for command '{}'", command_name));
                }
                *args = list;
                Ok(())
            }
            ("env", AttrValue::List(entries)) => {
                let mut map = SmallMap::new();
                for entry in entries {
                    match entry.split_once('=') {
                        Some((k, v)) => map.insert(k.to_string(), v.to_string()),
                        None => {
                            return Err(format!("invalid environment entry '{}'", entry));
                        }
                    }
                }
                *env = map;
                Ok(())
            }
            (name, _) => Err(format!("unexpected attribute: '{}'", name)),
        },
        CommandKind::Clang { args, deps_path } => match (name, value) {
            ("args", AttrValue::Scalar(text)) => {
                *args = text;
                Ok(())
            }
            ("deps", AttrValue::Scalar(path)) => {
                *deps_path = Some(path);
                Ok(())
            }
            (name, _) => Err(format!("unexpected attribute: '{}'", name)),
        },
        CommandKind::Custom(custom) => {
            if custom.configure_attribute(name, &value) {
                Ok(())
            } else {
                Err(format!("unexpected attribute: '{}'", name))
            }
        }
    }
}

/// The worker-side snapshot of a command's work.
pub enum CommandBody {
    Phony,
    Shell {
        argv: Vec<String>,
        env: SmallMap<String, String>,
    },
    Clang {
        args: String,
        deps_path: Option<String>,
    },
    Mkdir {
        output: String,
    },
    Custom(Arc<dyn CustomCommand>),
}

impl CommandBody {
    /// Run the body on a worker lane.  Dependency keys discovered along the
    /// way are appended to `discovered`.
    pub fn execute(
        &self,
        jctx: &JobContext,
        fs: &Arc<dyn FileSystem>,
        delegate: &Arc<dyn BuildSystemDelegate>,
        discovered: &mut Vec<Vec<u8>>,
    ) -> bool {
        match self {
            CommandBody::Phony => true,
            CommandBody::Shell { argv, env } => jctx.execute_process(argv, env),
            CommandBody::Clang { args, deps_path } => {
                if !jctx.execute_shell_command(args) {
                    // No point gathering dependencies from a failed run.
                    return false;
                }
                match deps_path {
                    None => true,
                    Some(path) => {
                        process_discovered_dependencies(path, fs, delegate, discovered)
                    }
                }
            }
            CommandBody::Mkdir { output } => match fs.create_directories(output) {
                Ok(()) => true,
                Err(_) => {
                    delegate.error(
                        "",
                        &Token::default(),
                        &format!("unable to create directory '{}'", output),
                    );
                    false
                }
            },
            CommandBody::Custom(custom) => custom.execute(jctx, fs),
        }
    }
}

/// Ingest a makefile-format deps file.  The rule structure is ignored;
/// every dependency becomes a discovered node key.
fn process_discovered_dependencies(
    path: &str,
    fs: &Arc<dyn FileSystem>,
    delegate: &Arc<dyn BuildSystemDelegate>,
    discovered: &mut Vec<Vec<u8>>,
) -> bool {
    let contents = match fs.file_contents(path) {
        Ok(contents) => contents,
        Err(_) => {
            delegate.error(
                path,
                &Token::default(),
                &format!("unable to open dependencies file ({})", path),
            );
            return false;
        }
    };

    struct Actions<'a> {
        path: &'a str,
        delegate: &'a Arc<dyn BuildSystemDelegate>,
        discovered: &'a mut Vec<Vec<u8>>,
        errors: usize,
    }
    impl depfile::ParseActions for Actions<'_> {
        fn rule_start(&mut self, _name: &str) {}
        fn rule_dependency(&mut self, dep: &str) {
            self.discovered
                .push(BuildKey::Node(dep.to_string()).to_data());
        }
        fn rule_end(&mut self) {}
        fn error(&mut self, message: &str, offset: usize) {
            self.delegate.error(
                self.path,
                &Token {
                    start: offset,
                    length: 0,
                },
                &format!("error reading dependency file: {}", message),
            );
            self.errors += 1;
        }
    }

    let mut actions = Actions {
        path,
        delegate,
        discovered,
        errors: 0,
    };
    depfile::parse(&contents, &mut actions);
    actions.errors == 0
}
