//! The build graph: arenas of nodes and commands, plus targets.
//!
//! A command references its input and output nodes; a node references its
//! producing commands.  Both sides are stable integer ids into the arenas,
//! which is what lets the reference cycle exist without ownership tricks.

use crate::command::Command;
use crate::densemap::{declare_id, DenseMap};
use std::collections::HashMap;

declare_id!(NodeId);
declare_id!(CommandId);

/// A node name is virtual iff it is bracketed like `<all>`.
pub fn is_virtual_name(name: &str) -> bool {
    name.len() >= 2 && name.starts_with('<') && name.ends_with('>')
}

/// A named buildable entity, typically a file.
pub struct Node {
    pub name: String,
    pub is_virtual: bool,
    /// True for nodes created on first reference rather than declared by the
    /// manifest.  Implicit nodes never have producers.
    pub is_implicit: bool,
    pub producers: Vec<CommandId>,
}

/// A named ordered sequence of node references; carries no outcome beyond
/// existence.
pub struct Target {
    pub name: String,
    pub nodes: Vec<NodeId>,
}

#[derive(Default)]
pub struct BuildGraph {
    pub nodes: DenseMap<NodeId, Node>,
    node_names: HashMap<String, NodeId>,
    pub commands: DenseMap<CommandId, Command>,
    command_names: HashMap<String, CommandId>,
    pub targets: Vec<Target>,
}

impl BuildGraph {
    pub fn new() -> BuildGraph {
        BuildGraph::default()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes.get(id)
    }

    pub fn command(&self, id: CommandId) -> &Command {
        self.commands.get(id)
    }

    /// Look up a node of any kind by name.
    pub fn lookup_node(&self, name: &str) -> Option<NodeId> {
        self.node_names.get(name).copied()
    }

    /// Intern a node declared by the manifest (referenced from a command or
    /// target).  Two references to the same name yield the same id.
    pub fn declare_node(&mut self, name: &str) -> NodeId {
        if let Some(&id) = self.node_names.get(name) {
            return id;
        }
        let id = self.nodes.push(Node {
            name: name.to_string(),
            is_virtual: is_virtual_name(name),
            is_implicit: false,
            producers: Vec::new(),
        });
        self.node_names.insert(name.to_string(), id);
        id
    }

    /// Resolve a name to its node, creating a dynamic node on first
    /// reference.  Dynamic nodes have no producers and are always inputs.
    pub fn lookup_or_create_dynamic(&mut self, name: &str) -> NodeId {
        if let Some(&id) = self.node_names.get(name) {
            return id;
        }
        let id = self.nodes.push(Node {
            name: name.to_string(),
            is_virtual: is_virtual_name(name),
            is_implicit: true,
            producers: Vec::new(),
        });
        self.node_names.insert(name.to_string(), id);
        id
    }

    /// Add a manifest command, wiring each output node's producer list.
    /// A node gaining a second producer is not an error here; ambiguity is
    /// reported when the node is actually demanded.
    pub fn add_command(&mut self, command: Command) -> CommandId {
        let id = self.commands.next_id();
        for &out in &command.outputs {
            self.nodes.get_mut(out).producers.push(id);
        }
        self.command_names.insert(command.name.clone(), id);
        self.commands.push(command)
    }

    /// Register a tool-created custom command; it is addressed by key, not
    /// by manifest name, so the name table is left alone.
    pub fn add_custom_command(&mut self, command: Command) -> CommandId {
        self.commands.push(command)
    }

    pub fn lookup_command(&self, name: &str) -> Option<CommandId> {
        self.command_names.get(name).copied()
    }

    pub fn add_target(&mut self, target: Target) {
        self.targets.push(target);
    }

    pub fn lookup_target(&self, name: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.name == name)
    }
}
