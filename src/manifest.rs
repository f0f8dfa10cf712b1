//! Loading the build manifest into a graph.
//!
//! The format is line-oriented:
//!
//! ```text
//! # comment
//! client llb 0
//! tool sometool
//! target all: out <sync>
//! command cat
//!   tool = shell
//!   inputs = in1 in2
//!   outputs = out
//!   args = cat in1 in2 > out
//! ```
//!
//! Attribute values run to end of line; a value bracketed `[a, b, c]` is an
//! ordered list.  Which attributes a command accepts is up to its tool.

use crate::buildsystem::{BuildSystemDelegate, Token};
use crate::graph::{BuildGraph, NodeId, Target};
use crate::scanner::{ParseResult, Scanner};
use crate::tools::{self, AttrValue, Tool};
use std::sync::Arc;

pub struct Manifest {
    pub graph: BuildGraph,
    /// Tools in declaration/reference order; custom-task lookup walks this.
    pub tools: Vec<(String, Box<dyn Tool>)>,
}

/// Load and parse `filename`.  Problems are reported through the delegate
/// error channel; None means the manifest is unusable.
pub fn load(filename: &str, delegate: &Arc<dyn BuildSystemDelegate>) -> Option<Manifest> {
    let mut bytes = match delegate.file_system().file_contents(filename) {
        Ok(bytes) => bytes,
        Err(err) => {
            delegate.error(
                filename,
                &Token::default(),
                &format!("unable to read manifest: {}", err),
            );
            return None;
        }
    };
    delegate.set_file_contents_being_parsed(&bytes);
    bytes.push(0);

    let mut loader = Loader {
        delegate,
        filename,
        graph: BuildGraph::new(),
        tools: Vec::new(),
        errors: 0,
    };
    let mut scanner = Scanner::new(&bytes);
    if let Err(err) = loader.parse(&mut scanner) {
        let (line, col) = scanner.line_col(err.ofs);
        delegate.error(
            filename,
            &Token {
                start: err.ofs,
                length: 0,
            },
            &format!("{}:{}: {}", line, col, err.msg),
        );
        return None;
    }
    if loader.errors > 0 {
        return None;
    }
    Some(Manifest {
        graph: loader.graph,
        tools: loader.tools,
    })
}

struct Loader<'a> {
    delegate: &'a Arc<dyn BuildSystemDelegate>,
    filename: &'a str,
    graph: BuildGraph,
    tools: Vec<(String, Box<dyn Tool>)>,
    errors: usize,
}

fn read_ident<'a>(s: &mut Scanner<'a>) -> ParseResult<&'a str> {
    let start = s.ofs;
    while s.peek().is_ascii_alphanumeric() || s.peek() == '_' {
        s.next();
    }
    if s.ofs == start {
        return s.parse_error("expected identifier");
    }
    Ok(s.slice(start, s.ofs))
}

fn read_name<'a>(s: &mut Scanner<'a>) -> ParseResult<&'a str> {
    let start = s.ofs;
    while !matches!(s.peek(), ' ' | '\n' | '\0') {
        s.next();
    }
    if s.ofs == start {
        return s.parse_error("expected name");
    }
    Ok(s.slice(start, s.ofs))
}

fn read_value(s: &mut Scanner) -> ParseResult<AttrValue> {
    if s.peek() != '[' {
        let start = s.ofs;
        while !matches!(s.peek(), '\n' | '\0') {
            s.next();
        }
        return Ok(AttrValue::Scalar(s.slice(start, s.ofs).trim_end().to_string()));
    }
    s.next();
    let mut items = Vec::new();
    let mut current = String::new();
    loop {
        match s.read() {
            ']' => {
                let item = current.trim();
                if !item.is_empty() {
                    items.push(item.to_string());
                }
                break;
            }
            ',' => {
                items.push(current.trim().to_string());
                current.clear();
            }
            '\n' | '\0' => return s.parse_error("unterminated list"),
            c => current.push(c),
        }
    }
    Ok(AttrValue::List(items))
}

fn end_of_line(s: &mut Scanner) -> ParseResult<()> {
    s.skip_spaces();
    match s.peek() {
        '\n' => {
            s.next();
            Ok(())
        }
        '\0' => Ok(()),
        _ => s.parse_error("expected end of line"),
    }
}

impl Loader<'_> {
    fn error_at(&mut self, ofs: usize, message: &str) {
        self.errors += 1;
        self.delegate.error(
            self.filename,
            &Token {
                start: ofs,
                length: 0,
            },
            message,
        );
    }

    fn parse(&mut self, s: &mut Scanner) -> ParseResult<()> {
        loop {
            match s.peek() {
                '\0' => return Ok(()),
                '\n' => s.next(),
                '#' => {
                    while !matches!(s.peek(), '\n' | '\0') {
                        s.next();
                    }
                }
                ' ' => return s.parse_error("unexpected indent"),
                _ => {
                    let ident = read_ident(s)?;
                    s.skip_spaces();
                    match ident {
                        "client" => self.parse_client(s)?,
                        "tool" => self.parse_tool(s)?,
                        "target" => self.parse_target(s)?,
                        "command" => self.parse_command(s)?,
                        ident => {
                            return s.parse_error(format!("unknown statement {:?}", ident));
                        }
                    }
                }
            }
        }
    }

    fn parse_client(&mut self, s: &mut Scanner) -> ParseResult<()> {
        let ofs = s.ofs;
        let name = read_name(s)?.to_string();
        s.skip_spaces();
        let version_text = read_name(s)?;
        let version: u32 = match version_text.parse() {
            Ok(version) => version,
            Err(_) => return s.parse_error("expected client version"),
        };
        end_of_line(s)?;
        if name != self.delegate.name() || version != self.delegate.version() {
            self.error_at(ofs, "unable to configure client");
        }
        Ok(())
    }

    /// Resolve a tool by name, host tools first, and record it in
    /// declaration order.
    fn ensure_tool(&mut self, name: &str, ofs: usize) -> bool {
        if self.tools.iter().any(|(n, _)| n == name) {
            return true;
        }
        let tool = self
            .delegate
            .lookup_tool(name)
            .or_else(|| tools::lookup_builtin(name));
        match tool {
            Some(tool) => {
                self.tools.push((name.to_string(), tool));
                true
            }
            None => {
                self.error_at(ofs, &format!("invalid tool type: '{}'", name));
                false
            }
        }
    }

    fn parse_tool(&mut self, s: &mut Scanner) -> ParseResult<()> {
        let ofs = s.ofs;
        let name = read_name(s)?.to_string();
        end_of_line(s)?;
        self.ensure_tool(&name, ofs);
        Ok(())
    }

    fn parse_target(&mut self, s: &mut Scanner) -> ParseResult<()> {
        let name = read_name(s)?;
        let name = match name.strip_suffix(':') {
            Some(name) => name.to_string(),
            None => {
                let name = name.to_string();
                s.skip_spaces();
                s.expect(':')?;
                name
            }
        };
        s.skip_spaces();
        let mut nodes = Vec::new();
        while !matches!(s.peek(), '\n' | '\0') {
            let node = read_name(s)?;
            nodes.push(self.graph.declare_node(node));
            s.skip_spaces();
        }
        end_of_line(s)?;
        self.graph.add_target(Target { name, nodes });
        Ok(())
    }

    fn node_list(&mut self, value: AttrValue) -> Vec<NodeId> {
        match value {
            AttrValue::Scalar(text) => text
                .split_whitespace()
                .map(|name| self.graph.declare_node(name))
                .collect(),
            AttrValue::List(items) => items
                .iter()
                .map(|name| self.graph.declare_node(name))
                .collect(),
        }
    }

    fn parse_command(&mut self, s: &mut Scanner) -> ParseResult<()> {
        let name_ofs = s.ofs;
        let name = read_name(s)?.to_string();
        end_of_line(s)?;

        let mut attrs: Vec<(usize, String, AttrValue)> = Vec::new();
        while s.peek() == ' ' {
            s.skip_spaces();
            let attr_ofs = s.ofs;
            let attr = read_ident(s)?.to_string();
            s.skip_spaces();
            s.expect('=')?;
            s.skip_spaces();
            let value = read_value(s)?;
            end_of_line(s)?;
            attrs.push((attr_ofs, attr, value));
        }

        if self.graph.lookup_command(&name).is_some() {
            self.error_at(name_ofs, &format!("duplicate command '{}'", name));
            return Ok(());
        }

        let Some(tool_pos) = attrs.iter().position(|(_, attr, _)| attr == "tool") else {
            self.error_at(
                name_ofs,
                &format!("missing attribute 'tool' for command '{}'", name),
            );
            return Ok(());
        };
        let tool_ofs = attrs[tool_pos].0;
        let tool_name = match &attrs[tool_pos].2 {
            AttrValue::Scalar(tool_name) => tool_name.clone(),
            AttrValue::List(_) => {
                self.error_at(tool_ofs, "expected scalar value for 'tool'");
                return Ok(());
            }
        };
        if !self.ensure_tool(&tool_name, tool_ofs) {
            return Ok(());
        }
        let mut command = {
            let tool = &self
                .tools
                .iter()
                .find(|(n, _)| n == &tool_name)
                .unwrap()
                .1;
            tool.create_command(&name)
        };

        for (i, (ofs, attr, value)) in attrs.into_iter().enumerate() {
            if i == tool_pos {
                continue;
            }
            match attr.as_str() {
                "inputs" => command.inputs = self.node_list(value),
                "outputs" => command.outputs = self.node_list(value),
                _ => {
                    if let Err(message) = tools::configure_attribute(&mut command, &attr, value) {
                        self.error_at(ofs, &message);
                    }
                }
            }
        }

        if matches!(command.kind, crate::command::CommandKind::Mkdir) {
            if !command.inputs.is_empty() {
                self.error_at(
                    name_ofs,
                    &format!(
                        "unexpected explicit input: '{}'",
                        self.graph.node(command.inputs[0]).name
                    ),
                );
            }
            match command.outputs.len() {
                0 => self.error_at(name_ofs, "missing declared output"),
                1 => {
                    if self.graph.node(command.outputs[0]).is_virtual {
                        self.error_at(name_ofs, "unexpected virtual output");
                    }
                }
                _ => {
                    let extras = command.outputs[1..]
                        .iter()
                        .map(|&id| self.graph.node(id).name.as_str())
                        .collect::<Vec<_>>()
                        .join("', '");
                    self.error_at(
                        name_ofs,
                        &format!("unexpected explicit outputs: '{}'", extras),
                    );
                }
            }
        }

        self.graph.add_command(command);
        Ok(())
    }
}
