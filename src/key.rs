//! BuildKey: the discriminated identity of every buildable entity.
//!
//! Keys are the sole identity used for caching and cycle detection, so the
//! encoded form is a stable contract: a leading kind byte followed by a
//! kind-specific payload.

/// Identity of an entity the engine can be asked to build.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BuildKey {
    /// A concrete command from the manifest.
    Command(String),
    /// A task created on demand by a tool, with tool-defined payload.
    CustomTask { name: String, payload: Vec<u8> },
    /// A node (file or virtual).
    Node(String),
    /// A named target.
    Target(String),
    /// Reserved; decoding unrecognized data lands here.
    Unknown,
}

const KIND_COMMAND: u8 = b'C';
const KIND_CUSTOM_TASK: u8 = b'X';
const KIND_NODE: u8 = b'N';
const KIND_TARGET: u8 = b'T';
const KIND_UNKNOWN: u8 = b'U';

impl BuildKey {
    pub fn to_data(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            BuildKey::Command(name) => {
                buf.push(KIND_COMMAND);
                buf.extend_from_slice(name.as_bytes());
            }
            BuildKey::CustomTask { name, payload } => {
                buf.push(KIND_CUSTOM_TASK);
                buf.extend_from_slice(&(name.len() as u32).to_le_bytes());
                buf.extend_from_slice(name.as_bytes());
                buf.extend_from_slice(payload);
            }
            BuildKey::Node(name) => {
                buf.push(KIND_NODE);
                buf.extend_from_slice(name.as_bytes());
            }
            BuildKey::Target(name) => {
                buf.push(KIND_TARGET);
                buf.extend_from_slice(name.as_bytes());
            }
            BuildKey::Unknown => buf.push(KIND_UNKNOWN),
        }
        buf
    }

    pub fn from_data(data: &[u8]) -> BuildKey {
        let Some((&kind, rest)) = data.split_first() else {
            return BuildKey::Unknown;
        };
        let name = |bytes: &[u8]| String::from_utf8(bytes.to_vec());
        match kind {
            KIND_COMMAND => match name(rest) {
                Ok(n) => BuildKey::Command(n),
                Err(_) => BuildKey::Unknown,
            },
            KIND_CUSTOM_TASK => {
                if rest.len() < 4 {
                    return BuildKey::Unknown;
                }
                let len = u32::from_le_bytes(rest[..4].try_into().unwrap()) as usize;
                let rest = &rest[4..];
                if rest.len() < len {
                    return BuildKey::Unknown;
                }
                match name(&rest[..len]) {
                    Ok(n) => BuildKey::CustomTask {
                        name: n,
                        payload: rest[len..].to_vec(),
                    },
                    Err(_) => BuildKey::Unknown,
                }
            }
            KIND_NODE => match name(rest) {
                Ok(n) => BuildKey::Node(n),
                Err(_) => BuildKey::Unknown,
            },
            KIND_TARGET => match name(rest) {
                Ok(n) => BuildKey::Target(n),
                Err(_) => BuildKey::Unknown,
            },
            _ => BuildKey::Unknown,
        }
    }

    /// The form used in cycle reports, e.g. `node 'out'`.
    pub fn describe(&self) -> String {
        match self {
            BuildKey::Command(n) => format!("command '{}'", n),
            BuildKey::CustomTask { name, .. } => format!("custom task '{}'", name),
            BuildKey::Node(n) => format!("node '{}'", n),
            BuildKey::Target(n) => format!("target '{}'", n),
            BuildKey::Unknown => "((unknown))".to_string(),
        }
    }
}
