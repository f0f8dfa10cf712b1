//! BuildValue: the tagged outcome of building a key, and the stable encoded
//! form stored in the build database.

use crate::fileinfo::FileInfo;
use crate::hash::Signature;

/// The outcome of building some key.  Correctness is carried entirely by
/// these variants; errors never cross the engine boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildValue {
    /// Never a valid cached outcome; forces dependents to rebuild.
    Invalid,
    /// Marker for a virtual node: "exists", with no filesystem presence.
    VirtualInput,
    /// A leaf file observed with this stat fingerprint.
    ExistingInput(FileInfo),
    /// A leaf file that is absent.
    MissingInput,
    /// A node that could not be produced (ambiguous producer or upstream
    /// failure).
    FailedInput,
    /// A command that ran; one FileInfo per declared output, plus the
    /// command signature at the time it ran.
    SuccessfulCommand {
        outputs: Vec<FileInfo>,
        signature: Signature,
    },
    /// A command that ran and failed.
    FailedCommand,
    /// A command that was skipped (e.g. cancellation).
    SkippedCommand,
    /// Marker result for a target; targets always re-evaluate.
    Target,
}

const TAG_INVALID: u8 = 0;
const TAG_VIRTUAL_INPUT: u8 = 1;
const TAG_EXISTING_INPUT: u8 = 2;
const TAG_MISSING_INPUT: u8 = 3;
const TAG_FAILED_INPUT: u8 = 4;
const TAG_SUCCESSFUL_COMMAND: u8 = 5;
const TAG_FAILED_COMMAND: u8 = 6;
const TAG_SKIPPED_COMMAND: u8 = 7;
const TAG_TARGET: u8 = 8;

impl BuildValue {
    pub fn is_invalid(&self) -> bool {
        matches!(self, BuildValue::Invalid)
    }

    pub fn is_missing_input(&self) -> bool {
        matches!(self, BuildValue::MissingInput)
    }

    pub fn is_failed_input(&self) -> bool {
        matches!(self, BuildValue::FailedInput)
    }

    pub fn is_successful_command(&self) -> bool {
        matches!(self, BuildValue::SuccessfulCommand { .. })
    }

    pub fn to_data(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            BuildValue::Invalid => buf.push(TAG_INVALID),
            BuildValue::VirtualInput => buf.push(TAG_VIRTUAL_INPUT),
            BuildValue::ExistingInput(info) => {
                buf.push(TAG_EXISTING_INPUT);
                info.encode(&mut buf);
            }
            BuildValue::MissingInput => buf.push(TAG_MISSING_INPUT),
            BuildValue::FailedInput => buf.push(TAG_FAILED_INPUT),
            BuildValue::SuccessfulCommand { outputs, signature } => {
                buf.push(TAG_SUCCESSFUL_COMMAND);
                buf.extend_from_slice(&signature.0.to_le_bytes());
                buf.extend_from_slice(&(outputs.len() as u32).to_le_bytes());
                for info in outputs {
                    info.encode(&mut buf);
                }
            }
            BuildValue::FailedCommand => buf.push(TAG_FAILED_COMMAND),
            BuildValue::SkippedCommand => buf.push(TAG_SKIPPED_COMMAND),
            BuildValue::Target => buf.push(TAG_TARGET),
        }
        buf
    }

    pub fn from_data(data: &[u8]) -> BuildValue {
        let Some((&tag, rest)) = data.split_first() else {
            return BuildValue::Invalid;
        };
        match tag {
            TAG_INVALID => BuildValue::Invalid,
            TAG_VIRTUAL_INPUT => BuildValue::VirtualInput,
            TAG_EXISTING_INPUT => match FileInfo::decode(rest) {
                Some((info, _)) => BuildValue::ExistingInput(info),
                None => BuildValue::Invalid,
            },
            TAG_MISSING_INPUT => BuildValue::MissingInput,
            TAG_FAILED_INPUT => BuildValue::FailedInput,
            TAG_SUCCESSFUL_COMMAND => {
                if rest.len() < 12 {
                    return BuildValue::Invalid;
                }
                let signature = Signature(u64::from_le_bytes(rest[..8].try_into().unwrap()));
                let count = u32::from_le_bytes(rest[8..12].try_into().unwrap()) as usize;
                let mut rest = &rest[12..];
                let mut outputs = Vec::with_capacity(count);
                for _ in 0..count {
                    match FileInfo::decode(rest) {
                        Some((info, tail)) => {
                            outputs.push(info);
                            rest = tail;
                        }
                        None => return BuildValue::Invalid,
                    }
                }
                BuildValue::SuccessfulCommand { outputs, signature }
            }
            TAG_FAILED_COMMAND => BuildValue::FailedCommand,
            TAG_SKIPPED_COMMAND => BuildValue::SkippedCommand,
            TAG_TARGET => BuildValue::Target,
            _ => BuildValue::Invalid,
        }
    }
}
