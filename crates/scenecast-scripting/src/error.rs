//! Load-path failure taxonomy.
//!
//! Interpreter errors raised while a script is *running* (callbacks, ticks,
//! unload hooks) never surface as values; they are logged at the call
//! boundary and swallowed so one broken script cannot halt another script's
//! events. Only the load path reports structured errors.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScriptError {
    /// The interpreter instance could not be set up. Fatal to this single
    /// load attempt only.
    #[error("failed to create interpreter for '{}': {text}", path.display())]
    AllocationFailure { path: PathBuf, text: String },

    /// Syntax error, unreadable file, or a failure while running the
    /// bootstrap snippet.
    #[error("failed to compile '{}': {text}", path.display())]
    CompileFailure { path: PathBuf, text: String },

    /// Error raised during the script's top-level execution.
    #[error("error running '{}': {text}", path.display())]
    RuntimeFailure { path: PathBuf, text: String },

    /// The script body returned `false` to decline the load.
    #[error("script '{}' rejected load", path.display())]
    LoadRejected { path: PathBuf },

    /// The file extension maps to no supported interpreter.
    #[error("unknown script type: '{}'", path.display())]
    UnsupportedFormat { path: PathBuf },
}

impl ScriptError {
    pub fn path(&self) -> &PathBuf {
        match self {
            Self::AllocationFailure { path, .. }
            | Self::CompileFailure { path, .. }
            | Self::RuntimeFailure { path, .. }
            | Self::LoadRejected { path }
            | Self::UnsupportedFormat { path } => path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_the_offending_path() {
        let err = ScriptError::CompileFailure {
            path: PathBuf::from("/tmp/broken.lua"),
            text: "unexpected symbol".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("/tmp/broken.lua"));
        assert!(text.contains("unexpected symbol"));
    }

    #[test]
    fn path_accessor_covers_every_variant() {
        let path = PathBuf::from("x.lua");
        let variants = vec![
            ScriptError::AllocationFailure {
                path: path.clone(),
                text: String::new(),
            },
            ScriptError::CompileFailure {
                path: path.clone(),
                text: String::new(),
            },
            ScriptError::RuntimeFailure {
                path: path.clone(),
                text: String::new(),
            },
            ScriptError::LoadRejected { path: path.clone() },
            ScriptError::UnsupportedFormat { path: path.clone() },
        ];
        for err in variants {
            assert_eq!(err.path(), &path);
        }
    }
}
