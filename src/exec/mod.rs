//! Code execution: input validation, per-user rate limiting, a durable
//! Postgres-backed job queue and the container sandbox that actually runs
//! untrusted code.

pub mod limiter;
pub mod queue;
pub mod sandbox;

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Python,
    Javascript,
    Java,
}

impl Language {
    pub fn parse(value: &str) -> Option<Language> {
        match value.to_ascii_lowercase().as_str() {
            "python" | "python3" => Some(Language::Python),
            "javascript" | "js" | "node" => Some(Language::Javascript),
            "java" => Some(Language::Java),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Javascript => "javascript",
            Language::Java => "java",
        }
    }
}

/// Substrings that reject a submission outright. This is defense in depth
/// on top of the container boundary, not the boundary itself: the sandbox
/// has no network and a read-only filesystem regardless.
const BLOCKED_PATTERNS: &[&str] = &[
    "import os",
    "import subprocess",
    "import socket",
    "import shutil",
    "__import__",
    "eval(",
    "exec(",
    "child_process",
    "require('fs')",
    "require(\"fs\")",
    "require('net')",
    "require(\"net\")",
    "process.binding",
    "java.lang.Runtime",
    "ProcessBuilder",
    "java.net.",
    "java.io.File",
];

/// Pre-enqueue validation: size, language, and the coarse pattern filter.
pub fn validate_request(
    config: &AppConfig,
    language: &str,
    code: &str,
) -> AppResult<Language> {
    if code.trim().is_empty() {
        return Err(AppError::validation("code must not be empty"));
    }
    if code.len() > config.exec_code_max_bytes {
        return Err(AppError::validation(format!(
            "code exceeds maximum size of {} bytes",
            config.exec_code_max_bytes
        )));
    }

    let language = Language::parse(language)
        .ok_or_else(|| AppError::validation(format!("unsupported language '{language}'")))?;

    for pattern in BLOCKED_PATTERNS {
        if code.contains(pattern) {
            return Err(AppError::validation(format!(
                "code contains blocked pattern '{pattern}'"
            )));
        }
    }

    Ok(language)
}
