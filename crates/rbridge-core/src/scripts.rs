//! Engine-language snippets issued by the controller.

use std::path::Path;

use crate::error::{Error, Result};

/// Workspace name an exported table is assigned to before being renamed.
pub const TEMP_VARIABLE: &str = "rbridge.temp.836481";

/// Workspace name scripts use to report the libraries they loaded.
pub const LOADED_LIBRARIES_VARIABLE: &str = "rbridge.loaded.libraries";

const RESERVED_WORDS: &[&str] = &[
    "if",
    "else",
    "repeat",
    "while",
    "function",
    "for",
    "in",
    "next",
    "break",
    "TRUE",
    "FALSE",
    "NULL",
    "Inf",
    "NaN",
    "NA",
    "NA_integer_",
    "NA_real_",
    "NA_character_",
    "NA_complex_",
];

/// Detaches every non-default package, then removes every binding.
pub const CLEAR_WORKSPACE: &str = "for (pkg in setdiff(.packages(), c(getOption(\"defaultPackages\"), \"base\"))) \
detach(paste0(\"package:\", pkg), character.only = TRUE)\n\
rm(list = ls(all.names = TRUE))";

/// Whether `name` can be used unquoted as an engine symbol.
pub fn is_syntactic_name(name: &str) -> bool {
    let mut chars = name.chars();
    let valid_start = match chars.next() {
        Some('.') => !matches!(chars.clone().next(), Some(c) if c.is_ascii_digit()),
        Some(c) => c.is_alphabetic(),
        None => false,
    };
    valid_start
        && chars.all(|c| c.is_alphanumeric() || c == '.' || c == '_')
        && !RESERVED_WORDS.contains(&name)
}

/// `name`, or [`Error::InvalidSymbol`] if it is not syntactic.
pub fn check_symbol(name: &str) -> Result<&str> {
    if is_syntactic_name(name) {
        Ok(name)
    } else {
        Err(Error::InvalidSymbol(name.to_string()))
    }
}

/// A double-quoted engine string literal.
pub fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn quote_path(path: &Path) -> String {
    quote(&path.to_string_lossy().replace('\\', "/"))
}

/// Bind the value under `from` to `to` and drop `from`.
pub fn rename(from: &str, to: &str) -> String {
    format!("{to} <- {from}; rm({from})")
}

pub fn empty_frame(name: &str) -> String {
    format!("{name} <- data.frame()")
}

pub fn exists(name: &str) -> String {
    format!("exists({})", quote(name))
}

pub fn class_of(name: &str) -> String {
    format!("class({name})")
}

pub fn remove(name: &str) -> String {
    format!("rm({name})")
}

/// Attach each of `libraries` that is not attached yet.
pub fn load_libraries(libraries: &[String]) -> String {
    let quoted: Vec<String> = libraries.iter().map(|l| quote(l)).collect();
    format!(
        "for (pkg in setdiff(c({}), .packages())) suppressMessages(library(pkg, character.only = TRUE))",
        quoted.join(", ")
    )
}

/// Record the attached libraries in the marker and write the workspace
/// image to `path`.
pub fn save_workspace(path: &Path) -> String {
    format!(
        "{marker} <- .packages(); save.image({file}); rm({marker})",
        marker = LOADED_LIBRARIES_VARIABLE,
        file = quote_path(path)
    )
}

pub fn load_workspace(path: &Path) -> String {
    format!("load({})", quote_path(path))
}

pub fn memory_limit(megabytes: u64) -> String {
    format!("memory.limit(size = {megabytes})")
}
