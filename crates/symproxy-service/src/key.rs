//! Validation of the three-part symbol key.
//!
//! Every request names a symbol as `module/identifier/file`, for example
//! `ntdll.pdb/3844DBB920174967BE7AA4A2C20430FA2/ntdll.pdb`. The components come straight from the
//! request path, so they are checked here before anything touches the file system or the network.
//! Everything downstream works with [`SymbolKey`], which can only be obtained through
//! [`SymbolKey::parse`].

use std::fmt;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Maximum length of the module and file name components.
pub const MAX_NAME_LENGTH: usize = 255;

/// Shortest accepted identifier: an 8-digit PE timestamp followed by at least one size digit.
pub const MIN_IDENTIFIER_LENGTH: usize = 9;

/// Longest accepted identifier: a 40-digit build id.
pub const MAX_IDENTIFIER_LENGTH: usize = 40;

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("valid name pattern"));

static IDENTIFIER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9A-Fa-f]+$").expect("valid identifier pattern"));

/// One of the three components of a [`SymbolKey`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyField {
    /// The debug file name of the module, e.g. `ntdll.pdb`.
    ModuleName,
    /// The debug identifier, e.g. a PDB GUID followed by its age.
    Identifier,
    /// The requested file name, e.g. `ntdll.pdb` or `ntdll.pd_`.
    FileName,
}

impl KeyField {
    /// Returns the name of the field as used in error messages.
    pub fn as_str(self) -> &'static str {
        match self {
            KeyField::ModuleName => "module name",
            KeyField::Identifier => "identifier",
            KeyField::FileName => "file name",
        }
    }
}

impl fmt::Display for KeyField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons for rejecting a symbol key.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum InvalidKey {
    #[error("{0} is empty")]
    Empty(KeyField),
    #[error("{0} exceeds {1} characters")]
    TooLong(KeyField, usize),
    #[error("{0} contains control characters")]
    ControlCharacter(KeyField),
    #[error("{0} contains a path separator")]
    PathSeparator(KeyField),
    #[error("{0} contains a parent directory reference")]
    PathTraversal(KeyField),
    #[error("{0} starts with a dot")]
    HiddenFile(KeyField),
    #[error("{0} contains characters outside of [A-Za-z0-9._-]")]
    InvalidCharacter(KeyField),
    #[error("identifier must be {MIN_IDENTIFIER_LENGTH} to {MAX_IDENTIFIER_LENGTH} hex digits")]
    InvalidIdentifier,
}

impl InvalidKey {
    /// A stable, machine-readable code for this rejection.
    pub fn reason_code(&self) -> &'static str {
        match self {
            InvalidKey::Empty(_) => "empty",
            InvalidKey::TooLong(..) => "too_long",
            InvalidKey::ControlCharacter(_) => "control_character",
            InvalidKey::PathSeparator(_) => "path_separator",
            InvalidKey::PathTraversal(_) => "path_traversal",
            InvalidKey::HiddenFile(_) => "hidden_file",
            InvalidKey::InvalidCharacter(_) => "invalid_character",
            InvalidKey::InvalidIdentifier => "invalid_identifier",
        }
    }

    /// The key component that was rejected.
    pub fn field(&self) -> KeyField {
        match *self {
            InvalidKey::Empty(field)
            | InvalidKey::TooLong(field, _)
            | InvalidKey::ControlCharacter(field)
            | InvalidKey::PathSeparator(field)
            | InvalidKey::PathTraversal(field)
            | InvalidKey::HiddenFile(field)
            | InvalidKey::InvalidCharacter(field) => field,
            InvalidKey::InvalidIdentifier => KeyField::Identifier,
        }
    }
}

/// Runs the structural checks shared by all three components.
fn check_component(field: KeyField, value: &str, max_len: usize) -> Result<(), InvalidKey> {
    if value.is_empty() {
        return Err(InvalidKey::Empty(field));
    }
    if value.len() > max_len {
        return Err(InvalidKey::TooLong(field, max_len));
    }
    if value.chars().any(char::is_control) {
        return Err(InvalidKey::ControlCharacter(field));
    }
    if value.contains(['/', '\\']) {
        return Err(InvalidKey::PathSeparator(field));
    }
    if value.contains("..") {
        return Err(InvalidKey::PathTraversal(field));
    }
    if value.starts_with('.') {
        return Err(InvalidKey::HiddenFile(field));
    }
    Ok(())
}

fn check_name(field: KeyField, value: &str) -> Result<(), InvalidKey> {
    check_component(field, value, MAX_NAME_LENGTH)?;
    if !NAME_PATTERN.is_match(value) {
        return Err(InvalidKey::InvalidCharacter(field));
    }
    Ok(())
}

fn check_identifier(value: &str) -> Result<(), InvalidKey> {
    check_component(KeyField::Identifier, value, MAX_IDENTIFIER_LENGTH)?;
    if !IDENTIFIER_PATTERN.is_match(value) || value.len() < MIN_IDENTIFIER_LENGTH {
        return Err(InvalidKey::InvalidIdentifier);
    }
    Ok(())
}

/// A validated symbol key.
///
/// Symbol servers treat keys case-insensitively, so equality, the cache key and the storage
/// layout all use the lowercased components. The original spelling is kept for requests to
/// upstream servers.
#[derive(Clone, Debug)]
pub struct SymbolKey {
    module_name: String,
    identifier: String,
    file_name: String,
    normalized: [String; 3],
}

impl SymbolKey {
    /// Validates the raw components of a symbol key.
    pub fn parse(module_name: &str, identifier: &str, file_name: &str) -> Result<Self, InvalidKey> {
        check_name(KeyField::ModuleName, module_name)?;
        check_identifier(identifier)?;
        check_name(KeyField::FileName, file_name)?;

        Ok(Self {
            module_name: module_name.to_owned(),
            identifier: identifier.to_owned(),
            file_name: file_name.to_owned(),
            normalized: [
                module_name.to_ascii_lowercase(),
                identifier.to_ascii_lowercase(),
                file_name.to_ascii_lowercase(),
            ],
        })
    }

    /// The module name as requested.
    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    /// The identifier as requested.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// The file name as requested.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Path segments for the upstream request, in their original casing.
    pub fn upstream_segments(&self) -> [&str; 3] {
        [&self.module_name, &self.identifier, &self.file_name]
    }

    /// The case-normalized `module/identifier/file` string identifying this key.
    pub fn cache_key(&self) -> String {
        self.normalized.join("/")
    }

    /// The directory of this key relative to the storage root.
    pub(crate) fn relative_dir(&self) -> PathBuf {
        [&self.normalized[0], &self.normalized[1]].iter().collect()
    }

    /// The normalized file name of the raw artifact.
    pub(crate) fn normalized_file_name(&self) -> &str {
        &self.normalized[2]
    }
}

impl PartialEq for SymbolKey {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for SymbolKey {}

impl std::hash::Hash for SymbolKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.normalized.hash(state);
    }
}

impl fmt::Display for SymbolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.module_name, self.identifier, self.file_name
        )
    }
}
