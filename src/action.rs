//! sdmmc-storage - File actions
//!
//! Deferred file operations. The path and the data of an action are either
//! fixed when the action is built, or computed from a context value each
//! time the action runs.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

#[cfg(feature = "log")]
use log::{debug, error, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, error, warn};

use crate::config::ConfigError;
use crate::path;
use crate::storage::{Storage, StorageError};

/// A value that is either fixed, or computed from a context.
pub enum Templatable<T, C> {
    Static(T),
    Lambda(Box<dyn Fn(&C) -> T>),
}

impl<T, C> Templatable<T, C>
where
    T: Clone,
{
    pub fn lambda<F>(f: F) -> Self
    where
        F: Fn(&C) -> T + 'static,
    {
        Templatable::Lambda(Box::new(f))
    }

    pub fn value(&self, context: &C) -> T {
        match self {
            Templatable::Static(value) => value.clone(),
            Templatable::Lambda(f) => f(context),
        }
    }

    pub fn is_static(&self) -> bool {
        matches!(self, Templatable::Static(_))
    }
}

impl<T, C> From<T> for Templatable<T, C> {
    fn from(value: T) -> Self {
        Templatable::Static(value)
    }
}

impl<T, C> core::fmt::Debug for Templatable<T, C>
where
    T: core::fmt::Debug,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Templatable::Static(value) => f.debug_tuple("Static").field(value).finish(),
            Templatable::Lambda(_) => f.write_str("Lambda"),
        }
    }
}

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    WriteFile,
    AppendFile,
    CreateDirectory,
    RemoveDirectory,
    DeleteFile,
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::WriteFile => "write_file",
            ActionKind::AppendFile => "append_file",
            ActionKind::CreateDirectory => "create_directory",
            ActionKind::RemoveDirectory => "remove_directory",
            ActionKind::DeleteFile => "delete_file",
        }
    }

    pub fn takes_data(&self) -> bool {
        matches!(self, ActionKind::WriteFile | ActionKind::AppendFile)
    }
}

/// One file operation, ready to run.
#[derive(Debug)]
pub struct FileAction<C> {
    kind: ActionKind,
    path: Templatable<String, C>,
    data: Templatable<Vec<u8>, C>,
}

impl<C> FileAction<C> {
    pub fn write_file(path: Templatable<String, C>, data: Templatable<Vec<u8>, C>) -> Self {
        FileAction {
            kind: ActionKind::WriteFile,
            path,
            data,
        }
    }

    pub fn append_file(path: Templatable<String, C>, data: Templatable<Vec<u8>, C>) -> Self {
        FileAction {
            kind: ActionKind::AppendFile,
            path,
            data,
        }
    }

    pub fn create_directory(path: Templatable<String, C>) -> Self {
        Self::without_data(ActionKind::CreateDirectory, path)
    }

    pub fn remove_directory(path: Templatable<String, C>) -> Self {
        Self::without_data(ActionKind::RemoveDirectory, path)
    }

    pub fn delete_file(path: Templatable<String, C>) -> Self {
        Self::without_data(ActionKind::DeleteFile, path)
    }

    fn without_data(kind: ActionKind, path: Templatable<String, C>) -> Self {
        FileAction {
            kind,
            path,
            data: Templatable::Static(Vec::new()),
        }
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    /// Resolve the path and data against `context` and run the operation.
    /// A failure is logged and handed back; nothing else is affected.
    pub fn play<S>(&self, storage: &mut S, context: &C) -> Result<(), StorageError>
    where
        S: Storage + ?Sized,
    {
        let path = self.path.value(context);
        debug!("{} {}", self.kind.name(), path.as_str());
        let result = match self.kind {
            ActionKind::WriteFile => storage.write_file(&path, &self.data.value(context)),
            ActionKind::AppendFile => storage.append_file(&path, &self.data.value(context)),
            ActionKind::CreateDirectory => storage.create_directory(&path),
            ActionKind::RemoveDirectory => storage.remove_directory(&path),
            ActionKind::DeleteFile => storage.delete_file(&path),
        };
        if let Err(e) = result {
            error!("{} {} failed: {}", self.kind.name(), path.as_str(), e);
        }
        result
    }
}

/// Raw data as it appears in a configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    List(Vec<DataValue>),
}

/// Text becomes its UTF-8 bytes, a list must hold byte values. Anything else
/// is rejected.
pub fn validate_raw_data(value: &DataValue) -> Result<Vec<u8>, ConfigError> {
    match value {
        DataValue::Text(text) => Ok(text.as_bytes().to_vec()),
        DataValue::List(items) => items
            .iter()
            .map(|item| match item {
                DataValue::Integer(n) if (0..=255).contains(n) => Ok(*n as u8),
                DataValue::Integer(n) => Err(ConfigError::ByteOutOfRange(*n)),
                _ => Err(ConfigError::InvalidData),
            })
            .collect(),
        _ => Err(ConfigError::InvalidData),
    }
}

/// Data for an action, before it has been checked.
pub enum ActionData<C> {
    Raw(DataValue),
    Lambda(Box<dyn Fn(&C) -> Vec<u8>>),
}

// (identifier, operation, deprecated)
static ACTIONS: [(&str, ActionKind, bool); 15] = [
    ("sd_mmc_card.write_file", ActionKind::WriteFile, false),
    ("sd_mmc_card.append_file", ActionKind::AppendFile, false),
    ("sd_mmc_card.create_directory", ActionKind::CreateDirectory, false),
    ("sd_mmc_card.remove_directory", ActionKind::RemoveDirectory, false),
    ("sd_mmc_card.delete_file", ActionKind::DeleteFile, false),
    ("storage.write_file", ActionKind::WriteFile, false),
    ("storage.append_file", ActionKind::AppendFile, false),
    ("storage.create_directory", ActionKind::CreateDirectory, false),
    ("storage.remove_directory", ActionKind::RemoveDirectory, false),
    ("storage.delete_file", ActionKind::DeleteFile, false),
    ("esp32_camera_sd_card.write_file", ActionKind::WriteFile, true),
    ("esp32_camera_sd_card.append_file", ActionKind::AppendFile, true),
    ("esp32_camera_sd_card.create_directory", ActionKind::CreateDirectory, true),
    ("esp32_camera_sd_card.remove_directory", ActionKind::RemoveDirectory, true),
    ("esp32_camera_sd_card.delete_file", ActionKind::DeleteFile, true),
];

struct Registration {
    name: &'static str,
    kind: ActionKind,
    deprecated: bool,
}

/// Maps action identifiers such as `sd_mmc_card.write_file` to the
/// operation they perform.
pub struct ActionRegistry {
    actions: Vec<Registration>,
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionRegistry {
    /// Every action under the `sd_mmc_card` and `storage` namespaces, plus
    /// the deprecated `esp32_camera_sd_card` ones.
    pub fn new() -> Self {
        let mut registry = ActionRegistry {
            actions: Vec::with_capacity(ACTIONS.len()),
        };
        for (name, kind, deprecated) in ACTIONS.iter() {
            registry.register(*name, *kind, *deprecated);
        }
        registry
    }

    /// Add an identifier, or point an existing one somewhere else.
    pub fn register(&mut self, name: &'static str, kind: ActionKind, deprecated: bool) {
        self.actions.retain(|r| r.name != name);
        self.actions.push(Registration {
            name,
            kind,
            deprecated,
        });
    }

    /// The operation behind an identifier.
    pub fn lookup(&self, name: &str) -> Result<ActionKind, ConfigError> {
        let registration = self
            .actions
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| ConfigError::UnknownAction(String::from(name)))?;
        if registration.deprecated {
            warn!(
                "'{}' is deprecated, use 'sd_mmc_card.{}' instead",
                registration.name,
                registration.kind.name()
            );
        }
        Ok(registration.kind)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.actions.iter().map(|r| r.name)
    }

    /// Check an action's arguments and put it together. Fixed paths and
    /// fixed data are validated here, so a bad configuration never reaches
    /// the card.
    pub fn build<C>(
        &self,
        name: &str,
        path: Templatable<String, C>,
        data: Option<ActionData<C>>,
    ) -> Result<FileAction<C>, ConfigError> {
        let kind = self.lookup(name)?;
        let path = match path {
            Templatable::Static(p) => match path::normalize(&p) {
                Ok(normalized) if !p.trim().is_empty() => Templatable::Static(normalized),
                _ => return Err(ConfigError::InvalidPath(p)),
            },
            lambda => lambda,
        };
        let data = match (kind.takes_data(), data) {
            (true, Some(ActionData::Raw(value))) => Templatable::Static(validate_raw_data(&value)?),
            (true, Some(ActionData::Lambda(f))) => Templatable::Lambda(f),
            (true, None) => return Err(ConfigError::MissingData(kind.name())),
            (false, Some(_)) => return Err(ConfigError::UnexpectedData(kind.name())),
            (false, None) => Templatable::Static(Vec::new()),
        };
        Ok(FileAction { kind, path, data })
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
