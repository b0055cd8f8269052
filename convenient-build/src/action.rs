//! Build actions: one externally executed build step
//!
//! An [`Action`] is an immutable value. Anything that needs a modified
//! action (module interface patching, hot reload) goes through
//! [`Action::to_builder`] and swaps the new value into its
//! [`LinkedAction`](crate::LinkedAction), then re-links the graph.

use crate::file_item::{FileItem, FileItemRegistry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Kind of build step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ActionType {
    /// Build an external project (e.g. a third-party solution)
    BuildProject,

    /// Scan a C++ source for module provides/requires
    GatherModuleDependencies,

    /// Compile a C++ module interface unit
    CompileModuleInterface,

    /// Compile a translation unit
    Compile,

    /// Assemble an application bundle
    CreateAppBundle,

    /// Produce debug information
    GenerateDebugInfo,

    /// Link objects into a binary or library
    Link,

    /// Write target receipts and module manifests
    WriteMetadata,

    /// Run a post-build step
    PostBuildStep,

    /// Aggregate compiler timing data
    ParseTimingInfo,
}

impl ActionType {
    /// Short name used in status output
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BuildProject => "BuildProject",
            Self::GatherModuleDependencies => "GatherModuleDependencies",
            Self::CompileModuleInterface => "CompileModuleInterface",
            Self::Compile => "Compile",
            Self::CreateAppBundle => "CreateAppBundle",
            Self::GenerateDebugInfo => "GenerateDebugInfo",
            Self::Link => "Link",
            Self::WriteMetadata => "WriteMetadata",
            Self::PostBuildStep => "PostBuildStep",
            Self::ParseTimingInfo => "ParseTimingInfo",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One externally executable build step
#[derive(Clone)]
pub struct Action {
    action_type: ActionType,
    command_path: PathBuf,
    command_arguments: Vec<String>,
    command_version: String,
    working_directory: PathBuf,
    status_description: String,
    command_description: String,
    prerequisite_items: Vec<Arc<FileItem>>,
    produced_items: Vec<Arc<FileItem>>,
    delete_items: Vec<Arc<FileItem>>,
    dependency_list_file: Option<Arc<FileItem>>,
    module_dependencies_file: Option<Arc<FileItem>>,
    compiled_module_interface_file: Option<Arc<FileItem>>,
    environment: BTreeMap<String, String>,
    weight: f32,
    can_execute_remotely: bool,
    is_gcc_compiler: bool,
    produces_import_library: bool,
    use_action_history: bool,
    should_output_status_description: bool,
}

impl Action {
    /// Start building a new action
    pub fn builder(action_type: ActionType) -> ActionBuilder {
        ActionBuilder::new(action_type)
    }

    /// Copy this action into a builder for modification
    pub fn to_builder(&self) -> ActionBuilder {
        ActionBuilder {
            inner: self.clone(),
        }
    }

    /// Kind of step
    pub fn action_type(&self) -> ActionType {
        self.action_type
    }

    /// Executable to run
    pub fn command_path(&self) -> &Path {
        &self.command_path
    }

    /// Arguments passed to the executable
    pub fn command_arguments(&self) -> &[String] {
        &self.command_arguments
    }

    /// Tool version folded into the history fingerprint
    pub fn command_version(&self) -> &str {
        &self.command_version
    }

    /// Directory the command runs in
    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    /// Text shown while the action runs (usually the source file name)
    pub fn status_description(&self) -> &str {
        &self.status_description
    }

    /// Short verb describing the command ("Compile", "Link", ...)
    pub fn command_description(&self) -> &str {
        &self.command_description
    }

    /// Files consumed by this action
    pub fn prerequisite_items(&self) -> &[Arc<FileItem>] {
        &self.prerequisite_items
    }

    /// Files written by this action
    pub fn produced_items(&self) -> &[Arc<FileItem>] {
        &self.produced_items
    }

    /// Files to delete before running
    pub fn delete_items(&self) -> &[Arc<FileItem>] {
        &self.delete_items
    }

    /// Dependency list (`.d` or JSON) written by the compiler
    pub fn dependency_list_file(&self) -> Option<&Arc<FileItem>> {
        self.dependency_list_file.as_ref()
    }

    /// Module scan output listing provided and required C++ modules
    pub fn module_dependencies_file(&self) -> Option<&Arc<FileItem>> {
        self.module_dependencies_file.as_ref()
    }

    /// Compiled module interface produced by this action
    pub fn compiled_module_interface_file(&self) -> Option<&Arc<FileItem>> {
        self.compiled_module_interface_file.as_ref()
    }

    /// Extra environment for the spawned process
    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    /// Number of executor slots this action occupies
    pub fn weight(&self) -> f32 {
        self.weight
    }

    /// Whether a remote executor may run this action
    pub fn can_execute_remotely(&self) -> bool {
        self.can_execute_remotely
    }

    /// Whether the command is a GCC-style compiler
    pub fn is_gcc_compiler(&self) -> bool {
        self.is_gcc_compiler
    }

    /// Whether this action writes an import library alongside its binary
    pub fn produces_import_library(&self) -> bool {
        self.produces_import_library
    }

    /// Whether command line changes should mark this action outdated
    pub fn use_action_history(&self) -> bool {
        self.use_action_history
    }

    /// Whether the status description is printed when the action runs
    pub fn should_output_status_description(&self) -> bool {
        self.should_output_status_description
    }

    /// Canonical command line recorded in the action history
    pub fn command_line(&self) -> String {
        let mut line = quote_argument(&self.command_path.to_string_lossy());
        for argument in &self.command_arguments {
            line.push(' ');
            line.push_str(&quote_argument(argument));
        }
        if !self.command_version.is_empty() {
            line.push_str(" (");
            line.push_str(&self.command_version);
            line.push(')');
        }
        line
    }

    /// Human-readable one-line description
    pub fn description(&self) -> String {
        if !self.status_description.is_empty() {
            let verb = if self.command_description.is_empty() {
                self.action_type.as_str()
            } else {
                &self.command_description
            };
            return format!("{verb} {}", self.status_description);
        }
        match self.produced_items.first() {
            Some(item) => format!("{} {}", self.action_type, item.name()),
            None => format!("{} {}", self.action_type, self.command_path.display()),
        }
    }

    /// Whether `item` is one of this action's import libraries
    pub fn is_import_library(&self, item: &FileItem) -> bool {
        self.produces_import_library && is_import_library_path(item.location())
    }

    /// Path-based form for persistence
    pub fn to_serialized(&self) -> SerializedAction {
        let paths = |items: &[Arc<FileItem>]| {
            items
                .iter()
                .map(|item| item.location().to_path_buf())
                .collect::<Vec<_>>()
        };
        SerializedAction {
            action_type: self.action_type,
            command_path: self.command_path.clone(),
            command_arguments: self.command_arguments.clone(),
            command_version: self.command_version.clone(),
            working_directory: self.working_directory.clone(),
            status_description: self.status_description.clone(),
            command_description: self.command_description.clone(),
            prerequisite_items: paths(&self.prerequisite_items),
            produced_items: paths(&self.produced_items),
            delete_items: paths(&self.delete_items),
            dependency_list_file: self
                .dependency_list_file
                .as_ref()
                .map(|item| item.location().to_path_buf()),
            module_dependencies_file: self
                .module_dependencies_file
                .as_ref()
                .map(|item| item.location().to_path_buf()),
            compiled_module_interface_file: self
                .compiled_module_interface_file
                .as_ref()
                .map(|item| item.location().to_path_buf()),
            environment: self.environment.clone(),
            weight: self.weight,
            can_execute_remotely: self.can_execute_remotely,
            is_gcc_compiler: self.is_gcc_compiler,
            produces_import_library: self.produces_import_library,
            use_action_history: self.use_action_history,
            should_output_status_description: self.should_output_status_description,
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("type", &self.action_type)
            .field("command", &self.command_line())
            .field("prerequisites", &self.prerequisite_items)
            .field("produced", &self.produced_items)
            .finish()
    }
}

/// Import libraries are matched by extension
pub fn is_import_library_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("lib") || ext.eq_ignore_ascii_case("tbd"))
}

fn quote_argument(argument: &str) -> String {
    if argument.is_empty() || argument.chars().any(char::is_whitespace) {
        format!("\"{}\"", argument.replace('"', "\\\""))
    } else {
        argument.to_string()
    }
}

/// Builder for [`Action`]
#[derive(Clone)]
pub struct ActionBuilder {
    inner: Action,
}

impl ActionBuilder {
    /// New builder with defaults: weight 1, action history enabled
    pub fn new(action_type: ActionType) -> Self {
        Self {
            inner: Action {
                action_type,
                command_path: PathBuf::new(),
                command_arguments: Vec::new(),
                command_version: String::new(),
                working_directory: PathBuf::new(),
                status_description: String::new(),
                command_description: String::new(),
                prerequisite_items: Vec::new(),
                produced_items: Vec::new(),
                delete_items: Vec::new(),
                dependency_list_file: None,
                module_dependencies_file: None,
                compiled_module_interface_file: None,
                environment: BTreeMap::new(),
                weight: 1.0,
                can_execute_remotely: false,
                is_gcc_compiler: false,
                produces_import_library: false,
                use_action_history: true,
                should_output_status_description: true,
            },
        }
    }

    /// Change the action type
    pub fn action_type(mut self, action_type: ActionType) -> Self {
        self.inner.action_type = action_type;
        self
    }

    /// Executable to run
    pub fn command(mut self, path: impl Into<PathBuf>) -> Self {
        self.inner.command_path = path.into();
        self
    }

    /// Append one argument
    pub fn arg(mut self, argument: impl Into<String>) -> Self {
        self.inner.command_arguments.push(argument.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner
            .command_arguments
            .extend(arguments.into_iter().map(Into::into));
        self
    }

    /// Replace all arguments
    pub fn set_args(mut self, arguments: Vec<String>) -> Self {
        self.inner.command_arguments = arguments;
        self
    }

    /// Tool version recorded in the action history
    pub fn command_version(mut self, version: impl Into<String>) -> Self {
        self.inner.command_version = version.into();
        self
    }

    /// Working directory
    pub fn working_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.inner.working_directory = directory.into();
        self
    }

    /// Status text
    pub fn status_description(mut self, description: impl Into<String>) -> Self {
        self.inner.status_description = description.into();
        self
    }

    /// Command verb
    pub fn command_description(mut self, description: impl Into<String>) -> Self {
        self.inner.command_description = description.into();
        self
    }

    /// Add a consumed file
    pub fn prerequisite(mut self, item: Arc<FileItem>) -> Self {
        self.inner.prerequisite_items.push(item);
        self
    }

    /// Add consumed files
    pub fn prerequisites(mut self, items: impl IntoIterator<Item = Arc<FileItem>>) -> Self {
        self.inner.prerequisite_items.extend(items);
        self
    }

    /// Add a produced file
    pub fn produces(mut self, item: Arc<FileItem>) -> Self {
        self.inner.produced_items.push(item);
        self
    }

    /// Replace the produced files
    pub fn set_produced(mut self, items: Vec<Arc<FileItem>>) -> Self {
        self.inner.produced_items = items;
        self
    }

    /// Replace the consumed files
    pub fn set_prerequisites(mut self, items: Vec<Arc<FileItem>>) -> Self {
        self.inner.prerequisite_items = items;
        self
    }

    /// Add a file deleted before execution
    pub fn deletes(mut self, item: Arc<FileItem>) -> Self {
        self.inner.delete_items.push(item);
        self
    }

    /// Dependency list written by the compiler
    pub fn dependency_list_file(mut self, item: Option<Arc<FileItem>>) -> Self {
        self.inner.dependency_list_file = item;
        self
    }

    /// Module scan output consumed to resolve imports
    pub fn module_dependencies_file(mut self, item: Option<Arc<FileItem>>) -> Self {
        self.inner.module_dependencies_file = item;
        self
    }

    /// Compiled module interface written by this action
    pub fn compiled_module_interface_file(mut self, item: Option<Arc<FileItem>>) -> Self {
        self.inner.compiled_module_interface_file = item;
        self
    }

    /// Add an environment variable for the spawned process
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.inner.environment.insert(key.into(), value.into());
        self
    }

    /// Executor slots this action needs
    pub fn weight(mut self, weight: f32) -> Self {
        self.inner.weight = weight.max(0.0);
        self
    }

    /// Allow remote execution
    pub fn can_execute_remotely(mut self, value: bool) -> Self {
        self.inner.can_execute_remotely = value;
        self
    }

    /// Mark the command as a GCC-style compiler
    pub fn is_gcc_compiler(mut self, value: bool) -> Self {
        self.inner.is_gcc_compiler = value;
        self
    }

    /// Mark that produced `.lib` files are import libraries
    pub fn produces_import_library(mut self, value: bool) -> Self {
        self.inner.produces_import_library = value;
        self
    }

    /// Toggle command line tracking
    pub fn use_action_history(mut self, value: bool) -> Self {
        self.inner.use_action_history = value;
        self
    }

    /// Toggle status output
    pub fn should_output_status_description(mut self, value: bool) -> Self {
        self.inner.should_output_status_description = value;
        self
    }

    /// Finish; item lists are sorted and deduplicated
    pub fn build(mut self) -> Action {
        for items in [
            &mut self.inner.prerequisite_items,
            &mut self.inner.produced_items,
            &mut self.inner.delete_items,
        ] {
            items.sort();
            items.dedup();
        }
        self.inner
    }
}

/// Path-based, serializable form of an [`Action`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SerializedAction {
    /// Action type
    #[serde(rename = "Type")]
    pub action_type: ActionType,
    /// Executable
    pub command_path: PathBuf,
    /// Arguments
    pub command_arguments: Vec<String>,
    /// Tool version
    #[serde(default)]
    pub command_version: String,
    /// Working directory
    pub working_directory: PathBuf,
    /// Status text
    #[serde(default)]
    pub status_description: String,
    /// Command verb
    #[serde(default)]
    pub command_description: String,
    /// Consumed files
    pub prerequisite_items: Vec<PathBuf>,
    /// Produced files
    pub produced_items: Vec<PathBuf>,
    /// Files deleted before execution
    #[serde(default)]
    pub delete_items: Vec<PathBuf>,
    /// Dependency list file
    #[serde(default)]
    pub dependency_list_file: Option<PathBuf>,
    /// Module scan output
    #[serde(default)]
    pub module_dependencies_file: Option<PathBuf>,
    /// Compiled module interface
    #[serde(default)]
    pub compiled_module_interface_file: Option<PathBuf>,
    /// Extra environment
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Executor slots
    #[serde(default = "default_weight")]
    pub weight: f32,
    /// Remote execution allowed
    #[serde(default)]
    pub can_execute_remotely: bool,
    /// GCC-style compiler
    #[serde(default)]
    pub is_gcc_compiler: bool,
    /// Writes an import library
    #[serde(default)]
    pub produces_import_library: bool,
    /// Command line tracking
    #[serde(default = "default_true")]
    pub use_action_history: bool,
    /// Print status text
    #[serde(default = "default_true")]
    pub should_output_status_description: bool,
}

fn default_weight() -> f32 {
    1.0
}

fn default_true() -> bool {
    true
}

impl SerializedAction {
    /// Rebuild an [`Action`], interning every path through `registry`
    pub fn intern(&self, registry: &FileItemRegistry) -> Action {
        let items = |paths: &[PathBuf]| {
            paths
                .iter()
                .map(|path| registry.get_item_by_path(path))
                .collect::<Vec<_>>()
        };
        let optional = |path: &Option<PathBuf>| path.as_ref().map(|p| registry.get_item_by_path(p));

        let mut builder = ActionBuilder::new(self.action_type)
            .command(self.command_path.clone())
            .set_args(self.command_arguments.clone())
            .command_version(self.command_version.clone())
            .working_directory(self.working_directory.clone())
            .status_description(self.status_description.clone())
            .command_description(self.command_description.clone())
            .set_prerequisites(items(&self.prerequisite_items))
            .set_produced(items(&self.produced_items))
            .dependency_list_file(optional(&self.dependency_list_file))
            .module_dependencies_file(optional(&self.module_dependencies_file))
            .compiled_module_interface_file(optional(&self.compiled_module_interface_file))
            .weight(self.weight)
            .can_execute_remotely(self.can_execute_remotely)
            .is_gcc_compiler(self.is_gcc_compiler)
            .produces_import_library(self.produces_import_library)
            .use_action_history(self.use_action_history)
            .should_output_status_description(self.should_output_status_description);
        for item in items(&self.delete_items) {
            builder = builder.deletes(item);
        }
        for (key, value) in &self.environment {
            builder = builder.env(key.clone(), value.clone());
        }
        builder.build()
    }
}
