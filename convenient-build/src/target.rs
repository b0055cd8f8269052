//! Target descriptors and the interface to whatever produces target makefiles

use crate::build_mode::HotReloadMode;
use crate::error::{BuildError, BuildResult};
use crate::makefile::TargetMakefile;
use crate::session::BuildSession;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Target platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Platform {
    /// 64-bit Windows
    Win64,
    /// x86-64 Linux
    Linux,
    /// AArch64 Linux
    LinuxArm64,
    /// macOS
    Mac,
    /// iOS
    IOS,
    /// Android
    Android,
}

impl Platform {
    /// Every known platform
    pub const ALL: [Platform; 6] = [
        Platform::Win64,
        Platform::Linux,
        Platform::LinuxArm64,
        Platform::Mac,
        Platform::IOS,
        Platform::Android,
    ];

    /// Canonical name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Win64 => "Win64",
            Self::Linux => "Linux",
            Self::LinuxArm64 => "LinuxArm64",
            Self::Mac => "Mac",
            Self::IOS => "IOS",
            Self::Android => "Android",
        }
    }

    /// Platform of the running host
    pub fn host() -> Self {
        if cfg!(target_os = "windows") {
            Self::Win64
        } else if cfg!(target_os = "macos") {
            Self::Mac
        } else if cfg!(target_arch = "aarch64") {
            Self::LinuxArm64
        } else {
            Self::Linux
        }
    }
}

impl FromStr for Platform {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|platform| platform.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| BuildError::msg(format!("Unknown platform '{s}'")))
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build configuration of a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Configuration {
    /// Unoptimized engine and game
    Debug,
    /// Optimized engine, unoptimized game
    DebugGame,
    /// Optimized with developer tooling
    Development,
    /// Shipping with test hooks
    Test,
    /// Final release build
    Shipping,
}

impl Configuration {
    /// Every known configuration
    pub const ALL: [Configuration; 5] = [
        Configuration::Debug,
        Configuration::DebugGame,
        Configuration::Development,
        Configuration::Test,
        Configuration::Shipping,
    ];

    /// Canonical name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "Debug",
            Self::DebugGame => "DebugGame",
            Self::Development => "Development",
            Self::Test => "Test",
            Self::Shipping => "Shipping",
        }
    }
}

impl FromStr for Configuration {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|configuration| configuration.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| BuildError::msg(format!("Unknown configuration '{s}'")))
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One target/platform/configuration tuple to build
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetDescriptor {
    /// Target name
    pub name: String,
    /// Platform to build for
    pub platform: Platform,
    /// Configuration to build
    pub configuration: Configuration,
    /// Architecture override (platform default when `None`)
    pub architecture: Option<String>,
    /// Project descriptor file, if this is a project target
    pub project_file: Option<PathBuf>,
    /// Restrict the build to these modules
    pub only_modules: Vec<String>,
    /// Restrict the build to these source files
    pub single_files: Vec<PathBuf>,
    /// Hot reload mode
    pub hot_reload: HotReloadMode,
    /// Unrecognized arguments passed through to the target builder
    pub additional_arguments: Vec<String>,
}

impl TargetDescriptor {
    /// Descriptor with no restrictions
    pub fn new(name: impl Into<String>, platform: Platform, configuration: Configuration) -> Self {
        Self {
            name: name.into(),
            platform,
            configuration,
            architecture: None,
            project_file: None,
            only_modules: Vec::new(),
            single_files: Vec::new(),
            hot_reload: HotReloadMode::Disabled,
            additional_arguments: Vec::new(),
        }
    }

    /// Architecture, defaulting per platform
    pub fn architecture(&self) -> &str {
        match &self.architecture {
            Some(architecture) => architecture,
            None => match self.platform {
                Platform::LinuxArm64 | Platform::IOS | Platform::Android => "arm64",
                _ => "x64",
            },
        }
    }

    /// Tag attached to every action this target contributes
    pub fn group_name(&self) -> String {
        format!("{}-{}-{}", self.name, self.platform, self.configuration)
    }

    /// Whether the build is restricted to a subset of outputs
    pub fn is_partial(&self) -> bool {
        !self.only_modules.is_empty() || !self.single_files.is_empty()
    }

    /// Parse target descriptors from command line tokens
    ///
    /// Positional tokens are target names, platforms, or configurations, and
    /// every combination is built. `-Target="..."` introduces a
    /// self-contained group parsed the same way.
    pub fn parse_command_line(arguments: &[String]) -> BuildResult<Vec<TargetDescriptor>> {
        let mut descriptors = Vec::new();
        let mut rest = Vec::new();
        for argument in arguments {
            match strip_option(argument, "Target") {
                Some(group) => {
                    let tokens = split_group(&group);
                    descriptors.extend(Self::parse_group(&tokens)?);
                }
                None => rest.push(argument.clone()),
            }
        }
        if !rest.is_empty() || descriptors.is_empty() {
            descriptors.extend(Self::parse_group(&rest)?);
        }
        Ok(descriptors)
    }

    fn parse_group(arguments: &[String]) -> BuildResult<Vec<TargetDescriptor>> {
        let mut names = Vec::new();
        let mut platforms = Vec::new();
        let mut configurations = Vec::new();
        let mut template = TargetDescriptor::new(String::new(), Platform::host(), Configuration::Development);

        for argument in arguments {
            if let Some(value) = strip_option(argument, "Project") {
                template.project_file = Some(PathBuf::from(value));
            } else if let Some(value) = strip_option(argument, "Module") {
                template.only_modules.push(value);
            } else if let Some(value) = strip_option(argument, "SingleFile") {
                template.single_files.push(PathBuf::from(value));
            } else if let Some(value) = strip_option(argument, "Architecture") {
                template.architecture = Some(value);
            } else if argument.eq_ignore_ascii_case("-LiveCoding") {
                template.hot_reload = HotReloadMode::LiveCoding;
            } else if argument.eq_ignore_ascii_case("-HotReload") {
                template.hot_reload = HotReloadMode::FromIde;
            } else if argument.starts_with('-') {
                template.additional_arguments.push(argument.clone());
            } else if argument.to_ascii_lowercase().ends_with(".uproject") {
                template.project_file = Some(PathBuf::from(argument));
            } else if let Ok(platform) = argument.parse::<Platform>() {
                platforms.push(platform);
            } else if let Ok(configuration) = argument.parse::<Configuration>() {
                configurations.push(configuration);
            } else {
                names.extend(argument.split('+').map(str::to_string));
            }
        }

        if names.is_empty() {
            return Err(BuildError::msg(format!(
                "No target name was specified on the command line ({})",
                arguments.join(" ")
            )));
        }
        if platforms.is_empty() {
            return Err(BuildError::msg(format!(
                "No platform specified for target {}",
                names.join("+")
            )));
        }
        if configurations.is_empty() {
            return Err(BuildError::msg(format!(
                "No configuration specified for target {}",
                names.join("+")
            )));
        }

        let mut descriptors = Vec::new();
        for name in &names {
            for &platform in &platforms {
                for &configuration in &configurations {
                    let mut descriptor = template.clone();
                    descriptor.name = name.clone();
                    descriptor.platform = platform;
                    descriptor.configuration = configuration;
                    descriptors.push(descriptor);
                }
            }
        }
        Ok(descriptors)
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.name, self.platform, self.configuration)
    }
}

fn strip_option(argument: &str, name: &str) -> Option<String> {
    let body = argument.strip_prefix('-')?;
    let (key, value) = body.split_once('=')?;
    if key.eq_ignore_ascii_case(name) {
        Some(value.trim_matches('"').to_string())
    } else {
        None
    }
}

fn split_group(group: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in group.chars() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Produces a target's makefile from its rules
///
/// Implementations stand in for the module/rules model: they decide which
/// actions a target needs.
pub trait TargetBuilder: Send + Sync {
    /// Build a fresh makefile for `descriptor`
    fn build_makefile(
        &self,
        descriptor: &TargetDescriptor,
        session: &BuildSession,
    ) -> BuildResult<TargetMakefile>;
}
