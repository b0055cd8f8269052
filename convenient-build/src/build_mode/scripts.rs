//! Pre- and post-build scripts declared by a target's makefile

use crate::error::{BuildError, BuildResult};
use crate::session::BuildSession;
use crate::target::TargetDescriptor;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{info, warn};

/// Run `scripts` in order; the first failure aborts the target
pub async fn run_build_scripts(
    stage: &str,
    scripts: &[PathBuf],
    descriptor: &TargetDescriptor,
    session: &BuildSession,
) -> BuildResult<()> {
    for script in scripts {
        info!("Running {} script {}", stage, script.display());
        let mut command = Command::new(script);
        command
            .env("ENGINE_DIR", session.engine_dir())
            .env("TARGET_NAME", &descriptor.name)
            .env("TARGET_PLATFORM", descriptor.platform.as_str())
            .env("TARGET_CONFIGURATION", descriptor.configuration.as_str())
            .env("TARGET_ARCHITECTURE", descriptor.architecture())
            .current_dir(session.root_dir());
        if let Some(project_dir) = session.project_dir() {
            command.env("PROJECT_DIR", project_dir);
        }

        let output = command.output().await.map_err(|e| BuildError::TargetFailed {
            target: descriptor.group_name(),
            reason: format!("unable to run {} script {}: {}", stage, script.display(), e),
        })?;
        let text = String::from_utf8_lossy(&output.stdout);
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            info!("  {}", line);
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            for line in stderr.lines() {
                warn!("  {}", line);
            }
            return Err(BuildError::TargetFailed {
                target: descriptor.group_name(),
                reason: format!(
                    "{} script {} failed ({})",
                    stage,
                    script.display(),
                    output.status
                ),
            });
        }
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::BuildConfiguration;
    use crate::target::{Configuration, Platform};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(dir: &std::path::Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_scripts_see_target_environment_and_stop_on_failure() {
        let tmp = TempDir::new().unwrap();
        let session = BuildSession::in_memory(tmp.path(), BuildConfiguration::default());
        let descriptor = TargetDescriptor::new("Game", Platform::Linux, Configuration::Debug);
        let marker = tmp.path().join("marker");
        let ok = script(
            tmp.path(),
            "ok.sh",
            &format!("echo \"$TARGET_NAME-$TARGET_CONFIGURATION\" > {}", marker.display()),
        );
        let fail = script(tmp.path(), "fail.sh", "exit 4");
        let never = script(tmp.path(), "never.sh", "touch never");

        run_build_scripts("pre-build", &[ok.clone()], &descriptor, &session)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&marker).unwrap().trim(), "Game-Debug");

        let error = run_build_scripts("post-build", &[fail, never], &descriptor, &session)
            .await
            .unwrap_err();
        assert!(matches!(error, BuildError::TargetFailed { .. }));
        assert!(!tmp.path().join("never").exists());
    }
}
