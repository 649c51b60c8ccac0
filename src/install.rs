//! What happens to a file once it has been received

use std::path::Path;
use std::process::Command;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    /// The installer ran but did not finish unattended
    ManualSetupRequired,
    /// Nothing could be run for this file
    Unsupported,
}

pub trait Installer: Send + Sync {
    fn install(&self, path: &Path) -> InstallOutcome;
}

/// Runs a fixed argv per received file. `{file}` in any argument is replaced
/// by the received path; with no placeholder the path is appended.
#[derive(Debug, Clone)]
pub struct CommandInstaller {
    argv: Vec<String>,
}

impl CommandInstaller {
    pub fn new(argv: Vec<String>) -> Option<Self> {
        if argv.is_empty() {
            None
        } else {
            Some(Self { argv })
        }
    }

    fn command_line(&self, path: &Path) -> Vec<String> {
        let file = path.display().to_string();
        let mut substituted = false;
        let mut args: Vec<String> = self
            .argv
            .iter()
            .map(|a| {
                if a.contains("{file}") {
                    substituted = true;
                    a.replace("{file}", &file)
                } else {
                    a.clone()
                }
            })
            .collect();
        if !substituted {
            args.push(file);
        }
        args
    }
}

impl Installer for CommandInstaller {
    fn install(&self, path: &Path) -> InstallOutcome {
        let args = self.command_line(path);
        let Some((program, rest)) = args.split_first() else {
            return InstallOutcome::Unsupported;
        };
        match Command::new(program).args(rest).status() {
            Ok(status) if status.success() => {
                info!(file = %path.display(), "installed");
                InstallOutcome::Installed
            }
            Ok(status) => {
                warn!(file = %path.display(), %status, "installer did not finish");
                InstallOutcome::ManualSetupRequired
            }
            Err(e) => {
                warn!(program = %program, "cannot run installer: {}", e);
                InstallOutcome::Unsupported
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_substitution() {
        let inst = CommandInstaller::new(vec![
            "msiexec".into(),
            "/i".into(),
            "{file}".into(),
            "/qn".into(),
        ])
        .unwrap();
        assert_eq!(
            inst.command_line(Path::new("/dl/a.msi")),
            vec!["msiexec", "/i", "/dl/a.msi", "/qn"]
        );

        let inst = CommandInstaller::new(vec!["run".into()]).unwrap();
        assert_eq!(inst.command_line(Path::new("x.exe")), vec!["run", "x.exe"]);
        assert!(CommandInstaller::new(Vec::new()).is_none());
    }

    #[test]
    fn test_missing_program_is_unsupported() {
        let inst = CommandInstaller::new(vec!["/nonexistent/lanpush-installer".into()]).unwrap();
        assert_eq!(inst.install(Path::new("x")), InstallOutcome::Unsupported);
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_code_maps_to_outcome() {
        let ok = CommandInstaller::new(vec!["true".into()]).unwrap();
        assert_eq!(ok.install(Path::new("x")), InstallOutcome::Installed);
        let bad = CommandInstaller::new(vec!["false".into()]).unwrap();
        assert_eq!(bad.install(Path::new("x")), InstallOutcome::ManualSetupRequired);
    }
}
