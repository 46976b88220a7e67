//! Privilege drop.
//!
//! # Sequence
//! ```text
//! gate (user configured, drop requested, unprivileged mode on)
//!     → resolve user → setgid → setuid
//!     → chroot(root_dir) → chdir("/")      (only when confinement requested)
//! ```
//!
//! # Design Decisions
//! - Group is changed before user: setgid fails once the process is no
//!   longer root
//! - Every step is logged and the sequence keeps going on failure; nothing
//!   already applied is reverted
//! - The outcome is returned as a [`PrivilegeReport`] so the embedding
//!   service can decide whether a degraded drop is fatal

use std::fmt;
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Uid, User};

/// Identity settings, read once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityConfig {
    /// User to switch to.
    pub username: Option<String>,
    /// Directory to confine the process to.
    pub root_dir: Option<PathBuf>,
    /// The supervisor asked for a privilege drop (it passed service args).
    pub drop_requested: bool,
    /// Run unprivileged (`-u`).
    pub unprivileged: bool,
    /// Confine to `root_dir` (`-c`).
    pub chroot: bool,
}

impl IdentityConfig {
    fn skip_reason(&self) -> Option<SkipReason> {
        if self.username.as_deref().map_or(true, str::is_empty) {
            Some(SkipReason::NoUser)
        } else if !self.drop_requested {
            Some(SkipReason::NotRequested)
        } else if !self.unprivileged {
            Some(SkipReason::PrivilegedMode)
        } else {
            None
        }
    }

    fn confinement_dir(&self) -> Option<&Path> {
        if !self.chroot {
            return None;
        }
        self.root_dir
            .as_deref()
            .filter(|dir| !dir.as_os_str().is_empty())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PrivilegeError {
    #[error("Lookup {user} error {source}")]
    Lookup {
        user: String,
        #[source]
        source: nix::Error,
    },
    #[error("unknown user {0}")]
    UnknownUser(String),
    #[error("Setgid error {0}")]
    SetGid(#[source] nix::Error),
    #[error("Setuid error {0}")]
    SetUid(#[source] nix::Error),
    #[error("Chroot error {source}, path {}", .path.display())]
    Chroot {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
    #[error("Chdir error {0}")]
    Chdir(#[source] nix::Error),
    #[error("user {0} could not be resolved")]
    Unresolved(String),
}

/// Why the whole sequence was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoUser,
    NotRequested,
    PrivilegedMode,
    /// Privileges were already dropped by an earlier call.
    AlreadyApplied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Group,
    User,
    Chroot,
    Chdir,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Group => "setgid",
            Step::User => "setuid",
            Step::Chroot => "chroot",
            Step::Chdir => "chdir",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
pub enum StepOutcome {
    #[default]
    Skipped,
    Applied,
    Failed(PrivilegeError),
}

impl StepOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, StepOutcome::Applied)
    }
}

/// Result of one privilege drop attempt.
#[derive(Debug, Default)]
pub struct PrivilegeReport {
    pub skip_reason: Option<SkipReason>,
    pub group: StepOutcome,
    pub user: StepOutcome,
    pub chroot: StepOutcome,
    pub chdir: StepOutcome,
}

impl PrivilegeReport {
    pub(crate) fn skipped(reason: SkipReason) -> Self {
        Self {
            skip_reason: Some(reason),
            ..Default::default()
        }
    }

    /// The process may still hold the identity it started with.
    pub fn is_degraded(&self) -> bool {
        self.group.is_failed() || self.user.is_failed()
    }

    /// Every step that failed, in execution order.
    pub fn failures(&self) -> impl Iterator<Item = (Step, &PrivilegeError)> {
        [
            (Step::Group, &self.group),
            (Step::User, &self.user),
            (Step::Chroot, &self.chroot),
            (Step::Chdir, &self.chdir),
        ]
        .into_iter()
        .filter_map(|(step, outcome)| match outcome {
            StepOutcome::Failed(e) => Some((step, e)),
            _ => None,
        })
    }

    /// Escalate the first failed step into an error.
    pub fn into_result(self) -> Result<(), PrivilegeError> {
        for outcome in [self.group, self.user, self.chroot, self.chdir] {
            if let StepOutcome::Failed(e) = outcome {
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Process identity system calls.
pub trait IdentityOps {
    /// Resolve a user name to its uid and primary gid.
    fn lookup_user(&self, name: &str) -> Result<Option<(Uid, Gid)>, nix::Error>;
    fn set_gid(&self, gid: Gid) -> Result<(), nix::Error>;
    fn set_uid(&self, uid: Uid) -> Result<(), nix::Error>;
    fn chroot(&self, path: &Path) -> Result<(), nix::Error>;
    fn chdir(&self, path: &Path) -> Result<(), nix::Error>;
}

/// The real system calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemIdentity;

impl IdentityOps for SystemIdentity {
    fn lookup_user(&self, name: &str) -> Result<Option<(Uid, Gid)>, nix::Error> {
        Ok(User::from_name(name)?.map(|user| (user.uid, user.gid)))
    }

    fn set_gid(&self, gid: Gid) -> Result<(), nix::Error> {
        nix::unistd::setgid(gid)
    }

    fn set_uid(&self, uid: Uid) -> Result<(), nix::Error> {
        nix::unistd::setuid(uid)
    }

    fn chroot(&self, path: &Path) -> Result<(), nix::Error> {
        nix::unistd::chroot(path)
    }

    fn chdir(&self, path: &Path) -> Result<(), nix::Error> {
        nix::unistd::chdir(path)
    }
}

/// Runs the privilege drop sequence against an [`IdentityOps`] backend.
#[derive(Debug, Default)]
pub struct PrivilegeDropper<O = SystemIdentity> {
    ops: O,
}

impl PrivilegeDropper<SystemIdentity> {
    pub fn system() -> Self {
        Self {
            ops: SystemIdentity,
        }
    }
}

impl<O: IdentityOps> PrivilegeDropper<O> {
    pub fn with_ops(ops: O) -> Self {
        Self { ops }
    }

    pub fn ops(&self) -> &O {
        &self.ops
    }

    /// Drop privileges as configured. Never fails; see the returned report.
    pub fn drop_privileges(&self, identity: &IdentityConfig) -> PrivilegeReport {
        if let Some(reason) = identity.skip_reason() {
            tracing::debug!(reason = ?reason, "Privilege drop skipped");
            return PrivilegeReport::skipped(reason);
        }

        let mut report = PrivilegeReport::default();
        // Gate guarantees a non-empty user name.
        let username = identity.username.as_deref().unwrap_or_default();

        match self.resolve(username) {
            Ok((uid, gid)) => {
                report.group = match self.ops.set_gid(gid) {
                    Ok(()) => {
                        tracing::info!(gid = gid.as_raw(), "Setgid ok");
                        StepOutcome::Applied
                    }
                    Err(e) => {
                        tracing::error!(gid = gid.as_raw(), error = %e, "Setgid error");
                        StepOutcome::Failed(PrivilegeError::SetGid(e))
                    }
                };
                report.user = match self.ops.set_uid(uid) {
                    Ok(()) => {
                        tracing::info!(uid = uid.as_raw(), "Setuid ok");
                        StepOutcome::Applied
                    }
                    Err(e) => {
                        tracing::error!(uid = uid.as_raw(), error = %e, "Setuid error");
                        StepOutcome::Failed(PrivilegeError::SetUid(e))
                    }
                };
            }
            Err(e) => {
                tracing::error!(user = %username, error = %e, "Cannot resolve user, keeping current identity");
                report.group = StepOutcome::Failed(e);
                report.user = StepOutcome::Failed(PrivilegeError::Unresolved(username.to_string()));
            }
        }

        if let Some(dir) = identity.confinement_dir() {
            self.confine(dir, &mut report);
        }

        report
    }

    fn resolve(&self, username: &str) -> Result<(Uid, Gid), PrivilegeError> {
        match self.ops.lookup_user(username) {
            Ok(Some(ids)) => Ok(ids),
            Ok(None) => Err(PrivilegeError::UnknownUser(username.to_string())),
            Err(source) => Err(PrivilegeError::Lookup {
                user: username.to_string(),
                source,
            }),
        }
    }

    fn confine(&self, dir: &Path, report: &mut PrivilegeReport) {
        if let Err(e) = self.ops.chroot(dir) {
            tracing::error!(path = %dir.display(), error = %e, "Chroot error");
            report.chroot = StepOutcome::Failed(PrivilegeError::Chroot {
                path: dir.to_path_buf(),
                source: e,
            });
            return;
        }
        tracing::info!(path = %dir.display(), "Chroot ok");
        report.chroot = StepOutcome::Applied;

        report.chdir = match self.ops.chdir(Path::new("/")) {
            Ok(()) => {
                tracing::info!("Chdir ok");
                StepOutcome::Applied
            }
            Err(e) => {
                tracing::error!(error = %e, "Chdir error");
                StepOutcome::Failed(PrivilegeError::Chdir(e))
            }
        };
    }
}
