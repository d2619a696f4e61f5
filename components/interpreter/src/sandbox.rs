//! Security and resource sandbox
//!
//! The default [`SecurityPolicy`] denies filesystem, network, process and
//! FFI access. Privileged natives are authorized before they run, so a denied
//! call has no side effects. Instruction, wall-clock and cancellation limits
//! are enforced by an [`ExecutionMeter`] at checkpoints.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use core_types::{Fault, TypeId, Value};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::config::ConfigError;

/// Access a privileged native needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Privilege {
    /// Read the file named by the first argument
    FileRead,
    /// Write the file named by the first argument
    FileWrite,
    /// Connect to the host (and optional port) given by the first arguments
    Network,
    /// Start a process
    Process,
    /// Call into foreign code
    Ffi,
}

/// Filesystem grant for a directory tree or file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsGrant {
    /// Granted path; everything below it is covered. Relative paths are
    /// resolved against the working directory when the policy is installed.
    pub path: PathBuf,
    /// Reads allowed
    #[serde(default)]
    pub read: bool,
    /// Writes allowed
    #[serde(default)]
    pub write: bool,
}

/// Network allow rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetRule {
    /// Host glob; `*` matches any run of characters
    pub host: String,
    /// Port, or any port when absent
    #[serde(default)]
    pub port: Option<u16>,
}

/// Resource ceilings; `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Heap bytes
    pub max_memory_bytes: Option<usize>,
    /// Instructions per host call
    pub max_instructions: Option<u64>,
    /// Wall-clock milliseconds per host call
    pub max_wall_ms: Option<u64>,
}

/// Capabilities granted to scripts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    /// Filesystem grants
    pub filesystem: Vec<FsGrant>,
    /// Network allow rules
    pub network: Vec<NetRule>,
    /// Whether processes may be started
    pub allow_process: bool,
    /// Whether FFI natives may run
    pub allow_ffi: bool,
    /// Resource ceilings
    pub limits: ResourceLimits,
}

impl SecurityPolicy {
    /// Policy that denies everything
    pub fn deny_all() -> Self {
        Self::default()
    }

    /// Add a filesystem grant
    pub fn grant_path(mut self, path: impl Into<PathBuf>, read: bool, write: bool) -> Self {
        self.filesystem.push(FsGrant {
            path: path.into(),
            read,
            write,
        });
        self
    }

    /// Add a network rule
    pub fn allow_host(mut self, host: &str, port: Option<u16>) -> Self {
        self.network.push(NetRule {
            host: host.to_string(),
            port,
        });
        self
    }
}

/// Installed policy with host patterns compiled.
#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    policy: SecurityPolicy,
    grants: Vec<FsGrant>,
    hosts: Vec<(Regex, Option<u16>)>,
}

fn host_pattern(glob: &str) -> Result<Regex, regex::Error> {
    let body = glob
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("(?i)^{}$", body))
}

/// Absolute form of `path` as the filesystem would see it.
///
/// The longest existing prefix is canonicalized, so symlinks are followed;
/// the components below it are applied lexically. `None` when `..` climbs
/// above the root or the working directory cannot be read.
fn resolve(path: &Path) -> Option<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(path)
    };

    let mut depth = 0usize;
    for component in absolute.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::ParentDir => depth = depth.checked_sub(1)?,
            _ => {}
        }
    }

    let mut components: Vec<Component> = absolute.components().collect();
    let mut missing = Vec::new();
    let mut resolved = loop {
        let prefix: PathBuf = components.iter().collect();
        if let Ok(real) = prefix.canonicalize() {
            break real;
        }
        missing.push(components.pop()?);
    };
    for component in missing.into_iter().rev() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return None;
                }
            }
            other => resolved.push(other),
        }
    }
    Some(resolved)
}

fn text_arg<'a>(args: &'a [Value], index: usize) -> Result<&'a str, Fault> {
    match args.get(index) {
        Some(Value::Text(t)) => Ok(t.as_str()),
        other => Err(Fault::TypeMismatch {
            expected: TypeId::TEXT,
            actual: other.map_or(TypeId::NULL, Value::type_id),
        }),
    }
}

impl Sandbox {
    /// Compile a policy
    pub fn new(policy: SecurityPolicy) -> Result<Self, ConfigError> {
        let hosts = policy
            .network
            .iter()
            .map(|rule| Ok((host_pattern(&rule.host)?, rule.port)))
            .collect::<Result<Vec<_>, regex::Error>>()?;
        let grants = policy
            .filesystem
            .iter()
            .filter_map(|grant| {
                let path = resolve(&grant.path);
                if path.is_none() {
                    warn!(path = %grant.path.display(), "filesystem grant cannot be resolved");
                }
                Some(FsGrant {
                    path: path?,
                    ..grant.clone()
                })
            })
            .collect();
        Ok(Self {
            policy,
            grants,
            hosts,
        })
    }

    /// Installed policy
    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    /// Whether `path` may be read or written
    pub fn check_file(&self, path: &str, write: bool) -> Result<(), Fault> {
        let allowed = resolve(Path::new(path)).map_or(false, |target| {
            self.grants.iter().any(|grant| {
                (if write { grant.write } else { grant.read }) && target.starts_with(&grant.path)
            })
        });
        if allowed {
            Ok(())
        } else {
            let verb = if write { "write" } else { "read" };
            Err(Fault::PermissionDenied(format!("{} of `{}`", verb, path)))
        }
    }

    /// Whether `host` (and `port`) may be contacted
    pub fn check_network(&self, host: &str, port: Option<u16>) -> Result<(), Fault> {
        let allowed = self.hosts.iter().any(|(pattern, rule_port)| {
            pattern.is_match(host) && (rule_port.is_none() || *rule_port == port)
        });
        if allowed {
            Ok(())
        } else {
            Err(Fault::PermissionDenied(match port {
                Some(port) => format!("connection to `{}:{}`", host, port),
                None => format!("connection to `{}`", host),
            }))
        }
    }

    /// Authorize a privileged call from its arguments
    pub fn authorize(&self, privilege: Privilege, args: &[Value]) -> Result<(), Fault> {
        let result = match privilege {
            Privilege::FileRead => self.check_file(text_arg(args, 0)?, false),
            Privilege::FileWrite => self.check_file(text_arg(args, 0)?, true),
            Privilege::Network => {
                let host = text_arg(args, 0)?;
                let port = args
                    .get(1)
                    .and_then(Value::as_integer)
                    .and_then(|p| u16::try_from(p).ok());
                self.check_network(host, port)
            }
            Privilege::Process if self.policy.allow_process => Ok(()),
            Privilege::Process => Err(Fault::PermissionDenied("process creation".to_string())),
            Privilege::Ffi if self.policy.allow_ffi => Ok(()),
            Privilege::Ffi => Err(Fault::PermissionDenied("foreign function call".to_string())),
        };
        if let Err(fault) = &result {
            warn!(?privilege, %fault, "privileged call denied");
        }
        result
    }
}

/// Cross-thread cancellation flag.
///
/// # Examples
///
/// ```
/// use interpreter::CancelHandle;
///
/// let handle = CancelHandle::new();
/// let remote = handle.clone();
/// remote.cancel();
/// assert!(handle.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Fresh, not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of the running call
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation is pending
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Consume a pending request
    pub(crate) fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

/// Instruction, wall-clock and cancellation accounting for one host call.
#[derive(Debug, Clone)]
pub struct ExecutionMeter {
    executed: u64,
    countdown: u32,
    interval: u32,
    started: Instant,
    limits: ResourceLimits,
}

impl ExecutionMeter {
    /// Meter checking every `interval` instructions
    pub fn new(interval: u32, limits: ResourceLimits) -> Self {
        let interval = interval.max(1);
        Self {
            executed: 0,
            countdown: interval,
            interval,
            started: Instant::now(),
            limits,
        }
    }

    /// Start a new host call
    pub fn reset(&mut self) {
        self.executed = 0;
        self.countdown = self.interval;
        self.started = Instant::now();
    }

    /// Replace the limits
    pub fn set_limits(&mut self, limits: ResourceLimits) {
        self.limits = limits;
    }

    /// Instructions executed since the last reset
    pub fn executed(&self) -> u64 {
        self.executed
    }

    /// Count one instruction; true when a checkpoint is due
    #[inline]
    pub fn tick(&mut self) -> bool {
        self.executed += 1;
        self.countdown -= 1;
        if self.countdown == 0 {
            self.countdown = self.interval;
            true
        } else {
            false
        }
    }

    /// Enforce the limits and honor cancellation
    pub fn check(&mut self, cancel: &CancelHandle) -> Result<(), Fault> {
        trace!(executed = self.executed, "checkpoint");
        if cancel.take() {
            warn!("call cancelled by host");
            return Err(Fault::Cancelled);
        }
        if let Some(limit) = self.limits.max_instructions {
            if self.executed > limit {
                warn!(limit, executed = self.executed, "instruction limit exceeded");
                return Err(Fault::ExecutionLimitExceeded { limit });
            }
        }
        if let Some(limit_ms) = self.limits.max_wall_ms {
            if self.started.elapsed().as_millis() > u128::from(limit_ms) {
                warn!(limit_ms, "wall-clock limit exceeded");
                return Err(Fault::TimeoutExceeded { limit_ms });
            }
        }
        Ok(())
    }
}
