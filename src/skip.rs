//! Interactive operator skip commands
//!
//! A background OS thread reads stdin lines into a channel. Each in-flight
//! transfer holds a [`SkipToken`]; polling the token drains pending commands
//! without blocking and applies them to the registered transfers.
//!
//! Commands:
//! - `s` / `skip` - skip the foreground item, or the only in-flight item
//! - `s <identifier>` / `skip <identifier>` - skip that item
//! - `l` / `list` - log the in-flight identifiers

use std::collections::BTreeMap;
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Parsed operator command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipCommand {
    /// Skip the default target
    Skip,
    /// Skip a named in-flight item
    SkipItem(String),
    /// List in-flight items
    List,
}

/// Parse one input line; unknown lines yield `None`
pub fn parse_command(line: &str) -> Option<SkipCommand> {
    let mut parts = line.split_whitespace();
    let verb = parts.next()?.to_ascii_lowercase();
    let arg = parts.next();

    match (verb.as_str(), arg) {
        ("s" | "skip", None) => Some(SkipCommand::Skip),
        ("s" | "skip", Some(id)) => Some(SkipCommand::SkipItem(id.to_string())),
        ("l" | "list", _) => Some(SkipCommand::List),
        _ => None,
    }
}

#[derive(Default)]
struct Registry {
    items: BTreeMap<String, Arc<AtomicBool>>,
    foreground: Option<String>,
}

struct Inner {
    sender: mpsc::UnboundedSender<String>,
    receiver: Mutex<mpsc::UnboundedReceiver<String>>,
    registry: Mutex<Registry>,
}

/// Routes operator commands to in-flight transfers
#[derive(Clone)]
pub struct SkipController {
    inner: Arc<Inner>,
}

impl Default for SkipController {
    fn default() -> Self {
        Self::new()
    }
}

impl SkipController {
    /// Create a controller with no input attached
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                sender,
                receiver: Mutex::new(receiver),
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    /// Create a controller fed from stdin by a background thread
    pub fn with_stdin() -> Self {
        let controller = Self::new();
        controller.spawn_stdin_listener();
        controller
    }

    /// Start the stdin reader thread
    ///
    /// The thread ends on EOF or once the controller is dropped.
    pub fn spawn_stdin_listener(&self) {
        let sender = self.inner.sender.clone();
        let spawned = std::thread::Builder::new()
            .name("skip-listener".to_string())
            .spawn(move || {
                let stdin = std::io::stdin();
                for line in stdin.lock().lines() {
                    let Ok(line) = line else { break };
                    if sender.send(line).is_err() {
                        break;
                    }
                }
                debug!("Skip listener stopped");
            });

        match spawned {
            Ok(_) => info!("Type 's' + Enter to skip the current dataset, 's <id>' to skip a specific one, 'l' to list"),
            Err(e) => warn!(error = %e, "Failed to start skip listener"),
        }
    }

    /// Queue a command line as if it had been typed
    pub fn send_command(&self, line: impl Into<String>) {
        let _ = self.inner.sender.send(line.into());
    }

    /// Register an in-flight item
    ///
    /// A foreground item is the target of a bare `s`. Commands queued before
    /// registration are applied first so a stale `s` never hits a new item.
    pub fn register(&self, identifier: impl Into<String>, foreground: bool) -> SkipToken {
        let identifier = identifier.into();
        self.drain();

        let flag = Arc::new(AtomicBool::new(false));
        {
            let mut registry = self.registry();
            registry.items.insert(identifier.clone(), flag.clone());
            if foreground {
                registry.foreground = Some(identifier.clone());
            }
        }

        SkipToken {
            identifier,
            flag,
            controller: self.clone(),
        }
    }

    /// Identifiers currently in flight
    pub fn in_flight(&self) -> Vec<String> {
        self.registry().items.keys().cloned().collect()
    }

    /// Apply every queued command without blocking
    pub fn drain(&self) {
        loop {
            let next = match self.inner.receiver.lock() {
                Ok(mut receiver) => receiver.try_recv().ok(),
                Err(poisoned) => poisoned.into_inner().try_recv().ok(),
            };
            let Some(line) = next else { break };
            match parse_command(&line) {
                Some(command) => self.apply(command),
                None => {
                    if !line.trim().is_empty() {
                        debug!(input = %line.trim(), "Ignoring unknown command");
                    }
                }
            }
        }
    }

    fn apply(&self, command: SkipCommand) {
        let registry = self.registry();
        match command {
            SkipCommand::Skip => {
                let target = registry.foreground.clone().or_else(|| {
                    (registry.items.len() == 1)
                        .then(|| registry.items.keys().next().cloned())
                        .flatten()
                });
                match target.and_then(|id| registry.items.get(&id).map(|f| (id, f))) {
                    Some((id, flag)) => {
                        flag.store(true, Ordering::SeqCst);
                        info!(identifier = %id, "Skip requested");
                    }
                    None if registry.items.is_empty() => info!("No transfer in flight to skip"),
                    None => warn!(
                        in_flight = ?registry.items.keys().collect::<Vec<_>>(),
                        "Several transfers in flight, use 's <identifier>'"
                    ),
                }
            }
            SkipCommand::SkipItem(id) => match registry.items.get(&id) {
                Some(flag) => {
                    flag.store(true, Ordering::SeqCst);
                    info!(identifier = %id, "Skip requested");
                }
                None => warn!(identifier = %id, "Not in flight, ignoring skip"),
            },
            SkipCommand::List => {
                info!(
                    in_flight = ?registry.items.keys().collect::<Vec<_>>(),
                    foreground = ?registry.foreground,
                    "In-flight transfers"
                );
            }
        }
    }

    fn unregister(&self, identifier: &str, flag: &Arc<AtomicBool>) {
        let mut registry = self.registry();
        let owned = registry
            .items
            .get(identifier)
            .map(|f| Arc::ptr_eq(f, flag))
            .unwrap_or(false);
        if owned {
            registry.items.remove(identifier);
            if registry.foreground.as_deref() == Some(identifier) {
                registry.foreground = None;
            }
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        match self.inner.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Per-item skip handle, unregistered on drop
pub struct SkipToken {
    identifier: String,
    flag: Arc<AtomicBool>,
    controller: SkipController,
}

impl SkipToken {
    /// Whether a skip was requested for this item
    ///
    /// Drains pending operator commands first.
    pub fn is_requested(&self) -> bool {
        self.controller.drain();
        self.flag.load(Ordering::SeqCst)
    }

    /// Identifier this token belongs to
    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

impl Drop for SkipToken {
    fn drop(&mut self) {
        self.controller.unregister(&self.identifier, &self.flag);
    }
}
