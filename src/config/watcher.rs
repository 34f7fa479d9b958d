//! Hot reload of the gateway config file.
//!
//! The parent directory is watched rather than the file itself: editors
//! that save by writing a temp file and renaming it over the original would
//! otherwise detach a file-level watch after the first save.
//!
//! A single save usually fires several events. Each one re-reads the file,
//! but only a config that validates and differs from the last one forwarded
//! reaches the server.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::GatewayConfig;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Decides which file events turn into config updates.
#[derive(Debug)]
struct ReloadGate {
    path: PathBuf,
    last_sent: GatewayConfig,
}

impl ReloadGate {
    fn new(path: PathBuf, current: GatewayConfig) -> Self {
        Self {
            path,
            last_sent: current,
        }
    }

    fn touches_config(&self, event: &Event) -> bool {
        let relevant_kind = matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_)
        );
        relevant_kind && event.paths.iter().any(|p| same_file(p, &self.path))
    }

    /// `Some` only when `loaded` changes what the server is running.
    fn admit(&mut self, loaded: GatewayConfig) -> Option<GatewayConfig> {
        if loaded == self.last_sent {
            return None;
        }
        self.last_sent = loaded.clone();
        Some(loaded)
    }
}

/// Event paths may be absolute even when the configured path is relative.
fn same_file(event_path: &Path, config_path: &Path) -> bool {
    if event_path == config_path {
        return true;
    }
    match (event_path.canonicalize(), config_path.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => event_path.file_name() == config_path.file_name() && event_path.ends_with(config_path),
    }
}

/// Turns edits of the config file into a stream of validated configs.
pub struct ConfigWatcher {
    gate: ReloadGate,
    update_tx: mpsc::UnboundedSender<GatewayConfig>,
}

impl ConfigWatcher {
    /// `current` is the config the server starts with; reloads equal to it
    /// are not forwarded.
    pub fn new(path: &Path, current: GatewayConfig) -> (Self, mpsc::UnboundedReceiver<GatewayConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let watcher = Self {
            gate: ReloadGate::new(path.to_path_buf(), current),
            update_tx,
        };
        (watcher, update_rx)
    }

    /// Start watching. Drop the returned watcher to stop.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let dir = watch_dir(&self.gate.path);
        let path = self.gate.path.clone();
        let mut gate = self.gate;
        let tx = self.update_tx;

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::error!(error = ?e, "Config watch error");
                        return;
                    }
                };
                if !gate.touches_config(&event) {
                    return;
                }
                match load_config(&gate.path) {
                    Ok(loaded) => match gate.admit(loaded) {
                        Some(config) => {
                            tracing::info!(path = ?gate.path, "Config changed, applying");
                            let _ = tx.send(config);
                        }
                        None => tracing::debug!(path = ?gate.path, "Config unchanged, skipping reload"),
                    },
                    Err(e) => {
                        tracing::error!(path = ?gate.path, error = %e, "Rejected config reload, keeping current configuration");
                    }
                }
            },
            Config::default().with_poll_interval(POLL_INTERVAL),
        )?;

        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        tracing::info!(path = ?path, dir = ?dir, "Config watcher started");
        Ok(watcher)
    }
}

fn watch_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, DataChange, ModifyKind};

    fn gate() -> ReloadGate {
        ReloadGate::new(PathBuf::from("/etc/gateway/gateway.toml"), GatewayConfig::default())
    }

    fn modified(path: &str) -> Event {
        Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content))).add_path(PathBuf::from(path))
    }

    #[test]
    fn test_only_config_file_events_count() {
        let gate = gate();
        assert!(gate.touches_config(&modified("/etc/gateway/gateway.toml")));
        assert!(gate.touches_config(
            &Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from("/etc/gateway/gateway.toml"))
        ));
        assert!(!gate.touches_config(&modified("/etc/gateway/.gateway.toml.swp")));
        assert!(!gate.touches_config(&modified("/etc/gateway/other.toml")));
        assert!(!gate.touches_config(
            &Event::new(EventKind::Access(AccessKind::Read)).add_path(PathBuf::from("/etc/gateway/gateway.toml"))
        ));
    }

    #[test]
    fn test_repeated_identical_reloads_forwarded_once() {
        let mut gate = gate();
        assert!(gate.admit(GatewayConfig::default()).is_none());

        let mut changed = GatewayConfig::default();
        changed.authorization.minimum_role = "MANAGER".to_string();
        assert_eq!(gate.admit(changed.clone()), Some(changed.clone()));
        assert!(gate.admit(changed.clone()).is_none());

        assert_eq!(gate.admit(GatewayConfig::default()), Some(GatewayConfig::default()));
    }

    #[test]
    fn test_relative_config_path_matches_absolute_event() {
        assert!(same_file(Path::new("/srv/app/conf/gateway.toml"), Path::new("conf/gateway.toml")));
        assert!(!same_file(Path::new("/srv/app/conf/other.toml"), Path::new("conf/gateway.toml")));
    }

    #[test]
    fn test_watch_dir_of_bare_file_name_is_cwd() {
        assert_eq!(watch_dir(Path::new("gateway.toml")), PathBuf::from("."));
        assert_eq!(watch_dir(Path::new("/etc/gateway/gateway.toml")), PathBuf::from("/etc/gateway"));
    }
}
