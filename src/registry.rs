use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use tracing::{debug, info};
use crate::config::ReceiveWindowConfig;
use crate::packet::Tsi;
use crate::window::ReceiveWindow;

/// The receive windows of all sending peers known to a receiver, keyed by [Tsi]. The
///  registry is owned by the transport layer and passed to whatever needs to look up
///  sessions.
pub struct SessionRegistry {
    config: Arc<ReceiveWindowConfig>,
    windows: Mutex<FxHashMap<Tsi, Arc<ReceiveWindow>>>,
}

impl SessionRegistry {
    pub fn new(config: Arc<ReceiveWindowConfig>) -> anyhow::Result<SessionRegistry> {
        config.validate()?;
        Ok(SessionRegistry {
            config,
            windows: Default::default(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<Tsi, Arc<ReceiveWindow>>> {
        self.windows.lock()
            .expect("session registry lock is poisoned")
    }

    pub fn get(&self, tsi: Tsi) -> Option<Arc<ReceiveWindow>> {
        self.lock().get(&tsi).cloned()
    }

    /// returns the window for a session, creating it on first contact
    pub fn get_or_create(&self, tsi: Tsi) -> anyhow::Result<Arc<ReceiveWindow>> {
        match self.lock().entry(tsi) {
            Entry::Occupied(e) => Ok(e.get().clone()),
            Entry::Vacant(e) => {
                debug!("initializing receive window for {}", tsi);
                let window = ReceiveWindow::new(tsi, self.config.clone())?;
                Ok(e.insert(Arc::new(window)).clone())
            }
        }
    }

    /// Removes a session's window and shuts it down. Other holders of the window see
    ///  `WindowGone` from then on.
    pub fn remove(&self, tsi: Tsi) -> Option<Arc<ReceiveWindow>> {
        let window = self.lock().remove(&tsi)?;
        info!("removing receive window for {}", tsi);
        window.shutdown();
        Some(window)
    }

    /// a snapshot of all registered windows
    pub fn windows(&self) -> Vec<Arc<ReceiveWindow>> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn shutdown_all(&self) {
        let windows = std::mem::take(&mut *self.lock());
        for window in windows.values() {
            window.shutdown();
        }
    }
}
