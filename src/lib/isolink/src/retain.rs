//! Permanent retention of hook-loaded instances.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::debug;

use crate::library::CustomLibrary;

pub struct RetainedEntry {
    pub library: Arc<CustomLibrary>,
    pub entry_point: usize,
}

/// Keeps instances alive for the remainder of the process.
///
/// Extension modules loaded on behalf of an interpreter hand out function
/// pointers with no unload notification, and interpreter shutdown order is
/// not observable from here. Entries are deliberately never released; code,
/// data, and TLS blocks of retained instances stay valid until exit.
#[derive(Default)]
pub struct RetentionArena {
    entries: Mutex<Vec<RetainedEntry>>,
}

static ARENA: OnceCell<RetentionArena> = OnceCell::new();

impl RetentionArena {
    pub fn global() -> &'static Self {
        ARENA.get_or_init(RetentionArena::default)
    }

    pub fn retain(&self, library: Arc<CustomLibrary>, entry_point: usize) {
        debug!(
            "retaining {} (entry {:x}) for process lifetime",
            library, entry_point
        );
        self.entries.lock().push(RetainedEntry {
            library,
            entry_point,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retained_instances_stay_alive() {
        let arena = RetentionArena::default();
        let lib = CustomLibrary::create("/nonexistent/never-loaded.so");
        let weak = Arc::downgrade(&lib);
        arena.retain(lib, 0x1000);
        assert_eq!(arena.len(), 1);
        assert!(weak.upgrade().is_some());
    }
}
