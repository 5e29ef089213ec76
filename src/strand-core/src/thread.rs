use fnv::FnvHashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::sync::Arc;
use std::thread::{self, ThreadId};

static THREAD_NAME_MAP: Lazy<RwLock<FnvHashMap<ThreadId, Arc<String>>>> =
    Lazy::new(RwLock::default);

pub fn set_thread_name(id: ThreadId, name: String) {
    THREAD_NAME_MAP.write().insert(id, Arc::new(name));
}

pub fn thread_name(id: ThreadId) -> Option<Arc<String>> {
    THREAD_NAME_MAP.read().get(&id).cloned()
}

/// Register a name for the calling thread, so log lines from it are
/// attributable. Worker and fiber threads call this on startup.
pub fn register_current(name: String) {
    set_thread_name(thread::current().id(), name);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_name_is_visible() {
        register_current("Thread Map Test".to_string());
        let name = thread_name(thread::current().id()).expect("name was just registered");
        assert_eq!(name.as_str(), "Thread Map Test");
    }
}
