use std::sync::atomic::{AtomicBool, Ordering};

/// Set once the configured modules and tenants are provisioned.
static BOOTSTRAPPED: AtomicBool = AtomicBool::new(false);

/// Where the registry state lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateSource {
    Local,
    Etcd,
}

impl StateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateSource::Local => "local",
            StateSource::Etcd => "etcd",
        }
    }
}

pub fn mark_ready(source: StateSource) {
    BOOTSTRAPPED.store(true, Ordering::SeqCst);
    log::info!(
        "Gateway bootstrapped with {} state, service is ready",
        source.as_str()
    );
}

pub fn is_ready() -> bool {
    BOOTSTRAPPED.load(Ordering::SeqCst)
}

#[allow(dead_code)]
pub fn reset() {
    BOOTSTRAPPED.store(false, Ordering::SeqCst);
    log::debug!("Readiness status reset");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Tests share the process-wide flag.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_initial_state_not_ready() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset();
        assert!(!is_ready());
    }

    #[test]
    fn test_mark_ready() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset();
        mark_ready(StateSource::Local);
        assert!(is_ready());
        mark_ready(StateSource::Etcd);
        assert!(is_ready());
    }
}
