// Utility functions

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Name of the per-project state directory
pub const STATE_DIR_NAME: &str = ".tdd-parallel";

/// Get the .tdd-parallel directory path for a project.
#[inline]
pub fn state_dir(project_path: &Path) -> PathBuf {
    project_path.join(STATE_DIR_NAME)
}

/// Get the .tdd-parallel/config.toml path for a project.
#[inline]
pub fn config_path(project_path: &Path) -> PathBuf {
    state_dir(project_path).join("config.toml")
}

/// Safely acquire a mutex lock, recovering from poisoning by returning the guard.
/// Every registry in this crate is only mutated through its owning component,
/// so a panic mid-update leaves a registry no worse than the panicking call did.
pub fn lock_mutex_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("Mutex was poisoned, recovering: {}", poisoned);
            poisoned.into_inner()
        }
    }
}

/// Generate a unique, sortable ID with a short type prefix (e.g. `cyc-...`).
pub fn generate_id(prefix: &str) -> String {
    let now = Utc::now().timestamp_millis();
    format!("{}-{}-{}", prefix, now, rand_string(8))
}

/// Generate a random alphanumeric string of specified length.
fn rand_string(len: usize) -> String {
    use rand::Rng;
    use std::iter;
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();

    iter::repeat_with(|| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .take(len)
        .collect()
}

/// Clamp a ratio into [0, 1].
#[inline]
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id() {
        let id1 = generate_id("cyc");
        let id2 = generate_id("cyc");
        assert_ne!(id1, id2);
        assert!(id1.starts_with("cyc-"));
    }

    #[test]
    fn test_state_dir() {
        let dir = state_dir(Path::new("/home/user/project"));
        assert_eq!(dir, PathBuf::from("/home/user/project/.tdd-parallel"));
    }

    #[test]
    fn test_config_path() {
        let path = config_path(Path::new("/home/user/project"));
        assert_eq!(
            path,
            PathBuf::from("/home/user/project/.tdd-parallel/config.toml")
        );
    }

    #[test]
    fn test_lock_mutex_recover_after_poison() {
        let mutex = std::sync::Arc::new(Mutex::new(5));
        let cloned = mutex.clone();
        let _ = std::thread::spawn(move || {
            let _guard = cloned.lock().unwrap();
            panic!("poison");
        })
        .join();

        let guard = lock_mutex_recover(&mutex);
        assert_eq!(*guard, 5);
    }

    #[test]
    fn test_clamp_unit() {
        assert_eq!(clamp_unit(1.5), 1.0);
        assert_eq!(clamp_unit(-0.2), 0.0);
        assert_eq!(clamp_unit(f64::NAN), 0.0);
    }
}
