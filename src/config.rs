//! Process-level options consumed by the core.

use serde::{Deserialize, Serialize};

use crate::dex::error::DexError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DexOptions {
    /// Accept (and emit) `dex\n037\0` containers.
    pub support_dex_v37: bool,
    /// Worker count for parallel stages; `None` leaves the choice to rayon.
    pub max_worker_threads: Option<usize>,
    /// Let balloon insert `init-class` before static accesses to other classes.
    pub create_init_class_insns: bool,
    /// Treat the source of a check-cast as escaping.
    pub escape_check_cast: bool,
}

impl DexOptions {
    /// Builds the worker pool used for all-classes and all-methods stages.
    pub fn thread_pool(&self) -> Result<rayon::ThreadPool, DexError> {
        let mut builder = rayon::ThreadPoolBuilder::new().thread_name(|i| format!("dexopt-worker-{}", i));
        if let Some(n) = self.max_worker_threads {
            builder = builder.num_threads(n);
        }
        builder.build().map_err(|e| DexError::new(&format!("unable to start worker pool: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_honours_thread_count() {
        let options = DexOptions { max_worker_threads: Some(2), ..DexOptions::default() };
        let pool = options.thread_pool().unwrap();
        assert_eq!(pool.current_num_threads(), 2);
    }
}
