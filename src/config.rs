//! Public open options, plus a couple of tuning knobs (cache size, sync
//! mode, lock mode, busy handler, env override).

use std::sync::Arc;

use crate::env::{BusyHandler, Env, ExponentialBackoff, PosixEnv};

pub const MIN_PAGE_SIZE: u32 = 512;
pub const MAX_PAGE_SIZE: u32 = 65_536;
pub const DEFAULT_PAGE_SIZE: u32 = 4_096;
pub const DEFAULT_CACHE_SIZE: usize = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Off,
    Normal,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Normal,
    Exclusive,
}

/// Options accepted by [`crate::db::Db::open`].
pub struct DbOptions {
    pub create_if_missing: bool,
    pub error_if_exists: bool,
    pub page_size: u32,
    pub cache_size: usize,
    pub sync_mode: SyncMode,
    pub lock_mode: LockMode,
    pub temp_database: bool,
    pub busy_handler: Option<Box<dyn Fn() -> Box<dyn BusyHandler>>>,
    pub env: Option<Arc<dyn Env>>,
}

impl Default for DbOptions {
    fn default() -> Self {
        DbOptions {
            create_if_missing: true,
            error_if_exists: false,
            page_size: DEFAULT_PAGE_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
            sync_mode: SyncMode::Normal,
            lock_mode: LockMode::Normal,
            temp_database: false,
            busy_handler: None,
            env: None,
        }
    }
}

impl Clone for DbOptions {
    fn clone(&self) -> Self {
        DbOptions {
            create_if_missing: self.create_if_missing,
            error_if_exists: self.error_if_exists,
            page_size: self.page_size,
            cache_size: self.cache_size,
            sync_mode: self.sync_mode,
            lock_mode: self.lock_mode,
            temp_database: self.temp_database,
            busy_handler: None,
            env: self.env.clone(),
        }
    }
}

impl std::fmt::Debug for DbOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbOptions")
            .field("create_if_missing", &self.create_if_missing)
            .field("error_if_exists", &self.error_if_exists)
            .field("page_size", &self.page_size)
            .field("cache_size", &self.cache_size)
            .field("sync_mode", &self.sync_mode)
            .field("lock_mode", &self.lock_mode)
            .field("temp_database", &self.temp_database)
            .finish()
    }
}

impl DbOptions {
    pub(crate) fn env(&self) -> Arc<dyn Env> {
        self.env.clone().unwrap_or_else(|| Arc::new(PosixEnv::new()))
    }

    pub(crate) fn new_busy_handler(&self, env: Arc<dyn Env>) -> Box<dyn BusyHandler> {
        match &self.busy_handler {
            Some(make) => make(),
            None => Box::new(ExponentialBackoff {
                max_attempts: 100,
                env,
            }),
        }
    }
}
