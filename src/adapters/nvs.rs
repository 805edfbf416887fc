//! NVS (Non-Volatile Storage) flash adapter.
//!
//! Implements [`FlashPort`] for the persistence engine.
//!
//! - **ESP-IDF**: one `nvs_handle_t` per open namespace; `nvs_set_blob`
//!   writes are cached by the NVS library until `nvs_commit`.
//! - **Simulation**: an in-memory cache plus a separate durable image, so
//!   tests can observe exactly what a commit made durable and what a power
//!   cycle would lose. Clones share the same simulated partition.

use log::info;

use crate::app::ports::FlashPort;
use crate::error::{Error, Result};

#[cfg(not(target_os = "espidf"))]
use std::collections::HashMap;
#[cfg(not(target_os = "espidf"))]
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[cfg(target_os = "espidf")]
use esp_idf_svc::sys::*;
#[cfg(target_os = "espidf")]
use log::warn;

/// NVS key/namespace limit, excluding the NUL terminator.
pub const MAX_KEY_LEN: usize = 15;

/// NUL-padded key buffer as the NVS C API expects.
fn key_buf(key: &str) -> Result<[u8; MAX_KEY_LEN + 1]> {
    let kb = key.as_bytes();
    if kb.is_empty() || kb.len() > MAX_KEY_LEN || kb.contains(&0) {
        return Err(Error::InvalidArgument);
    }
    let mut buf = [0u8; MAX_KEY_LEN + 1];
    buf[..kb.len()].copy_from_slice(kb);
    Ok(buf)
}

#[cfg(not(target_os = "espidf"))]
#[derive(Default)]
struct SimPartition {
    cache: HashMap<String, Vec<u8>>,
    durable: HashMap<String, Vec<u8>>,
    commits: u32,
}

#[cfg(not(target_os = "espidf"))]
#[derive(Clone, Default)]
pub struct NvsFlash {
    partition: Arc<Mutex<SimPartition>>,
    namespace: Option<String>,
}

#[cfg(target_os = "espidf")]
pub struct NvsFlash {
    handle: Option<nvs_handle_t>,
}

// ── Construction ──────────────────────────────────────────────

impl NvsFlash {
    /// Initialise the default NVS partition.
    ///
    /// On first boot or after a version mismatch the partition is erased
    /// and re-initialised.
    #[cfg(target_os = "espidf")]
    pub fn new() -> Result<Self> {
        // SAFETY: called once from the boot task before any NVS access.
        let ret = unsafe { nvs_flash_init() };
        if ret == ESP_ERR_NVS_NO_FREE_PAGES || ret == ESP_ERR_NVS_NEW_VERSION_FOUND {
            warn!("nvs: erasing and re-initialising flash partition");
            let ret = unsafe { nvs_flash_erase() };
            if ret != ESP_OK {
                return Err(Error::Platform(ret));
            }
            let ret = unsafe { nvs_flash_init() };
            if ret != ESP_OK {
                return Err(Error::Platform(ret));
            }
        } else if ret != ESP_OK {
            return Err(Error::Platform(ret));
        }
        info!("nvs: ESP-IDF NVS initialised");
        Ok(Self { handle: None })
    }

    #[cfg(not(target_os = "espidf"))]
    pub fn new() -> Result<Self> {
        info!("nvs: simulation backend");
        Ok(Self::default())
    }
}

// ── Simulation helpers ────────────────────────────────────────

#[cfg(not(target_os = "espidf"))]
impl NvsFlash {
    fn partition(&self) -> MutexGuard<'_, SimPartition> {
        self.partition.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn composite_key(&self, key: &str) -> Result<String> {
        let ns = self.namespace.as_deref().ok_or(Error::InvalidState)?;
        key_buf(key)?;
        Ok(format!("{ns}::{key}"))
    }

    /// Number of `commit` calls that reached the partition.
    pub fn commit_count(&self) -> u32 {
        self.partition().commits
    }

    /// The committed bytes for `namespace/key`, as they would survive a
    /// reset.
    pub fn durable_value(&self, namespace: &str, key: &str) -> Option<Vec<u8>> {
        self.partition()
            .durable
            .get(&format!("{namespace}::{key}"))
            .cloned()
    }

    /// Simulate a reset: uncommitted writes are lost.
    pub fn power_cycle(&self) {
        let mut p = self.partition();
        p.cache = p.durable.clone();
    }
}

// ── FlashPort ─────────────────────────────────────────────────

#[cfg(not(target_os = "espidf"))]
impl FlashPort for NvsFlash {
    fn open_namespace(&mut self, namespace: &str) -> Result<()> {
        key_buf(namespace)?;
        self.namespace = Some(namespace.to_owned());
        Ok(())
    }

    fn close_namespace(&mut self) {
        self.namespace = None;
    }

    fn get_blob(&self, key: &str, buf: &mut [u8]) -> Result<usize> {
        let composite = self.composite_key(key)?;
        let p = self.partition();
        let data = p.cache.get(&composite).ok_or(Error::NotFound)?;
        if data.len() > buf.len() {
            return Err(Error::Truncated);
        }
        buf[..data.len()].copy_from_slice(data);
        Ok(data.len())
    }

    fn set_blob(&mut self, key: &str, data: &[u8]) -> Result<()> {
        let composite = self.composite_key(key)?;
        self.partition().cache.insert(composite, data.to_vec());
        Ok(())
    }

    fn erase_key(&mut self, key: &str) -> Result<()> {
        let composite = self.composite_key(key)?;
        self.partition()
            .cache
            .remove(&composite)
            .map(|_| ())
            .ok_or(Error::NotFound)
    }

    fn erase_all(&mut self) -> Result<()> {
        let prefix = format!("{}::", self.namespace.as_deref().ok_or(Error::InvalidState)?);
        self.partition().cache.retain(|k, _| !k.starts_with(&prefix));
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let prefix = format!("{}::", self.namespace.as_deref().ok_or(Error::InvalidState)?);
        let mut p = self.partition();
        let SimPartition {
            cache,
            durable,
            commits,
        } = &mut *p;
        durable.retain(|k, _| !k.starts_with(&prefix));
        durable.extend(
            cache
                .iter()
                .filter(|(k, _)| k.starts_with(&prefix))
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        *commits += 1;
        Ok(())
    }
}

#[cfg(target_os = "espidf")]
impl NvsFlash {
    fn handle(&self) -> Result<nvs_handle_t> {
        self.handle.ok_or(Error::InvalidState)
    }
}

#[cfg(target_os = "espidf")]
fn check(ret: esp_err_t) -> Result<()> {
    match ret {
        ESP_OK => Ok(()),
        ESP_ERR_NVS_NOT_FOUND => Err(Error::NotFound),
        ESP_ERR_NVS_INVALID_LENGTH => Err(Error::Truncated),
        ESP_ERR_NVS_KEY_TOO_LONG | ESP_ERR_NVS_INVALID_NAME => Err(Error::InvalidArgument),
        other => Err(Error::Platform(other)),
    }
}

#[cfg(target_os = "espidf")]
impl FlashPort for NvsFlash {
    fn open_namespace(&mut self, namespace: &str) -> Result<()> {
        if self.handle.is_some() {
            return Err(Error::InvalidState);
        }
        let ns = key_buf(namespace)?;
        let mut handle: nvs_handle_t = 0;
        // SAFETY: `ns` is NUL-terminated and outlives the call.
        check(unsafe {
            nvs_open(
                ns.as_ptr().cast(),
                nvs_open_mode_t_NVS_READWRITE,
                &mut handle,
            )
        })?;
        self.handle = Some(handle);
        Ok(())
    }

    fn close_namespace(&mut self) {
        if let Some(h) = self.handle.take() {
            // SAFETY: `h` came from a successful nvs_open and is closed once.
            unsafe { nvs_close(h) };
        }
    }

    fn get_blob(&self, key: &str, buf: &mut [u8]) -> Result<usize> {
        let handle = self.handle()?;
        let k = key_buf(key)?;

        // Size query first so an undersized buffer is never written.
        let mut size: usize = 0;
        // SAFETY: a null out-pointer asks NVS for the stored length only.
        check(unsafe { nvs_get_blob(handle, k.as_ptr().cast(), core::ptr::null_mut(), &mut size) })?;
        if size > buf.len() {
            return Err(Error::Truncated);
        }
        // SAFETY: `buf` has at least `size` writable bytes.
        check(unsafe { nvs_get_blob(handle, k.as_ptr().cast(), buf.as_mut_ptr().cast(), &mut size) })?;
        Ok(size)
    }

    fn set_blob(&mut self, key: &str, data: &[u8]) -> Result<()> {
        let handle = self.handle()?;
        let k = key_buf(key)?;
        // SAFETY: `data` is valid for `data.len()` bytes.
        check(unsafe { nvs_set_blob(handle, k.as_ptr().cast(), data.as_ptr().cast(), data.len()) })
    }

    fn erase_key(&mut self, key: &str) -> Result<()> {
        let handle = self.handle()?;
        let k = key_buf(key)?;
        // SAFETY: `k` is NUL-terminated.
        check(unsafe { nvs_erase_key(handle, k.as_ptr().cast()) })
    }

    fn erase_all(&mut self) -> Result<()> {
        let handle = self.handle()?;
        // SAFETY: valid open handle.
        check(unsafe { nvs_erase_all(handle) })
    }

    fn commit(&mut self) -> Result<()> {
        let handle = self.handle()?;
        // SAFETY: valid open handle.
        check(unsafe { nvs_commit(handle) })
    }
}

#[cfg(target_os = "espidf")]
impl Drop for NvsFlash {
    fn drop(&mut self) {
        self.close_namespace();
    }
}
