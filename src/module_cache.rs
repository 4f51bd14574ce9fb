// On-disk module cache: resolves module names to binary artifacts, compiling
// textual interfaces on demand
//
// Lookup order with an interface: local cache, prebuilt cache, a binary module
// next to the interface, then compile. Without an interface: a binary module
// in the search paths, then the newest valid cached artifact (local before
// prebuilt). The prebuilt cache is never written to.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

use crate::diagnostics::{Diagnostic, DiagnosticBridge, DiagnosticCategory, FrontendOperation};
use crate::error::{ConfigurationError, LangCtxError, ModuleError, Result};
use crate::frontend::{CompileRequest, Frontend};
use crate::logging::{utils as log_utils, HealthLog};
use crate::target::TargetId;

pub const ARTIFACT_MAGIC: &[u8; 8] = b"LCTXMOD\0";
pub const ARTIFACT_VERSION: u16 = 1;
const HEADER_LEN: usize = 8 + 2 + 2;

/// Health log label of cache events
pub const CACHE_EVENT_LABEL: &str = "ModuleCacheManager::resolve";

/// Content fingerprint of a textual interface compiled with a given option line
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// First 16 hex digits of BLAKE3(interface content, option line)
    pub fn compute(interface: &[u8], option_line: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(interface);
        hasher.update(b"\0");
        hasher.update(option_line.as_bytes());
        let hex = hasher.finalize().to_hex();
        Fingerprint(hex.as_str()[..16].to_string())
    }

    pub fn parse(text: &str) -> Option<Self> {
        (text.len() == 16 && text.bytes().all(|b| b.is_ascii_hexdigit()))
            .then(|| Fingerprint(text.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why an artifact failed the structural validity check
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArtifactDefect {
    #[error("artifact does not exist")]
    Missing,
    #[error("artifact is empty")]
    Empty,
    #[error("artifact is unreadable: {0}")]
    Unreadable(String),
    #[error("artifact has a bad magic number")]
    BadMagic,
    #[error("artifact header is truncated")]
    Truncated,
    #[error("unsupported artifact format version {0}")]
    UnsupportedVersion(u16),
    #[error("fingerprint mismatch: expected {expected}, found {found}")]
    FingerprintMismatch { expected: String, found: String },
}

/// `MAGIC | version u16 LE | fingerprint length u16 LE | fingerprint | payload`
pub fn encode_artifact(fingerprint: &Fingerprint, payload: &[u8]) -> Vec<u8> {
    let fp = fingerprint.as_str().as_bytes();
    let mut bytes = Vec::with_capacity(HEADER_LEN + fp.len() + payload.len());
    bytes.extend_from_slice(ARTIFACT_MAGIC);
    bytes.extend_from_slice(&ARTIFACT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&(fp.len() as u16).to_le_bytes());
    bytes.extend_from_slice(fp);
    bytes.extend_from_slice(payload);
    bytes
}

/// Structural validity check; returns the embedded fingerprint
pub fn validate_artifact(
    bytes: &[u8],
    expected: Option<&Fingerprint>,
) -> std::result::Result<Fingerprint, ArtifactDefect> {
    if bytes.is_empty() {
        return Err(ArtifactDefect::Empty);
    }
    if bytes.len() < ARTIFACT_MAGIC.len() || &bytes[..ARTIFACT_MAGIC.len()] != ARTIFACT_MAGIC {
        return Err(ArtifactDefect::BadMagic);
    }
    if bytes.len() < HEADER_LEN {
        return Err(ArtifactDefect::Truncated);
    }
    let version = u16::from_le_bytes([bytes[8], bytes[9]]);
    if version != ARTIFACT_VERSION {
        return Err(ArtifactDefect::UnsupportedVersion(version));
    }
    let fp_len = u16::from_le_bytes([bytes[10], bytes[11]]) as usize;
    let fp_bytes = bytes
        .get(HEADER_LEN..HEADER_LEN + fp_len)
        .ok_or(ArtifactDefect::Truncated)?;
    let found = std::str::from_utf8(fp_bytes)
        .ok()
        .and_then(Fingerprint::parse)
        .ok_or(ArtifactDefect::Truncated)?;

    match expected {
        Some(expected) if *expected != found => Err(ArtifactDefect::FingerprintMismatch {
            expected: expected.to_string(),
            found: found.to_string(),
        }),
        _ => Ok(found),
    }
}

pub fn validate_artifact_file(
    path: &Path,
    expected: Option<&Fingerprint>,
) -> std::result::Result<Fingerprint, ArtifactDefect> {
    match fs::read(path) {
        Ok(bytes) => validate_artifact(&bytes, expected),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(ArtifactDefect::Missing),
        Err(e) => Err(ArtifactDefect::Unreadable(e.to_string())),
    }
}

/// Module names become file names in the search paths and the cache; anything
/// that could leave those directories is rejected
pub fn validate_module_name(module: &str) -> Result<()> {
    let invalid = module.is_empty()
        || module.starts_with('.')
        || module.contains("..")
        || module.contains(['/', '\\', '\0']);
    if invalid {
        return Err(ModuleError::InvalidName {
            module: module.to_string(),
        }
        .into());
    }
    Ok(())
}

/// Where an artifact was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheTier {
    Local,
    Prebuilt,
    SearchPath,
}

/// Local (writable) and prebuilt (read-only) cache directories, in search order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheDirectorySet {
    pub local: PathBuf,
    pub prebuilt: Option<PathBuf>,
}

impl CacheDirectorySet {
    pub fn new(local: impl Into<PathBuf>, prebuilt: Option<PathBuf>) -> Self {
        Self {
            local: local.into(),
            prebuilt,
        }
    }

    pub fn tiers(&self) -> Vec<(CacheTier, &Path)> {
        let mut tiers = vec![(CacheTier::Local, self.local.as_path())];
        if let Some(prebuilt) = &self.prebuilt {
            tiers.push((CacheTier::Prebuilt, prebuilt.as_path()));
        }
        tiers
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub module: String,
    pub fingerprint: Option<Fingerprint>,
}

/// In-memory record of a resolved artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleCacheEntry {
    pub module: String,
    pub fingerprint: Option<Fingerprint>,
    pub path: PathBuf,
    pub tier: CacheTier,
    pub last_validated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheEvent {
    Hit,
    Miss,
    Regenerate,
}

impl CacheEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheEvent::Hit => "hit",
            CacheEvent::Miss => "miss",
            CacheEvent::Regenerate => "regenerate",
        }
    }
}

impl fmt::Display for CacheEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    regenerations: AtomicU64,
    compiles: AtomicU64,
    corruptions: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub regenerations: u64,
    pub compiles: u64,
    pub corruptions: u64,
}

impl CacheMetrics {
    fn record(&self, event: CacheEvent) {
        let counter = match event {
            CacheEvent::Hit => &self.hits,
            CacheEvent::Miss => &self.misses,
            CacheEvent::Regenerate => &self.regenerations,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            regenerations: self.regenerations.load(Ordering::Relaxed),
            compiles: self.compiles.load(Ordering::Relaxed),
            corruptions: self.corruptions.load(Ordering::Relaxed),
        }
    }
}

/// Inputs of one module resolution
#[derive(Debug, Clone)]
pub struct ResolveRequest<'a> {
    pub module: &'a str,
    pub search_paths: &'a [PathBuf],
    /// Rendered option line the module is compiled with
    pub options: &'a [String],
    pub vfs_overlays: &'a [PathBuf],
    pub compiler: &'a Path,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedModule {
    pub module: String,
    pub path: PathBuf,
    pub fingerprint: Option<Fingerprint>,
    pub tier: CacheTier,
    pub event: CacheEvent,
    pub warnings: Vec<Diagnostic>,
}

type LockKey = (TargetId, String, PathBuf);

/// Resolves module names for one target
pub struct ModuleCacheManager {
    target: TargetId,
    dirs: CacheDirectorySet,
    interface_extension: String,
    binary_extension: String,
    frontend: Arc<dyn Frontend>,
    health: Arc<HealthLog>,
    index: DashMap<CacheKey, ModuleCacheEntry>,
    locks: DashMap<LockKey, Arc<Mutex<()>>>,
    metrics: CacheMetrics,
}

impl fmt::Debug for ModuleCacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleCacheManager")
            .field("target", &self.target)
            .field("dirs", &self.dirs)
            .field("entries", &self.index.len())
            .finish()
    }
}

impl ModuleCacheManager {
    /// Create the manager, creating the local cache directory if needed
    pub fn new(
        target: TargetId,
        dirs: CacheDirectorySet,
        interface_extension: impl Into<String>,
        binary_extension: impl Into<String>,
        frontend: Arc<dyn Frontend>,
        health: Arc<HealthLog>,
    ) -> Result<Self> {
        fs::create_dir_all(&dirs.local).map_err(|e| {
            LangCtxError::from(ConfigurationError::CacheDirectoryFailed {
                path: dirs.local.clone(),
                error: e.to_string(),
            })
        })?;

        Ok(Self {
            target,
            dirs,
            interface_extension: interface_extension.into(),
            binary_extension: binary_extension.into(),
            frontend,
            health,
            index: DashMap::new(),
            locks: DashMap::new(),
            metrics: CacheMetrics::default(),
        })
    }

    pub fn directories(&self) -> &CacheDirectorySet {
        &self.dirs
    }

    pub fn metrics(&self) -> CacheMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn entry(&self, module: &str, fingerprint: Option<&Fingerprint>) -> Option<ModuleCacheEntry> {
        let key = CacheKey {
            module: module.to_string(),
            fingerprint: fingerprint.cloned(),
        };
        self.index.get(&key).map(|entry| entry.clone())
    }

    pub fn entries(&self) -> Vec<ModuleCacheEntry> {
        self.index.iter().map(|entry| entry.value().clone()).collect()
    }

    /// `<dir>/<Name>-<fingerprint>.<ext>`
    pub fn artifact_path(&self, dir: &Path, module: &str, fingerprint: &Fingerprint) -> PathBuf {
        dir.join(format!("{module}-{fingerprint}.{}", self.binary_extension))
    }

    /// First `<Name>.<interface-ext>` along the search paths
    pub fn find_interface(&self, module: &str, search_paths: &[PathBuf]) -> Option<PathBuf> {
        let file_name = format!("{module}.{}", self.interface_extension);
        search_paths
            .iter()
            .map(|dir| dir.join(&file_name))
            .find(|path| path.is_file())
    }

    pub fn resolve(&self, request: &ResolveRequest<'_>) -> Result<ResolvedModule> {
        let span = log_utils::module_resolution_span(self.target, request.module);
        let _enter = span.enter();

        validate_module_name(request.module)?;
        self.check_overlays(request)?;

        let resolved = match self.find_interface(request.module, request.search_paths) {
            Some(interface) => self.resolve_from_interface(request, &interface)?,
            None => self.resolve_binary_only(request)?,
        };

        self.record(&resolved);
        Ok(resolved)
    }

    fn check_overlays(&self, request: &ResolveRequest<'_>) -> Result<()> {
        let Some(missing) = request.vfs_overlays.iter().find(|path| !path.is_file()) else {
            return Ok(());
        };
        let text = format!(
            "virtual filesystem overlay file '{}' not found",
            missing.display()
        );
        Err(ModuleError::BuildFailure {
            module: request.module.to_string(),
            interface: None,
            message: format!("could not build module '{}': {text}", request.module),
            diagnostics: vec![Diagnostic::error(
                DiagnosticCategory::ModuleBuildFailure,
                text,
            )],
        }
        .into())
    }

    fn resolve_from_interface(
        &self,
        request: &ResolveRequest<'_>,
        interface: &Path,
    ) -> Result<ResolvedModule> {
        let module = request.module;
        let content = fs::read(interface)?;
        let fingerprint = Fingerprint::compute(&content, &request.options.join(" "));
        let local_path = self.artifact_path(&self.dirs.local, module, &fingerprint);

        let lock = self.module_lock(module);
        let resolved = {
            let _guard = lock.lock();
            self.resolve_locked(request, interface, fingerprint, local_path)
        };
        drop(lock);
        self.release_module_lock(module);
        resolved
    }

    fn resolve_locked(
        &self,
        request: &ResolveRequest<'_>,
        interface: &Path,
        fingerprint: Fingerprint,
        local_path: PathBuf,
    ) -> Result<ResolvedModule> {
        let module = request.module;

        // Checked again under the lock so waiters reuse the winner's artifact
        let mut corrupted = false;
        match validate_artifact_file(&local_path, Some(&fingerprint)) {
            Ok(_) => {
                return Ok(self.found(module, local_path, Some(fingerprint), CacheTier::Local));
            }
            Err(ArtifactDefect::Missing) => {}
            Err(defect) => {
                corrupted = true;
                self.report_corruption(module, &local_path, &defect);
            }
        }

        if !corrupted {
            if let Some(prebuilt) = &self.dirs.prebuilt {
                let path = self.artifact_path(prebuilt, module, &fingerprint);
                if validate_artifact_file(&path, Some(&fingerprint)).is_ok() {
                    return Ok(self.found(module, path, Some(fingerprint), CacheTier::Prebuilt));
                }
            }

            if let Some(dir) = interface.parent() {
                let adjacent = dir.join(format!("{module}.{}", self.binary_extension));
                match validate_artifact_file(&adjacent, Some(&fingerprint)) {
                    Ok(_) => {
                        return Ok(self.found(
                            module,
                            adjacent,
                            Some(fingerprint),
                            CacheTier::SearchPath,
                        ));
                    }
                    Err(ArtifactDefect::Missing) => {}
                    Err(defect) => {
                        debug!(path = %adjacent.display(), %defect, "Ignoring binary module next to interface");
                    }
                }
            }
        }

        self.compile(request, interface, fingerprint, local_path, corrupted)
    }

    fn compile(
        &self,
        request: &ResolveRequest<'_>,
        interface: &Path,
        fingerprint: Fingerprint,
        local_path: PathBuf,
        corrupted: bool,
    ) -> Result<ResolvedModule> {
        let module = request.module;
        let lock_path = self
            .dirs
            .local
            .join(format!("{module}-{fingerprint}.lock"));
        let lock_file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .read(true)
            .open(&lock_path)?;
        fs2::FileExt::lock_exclusive(&lock_file)?;

        let result = self.compile_locked(request, interface, fingerprint, local_path, corrupted);

        if let Err(e) = fs2::FileExt::unlock(&lock_file) {
            debug!(path = %lock_path.display(), error = %e, "Failed to release cache lock");
        }
        result
    }

    fn compile_locked(
        &self,
        request: &ResolveRequest<'_>,
        interface: &Path,
        fingerprint: Fingerprint,
        local_path: PathBuf,
        corrupted: bool,
    ) -> Result<ResolvedModule> {
        let module = request.module;

        // Another debugger process may have produced it while we waited
        if !corrupted && validate_artifact_file(&local_path, Some(&fingerprint)).is_ok() {
            return Ok(self.found(module, local_path, Some(fingerprint), CacheTier::Local));
        }

        let bridge = DiagnosticBridge::new(FrontendOperation::CompileInterface {
            module: module.to_string(),
            interface: Some(interface.to_path_buf()),
        });
        let compile_request = CompileRequest {
            module: module.to_string(),
            interface: interface.to_path_buf(),
            compiler: request.compiler.to_path_buf(),
            options: request.options.to_vec(),
            search_paths: request.search_paths.to_vec(),
            fingerprint: fingerprint.to_string(),
            timeout: request.timeout,
        };
        self.metrics.compiles.fetch_add(1, Ordering::Relaxed);
        let output = self.frontend.compile_interface(&compile_request, &bridge)?;
        let warnings = bridge.finish()?;

        self.persist(&local_path, &encode_artifact(&fingerprint, &output.payload))?;

        Ok(ResolvedModule {
            module: module.to_string(),
            path: local_path,
            fingerprint: Some(fingerprint),
            tier: CacheTier::Local,
            event: if corrupted {
                CacheEvent::Regenerate
            } else {
                CacheEvent::Miss
            },
            warnings,
        })
    }

    /// Write through a temporary file in the same directory, renamed on success
    fn persist(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let dir = path.parent().unwrap_or(&self.dirs.local);
        let mut temp = NamedTempFile::new_in(dir)?;
        temp.write_all(bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| LangCtxError::Io(e.error))?;
        Ok(())
    }

    fn resolve_binary_only(&self, request: &ResolveRequest<'_>) -> Result<ResolvedModule> {
        let module = request.module;
        let file_name = format!("{module}.{}", self.binary_extension);

        for dir in request.search_paths {
            let candidate = dir.join(&file_name);
            match validate_artifact_file(&candidate, None) {
                Ok(fingerprint) => {
                    return Ok(self.found(module, candidate, Some(fingerprint), CacheTier::SearchPath));
                }
                Err(ArtifactDefect::Missing) => {}
                Err(defect) => {
                    debug!(path = %candidate.display(), %defect, "Ignoring invalid binary module");
                }
            }
        }

        for (tier, dir) in self.dirs.tiers() {
            if let Some((path, fingerprint)) = self.newest_valid(dir, module) {
                return Ok(self.found(module, path, Some(fingerprint), tier));
            }
        }

        let mut searched = request.search_paths.to_vec();
        searched.extend(self.dirs.tiers().into_iter().map(|(_, dir)| dir.to_path_buf()));
        Err(ModuleError::NotFound {
            module: module.to_string(),
            searched,
        }
        .into())
    }

    /// Most recently modified valid `<Name>-*.<ext>` in `dir`
    fn newest_valid(&self, dir: &Path, module: &str) -> Option<(PathBuf, Fingerprint)> {
        let pattern = dir.join(format!(
            "{}-*.{}",
            glob::Pattern::escape(module),
            self.binary_extension
        ));
        let paths = glob::glob(&pattern.to_string_lossy()).ok()?;

        paths
            .filter_map(|entry| entry.ok())
            .filter_map(|path| {
                let modified = fs::metadata(&path)
                    .and_then(|meta| meta.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                validate_artifact_file(&path, None)
                    .ok()
                    .map(|fingerprint| (modified, path, fingerprint))
            })
            .max_by_key(|(modified, _, _)| *modified)
            .map(|(_, path, fingerprint)| (path, fingerprint))
    }

    fn found(
        &self,
        module: &str,
        path: PathBuf,
        fingerprint: Option<Fingerprint>,
        tier: CacheTier,
    ) -> ResolvedModule {
        ResolvedModule {
            module: module.to_string(),
            path,
            fingerprint,
            tier,
            event: CacheEvent::Hit,
            warnings: Vec::new(),
        }
    }

    fn report_corruption(&self, module: &str, path: &Path, defect: &ArtifactDefect) {
        self.metrics.corruptions.fetch_add(1, Ordering::Relaxed);
        let error = ModuleError::CacheCorruption {
            module: module.to_string(),
            path: path.to_path_buf(),
            reason: defect.to_string(),
        };
        warn!(target_id = %self.target, "{error}; recompiling");
        self.health.record(CACHE_EVENT_LABEL, error.to_string());
    }

    fn record(&self, resolved: &ResolvedModule) {
        self.metrics.record(resolved.event);
        log_utils::log_cache_event(resolved.event.as_str(), &resolved.module, &resolved.path);
        self.health.record(
            CACHE_EVENT_LABEL,
            format!(
                "module cache {}: {} -> {}",
                resolved.event,
                resolved.module,
                resolved.path.display()
            ),
        );

        let key = CacheKey {
            module: resolved.module.clone(),
            fingerprint: resolved.fingerprint.clone(),
        };
        self.index.insert(
            key,
            ModuleCacheEntry {
                module: resolved.module.clone(),
                fingerprint: resolved.fingerprint.clone(),
                path: resolved.path.clone(),
                tier: resolved.tier,
                last_validated: Utc::now(),
            },
        );
    }

    fn lock_key(&self, module: &str) -> LockKey {
        (self.target, module.to_string(), self.dirs.local.clone())
    }

    fn module_lock(&self, module: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(self.lock_key(module))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry once no resolution holds it
    fn release_module_lock(&self, module: &str) {
        self.locks
            .remove_if(&self.lock_key(module), |_, lock| Arc::strong_count(lock) == 1);
    }
}
