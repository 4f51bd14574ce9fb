// Per-image reflection caches and their invalidation when debug info arrives
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::target::{ImageId, TargetId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DebugInfoState {
    NoDebugInfo,
    HasDebugInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldInfo {
    pub name: String,
    pub type_name: String,
    pub offset: u64,
}

/// Type layout derived from an image's debug information
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeInfo {
    pub name: String,
    pub image: ImageId,
    pub size: Option<u64>,
    pub fields: Vec<FieldInfo>,
    /// Set when the image had no debug information at lookup time
    pub missing_debug_info: bool,
    /// Shard generation the value was computed in
    pub generation: u64,
}

impl TypeInfo {
    pub fn new(name: impl Into<String>, image: ImageId) -> Self {
        Self {
            name: name.into(),
            image,
            size: None,
            fields: Vec::new(),
            missing_debug_info: false,
            generation: 0,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_field(mut self, name: &str, type_name: &str, offset: u64) -> Self {
        self.fields.push(FieldInfo {
            name: name.to_string(),
            type_name: type_name.to_string(),
            offset,
        });
        self
    }

    fn missing(name: &str, image: ImageId, generation: u64) -> Self {
        Self {
            missing_debug_info: true,
            generation,
            ..Self::new(name, image)
        }
    }
}

/// Symbol and type lookup supplied by the host debugger
pub trait TypeInfoProvider: Send + Sync {
    fn type_info(&self, image: ImageId, type_name: &str) -> Option<TypeInfo>;
}

/// Provider for hosts without symbol access; every lookup misses
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTypeInfo;

impl TypeInfoProvider for NoTypeInfo {
    fn type_info(&self, _image: ImageId, _type_name: &str) -> Option<TypeInfo> {
        None
    }
}

/// Cached lookups of one image. Replaced as a whole, never patched.
#[derive(Debug)]
pub struct ReflectionCacheShard {
    image: ImageId,
    state: DebugInfoState,
    generation: u64,
    entries: DashMap<String, Option<Arc<TypeInfo>>>,
}

impl ReflectionCacheShard {
    fn new(image: ImageId, state: DebugInfoState, generation: u64) -> Self {
        Self {
            image,
            state,
            generation,
            entries: DashMap::new(),
        }
    }

    pub fn image(&self) -> ImageId {
        self.image
    }

    pub fn state(&self) -> DebugInfoState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reflection caches of one target, one shard per loaded image
pub struct ReflectionCache {
    provider: Arc<dyn TypeInfoProvider>,
    shards: DashMap<ImageId, Arc<ReflectionCacheShard>>,
    next_generation: AtomicU64,
}

impl fmt::Debug for ReflectionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReflectionCache")
            .field("shards", &self.shards.len())
            .finish()
    }
}

impl ReflectionCache {
    pub fn new(provider: Arc<dyn TypeInfoProvider>) -> Self {
        Self {
            provider,
            shards: DashMap::new(),
            next_generation: AtomicU64::new(1),
        }
    }

    fn bump(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Start tracking an image; an already tracked image is left alone
    pub fn register_image(&self, image: ImageId, state: DebugInfoState) {
        self.shards
            .entry(image)
            .or_insert_with(|| Arc::new(ReflectionCacheShard::new(image, state, self.bump())));
    }

    pub fn shard(&self, image: ImageId) -> Option<Arc<ReflectionCacheShard>> {
        self.shards.get(&image).map(|shard| Arc::clone(shard.value()))
    }

    pub fn state(&self, image: ImageId) -> Option<DebugInfoState> {
        self.shards.get(&image).map(|shard| shard.state)
    }

    /// Look a type up in the image's current shard. Images without debug info
    /// yield a `missing_debug_info` placeholder; `None` means the type is unknown.
    pub fn lookup(&self, image: ImageId, type_name: &str) -> Option<Arc<TypeInfo>> {
        let shard = match self.shard(image) {
            Some(shard) => shard,
            None => {
                self.register_image(image, DebugInfoState::NoDebugInfo);
                self.shard(image)?
            }
        };

        if let Some(cached) = shard.entries.get(type_name) {
            return cached.value().clone();
        }

        let computed = match shard.state {
            DebugInfoState::NoDebugInfo => Some(Arc::new(TypeInfo::missing(
                type_name,
                image,
                shard.generation,
            ))),
            DebugInfoState::HasDebugInfo => {
                self.provider.type_info(image, type_name).map(|mut info| {
                    info.generation = shard.generation;
                    info.missing_debug_info = false;
                    Arc::new(info)
                })
            }
        };

        let info = shard
            .entries
            .entry(type_name.to_string())
            .or_insert(computed)
            .value()
            .clone();
        info
    }

    /// Drop the image's shard and start a fresh one in `state`
    pub fn invalidate(&self, image: ImageId, state: DebugInfoState) -> u64 {
        let generation = self.bump();
        self.shards.insert(
            image,
            Arc::new(ReflectionCacheShard::new(image, state, generation)),
        );
        generation
    }

    pub fn remove_image(&self, image: ImageId) -> bool {
        self.shards.remove(&image).is_some()
    }

    pub fn images(&self) -> Vec<ImageId> {
        let mut images: Vec<ImageId> = self.shards.iter().map(|entry| *entry.key()).collect();
        images.sort();
        images
    }
}

/// Image lifecycle notifications from the debugger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ImageEvent {
    Loaded {
        target: TargetId,
        image: ImageId,
        path: PathBuf,
        has_debug_info: bool,
    },
    DebugInfoAvailable {
        target: TargetId,
        image: ImageId,
    },
    Unloaded {
        target: TargetId,
        image: ImageId,
    },
}

impl ImageEvent {
    pub fn target(&self) -> TargetId {
        match self {
            ImageEvent::Loaded { target, .. }
            | ImageEvent::DebugInfoAvailable { target, .. }
            | ImageEvent::Unloaded { target, .. } => *target,
        }
    }

    pub fn image(&self) -> ImageId {
        match self {
            ImageEvent::Loaded { image, .. }
            | ImageEvent::DebugInfoAvailable { image, .. }
            | ImageEvent::Unloaded { image, .. } => *image,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerOutcome {
    Registered,
    /// The image's shard was replaced; lookups now run in this generation
    Invalidated { generation: u64 },
    Removed,
    Ignored,
}

/// Applies image events to a reflection cache: `NoDebugInfo -> HasDebugInfo`
/// discards the image's shard, nothing ever goes back.
#[derive(Debug)]
pub struct CacheInvalidationTrigger {
    cache: Arc<ReflectionCache>,
}

impl CacheInvalidationTrigger {
    pub fn new(cache: Arc<ReflectionCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<ReflectionCache> {
        &self.cache
    }

    pub fn handle(&self, event: &ImageEvent) -> TriggerOutcome {
        let image = event.image();
        let outcome = match event {
            ImageEvent::Loaded { has_debug_info, .. } => {
                let state = if *has_debug_info {
                    DebugInfoState::HasDebugInfo
                } else {
                    DebugInfoState::NoDebugInfo
                };
                match self.cache.state(image) {
                    None => {
                        self.cache.register_image(image, state);
                        TriggerOutcome::Registered
                    }
                    Some(current) => self.transition(image, current, state),
                }
            }
            ImageEvent::DebugInfoAvailable { .. } => match self.cache.state(image) {
                None => {
                    self.cache.register_image(image, DebugInfoState::HasDebugInfo);
                    TriggerOutcome::Registered
                }
                Some(current) => self.transition(image, current, DebugInfoState::HasDebugInfo),
            },
            ImageEvent::Unloaded { .. } => {
                if self.cache.remove_image(image) {
                    TriggerOutcome::Removed
                } else {
                    TriggerOutcome::Ignored
                }
            }
        };

        debug!(target_id = %event.target(), image = %image, outcome = ?outcome, "Image event handled");
        outcome
    }

    fn transition(
        &self,
        image: ImageId,
        current: DebugInfoState,
        next: DebugInfoState,
    ) -> TriggerOutcome {
        match (current, next) {
            (DebugInfoState::NoDebugInfo, DebugInfoState::HasDebugInfo) => {
                let generation = self.cache.invalidate(image, DebugInfoState::HasDebugInfo);
                info!(image = %image, generation, "Debug info became available; reflection cache reset");
                TriggerOutcome::Invalidated { generation }
            }
            _ => TriggerOutcome::Ignored,
        }
    }
}
