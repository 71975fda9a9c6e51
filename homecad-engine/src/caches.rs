use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, PoisonError};

use homecad_core::geometry::Bounds2D;
use homecad_core::model::EntityId;
use tracing::debug;

/// 墙体的派生缓存项。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WallCachedData {
    pub length: f64,
    pub opening_count: usize,
}

/// 当前打开文档的派生缓存，进程级单例。
///
/// 生命周期约定：文档打开期间填充，文档关闭时随活动文档引用一并整体
/// 清空，任何缓存都不得活过其来源文档。
#[derive(Debug, Default)]
pub struct DocManager {
    active_document: Option<String>,
    wall_cached_data: HashMap<EntityId, WallCachedData>,
    geometries: HashMap<EntityId, Bounds2D>,
    wall_provider_map: HashMap<EntityId, EntityId>,
    slab_provider_map: HashMap<EntityId, EntityId>,
}

impl DocManager {
    /// 惰性构造的进程级单例。
    pub fn instance() -> &'static Mutex<DocManager> {
        static INSTANCE: OnceLock<Mutex<DocManager>> = OnceLock::new();
        INSTANCE.get_or_init(|| Mutex::new(DocManager::default()))
    }

    pub fn open(&mut self, name: impl Into<String>) {
        self.active_document = Some(name.into());
    }

    #[inline]
    pub fn active_document(&self) -> Option<&str> {
        self.active_document.as_deref()
    }

    pub fn insert_wall_data(&mut self, wall: EntityId, data: WallCachedData) {
        self.wall_cached_data.insert(wall, data);
    }

    #[inline]
    pub fn wall_data(&self, wall: EntityId) -> Option<&WallCachedData> {
        self.wall_cached_data.get(&wall)
    }

    #[inline]
    pub fn wall_data_len(&self) -> usize {
        self.wall_cached_data.len()
    }

    pub fn insert_geometry(&mut self, entity: EntityId, bounds: Bounds2D) {
        self.geometries.insert(entity, bounds);
    }

    #[inline]
    pub fn geometry(&self, entity: EntityId) -> Option<&Bounds2D> {
        self.geometries.get(&entity)
    }

    #[inline]
    pub fn geometries_len(&self) -> usize {
        self.geometries.len()
    }

    pub fn set_wall_provider(&mut self, wall: EntityId, provider: EntityId) {
        self.wall_provider_map.insert(wall, provider);
    }

    #[inline]
    pub fn wall_provider(&self, wall: EntityId) -> Option<EntityId> {
        self.wall_provider_map.get(&wall).copied()
    }

    #[inline]
    pub fn wall_provider_len(&self) -> usize {
        self.wall_provider_map.len()
    }

    pub fn set_slab_provider(&mut self, slab: EntityId, provider: EntityId) {
        self.slab_provider_map.insert(slab, provider);
    }

    #[inline]
    pub fn slab_provider(&self, slab: EntityId) -> Option<EntityId> {
        self.slab_provider_map.get(&slab).copied()
    }

    #[inline]
    pub fn slab_provider_len(&self) -> usize {
        self.slab_provider_map.len()
    }

    /// 文档关闭：丢弃活动文档引用并清空全部缓存。关联管理器在同一次
    /// 调用内一并清空，外界不会观察到半清空状态。
    pub fn clear(&mut self) {
        self.active_document = None;
        self.wall_cached_data.clear();
        self.geometries.clear();
        self.wall_provider_map.clear();
        self.slab_provider_map.clear();
        let mut associations = AssociationManager::instance()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        associations.clear();
        debug!("文档缓存已整体清空");
    }
}

/// 跨实体关联（门窗与宿主墙、楼板与房间等），进程级单例，
/// 随 [`DocManager::clear`] 一并清空。
#[derive(Debug, Default)]
pub struct AssociationManager {
    associations: HashMap<EntityId, Vec<EntityId>>,
}

impl AssociationManager {
    pub fn instance() -> &'static Mutex<AssociationManager> {
        static INSTANCE: OnceLock<Mutex<AssociationManager>> = OnceLock::new();
        INSTANCE.get_or_init(|| Mutex::new(AssociationManager::default()))
    }

    pub fn associate(&mut self, from: EntityId, to: EntityId) {
        let targets = self.associations.entry(from).or_default();
        if !targets.contains(&to) {
            targets.push(to);
        }
    }

    #[inline]
    pub fn associates(&self, from: EntityId) -> &[EntityId] {
        self.associations
            .get(&from)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.associations.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.associations.is_empty()
    }

    pub fn clear(&mut self) {
        self.associations.clear();
    }
}
