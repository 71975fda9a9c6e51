pub mod geometry {
    use glam::DVec2;
    use serde::{Deserialize, Serialize};

    /// 二维点，内部以 `glam::DVec2` 表示，单位为米。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Point2(pub DVec2);

    impl Point2 {
        #[inline]
        pub fn new(x: f64, y: f64) -> Self {
            Self(DVec2::new(x, y))
        }

        #[inline]
        pub fn from_vec(vec: DVec2) -> Self {
            Self(vec)
        }

        #[inline]
        pub fn x(self) -> f64 {
            self.0.x
        }

        #[inline]
        pub fn y(self) -> f64 {
            self.0.y
        }

        #[inline]
        pub fn translate(self, offset: Vector2) -> Self {
            Self(self.0 + offset.0)
        }

        #[inline]
        pub fn vector_to(self, other: Point2) -> Vector2 {
            Vector2(other.0 - self.0)
        }

        /// 两点中点，用于墙体中线等派生量。
        #[inline]
        pub fn midpoint(self, other: Point2) -> Point2 {
            Self((self.0 + other.0) * 0.5)
        }

        #[inline]
        pub fn as_vec2(self) -> DVec2 {
            self.0
        }
    }

    impl From<DVec2> for Point2 {
        fn from(value: DVec2) -> Self {
            Self::from_vec(value)
        }
    }

    /// 二维向量。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Vector2(pub DVec2);

    impl Vector2 {
        #[inline]
        pub fn new(x: f64, y: f64) -> Self {
            Self(DVec2::new(x, y))
        }

        #[inline]
        pub fn from_points(start: Point2, end: Point2) -> Self {
            Self(end.0 - start.0)
        }

        #[inline]
        pub fn length(self) -> f64 {
            self.0.length()
        }

        #[inline]
        pub fn length_squared(self) -> f64 {
            self.0.length_squared()
        }

        #[inline]
        pub fn x(self) -> f64 {
            self.0.x
        }

        #[inline]
        pub fn y(self) -> f64 {
            self.0.y
        }

        #[inline]
        pub fn as_vec2(self) -> DVec2 {
            self.0
        }
    }

    impl From<DVec2> for Vector2 {
        fn from(value: DVec2) -> Self {
            Self(value)
        }
    }

    /// 轴对齐边界框，用于估算模型/实体范围。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Bounds2D {
        min: Point2,
        max: Point2,
    }

    impl Bounds2D {
        #[inline]
        pub fn new(min: Point2, max: Point2) -> Self {
            Self { min, max }
        }

        #[inline]
        pub fn empty() -> Self {
            Self {
                min: Point2::new(f64::INFINITY, f64::INFINITY),
                max: Point2::new(f64::NEG_INFINITY, f64::NEG_INFINITY),
            }
        }

        #[inline]
        pub fn is_empty(&self) -> bool {
            self.min.x() > self.max.x() || self.min.y() > self.max.y()
        }

        #[inline]
        pub fn min(&self) -> Point2 {
            self.min
        }

        #[inline]
        pub fn max(&self) -> Point2 {
            self.max
        }

        pub fn include_point(&mut self, point: Point2) {
            if self.is_empty() {
                self.min = point;
                self.max = point;
                return;
            }
            let min_vec = self.min.as_vec2().min(point.as_vec2());
            let max_vec = self.max.as_vec2().max(point.as_vec2());
            self.min = Point2::from_vec(min_vec);
            self.max = Point2::from_vec(max_vec);
        }

        pub fn include_bounds(&mut self, other: &Bounds2D) {
            if other.is_empty() {
                return;
            }
            self.include_point(other.min);
            self.include_point(other.max);
        }

        #[inline]
        pub fn center(&self) -> Point2 {
            debug_assert!(!self.is_empty());
            let center = (self.min.as_vec2() + self.max.as_vec2()) * 0.5;
            Point2::from_vec(center)
        }
    }

}

pub mod model {
    use std::collections::HashMap;
    use std::fmt;

    use serde::{Deserialize, Serialize};
    use thiserror::Error;

    use crate::geometry::{Bounds2D, Point2};
    use crate::registry::TypeIdRegistry;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    pub struct EntityId(u64);

    impl EntityId {
        #[inline]
        pub fn new(raw: u64) -> Self {
            Self(raw)
        }

        /// 提供原始数值，便于序列化或日志输出。
        #[inline]
        pub fn get(self) -> u64 {
            self.0
        }
    }

    /// 派生状态失效标记的类别，每一类独立置位、独立重建。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum DirtyFlag {
        Geometry,
        ClipGeometry,
        FaceMaterials,
        PartsInfo,
    }

    impl DirtyFlag {
        pub const ALL: [DirtyFlag; 4] = [
            DirtyFlag::Geometry,
            DirtyFlag::ClipGeometry,
            DirtyFlag::FaceMaterials,
            DirtyFlag::PartsInfo,
        ];

        #[inline]
        pub fn label(self) -> &'static str {
            match self {
                DirtyFlag::Geometry => "geometry",
                DirtyFlag::ClipGeometry => "clip_geometry",
                DirtyFlag::FaceMaterials => "face_materials",
                DirtyFlag::PartsInfo => "parts_info",
            }
        }
    }

    impl fmt::Display for DirtyFlag {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.label())
        }
    }

    /// 每个实体的失效标记。新建实体的派生状态尚不存在，因此全部默认为脏。
    /// 标记只会被成功的重建步骤清除，突变步骤只负责置位。
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DirtyFlags {
        geometry: bool,
        clip_geometry: bool,
        face_materials: bool,
        parts_info: bool,
    }

    impl Default for DirtyFlags {
        fn default() -> Self {
            Self {
                geometry: true,
                clip_geometry: true,
                face_materials: true,
                parts_info: true,
            }
        }
    }

    impl DirtyFlags {
        #[inline]
        pub fn is_set(&self, flag: DirtyFlag) -> bool {
            match flag {
                DirtyFlag::Geometry => self.geometry,
                DirtyFlag::ClipGeometry => self.clip_geometry,
                DirtyFlag::FaceMaterials => self.face_materials,
                DirtyFlag::PartsInfo => self.parts_info,
            }
        }

        #[inline]
        pub fn set(&mut self, flag: DirtyFlag) {
            match flag {
                DirtyFlag::Geometry => self.geometry = true,
                DirtyFlag::ClipGeometry => self.clip_geometry = true,
                DirtyFlag::FaceMaterials => self.face_materials = true,
                DirtyFlag::PartsInfo => self.parts_info = true,
            }
        }

        #[inline]
        pub fn clear(&mut self, flag: DirtyFlag) {
            match flag {
                DirtyFlag::Geometry => self.geometry = false,
                DirtyFlag::ClipGeometry => self.clip_geometry = false,
                DirtyFlag::FaceMaterials => self.face_materials = false,
                DirtyFlag::PartsInfo => self.parts_info = false,
            }
        }

        #[inline]
        pub fn any(&self) -> bool {
            self.geometry || self.clip_geometry || self.face_materials || self.parts_info
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum EntityKind {
        Site,
        Storey,
        Room,
        Wall,
        Opening,
        Slab,
        Roof,
        Molding,
    }

    impl EntityKind {
        /// 类型标识前缀，也用于日志输出。
        #[inline]
        pub fn label(self) -> &'static str {
            match self {
                EntityKind::Site => "site",
                EntityKind::Storey => "storey",
                EntityKind::Room => "room",
                EntityKind::Wall => "wall",
                EntityKind::Opening => "opening",
                EntityKind::Slab => "slab",
                EntityKind::Roof => "roof",
                EntityKind::Molding => "molding",
            }
        }

        /// 声明该类型的派生状态是否依赖子实体的某类变化。
        /// 失效传播沿父链上行，遇到返回 false 的类型即停止。
        /// 地块自身没有派生几何，其余类型一律观察子实体（存疑时传播）。
        #[inline]
        pub fn depends_on_children(self, _flag: DirtyFlag) -> bool {
            !matches!(self, EntityKind::Site)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum RoomKind {
        Living,
        Bedroom,
        Kitchen,
        Bathroom,
        Hallway,
        Balcony,
        Other,
    }

    impl RoomKind {
        #[inline]
        pub fn label(self) -> &'static str {
            match self {
                RoomKind::Living => "living",
                RoomKind::Bedroom => "bedroom",
                RoomKind::Kitchen => "kitchen",
                RoomKind::Bathroom => "bathroom",
                RoomKind::Hallway => "hallway",
                RoomKind::Balcony => "balcony",
                RoomKind::Other => "other",
            }
        }

        pub fn from_label(label: &str) -> Option<Self> {
            match label {
                "living" => Some(RoomKind::Living),
                "bedroom" => Some(RoomKind::Bedroom),
                "kitchen" => Some(RoomKind::Kitchen),
                "bathroom" => Some(RoomKind::Bathroom),
                "hallway" => Some(RoomKind::Hallway),
                "balcony" => Some(RoomKind::Balcony),
                "other" => Some(RoomKind::Other),
                _ => None,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum OpeningKind {
        Door,
        Window,
        CornerWindow,
    }

    /// 平开门的开启方向。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum SwingSide {
        Left,
        Right,
    }

    impl SwingSide {
        #[inline]
        pub fn flipped(self) -> Self {
            match self {
                SwingSide::Left => SwingSide::Right,
                SwingSide::Right => SwingSide::Left,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct SiteData {
        pub name: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct StoreyData {
        pub name: String,
        pub elevation: f64,
        pub height: f64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct RoomData {
        pub name: String,
        pub kind: RoomKind,
        pub boundary: Vec<Point2>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct WallData {
        pub start: Point2,
        pub end: Point2,
        pub thickness: f64,
        pub height: f64,
    }

    impl WallData {
        /// 墙体中线长度。
        #[inline]
        pub fn length(&self) -> f64 {
            self.start.vector_to(self.end).length()
        }
    }

    /// 门窗洞口。`offset` 为洞口中心沿宿主墙中线的距离。
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct OpeningData {
        pub kind: OpeningKind,
        pub width: f64,
        pub height: f64,
        pub sill_height: f64,
        pub offset: f64,
        pub swing: SwingSide,
        pub sill_material: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct SlabData {
        pub thickness: f64,
        pub outline: Vec<Point2>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct RoofData {
        pub pitch: f64,
        pub overhang: f64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct MoldingData {
        pub profile: String,
        pub height: f64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum EntityData {
        Site(SiteData),
        Storey(StoreyData),
        Room(RoomData),
        Wall(WallData),
        Opening(OpeningData),
        Slab(SlabData),
        Roof(RoofData),
        Molding(MoldingData),
    }

    impl EntityData {
        #[inline]
        pub fn kind(&self) -> EntityKind {
            match self {
                EntityData::Site(_) => EntityKind::Site,
                EntityData::Storey(_) => EntityKind::Storey,
                EntityData::Room(_) => EntityKind::Room,
                EntityData::Wall(_) => EntityKind::Wall,
                EntityData::Opening(_) => EntityKind::Opening,
                EntityData::Slab(_) => EntityKind::Slab,
                EntityData::Roof(_) => EntityKind::Roof,
                EntityData::Molding(_) => EntityKind::Molding,
            }
        }

        #[inline]
        pub fn as_wall(&self) -> Option<&WallData> {
            match self {
                EntityData::Wall(wall) => Some(wall),
                _ => None,
            }
        }

        #[inline]
        pub fn as_wall_mut(&mut self) -> Option<&mut WallData> {
            match self {
                EntityData::Wall(wall) => Some(wall),
                _ => None,
            }
        }

        #[inline]
        pub fn as_opening(&self) -> Option<&OpeningData> {
            match self {
                EntityData::Opening(opening) => Some(opening),
                _ => None,
            }
        }

        #[inline]
        pub fn as_opening_mut(&mut self) -> Option<&mut OpeningData> {
            match self {
                EntityData::Opening(opening) => Some(opening),
                _ => None,
            }
        }

        #[inline]
        pub fn as_room(&self) -> Option<&RoomData> {
            match self {
                EntityData::Room(room) => Some(room),
                _ => None,
            }
        }

        #[inline]
        pub fn as_room_mut(&mut self) -> Option<&mut RoomData> {
            match self {
                EntityData::Room(room) => Some(room),
                _ => None,
            }
        }

        #[inline]
        pub fn as_slab(&self) -> Option<&SlabData> {
            match self {
                EntityData::Slab(slab) => Some(slab),
                _ => None,
            }
        }

        #[inline]
        pub fn as_slab_mut(&mut self) -> Option<&mut SlabData> {
            match self {
                EntityData::Slab(slab) => Some(slab),
                _ => None,
            }
        }
    }

    /// 建筑模型图中的一个节点。父引用不拥有所有权，子列表拥有所有权且保持顺序。
    #[derive(Debug, Clone)]
    pub struct Entity {
        id: EntityId,
        parent: Option<EntityId>,
        children: Vec<EntityId>,
        data: EntityData,
        dirty: DirtyFlags,
    }

    impl Entity {
        #[inline]
        pub fn id(&self) -> EntityId {
            self.id
        }

        #[inline]
        pub fn kind(&self) -> EntityKind {
            self.data.kind()
        }

        #[inline]
        pub fn parent(&self) -> Option<EntityId> {
            self.parent
        }

        #[inline]
        pub fn children(&self) -> &[EntityId] {
            &self.children
        }

        #[inline]
        pub fn data(&self) -> &EntityData {
            &self.data
        }

        #[inline]
        pub fn dirty(&self) -> &DirtyFlags {
            &self.dirty
        }

        /// 实体在平面上的范围。洞口等依附类实体不提供独立范围。
        pub fn bounds(&self) -> Option<Bounds2D> {
            let mut bounds = Bounds2D::empty();
            match &self.data {
                EntityData::Wall(wall) => {
                    bounds.include_point(wall.start);
                    bounds.include_point(wall.end);
                }
                EntityData::Room(room) => {
                    for point in &room.boundary {
                        bounds.include_point(*point);
                    }
                }
                EntityData::Slab(slab) => {
                    for point in &slab.outline {
                        bounds.include_point(*point);
                    }
                }
                _ => {}
            }
            if bounds.is_empty() { None } else { Some(bounds) }
        }
    }

    #[derive(Debug, Error)]
    pub enum ModelError {
        #[error("entity with id {0} not found")]
        EntityNotFound(u64),
        #[error("entity {0} already has a parent")]
        AlreadyAttached(u64),
        #[error("attaching entity {0} would create a cycle")]
        WouldCycle(u64),
        #[error("entity with id {0} already exists")]
        DuplicateId(u64),
        #[error("entity graph out of sync around entity {0}")]
        GraphOutOfSync(u64),
    }

    /// 重建失败。失效标记保持置位，下次读取会再次触发重建。
    #[derive(Debug, Error)]
    #[error("rebuild of {flag} for entity {id} failed: {reason}")]
    pub struct RebuildError {
        pub id: u64,
        pub flag: DirtyFlag,
        pub reason: String,
    }

    /// 派生状态重建的外部协作者（几何/场景层在本仓库之外）。
    pub trait Rebuilder {
        fn rebuild(&mut self, entity: &Entity, flag: DirtyFlag) -> Result<(), RebuildError>;
    }

    /// 实体图本体：以句柄寻址的实体仓库，并持有类型标识注册表。
    ///
    /// 约定：除结构操作（spawn/attach/detach/remove）外，实体字段只应
    /// 通过请求层调用 [`Model::mutate`] 修改，保证失效标记与突变同步。
    #[derive(Debug, Default)]
    pub struct Model {
        entities: HashMap<EntityId, Entity>,
        roots: Vec<EntityId>,
        next_entity_id: u64,
        registry: TypeIdRegistry,
    }

    impl Model {
        pub fn new() -> Self {
            Self::default()
        }

        /// 创建实体并挂到父实体之下（无父则为根）。自动登记类型标识。
        pub fn spawn(
            &mut self,
            data: EntityData,
            parent: Option<EntityId>,
        ) -> Result<EntityId, ModelError> {
            if let Some(parent_id) = parent {
                if !self.entities.contains_key(&parent_id) {
                    return Err(ModelError::EntityNotFound(parent_id.get()));
                }
            }
            let id = self.next_id();
            let kind = data.kind();
            self.entities.insert(
                id,
                Entity {
                    id,
                    parent,
                    children: Vec::new(),
                    data,
                    dirty: DirtyFlags::default(),
                },
            );
            match parent {
                Some(parent_id) => {
                    if let Some(parent_entity) = self.entities.get_mut(&parent_id) {
                        parent_entity.children.push(id);
                    }
                    // 新子实体让父链的派生状态失效。
                    for flag in DirtyFlag::ALL {
                        self.mark_dirty(parent_id, flag)?;
                    }
                }
                None => self.roots.push(id),
            }
            self.registry.generate_type_id(kind, id);
            Ok(id)
        }

        /// 按持久化记录恢复实体。调用方须保证记录按父先子后的顺序给出，
        /// 且在恢复任何实体之前已恢复注册表计数。
        pub fn restore_entity(
            &mut self,
            id: EntityId,
            data: EntityData,
            parent: Option<EntityId>,
            type_id: Option<&str>,
        ) -> Result<(), ModelError> {
            if self.entities.contains_key(&id) {
                return Err(ModelError::DuplicateId(id.get()));
            }
            if let Some(parent_id) = parent {
                if !self.entities.contains_key(&parent_id) {
                    return Err(ModelError::EntityNotFound(parent_id.get()));
                }
            }
            self.entities.insert(
                id,
                Entity {
                    id,
                    parent,
                    children: Vec::new(),
                    data,
                    dirty: DirtyFlags::default(),
                },
            );
            match parent {
                Some(parent_id) => {
                    if let Some(parent_entity) = self.entities.get_mut(&parent_id) {
                        parent_entity.children.push(id);
                    }
                }
                None => self.roots.push(id),
            }
            self.next_entity_id = self.next_entity_id.max(id.get() + 1);
            if let Some(type_id) = type_id {
                self.registry.bind(type_id, id);
            }
            Ok(())
        }

        #[inline]
        pub fn entity(&self, id: EntityId) -> Option<&Entity> {
            self.entities.get(&id)
        }

        #[inline]
        pub fn contains(&self, id: EntityId) -> bool {
            self.entities.contains_key(&id)
        }

        #[inline]
        pub fn entities(&self) -> impl Iterator<Item = &Entity> {
            self.entities.values()
        }

        #[inline]
        pub fn roots(&self) -> &[EntityId] {
            &self.roots
        }

        #[inline]
        pub fn registry(&self) -> &TypeIdRegistry {
            &self.registry
        }

        /// 恢复持久化的类型计数，必须在产生任何新标识之前调用。
        pub fn restore_registry_counters(&mut self, counters: HashMap<String, u64>) {
            self.registry.restore_counters(counters);
        }

        /// 修改实体载荷并将给定类别标记为脏（含父链传播）。
        pub fn mutate<F>(
            &mut self,
            id: EntityId,
            flags: &[DirtyFlag],
            f: F,
        ) -> Result<(), ModelError>
        where
            F: FnOnce(&mut EntityData),
        {
            let entity = self
                .entities
                .get_mut(&id)
                .ok_or(ModelError::EntityNotFound(id.get()))?;
            f(&mut entity.data);
            for &flag in flags {
                self.mark_dirty(id, flag)?;
            }
            Ok(())
        }

        /// 置位实体的失效标记，并沿父链向上传播到所有观察该类变化的祖先。
        pub fn mark_dirty(&mut self, id: EntityId, flag: DirtyFlag) -> Result<(), ModelError> {
            let entity = self
                .entities
                .get_mut(&id)
                .ok_or(ModelError::EntityNotFound(id.get()))?;
            entity.dirty.set(flag);
            let mut cursor = entity.parent;
            while let Some(parent_id) = cursor {
                let Some(parent) = self.entities.get_mut(&parent_id) else {
                    break;
                };
                if !parent.kind().depends_on_children(flag) {
                    break;
                }
                parent.dirty.set(flag);
                cursor = parent.parent;
            }
            Ok(())
        }

        /// 标记置位时调用重建协作者，成功才清除标记；失败时标记保持置位。
        /// 实体不存在或标记未置位时为无操作，可安全重复调用。
        pub fn rebuild_if_dirty(
            &mut self,
            id: EntityId,
            flag: DirtyFlag,
            builder: &mut dyn Rebuilder,
        ) -> Result<bool, RebuildError> {
            let Some(entity) = self.entities.get_mut(&id) else {
                return Ok(false);
            };
            if !entity.dirty.is_set(flag) {
                return Ok(false);
            }
            builder.rebuild(&*entity, flag)?;
            entity.dirty.clear(flag);
            Ok(true)
        }

        /// 按子先父后的顺序返回某类标记为脏的实体，供自底向上的重建扫描使用。
        pub fn dirty_bottom_up(&self, flag: DirtyFlag) -> Vec<EntityId> {
            let mut dirty: Vec<(usize, EntityId)> = self
                .entities
                .values()
                .filter(|entity| entity.dirty.is_set(flag))
                .map(|entity| (self.depth(entity.id), entity.id))
                .collect();
            dirty.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
            dirty.into_iter().map(|(_, id)| id).collect()
        }

        /// 把游离实体挂到父实体子列表末尾。
        pub fn attach(&mut self, child: EntityId, parent: EntityId) -> Result<(), ModelError> {
            self.attach_at(child, parent, usize::MAX)
        }

        /// 把游离实体插回父实体子列表的指定槽位，用于撤销时精确复原。
        pub fn attach_at(
            &mut self,
            child: EntityId,
            parent: EntityId,
            slot: usize,
        ) -> Result<(), ModelError> {
            let child_entity = self
                .entities
                .get(&child)
                .ok_or(ModelError::EntityNotFound(child.get()))?;
            if child_entity.parent.is_some() {
                return Err(ModelError::AlreadyAttached(child.get()));
            }
            if !self.entities.contains_key(&parent) {
                return Err(ModelError::EntityNotFound(parent.get()));
            }
            if child == parent || self.is_ancestor(child, parent) {
                return Err(ModelError::WouldCycle(child.get()));
            }
            self.roots.retain(|&root| root != child);
            {
                let parent_entity = self
                    .entities
                    .get_mut(&parent)
                    .ok_or(ModelError::EntityNotFound(parent.get()))?;
                let slot = slot.min(parent_entity.children.len());
                parent_entity.children.insert(slot, child);
            }
            if let Some(child_entity) = self.entities.get_mut(&child) {
                child_entity.parent = Some(parent);
            }
            // 重新挂接后子树与新父链的派生状态全部失效。
            for flag in DirtyFlag::ALL {
                self.mark_dirty(child, flag)?;
            }
            Ok(())
        }

        /// 把实体从父实体上摘下并变为根，返回原宿主及其槽位。
        /// 本来就是根时返回 `None`。
        pub fn detach(
            &mut self,
            child: EntityId,
        ) -> Result<Option<(EntityId, usize)>, ModelError> {
            let parent_id = {
                let entity = self
                    .entities
                    .get(&child)
                    .ok_or(ModelError::EntityNotFound(child.get()))?;
                entity.parent
            };
            let Some(parent_id) = parent_id else {
                return Ok(None);
            };
            let slot = {
                let parent = self
                    .entities
                    .get_mut(&parent_id)
                    .ok_or(ModelError::EntityNotFound(parent_id.get()))?;
                let slot = parent
                    .children
                    .iter()
                    .position(|&c| c == child)
                    .ok_or(ModelError::GraphOutOfSync(child.get()))?;
                parent.children.remove(slot);
                slot
            };
            if let Some(entity) = self.entities.get_mut(&child) {
                entity.parent = None;
            }
            self.roots.push(child);
            // 摘除影响双方：原父链失去内容，子树位置信息作废。
            for flag in DirtyFlag::ALL {
                self.mark_dirty(parent_id, flag)?;
                self.mark_dirty(child, flag)?;
            }
            Ok(Some((parent_id, slot)))
        }

        /// 销毁实体及其整棵子树，释放对应的类型标识映射，返回销毁数量。
        pub fn remove(&mut self, id: EntityId) -> Result<usize, ModelError> {
            if !self.entities.contains_key(&id) {
                return Err(ModelError::EntityNotFound(id.get()));
            }
            self.detach(id)?;
            self.roots.retain(|&root| root != id);
            let mut removed = 0;
            let mut stack = vec![id];
            while let Some(current) = stack.pop() {
                if let Some(entity) = self.entities.remove(&current) {
                    stack.extend(entity.children.iter().copied());
                    self.registry.release(current);
                    removed += 1;
                }
            }
            Ok(removed)
        }

        /// `ancestor` 是否为 `id` 的严格祖先。
        pub fn is_ancestor(&self, ancestor: EntityId, id: EntityId) -> bool {
            let mut cursor = self.entities.get(&id).and_then(|entity| entity.parent);
            while let Some(current) = cursor {
                if current == ancestor {
                    return true;
                }
                cursor = self.entities.get(&current).and_then(|entity| entity.parent);
            }
            false
        }

        /// 两实体是否处于同一条祖先链上（相等、祖先或后代）。
        #[inline]
        pub fn related(&self, a: EntityId, b: EntityId) -> bool {
            a == b || self.is_ancestor(a, b) || self.is_ancestor(b, a)
        }

        fn depth(&self, id: EntityId) -> usize {
            let mut depth = 0;
            let mut cursor = self.entities.get(&id).and_then(|entity| entity.parent);
            while let Some(current) = cursor {
                depth += 1;
                cursor = self.entities.get(&current).and_then(|entity| entity.parent);
            }
            depth
        }

        pub fn bounds(&self) -> Option<Bounds2D> {
            let mut bounds = Bounds2D::empty();
            let mut has = false;
            for entity in self.entities.values() {
                if let Some(entity_bounds) = entity.bounds() {
                    bounds.include_bounds(&entity_bounds);
                    has = true;
                }
            }
            if has { Some(bounds) } else { None }
        }

        #[inline]
        fn next_id(&mut self) -> EntityId {
            let id = self.next_entity_id;
            self.next_entity_id += 1;
            EntityId::new(id)
        }
    }

}

pub mod registry {
    use std::collections::HashMap;

    use crate::model::{EntityId, EntityKind};

    /// 发放与实体内存身份解耦的稳定类型标识（`"wall/3"` 形式）。
    /// 每类计数单调递增，从 1 起，不回收；双向映射始终保持一一对应。
    #[derive(Debug, Default, Clone)]
    pub struct TypeIdRegistry {
        counters: HashMap<String, u64>,
        type_to_entity: HashMap<String, EntityId>,
        entity_to_type: HashMap<EntityId, String>,
    }

    impl TypeIdRegistry {
        pub fn new() -> Self {
            Self::default()
        }

        /// 为实体发放类型标识。已登记的实体返回既有标识，保证一一对应。
        pub fn generate_type_id(&mut self, kind: EntityKind, entity: EntityId) -> String {
            if let Some(existing) = self.entity_to_type.get(&entity) {
                return existing.clone();
            }
            let counter = self.counters.entry(kind.label().to_string()).or_insert(0);
            *counter += 1;
            let type_id = format!("{}/{}", kind.label(), counter);
            self.type_to_entity.insert(type_id.clone(), entity);
            self.entity_to_type.insert(entity, type_id.clone());
            type_id
        }

        /// 恢复路径：按原样写回一条映射，不触碰计数。
        /// 调用方须先通过 [`TypeIdRegistry::restore_counters`] 恢复计数。
        pub fn bind(&mut self, type_id: &str, entity: EntityId) {
            self.type_to_entity.insert(type_id.to_string(), entity);
            self.entity_to_type.insert(entity, type_id.to_string());
        }

        #[inline]
        pub fn get_entity_id(&self, type_id: &str) -> Option<EntityId> {
            self.type_to_entity.get(type_id).copied()
        }

        #[inline]
        pub fn get_type_id(&self, entity: EntityId) -> Option<&str> {
            self.entity_to_type.get(&entity).map(|id| id.as_str())
        }

        /// 当前各类型计数的副本，用于持久化；修改副本不影响注册表。
        pub fn snapshot(&self) -> HashMap<String, u64> {
            self.counters.clone()
        }

        pub fn restore_counters(&mut self, counters: HashMap<String, u64>) {
            self.counters = counters;
        }

        /// 实体销毁时释放映射，计数保持单调。
        pub fn release(&mut self, entity: EntityId) {
            if let Some(type_id) = self.entity_to_type.remove(&entity) {
                self.type_to_entity.remove(&type_id);
            }
        }

        /// 文档关闭/新建时整体清空三张表。
        pub fn reset(&mut self) {
            self.counters.clear();
            self.type_to_entity.clear();
            self.entity_to_type.clear();
        }
    }

}
