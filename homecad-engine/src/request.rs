use std::collections::HashMap;

use homecad_core::model::{DirtyFlag, EntityId, Model, RoomKind, SwingSide};

use crate::errors::EngineError;
use crate::transaction::{
    DataRequest, Request, RequestCategory, StateChange, StateRequest,
};

/// 请求类型标签：封闭的枚举键，取代字符串分发；
/// 外部插件仍可通过 [`RequestRegistry::register`] 挂入新工厂。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    SetWallThickness,
    SetSlabThickness,
    FlipOpeningSwing,
    SetRoomKind,
    SetSillMaterial,
    DetachOpening,
}

impl RequestKind {
    #[inline]
    pub fn label(self) -> &'static str {
        match self {
            RequestKind::SetWallThickness => "set_wall_thickness",
            RequestKind::SetSlabThickness => "set_slab_thickness",
            RequestKind::FlipOpeningSwing => "flip_opening_swing",
            RequestKind::SetRoomKind => "set_room_kind",
            RequestKind::SetSillMaterial => "set_sill_material",
            RequestKind::DetachOpening => "detach_opening",
        }
    }
}

/// 界面命令层传入的参数。
#[derive(Debug, Clone)]
pub enum RequestArg {
    Id(EntityId),
    Number(f64),
    Text(String),
}

impl RequestArg {
    #[inline]
    pub fn as_id(&self) -> Option<EntityId> {
        match self {
            RequestArg::Id(id) => Some(*id),
            _ => None,
        }
    }

    #[inline]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            RequestArg::Number(value) => Some(*value),
            _ => None,
        }
    }

    #[inline]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            RequestArg::Text(text) => Some(text),
            _ => None,
        }
    }
}

fn id_arg(args: &[RequestArg], index: usize) -> Result<EntityId, EngineError> {
    args.get(index).and_then(RequestArg::as_id).ok_or_else(|| {
        EngineError::BadRequestArgs(format!("argument {index} must be an entity id"))
    })
}

fn number_arg(args: &[RequestArg], index: usize) -> Result<f64, EngineError> {
    args.get(index).and_then(RequestArg::as_number).ok_or_else(|| {
        EngineError::BadRequestArgs(format!("argument {index} must be a number"))
    })
}

fn text_arg<'a>(args: &'a [RequestArg], index: usize) -> Result<&'a str, EngineError> {
    args.get(index).and_then(RequestArg::as_text).ok_or_else(|| {
        EngineError::BadRequestArgs(format!("argument {index} must be text"))
    })
}

/// 按请求类型构造具体请求。构造阶段不触碰任何实体状态。
pub trait RequestFactory {
    fn kind(&self) -> RequestKind;

    fn build(
        &self,
        model: &Model,
        args: &[RequestArg],
    ) -> Result<Box<dyn Request>, EngineError>;
}

/// 请求工厂注册表。内建工厂在构造时登记，插件通过 `register` 追加。
pub struct RequestRegistry {
    factories: HashMap<RequestKind, Box<dyn RequestFactory>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(SetWallThicknessFactory);
        registry.register(SetSlabThicknessFactory);
        registry.register(FlipOpeningSwingFactory);
        registry.register(SetRoomKindFactory);
        registry.register(SetSillMaterialFactory);
        registry.register(DetachOpeningFactory);
        registry
    }

    pub fn register<F: RequestFactory + 'static>(&mut self, factory: F) {
        self.factories.insert(factory.kind(), Box::new(factory));
    }

    pub fn create(
        &self,
        model: &Model,
        kind: RequestKind,
        args: &[RequestArg],
    ) -> Result<Box<dyn Request>, EngineError> {
        let factory = self
            .factories
            .get(&kind)
            .ok_or(EngineError::UnknownRequestKind(kind.label()))?;
        factory.build(model, args)
    }

    pub fn available_kinds(&self) -> impl Iterator<Item = RequestKind> + '_ {
        self.factories.keys().copied()
    }
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_wall_thickness(
    model: &mut Model,
    id: EntityId,
    value: &f64,
) -> Result<(), EngineError> {
    model.mutate(
        id,
        &[DirtyFlag::Geometry, DirtyFlag::ClipGeometry, DirtyFlag::PartsInfo],
        |data| {
            if let Some(wall) = data.as_wall_mut() {
                wall.thickness = *value;
            }
        },
    )?;
    Ok(())
}

fn apply_slab_thickness(
    model: &mut Model,
    id: EntityId,
    value: &f64,
) -> Result<(), EngineError> {
    model.mutate(id, &[DirtyFlag::Geometry, DirtyFlag::ClipGeometry], |data| {
        if let Some(slab) = data.as_slab_mut() {
            slab.thickness = *value;
        }
    })?;
    Ok(())
}

fn apply_opening_swing(
    model: &mut Model,
    id: EntityId,
    value: &SwingSide,
) -> Result<(), EngineError> {
    model.mutate(id, &[DirtyFlag::Geometry, DirtyFlag::PartsInfo], |data| {
        if let Some(opening) = data.as_opening_mut() {
            opening.swing = *value;
        }
    })?;
    Ok(())
}

fn apply_room_kind(model: &mut Model, id: EntityId, value: &RoomKind) -> Result<(), EngineError> {
    model.mutate(id, &[DirtyFlag::FaceMaterials, DirtyFlag::PartsInfo], |data| {
        if let Some(room) = data.as_room_mut() {
            room.kind = *value;
        }
    })?;
    Ok(())
}

fn apply_sill_material(
    model: &mut Model,
    id: EntityId,
    value: &String,
) -> Result<(), EngineError> {
    model.mutate(id, &[DirtyFlag::FaceMaterials], |data| {
        if let Some(opening) = data.as_opening_mut() {
            opening.sill_material = value.clone();
        }
    })?;
    Ok(())
}

struct SetWallThicknessFactory;

impl RequestFactory for SetWallThicknessFactory {
    fn kind(&self) -> RequestKind {
        RequestKind::SetWallThickness
    }

    fn build(
        &self,
        model: &Model,
        args: &[RequestArg],
    ) -> Result<Box<dyn Request>, EngineError> {
        let target = id_arg(args, 0)?;
        let after = number_arg(args, 1)?;
        let entity = model
            .entity(target)
            .ok_or(EngineError::EntityNotFound(target.get()))?;
        let wall = entity
            .data()
            .as_wall()
            .ok_or_else(|| EngineError::BadRequestArgs("target is not a wall".to_string()))?;
        Ok(Box::new(DataRequest::new(
            target,
            wall.thickness,
            after,
            apply_wall_thickness,
            format!("设置墙体厚度为 {after:.3}"),
            RequestCategory::Field,
        )))
    }
}

struct SetSlabThicknessFactory;

impl RequestFactory for SetSlabThicknessFactory {
    fn kind(&self) -> RequestKind {
        RequestKind::SetSlabThickness
    }

    fn build(
        &self,
        model: &Model,
        args: &[RequestArg],
    ) -> Result<Box<dyn Request>, EngineError> {
        let target = id_arg(args, 0)?;
        let after = number_arg(args, 1)?;
        let entity = model
            .entity(target)
            .ok_or(EngineError::EntityNotFound(target.get()))?;
        let slab = entity
            .data()
            .as_slab()
            .ok_or_else(|| EngineError::BadRequestArgs("target is not a slab".to_string()))?;
        Ok(Box::new(DataRequest::new(
            target,
            slab.thickness,
            after,
            apply_slab_thickness,
            format!("设置楼板厚度为 {after:.3}"),
            RequestCategory::Field,
        )))
    }
}

struct FlipOpeningSwingFactory;

impl RequestFactory for FlipOpeningSwingFactory {
    fn kind(&self) -> RequestKind {
        RequestKind::FlipOpeningSwing
    }

    fn build(
        &self,
        model: &Model,
        args: &[RequestArg],
    ) -> Result<Box<dyn Request>, EngineError> {
        let target = id_arg(args, 0)?;
        let entity = model
            .entity(target)
            .ok_or(EngineError::EntityNotFound(target.get()))?;
        let opening = entity
            .data()
            .as_opening()
            .ok_or_else(|| EngineError::BadRequestArgs("target is not an opening".to_string()))?;
        let before = opening.swing;
        Ok(Box::new(DataRequest::new(
            target,
            before,
            before.flipped(),
            apply_opening_swing,
            "翻转门扇开启方向".to_string(),
            RequestCategory::Field,
        )))
    }
}

struct SetRoomKindFactory;

impl RequestFactory for SetRoomKindFactory {
    fn kind(&self) -> RequestKind {
        RequestKind::SetRoomKind
    }

    fn build(
        &self,
        model: &Model,
        args: &[RequestArg],
    ) -> Result<Box<dyn Request>, EngineError> {
        let target = id_arg(args, 0)?;
        let label = text_arg(args, 1)?;
        let after = RoomKind::from_label(label).ok_or_else(|| {
            EngineError::BadRequestArgs(format!("unknown room kind `{label}`"))
        })?;
        let entity = model
            .entity(target)
            .ok_or(EngineError::EntityNotFound(target.get()))?;
        let room = entity
            .data()
            .as_room()
            .ok_or_else(|| EngineError::BadRequestArgs("target is not a room".to_string()))?;
        Ok(Box::new(DataRequest::new(
            target,
            room.kind,
            after,
            apply_room_kind,
            format!("修改房间类型为 {}", after.label()),
            RequestCategory::Field,
        )))
    }
}

struct SetSillMaterialFactory;

impl RequestFactory for SetSillMaterialFactory {
    fn kind(&self) -> RequestKind {
        RequestKind::SetSillMaterial
    }

    fn build(
        &self,
        model: &Model,
        args: &[RequestArg],
    ) -> Result<Box<dyn Request>, EngineError> {
        let target = id_arg(args, 0)?;
        let after = text_arg(args, 1)?.to_string();
        let entity = model
            .entity(target)
            .ok_or(EngineError::EntityNotFound(target.get()))?;
        let opening = entity
            .data()
            .as_opening()
            .ok_or_else(|| EngineError::BadRequestArgs("target is not an opening".to_string()))?;
        Ok(Box::new(DataRequest::new(
            target,
            opening.sill_material.clone(),
            after.clone(),
            apply_sill_material,
            format!("设置窗台板材质为 {after}"),
            RequestCategory::Field,
        )))
    }
}

/// 把门窗从宿主墙上摘下。确切的原宿主与槽位只有提交时检视当前
/// 状态才能得到，因此在 `perform` 中随突变一并记录。
pub struct DetachOpening {
    opening: EntityId,
}

impl DetachOpening {
    pub fn new(opening: EntityId) -> Self {
        Self { opening }
    }
}

/// 摘除时记录的规格：原宿主与其子列表槽位。
pub struct DetachSpec {
    host: EntityId,
    slot: usize,
}

impl StateChange for DetachOpening {
    type Spec = DetachSpec;

    fn perform(&mut self, model: &mut Model) -> Result<DetachSpec, EngineError> {
        match model.detach(self.opening)? {
            Some((host, slot)) => Ok(DetachSpec { host, slot }),
            None => Err(EngineError::BadRequestArgs(format!(
                "entity {} has no host to detach from",
                self.opening.get()
            ))),
        }
    }

    fn revert(&mut self, model: &mut Model, spec: &DetachSpec) -> Result<(), EngineError> {
        model.attach_at(self.opening, spec.host, spec.slot)?;
        Ok(())
    }

    fn reapply(&mut self, model: &mut Model, spec: &DetachSpec) -> Result<(), EngineError> {
        let detached = model.detach(self.opening)?;
        if detached.is_none() {
            return Err(EngineError::BadRequestArgs(format!(
                "entity {} is already detached from {}",
                self.opening.get(),
                spec.host.get()
            )));
        }
        Ok(())
    }
}

struct DetachOpeningFactory;

impl RequestFactory for DetachOpeningFactory {
    fn kind(&self) -> RequestKind {
        RequestKind::DetachOpening
    }

    fn build(
        &self,
        model: &Model,
        args: &[RequestArg],
    ) -> Result<Box<dyn Request>, EngineError> {
        let target = id_arg(args, 0)?;
        let entity = model
            .entity(target)
            .ok_or(EngineError::EntityNotFound(target.get()))?;
        if entity.data().as_opening().is_none() {
            return Err(EngineError::BadRequestArgs(
                "target is not an opening".to_string(),
            ));
        }
        Ok(Box::new(StateRequest::new(
            target,
            DetachOpening::new(target),
            "拆除门窗".to_string(),
            RequestCategory::Structure,
        )))
    }
}

#[cfg(test)]
mod tests {
    use homecad_core::geometry::Point2;
    use homecad_core::model::{
        DirtyFlag, EntityData, OpeningData, OpeningKind, RoomData, SiteData, SlabData, StoreyData,
        WallData,
    };

    use super::*;
    use crate::transaction::TransactionManager;

    struct Fixture {
        model: Model,
        room: EntityId,
        wall: EntityId,
        door: EntityId,
        window: EntityId,
        slab: EntityId,
    }

    fn fixture() -> Fixture {
        let mut model = Model::new();
        let site = model
            .spawn(
                EntityData::Site(SiteData {
                    name: "地块".to_string(),
                }),
                None,
            )
            .expect("spawn site");
        let storey = model
            .spawn(
                EntityData::Storey(StoreyData {
                    name: "一层".to_string(),
                    elevation: 0.0,
                    height: 2.8,
                }),
                Some(site),
            )
            .expect("spawn storey");
        let room = model
            .spawn(
                EntityData::Room(RoomData {
                    name: "起居室".to_string(),
                    kind: RoomKind::Living,
                    boundary: vec![
                        Point2::new(0.0, 0.0),
                        Point2::new(6.0, 0.0),
                        Point2::new(6.0, 4.0),
                        Point2::new(0.0, 4.0),
                    ],
                }),
                Some(storey),
            )
            .expect("spawn room");
        let wall = model
            .spawn(
                EntityData::Wall(WallData {
                    start: Point2::new(0.0, 0.0),
                    end: Point2::new(6.0, 0.0),
                    thickness: 0.24,
                    height: 2.8,
                }),
                Some(room),
            )
            .expect("spawn wall");
        let door = model
            .spawn(
                EntityData::Opening(OpeningData {
                    kind: OpeningKind::Door,
                    width: 0.9,
                    height: 2.1,
                    sill_height: 0.0,
                    offset: 1.2,
                    swing: SwingSide::Left,
                    sill_material: String::new(),
                }),
                Some(wall),
            )
            .expect("spawn door");
        let window = model
            .spawn(
                EntityData::Opening(OpeningData {
                    kind: OpeningKind::Window,
                    width: 1.5,
                    height: 1.4,
                    sill_height: 0.9,
                    offset: 3.6,
                    swing: SwingSide::Left,
                    sill_material: "松木".to_string(),
                }),
                Some(wall),
            )
            .expect("spawn window");
        let slab = model
            .spawn(
                EntityData::Slab(SlabData {
                    thickness: 0.12,
                    outline: vec![
                        Point2::new(0.0, 0.0),
                        Point2::new(6.0, 0.0),
                        Point2::new(6.0, 4.0),
                        Point2::new(0.0, 4.0),
                    ],
                }),
                Some(storey),
            )
            .expect("spawn slab");
        Fixture {
            model,
            room,
            wall,
            door,
            window,
            slab,
        }
    }

    #[test]
    fn field_requests_round_trip_through_the_manager() {
        let mut fixture = fixture();
        let registry = RequestRegistry::new();
        let mut manager = TransactionManager::new();

        let request = registry
            .create(
                &fixture.model,
                RequestKind::SetWallThickness,
                &[RequestArg::Id(fixture.wall), RequestArg::Number(0.3)],
            )
            .expect("build request");
        assert!(request.can_transact_field());
        manager.commit(&mut fixture.model, request).expect("commit");

        let thickness = |model: &Model| {
            model
                .entity(fixture.wall)
                .and_then(|entity| entity.data().as_wall())
                .map(|wall| wall.thickness)
                .expect("wall data")
        };
        assert!((thickness(&fixture.model) - 0.3).abs() < f64::EPSILON);

        manager.undo(&mut fixture.model).expect("undo");
        assert!((thickness(&fixture.model) - 0.24).abs() < f64::EPSILON);
        manager.redo(&mut fixture.model).expect("redo");
        assert!((thickness(&fixture.model) - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn slab_thickness_marks_the_declared_flags() {
        let mut fixture = fixture();
        let registry = RequestRegistry::new();
        let mut manager = TransactionManager::new();

        let request = registry
            .create(
                &fixture.model,
                RequestKind::SetSlabThickness,
                &[RequestArg::Id(fixture.slab), RequestArg::Number(0.15)],
            )
            .expect("build request");
        manager.commit(&mut fixture.model, request).expect("commit");

        let entity = fixture.model.entity(fixture.slab).expect("slab exists");
        let slab = entity.data().as_slab().expect("slab data");
        assert!((slab.thickness - 0.15).abs() < f64::EPSILON);
        assert!(entity.dirty().is_set(DirtyFlag::Geometry));
        assert!(entity.dirty().is_set(DirtyFlag::ClipGeometry));

        manager.undo(&mut fixture.model).expect("undo");
        let slab = fixture
            .model
            .entity(fixture.slab)
            .and_then(|entity| entity.data().as_slab())
            .expect("slab data");
        assert!((slab.thickness - 0.12).abs() < f64::EPSILON);
    }

    #[test]
    fn flip_swing_builds_its_own_after_value() {
        let mut fixture = fixture();
        let registry = RequestRegistry::new();
        let mut manager = TransactionManager::new();

        let request = registry
            .create(
                &fixture.model,
                RequestKind::FlipOpeningSwing,
                &[RequestArg::Id(fixture.door)],
            )
            .expect("build request");
        manager.commit(&mut fixture.model, request).expect("commit");

        let swing = |model: &Model| {
            model
                .entity(fixture.door)
                .and_then(|entity| entity.data().as_opening())
                .map(|opening| opening.swing)
                .expect("door data")
        };
        assert_eq!(swing(&fixture.model), SwingSide::Right);
        manager.undo(&mut fixture.model).expect("undo");
        assert_eq!(swing(&fixture.model), SwingSide::Left);
    }

    #[test]
    fn room_kind_parses_label_and_rejects_unknown() {
        let mut fixture = fixture();
        let registry = RequestRegistry::new();
        let mut manager = TransactionManager::new();

        let err = registry
            .create(
                &fixture.model,
                RequestKind::SetRoomKind,
                &[
                    RequestArg::Id(fixture.room),
                    RequestArg::Text("ballroom".to_string()),
                ],
            )
            .expect_err("unknown label");
        assert!(matches!(err, EngineError::BadRequestArgs(_)));

        let request = registry
            .create(
                &fixture.model,
                RequestKind::SetRoomKind,
                &[
                    RequestArg::Id(fixture.room),
                    RequestArg::Text("bedroom".to_string()),
                ],
            )
            .expect("build request");
        manager.commit(&mut fixture.model, request).expect("commit");
        let kind = fixture
            .model
            .entity(fixture.room)
            .and_then(|entity| entity.data().as_room())
            .map(|room| room.kind)
            .expect("room data");
        assert_eq!(kind, RoomKind::Bedroom);
    }

    #[test]
    fn detach_opening_restores_host_and_slot_on_undo() {
        let mut fixture = fixture();
        let registry = RequestRegistry::new();
        let mut manager = TransactionManager::new();

        let request = registry
            .create(
                &fixture.model,
                RequestKind::DetachOpening,
                &[RequestArg::Id(fixture.door)],
            )
            .expect("build request");
        manager.commit(&mut fixture.model, request).expect("commit");

        assert!(fixture.model.entity(fixture.door).unwrap().parent().is_none());
        assert_eq!(
            fixture.model.entity(fixture.wall).unwrap().children(),
            &[fixture.window]
        );

        manager.undo(&mut fixture.model).expect("undo");
        assert_eq!(
            fixture.model.entity(fixture.door).unwrap().parent(),
            Some(fixture.wall)
        );
        // 原始槽位被精确复原：门仍在窗之前。
        assert_eq!(
            fixture.model.entity(fixture.wall).unwrap().children(),
            &[fixture.door, fixture.window]
        );

        manager.redo(&mut fixture.model).expect("redo");
        assert!(fixture.model.entity(fixture.door).unwrap().parent().is_none());

        manager.undo(&mut fixture.model).expect("undo again");
        assert_eq!(
            fixture.model.entity(fixture.wall).unwrap().children(),
            &[fixture.door, fixture.window]
        );
    }

    #[test]
    fn factories_validate_targets_and_args() {
        let fixture = fixture();
        let registry = RequestRegistry::new();

        let err = registry
            .create(
                &fixture.model,
                RequestKind::SetWallThickness,
                &[RequestArg::Id(fixture.door), RequestArg::Number(0.3)],
            )
            .expect_err("door is not a wall");
        assert!(matches!(err, EngineError::BadRequestArgs(_)));

        let err = registry
            .create(
                &fixture.model,
                RequestKind::SetWallThickness,
                &[RequestArg::Id(fixture.wall)],
            )
            .expect_err("missing thickness argument");
        assert!(matches!(err, EngineError::BadRequestArgs(_)));

        let err = registry
            .create(
                &fixture.model,
                RequestKind::SetWallThickness,
                &[
                    RequestArg::Id(EntityId::new(9_999)),
                    RequestArg::Number(0.3),
                ],
            )
            .expect_err("missing entity");
        assert!(matches!(err, EngineError::EntityNotFound(_)));
    }

    #[test]
    fn registry_lists_builtin_kinds() {
        let registry = RequestRegistry::new();
        let kinds: Vec<RequestKind> = registry.available_kinds().collect();
        assert_eq!(kinds.len(), 6);
        assert!(kinds.contains(&RequestKind::DetachOpening));
        assert!(kinds.contains(&RequestKind::SetSillMaterial));
    }
}
