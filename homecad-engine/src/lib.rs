pub mod caches;
pub mod dirty;
pub mod request;
pub mod transaction;

pub mod errors {
    use homecad_core::model::{ModelError, RebuildError};
    use thiserror::Error;

    #[derive(Debug, Error)]
    pub enum EngineError {
        #[error("entity with id {0} not found")]
        EntityNotFound(u64),
        #[error("a transaction is already pending for entity {0} or its subtree")]
        SubtreePending(u64),
        #[error("pending transaction token {0} is unknown")]
        UnknownPendingToken(u64),
        #[error("request targets entity {request} outside the pending subtree of {pending}")]
        PendingTargetMismatch { pending: u64, request: u64 },
        #[error("request `{0}` has not been committed")]
        NotCommitted(String),
        #[error("no factory registered for request kind {0}")]
        UnknownRequestKind(&'static str),
        #[error("invalid request arguments: {0}")]
        BadRequestArgs(String),
        #[error(transparent)]
        Model(#[from] ModelError),
        #[error(transparent)]
        Rebuild(#[from] RebuildError),
    }
}

pub mod scene {
    use std::collections::HashSet;
    use std::sync::PoisonError;

    use homecad_core::geometry::{Bounds2D, Point2};
    use homecad_core::model::{
        EntityData, EntityId, Model, MoldingData, OpeningData, OpeningKind, Rebuilder, RoofData,
        RoomData, RoomKind, SiteData, SlabData, StoreyData, SwingSide, WallData,
    };
    use tracing::debug;

    use crate::caches::DocManager;
    use crate::dirty::rebuild_sweep;
    use crate::errors::EngineError;
    use crate::transaction::{
        PendingToken, Request, SubscriptionId, TransactionManager, TransactionNotice,
    };

    /// 引擎层负责维护模型、事务管理器和运行时状态（选中集等）。
    pub struct Scene {
        model: Model,
        transactions: TransactionManager,
        selected: HashSet<EntityId>,
    }

    #[derive(Debug, Clone, Copy)]
    pub struct DemoEntities {
        pub site: EntityId,
        pub storey: EntityId,
        pub living_room: EntityId,
        pub south_wall: EntityId,
        pub entry_door: EntityId,
        pub bay_window: EntityId,
        pub floor_slab: EntityId,
        pub roof: EntityId,
        pub crown_molding: EntityId,
    }

    impl Scene {
        pub fn new() -> Self {
            Self {
                model: Model::new(),
                transactions: TransactionManager::new(),
                selected: HashSet::new(),
            }
        }

        pub fn with_history_limit(limit: usize) -> Self {
            Self {
                model: Model::new(),
                transactions: TransactionManager::with_history_limit(limit),
                selected: HashSet::new(),
            }
        }

        /// 关闭当前文档：重置模型（连带类型注册表）、清空选中集与历史，
        /// 并整体清空进程级缓存。
        pub fn reset(&mut self) {
            let limit = self.transactions.history_limit();
            self.model = Model::new();
            self.transactions = TransactionManager::with_history_limit(limit);
            self.selected.clear();
            DocManager::instance()
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
            debug!("场景已重置");
        }

        /// 替换当前模型并重置运行时状态，语义同关闭旧文档后打开新文档。
        pub fn load_model(&mut self, model: Model) {
            self.reset();
            self.model = model;
        }

        #[inline]
        pub fn model(&self) -> &Model {
            &self.model
        }

        pub fn commit(&mut self, request: Box<dyn Request>) -> Result<(), EngineError> {
            self.transactions.commit(&mut self.model, request)
        }

        pub fn begin_commit(&mut self, target: EntityId) -> Result<PendingToken, EngineError> {
            self.transactions.begin_commit(&self.model, target)
        }

        pub fn complete_commit(
            &mut self,
            token: PendingToken,
            request: Box<dyn Request>,
        ) -> Result<(), EngineError> {
            self.transactions
                .complete_commit(&mut self.model, token, request)
        }

        pub fn abort_commit(&mut self, token: PendingToken) -> Result<(), EngineError> {
            self.transactions.abort_commit(token)
        }

        pub fn undo(&mut self) -> Result<bool, EngineError> {
            self.transactions.undo(&mut self.model)
        }

        pub fn redo(&mut self) -> Result<bool, EngineError> {
            self.transactions.redo(&mut self.model)
        }

        #[inline]
        pub fn can_undo(&self) -> bool {
            self.transactions.can_undo()
        }

        #[inline]
        pub fn can_redo(&self) -> bool {
            self.transactions.can_redo()
        }

        #[inline]
        pub fn undo_depth(&self) -> usize {
            self.transactions.undo_depth()
        }

        #[inline]
        pub fn redo_depth(&self) -> usize {
            self.transactions.redo_depth()
        }

        pub fn last_committed_description(&self) -> Option<&str> {
            self.transactions.last_committed_description()
        }

        pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
        where
            F: FnMut(&TransactionNotice) + 'static,
        {
            self.transactions.subscribe(listener)
        }

        pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
            self.transactions.unsubscribe(id)
        }

        /// 返回当前选中实体数量。
        #[inline]
        pub fn selection_len(&self) -> usize {
            self.selected.len()
        }

        #[inline]
        pub fn is_selected(&self, id: EntityId) -> bool {
            self.selected.contains(&id)
        }

        /// 选中指定实体。实体不存在时返回错误。
        pub fn select(&mut self, id: EntityId) -> Result<(), EngineError> {
            if !self.model.contains(id) {
                return Err(EngineError::EntityNotFound(id.get()));
            }
            self.selected.insert(id);
            Ok(())
        }

        /// 取消选中指定实体，返回之前是否处于选中状态。
        pub fn deselect(&mut self, id: EntityId) -> bool {
            self.selected.remove(&id)
        }

        /// 切换实体选中状态，返回切换后的状态。
        pub fn toggle_selection(&mut self, id: EntityId) -> Result<bool, EngineError> {
            if !self.model.contains(id) {
                return Err(EngineError::EntityNotFound(id.get()));
            }
            if !self.selected.insert(id) {
                self.selected.remove(&id);
                Ok(false)
            } else {
                Ok(true)
            }
        }

        #[inline]
        pub fn clear_selection(&mut self) {
            self.selected.clear();
        }

        #[inline]
        pub fn selection(&self) -> impl Iterator<Item = EntityId> + '_ {
            self.selected.iter().copied()
        }

        pub fn bounds(&self) -> Option<Bounds2D> {
            self.model.bounds()
        }

        /// 把全部失效的派生状态交给重建协作者，返回重建次数。
        pub fn rebuild_dirty(&mut self, builder: &mut dyn Rebuilder) -> Result<usize, EngineError> {
            Ok(rebuild_sweep(&mut self.model, builder)?)
        }

        /// 为 CLI / 快速验证搭一套最小户型，返回关键实体 ID。
        pub fn populate_demo(&mut self) -> Result<DemoEntities, EngineError> {
            self.clear_selection();

            let site = self.model.spawn(
                EntityData::Site(SiteData {
                    name: "演示地块".to_string(),
                }),
                None,
            )?;
            let storey = self.model.spawn(
                EntityData::Storey(StoreyData {
                    name: "一层".to_string(),
                    elevation: 0.0,
                    height: 2.8,
                }),
                Some(site),
            )?;
            let living_room = self.model.spawn(
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
            )?;
            let south_wall = self.model.spawn(
                EntityData::Wall(WallData {
                    start: Point2::new(0.0, 0.0),
                    end: Point2::new(6.0, 0.0),
                    thickness: 0.24,
                    height: 2.8,
                }),
                Some(living_room),
            )?;
            let entry_door = self.model.spawn(
                EntityData::Opening(OpeningData {
                    kind: OpeningKind::Door,
                    width: 0.9,
                    height: 2.1,
                    sill_height: 0.0,
                    offset: 1.2,
                    swing: SwingSide::Left,
                    sill_material: String::new(),
                }),
                Some(south_wall),
            )?;
            let bay_window = self.model.spawn(
                EntityData::Opening(OpeningData {
                    kind: OpeningKind::Window,
                    width: 1.5,
                    height: 1.4,
                    sill_height: 0.9,
                    offset: 3.9,
                    swing: SwingSide::Left,
                    sill_material: "松木".to_string(),
                }),
                Some(south_wall),
            )?;
            let floor_slab = self.model.spawn(
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
            )?;
            let roof = self.model.spawn(
                EntityData::Roof(RoofData {
                    pitch: 0.5,
                    overhang: 0.4,
                }),
                Some(storey),
            )?;
            let crown_molding = self.model.spawn(
                EntityData::Molding(MoldingData {
                    profile: "石膏阴角线".to_string(),
                    height: 0.08,
                }),
                Some(living_room),
            )?;

            let ids = DemoEntities {
                site,
                storey,
                living_room,
                south_wall,
                entry_door,
                bay_window,
                floor_slab,
                roof,
                crown_molding,
            };

            debug!(
                site = ids.site.get(),
                storey = ids.storey.get(),
                living_room = ids.living_room.get(),
                south_wall = ids.south_wall.get(),
                entry_door = ids.entry_door.get(),
                bay_window = ids.bay_window.get(),
                floor_slab = ids.floor_slab.get(),
                roof = ids.roof.get(),
                crown_molding = ids.crown_molding.get(),
                "已创建演示户型"
            );

            Ok(ids)
        }
    }

    impl Default for Scene {
        fn default() -> Self {
            Self::new()
        }
    }

    #[cfg(test)]
    mod tests {
        use crate::request::{RequestArg, RequestKind, RequestRegistry};

        use super::*;

        #[test]
        fn demo_population_creates_entities() {
            let mut scene = Scene::new();
            let ids = scene.populate_demo().expect("populate demo");
            assert_eq!(scene.model().entities().count(), 9);
            assert_eq!(
                scene.model().entity(ids.entry_door).unwrap().parent(),
                Some(ids.south_wall)
            );
            assert_eq!(
                scene.model().registry().get_type_id(ids.south_wall),
                Some("wall/1")
            );
        }

        #[test]
        fn selection_operations_work() {
            let mut scene = Scene::new();
            let ids = scene.populate_demo().expect("populate demo");

            assert_eq!(scene.selection_len(), 0);
            assert!(scene.selection().next().is_none());
            scene.select(ids.south_wall).expect("select wall");
            assert!(scene.is_selected(ids.south_wall));
            assert_eq!(scene.selection().collect::<Vec<_>>(), vec![ids.south_wall]);

            let now_selected = scene
                .toggle_selection(ids.south_wall)
                .expect("toggle existing selection");
            assert!(!now_selected);

            let now_selected = scene
                .toggle_selection(ids.south_wall)
                .expect("toggle again");
            assert!(now_selected);

            assert!(scene.deselect(ids.south_wall));
            assert!(!scene.deselect(ids.south_wall));

            let missing = EntityId::new(9_999);
            let err = scene.select(missing).unwrap_err();
            assert!(matches!(err, EngineError::EntityNotFound(_)));
        }

        #[test]
        fn scene_commits_requests_from_the_registry() {
            let mut scene = Scene::new();
            let ids = scene.populate_demo().expect("populate demo");
            let registry = RequestRegistry::new();

            let request = registry
                .create(
                    scene.model(),
                    RequestKind::SetSillMaterial,
                    &[
                        RequestArg::Id(ids.bay_window),
                        RequestArg::Text("大理石".to_string()),
                    ],
                )
                .expect("build request");
            scene.commit(request).expect("commit");

            let sill = |scene: &Scene| {
                scene
                    .model()
                    .entity(ids.bay_window)
                    .and_then(|entity| entity.data().as_opening())
                    .map(|opening| opening.sill_material.clone())
                    .expect("window data")
            };
            assert_eq!(sill(&scene), "大理石");
            assert_eq!(scene.undo_depth(), 1);

            assert!(scene.undo().expect("undo"));
            assert_eq!(sill(&scene), "松木");
            assert!(scene.redo().expect("redo"));
            assert_eq!(sill(&scene), "大理石");
        }

        #[test]
        fn scene_subscriptions_can_be_released() {
            use std::cell::RefCell;
            use std::rc::Rc;

            let mut scene = Scene::new();
            let ids = scene.populate_demo().expect("populate demo");
            let seen = Rc::new(RefCell::new(0usize));
            let sink = Rc::clone(&seen);
            let subscription = scene.subscribe(move |_notice| {
                *sink.borrow_mut() += 1;
            });

            let registry = RequestRegistry::new();
            let request = registry
                .create(
                    scene.model(),
                    RequestKind::FlipOpeningSwing,
                    &[RequestArg::Id(ids.entry_door)],
                )
                .expect("build request");
            scene.commit(request).expect("commit");
            assert_eq!(*seen.borrow(), 1);

            assert!(scene.unsubscribe(subscription));
            scene.undo().expect("undo");
            assert_eq!(*seen.borrow(), 1);
        }

        #[test]
        fn reset_clears_model_history_and_selection() {
            let mut scene = Scene::new();
            let ids = scene.populate_demo().expect("populate demo");
            scene.select(ids.south_wall).expect("select wall");
            let registry = RequestRegistry::new();
            let request = registry
                .create(
                    scene.model(),
                    RequestKind::SetWallThickness,
                    &[RequestArg::Id(ids.south_wall), RequestArg::Number(0.3)],
                )
                .expect("build request");
            scene.commit(request).expect("commit");

            scene.reset();

            assert_eq!(scene.model().entities().count(), 0);
            assert_eq!(scene.selection_len(), 0);
            assert!(!scene.can_undo());
            assert!(!scene.can_redo());
            // 注册表随文档一并清零，新文档的编号从头开始。
            assert!(scene.model().registry().snapshot().is_empty());
        }

        #[test]
        fn load_model_replaces_document_and_runtime_state() {
            let mut scene = Scene::new();
            let ids = scene.populate_demo().expect("populate demo");
            scene.select(ids.south_wall).expect("select wall");

            let mut replacement = Model::new();
            replacement
                .spawn(
                    EntityData::Site(SiteData {
                        name: "新地块".to_string(),
                    }),
                    None,
                )
                .expect("spawn replacement site");
            scene.load_model(replacement);

            assert_eq!(scene.model().entities().count(), 1);
            assert_eq!(scene.selection_len(), 0);
            assert!(!scene.can_undo());
        }

        #[test]
        fn scene_bounds_follow_the_model() {
            let mut scene = Scene::new();
            assert!(scene.bounds().is_none());
            scene.populate_demo().expect("populate demo");
            let bounds = scene.bounds().expect("bounds exist");
            assert!((bounds.max().x() - 6.0).abs() < 1e-9);
            assert!((bounds.max().y() - 4.0).abs() < 1e-9);
        }
    }
}
