use std::sync::PoisonError;

use homecad_config::AppConfig;
use homecad_core::geometry::Point2;
use homecad_core::model::{EntityData, EntityId, Model, WallData};
use homecad_engine::caches::{AssociationManager, DocManager, WallCachedData};
use homecad_engine::dirty::TracingRebuilder;
use homecad_engine::errors::EngineError;
use homecad_engine::request::{RequestArg, RequestKind, RequestRegistry};
use homecad_engine::scene::Scene;
use homecad_engine::transaction::TransactionSignal;
use homecad_io::{restore_model, snapshot_model};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum DemoError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Payload(#[from] homecad_io::PayloadError),
}

/// 简易 CLI 演示：搭一套最小户型，走一遍提交/撤销/重做、异步提交、
/// 重建扫描和载荷往返，并打印模型概览。
pub fn run(config: &AppConfig) -> Result<(), DemoError> {
    let mut scene = Scene::with_history_limit(config.editor.history_limit);
    let registry = RequestRegistry::new();
    scene.subscribe(|notice| {
        println!(
            "[事务] {} — {}",
            signal_label(notice.signal),
            notice.description
        );
    });

    let ids = scene.populate_demo()?;
    populate_caches(&scene, ids.south_wall, ids.storey, ids.floor_slab);
    {
        let mut associations = AssociationManager::instance()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        associations.associate(ids.entry_door, ids.south_wall);
        associations.associate(ids.bay_window, ids.south_wall);
    }

    println!("homecad 参数化户型演示");
    let kinds: Vec<&str> = registry.available_kinds().map(|kind| kind.label()).collect();
    println!("支持的请求: {}", kinds.join(", "));

    // 字段级请求与撤销/重做。
    scene.commit(registry.create(
        scene.model(),
        RequestKind::SetWallThickness,
        &[RequestArg::Id(ids.south_wall), RequestArg::Number(0.3)],
    )?)?;
    scene.commit(registry.create(
        scene.model(),
        RequestKind::FlipOpeningSwing,
        &[RequestArg::Id(ids.entry_door)],
    )?)?;
    scene.commit(registry.create(
        scene.model(),
        RequestKind::SetRoomKind,
        &[
            RequestArg::Id(ids.living_room),
            RequestArg::Text("bedroom".to_string()),
        ],
    )?)?;
    scene.undo()?;
    scene.undo()?;
    scene.redo()?;

    // 结构性请求：拆除窗户再撤销，宿主与槽位被精确复原。
    scene.commit(registry.create(
        scene.model(),
        RequestKind::DetachOpening,
        &[RequestArg::Id(ids.bay_window)],
    )?)?;
    scene.undo()?;

    // 异步提交按子树串行化：锁定期间同一子树的请求被拒绝。
    let token = scene.begin_commit(ids.south_wall)?;
    let conflicting = registry.create(
        scene.model(),
        RequestKind::SetSillMaterial,
        &[
            RequestArg::Id(ids.bay_window),
            RequestArg::Text("大理石".to_string()),
        ],
    )?;
    match scene.commit(conflicting) {
        Err(EngineError::SubtreePending(locked)) => {
            warn!(locked, "同一子树存在挂起提交，请求被拒绝");
        }
        Err(err) => return Err(err.into()),
        Ok(()) => warn!("预期之外：冲突提交未被拒绝"),
    }
    scene.complete_commit(
        token,
        registry.create(
            scene.model(),
            RequestKind::SetWallThickness,
            &[RequestArg::Id(ids.south_wall), RequestArg::Number(0.35)],
        )?,
    )?;

    // 懒重建：一次自底向上的扫描清掉全部失效标记。
    info!(entities = scene.model().entities().count(), "开始重建扫描");
    let mut rebuilder = TracingRebuilder;
    let rebuilt = scene.rebuild_dirty(&mut rebuilder)?;
    println!("重建扫描完成，共重建 {rebuilt} 项派生状态");

    print_overview(&scene, ids.south_wall);

    // 载荷往返：计数先于实体恢复，重新打开的文档编号继续递增。
    let payload = snapshot_model(scene.model());
    let mut restored = restore_model(&payload)?;
    println!(
        "载荷往返成功：{} 个实体，{} 类编号",
        payload.entities.len(),
        payload.registry_counters.len()
    );
    let new_wall = restored
        .spawn(
            EntityData::Wall(WallData {
                start: Point2::new(0.0, 4.0),
                end: Point2::new(6.0, 4.0),
                thickness: 0.24,
                height: 2.8,
            }),
            None,
        )
        .map_err(EngineError::from)?;
    println!(
        "重新打开后新墙编号：{}",
        restored
            .registry()
            .get_type_id(new_wall)
            .unwrap_or("<未登记>")
    );

    // 关闭文档：缓存整体清空。
    scene.reset();
    let (wall_cache, geometry_cache) = {
        let manager = DocManager::instance()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        (manager.wall_data_len(), manager.geometries_len())
    };
    println!("文档已关闭，墙体缓存 {wall_cache} 项，几何缓存 {geometry_cache} 项");

    Ok(())
}

fn populate_caches(scene: &Scene, wall: EntityId, storey: EntityId, slab: EntityId) {
    let mut manager = DocManager::instance()
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    manager.open("演示住宅");
    if let Some(entity) = scene.model().entity(wall) {
        if let Some(data) = entity.data().as_wall() {
            manager.insert_wall_data(
                wall,
                WallCachedData {
                    length: data.length(),
                    opening_count: entity.children().len(),
                },
            );
        }
        if let Some(bounds) = entity.bounds() {
            manager.insert_geometry(wall, bounds);
        }
    }
    manager.set_wall_provider(wall, storey);
    manager.set_slab_provider(slab, storey);
}

fn print_overview(scene: &Scene, wall: EntityId) {
    let model = scene.model();
    println!("当前模型实体：");
    for root in model.roots() {
        print_subtree(model, *root, 1);
    }
    if let Some(type_id) = model.registry().get_type_id(wall) {
        println!("南墙类型标识：{type_id}");
    }
    println!(
        "可撤销 {} 步，可重做 {} 步",
        scene.undo_depth(),
        scene.redo_depth()
    );
    if let Some(description) = scene.last_committed_description() {
        println!("最近一次提交：{description}");
    }
}

fn print_subtree(model: &Model, id: EntityId, depth: usize) {
    let Some(entity) = model.entity(id) else {
        return;
    };
    let indent = "  ".repeat(depth);
    let summary = match entity.data() {
        EntityData::Site(site) => format!("地块 {}", site.name),
        EntityData::Storey(storey) => format!(
            "楼层 {}，标高 {:.2}，层高 {:.2}",
            storey.name, storey.elevation, storey.height
        ),
        EntityData::Room(room) => format!(
            "房间 {}（{}），边界点数 {}",
            room.name,
            room.kind.label(),
            room.boundary.len()
        ),
        EntityData::Wall(wall) => format!(
            "墙体 长度 {:.2}，厚度 {:.3}，高度 {:.2}",
            wall.length(),
            wall.thickness,
            wall.height
        ),
        EntityData::Opening(opening) => format!(
            "洞口 宽 {:.2} × 高 {:.2}，窗台高 {:.2}，材质 {}",
            opening.width,
            opening.height,
            opening.sill_height,
            if opening.sill_material.is_empty() {
                "<无>"
            } else {
                opening.sill_material.as_str()
            }
        ),
        EntityData::Slab(slab) => format!(
            "楼板 厚度 {:.3}，轮廓点数 {}",
            slab.thickness,
            slab.outline.len()
        ),
        EntityData::Roof(roof) => format!(
            "屋顶 坡度 {:.2}，挑檐 {:.2}",
            roof.pitch, roof.overhang
        ),
        EntityData::Molding(molding) => format!(
            "线脚 {}，高度 {:.3}",
            molding.profile, molding.height
        ),
    };
    let dirty_marker = if entity.dirty().any() { " *" } else { "" };
    println!("{indent}- #{} {}{}", id.get(), summary, dirty_marker);
    for child in entity.children() {
        print_subtree(model, *child, depth + 1);
    }
}

fn signal_label(signal: TransactionSignal) -> &'static str {
    match signal {
        TransactionSignal::Committed => "提交",
        TransactionSignal::Undone => "撤销",
        TransactionSignal::Redone => "重做",
    }
}
