use homecad_core::model::{DirtyFlag, Entity, Model, RebuildError, Rebuilder};
use tracing::{debug, trace};

/// 对整个模型做一次重建扫描：逐类别把脏实体按子先父后的顺序交给
/// 重建协作者，返回实际重建次数。协作者报错时扫描中止，出错实体及
/// 其后未处理实体的标记保持置位，下次扫描会重试。
pub fn rebuild_sweep(model: &mut Model, builder: &mut dyn Rebuilder) -> Result<usize, RebuildError> {
    let mut rebuilt = 0;
    for flag in DirtyFlag::ALL {
        for id in model.dirty_bottom_up(flag) {
            if model.rebuild_if_dirty(id, flag, builder)? {
                rebuilt += 1;
            }
        }
    }
    debug!(rebuilt, "重建扫描完成");
    Ok(rebuilt)
}

/// 开发与演示用协作者：只记录日志，不做真正的几何重建。
pub struct TracingRebuilder;

impl Rebuilder for TracingRebuilder {
    fn rebuild(&mut self, entity: &Entity, flag: DirtyFlag) -> Result<(), RebuildError> {
        trace!(
            id = entity.id().get(),
            kind = entity.kind().label(),
            flag = flag.label(),
            "重建派生状态"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use homecad_core::geometry::Point2;
    use homecad_core::model::{EntityData, EntityId, SiteData, StoreyData, WallData};

    use super::*;

    fn fixture() -> (Model, EntityId, EntityId) {
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
        let wall = model
            .spawn(
                EntityData::Wall(WallData {
                    start: Point2::new(0.0, 0.0),
                    end: Point2::new(4.0, 0.0),
                    thickness: 0.2,
                    height: 2.8,
                }),
                Some(storey),
            )
            .expect("spawn wall");
        (model, storey, wall)
    }

    struct RecordingRebuilder {
        calls: Vec<(u64, DirtyFlag)>,
    }

    impl Rebuilder for RecordingRebuilder {
        fn rebuild(&mut self, entity: &Entity, flag: DirtyFlag) -> Result<(), RebuildError> {
            self.calls.push((entity.id().get(), flag));
            Ok(())
        }
    }

    struct FailingRebuilder;

    impl Rebuilder for FailingRebuilder {
        fn rebuild(&mut self, entity: &Entity, flag: DirtyFlag) -> Result<(), RebuildError> {
            Err(RebuildError {
                id: entity.id().get(),
                flag,
                reason: "geometry backend offline".to_string(),
            })
        }
    }

    #[test]
    fn sweep_rebuilds_children_before_parents() {
        let (mut model, storey, wall) = fixture();
        let mut builder = RecordingRebuilder { calls: Vec::new() };

        let rebuilt = rebuild_sweep(&mut model, &mut builder).expect("sweep");
        // 三个实体，四类标记全部初始为脏。
        assert_eq!(rebuilt, 12);

        let geometry_order: Vec<u64> = builder
            .calls
            .iter()
            .filter(|(_, flag)| *flag == DirtyFlag::Geometry)
            .map(|(id, _)| *id)
            .collect();
        let wall_pos = geometry_order
            .iter()
            .position(|&id| id == wall.get())
            .expect("wall rebuilt");
        let storey_pos = geometry_order
            .iter()
            .position(|&id| id == storey.get())
            .expect("storey rebuilt");
        assert!(wall_pos < storey_pos);

        // 第二次扫描无事可做。
        let rebuilt_again = rebuild_sweep(&mut model, &mut builder).expect("second sweep");
        assert_eq!(rebuilt_again, 0);
    }

    #[test]
    fn failed_sweep_leaves_flags_for_retry() {
        let (mut model, _, wall) = fixture();

        let mut failing = FailingRebuilder;
        let err = rebuild_sweep(&mut model, &mut failing).expect_err("sweep fails");
        assert!(!err.reason.is_empty());
        assert!(model.entity(wall).unwrap().dirty().any());

        let mut recording = RecordingRebuilder { calls: Vec::new() };
        let rebuilt = rebuild_sweep(&mut model, &mut recording).expect("retry sweep");
        assert_eq!(rebuilt, 12);
    }
}
