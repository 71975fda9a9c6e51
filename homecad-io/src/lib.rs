//! 文档载荷的快照与恢复。
//!
//! 本 crate 不持有具体文件格式：载荷只是可序列化的数据结构，交给上层
//! 决定落盘形态（测试与演示中使用 JSON）。类型注册表计数是载荷中唯一
//! 必须先于实体恢复的部分，否则重新打开的文档会重复发放编号。

use std::collections::{HashMap, VecDeque};

use homecad_core::model::{EntityData, EntityId, Model, ModelError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PAYLOAD_FORMAT_VERSION: u32 = 1;

/// 单个实体的持久化记录。子列表不落盘，由记录顺序与父引用重建。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<u64>,
    pub data: EntityData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentPayload {
    pub format_version: u32,
    pub registry_counters: HashMap<String, u64>,
    pub entities: Vec<EntityRecord>,
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("unsupported payload format version {0}")]
    UnsupportedVersion(u32),
    #[error("entity record {id} could not be restored: {source}")]
    Record {
        id: u64,
        #[source]
        source: ModelError,
    },
}

/// 对模型做一次完整快照。实体按父先子后的顺序写出，恢复时无需回填。
pub fn snapshot_model(model: &Model) -> DocumentPayload {
    let mut entities = Vec::new();
    let mut queue: VecDeque<EntityId> = model.roots().iter().copied().collect();
    while let Some(id) = queue.pop_front() {
        if let Some(entity) = model.entity(id) {
            entities.push(EntityRecord {
                id: id.get(),
                type_id: model.registry().get_type_id(id).map(str::to_string),
                parent: entity.parent().map(EntityId::get),
                data: entity.data().clone(),
            });
            queue.extend(entity.children().iter().copied());
        }
    }
    DocumentPayload {
        format_version: PAYLOAD_FORMAT_VERSION,
        registry_counters: model.registry().snapshot(),
        entities,
    }
}

/// 从载荷重建模型。注册表计数先于任何实体恢复；派生状态不落盘，
/// 恢复出的实体全部处于待重建状态。
pub fn restore_model(payload: &DocumentPayload) -> Result<Model, PayloadError> {
    if payload.format_version != PAYLOAD_FORMAT_VERSION {
        return Err(PayloadError::UnsupportedVersion(payload.format_version));
    }
    let mut model = Model::new();
    model.restore_registry_counters(payload.registry_counters.clone());
    for record in &payload.entities {
        model
            .restore_entity(
                EntityId::new(record.id),
                record.data.clone(),
                record.parent.map(EntityId::new),
                record.type_id.as_deref(),
            )
            .map_err(|source| PayloadError::Record {
                id: record.id,
                source,
            })?;
    }
    Ok(model)
}

#[cfg(test)]
mod tests {
    use homecad_core::model::{EntityData, SiteData};

    use super::*;

    fn site_record(id: u64, parent: Option<u64>) -> EntityRecord {
        EntityRecord {
            id,
            type_id: Some(format!("site/{}", id + 1)),
            parent,
            data: EntityData::Site(SiteData {
                name: "地块".to_string(),
            }),
        }
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let payload = DocumentPayload {
            format_version: PAYLOAD_FORMAT_VERSION + 1,
            registry_counters: HashMap::new(),
            entities: Vec::new(),
        };
        let err = restore_model(&payload).expect_err("bad version");
        assert!(matches!(err, PayloadError::UnsupportedVersion(_)));
    }

    #[test]
    fn unknown_parent_is_rejected() {
        let payload = DocumentPayload {
            format_version: PAYLOAD_FORMAT_VERSION,
            registry_counters: HashMap::new(),
            entities: vec![site_record(0, Some(42))],
        };
        let err = restore_model(&payload).expect_err("missing parent");
        assert!(matches!(
            err,
            PayloadError::Record {
                id: 0,
                source: ModelError::EntityNotFound(42),
            }
        ));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let payload = DocumentPayload {
            format_version: PAYLOAD_FORMAT_VERSION,
            registry_counters: HashMap::new(),
            entities: vec![site_record(0, None), site_record(0, None)],
        };
        let err = restore_model(&payload).expect_err("duplicate id");
        assert!(matches!(
            err,
            PayloadError::Record {
                id: 0,
                source: ModelError::DuplicateId(0),
            }
        ));
    }
}
