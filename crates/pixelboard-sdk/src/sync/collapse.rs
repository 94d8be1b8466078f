//! 折叠：把一次 drain 的日志压成每个实体一个有效操作，再按类型分组
//!
//! 规则（按 timestamp 升序处理）：
//! - delete 无条件覆盖该实体已有的有效操作
//! - create / update 仅在尚无有效操作、或已有的不是 delete 时才生效；
//!   delete 之后排队的 create / update 被丢弃

use std::collections::{BTreeMap, HashMap};

use crate::storage::entities::{EntityKind, PendingOperation, SyncAction};

/// 某实体折叠后的有效操作
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveOperation {
    pub entity_kind: EntityKind,
    pub action: SyncAction,
    /// 生效那条记录的时间戳
    pub timestamp: i64,
}

/// 某类型的一组批次
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KindBatch {
    /// create + update
    pub upserts: Vec<String>,
    pub deletes: Vec<String>,
}

impl KindBatch {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollapsedOps {
    /// entity_id -> 有效操作
    pub effective: HashMap<String, EffectiveOperation>,
    /// 按类型分组，组内 id 按生效时间升序
    pub batches: BTreeMap<EntityKind, KindBatch>,
}

impl CollapsedOps {
    pub fn is_empty(&self) -> bool {
        self.effective.is_empty()
    }

    pub fn get(&self, entity_id: &str) -> Option<&EffectiveOperation> {
        self.effective.get(entity_id)
    }
}

/// `operations` 需按 (timestamp, seq) 升序，即 `OperationLog::drain` 的顺序
pub fn collapse(operations: &[PendingOperation]) -> CollapsedOps {
    let mut effective: HashMap<String, EffectiveOperation> = HashMap::new();

    for op in operations {
        let candidate = EffectiveOperation {
            entity_kind: op.entity_kind,
            action: op.action,
            timestamp: op.timestamp,
        };
        if op.action.is_delete() {
            effective.insert(op.entity_id.clone(), candidate);
            continue;
        }
        match effective.get(&op.entity_id) {
            Some(existing) if existing.action.is_delete() => {}
            _ => {
                effective.insert(op.entity_id.clone(), candidate);
            }
        }
    }

    let mut ordered: Vec<(&String, &EffectiveOperation)> = effective.iter().collect();
    ordered.sort_by(|a, b| a.1.timestamp.cmp(&b.1.timestamp).then_with(|| a.0.cmp(b.0)));

    let mut batches: BTreeMap<EntityKind, KindBatch> = BTreeMap::new();
    for (id, op) in ordered {
        let batch = batches.entry(op.entity_kind).or_default();
        if op.action.is_delete() {
            batch.deletes.push(id.clone());
        } else {
            batch.upserts.push(id.clone());
        }
    }

    CollapsedOps { effective, batches }
}
