//! 批次协调器
//!
//! 调用方一次发起的复合变更（例如 订阅 + 开启 presence + 推送状态）对应一个批次。
//! 批次内 N 个操作的终态回调严格按声明顺序投递：前 N-1 个 `sequenced = true`，
//! 最后一个 `sequenced = false`，owner 只在最后一个回调里释放外部锁。
//! 完成顺序与投递顺序无关：先完成的操作会被暂存，直到它前面的操作都已投递。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::channel::Channel;
use crate::error::{Result, SubscribeError};

pub type BatchId = u64;
pub type OperationId = u64;

/// 操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Subscribe,
    Unsubscribe,
    EnablePresence,
    DisablePresence,
    SyncSubscribe,
    SyncUnsubscribe,
    UpdateState,
    Restore,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Subscribe => "subscribe",
            OperationKind::Unsubscribe => "unsubscribe",
            OperationKind::EnablePresence => "enable_presence",
            OperationKind::DisablePresence => "disable_presence",
            OperationKind::SyncSubscribe => "sync_subscribe",
            OperationKind::SyncUnsubscribe => "sync_unsubscribe",
            OperationKind::UpdateState => "update_state",
            OperationKind::Restore => "restore",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 操作结果
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    Pending,
    Succeeded,
    Failed(SubscribeError),
}

impl OperationOutcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, OperationOutcome::Pending)
    }
}

/// 一个逻辑操作
#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub id: OperationId,
    pub batch_id: BatchId,
    pub kind: OperationKind,
    pub channels: Vec<Channel>,
    pub outcome: OperationOutcome,
}

/// 批次（操作 id 按声明顺序）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub id: BatchId,
    pub operations: Vec<OperationId>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// 可以投递给 owner 的终态
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedOperation {
    pub batch_id: BatchId,
    pub operation_id: OperationId,
    pub kind: OperationKind,
    pub channels: Vec<Channel>,
    pub result: std::result::Result<(), SubscribeError>,
    /// 后面还有同批次的回调
    pub sequenced: bool,
}

#[derive(Debug)]
struct BatchState {
    batch: Batch,
    /// 下一个待投递的位置
    cursor: usize,
}

/// 批次协调器（只在 worker 内使用）
#[derive(Debug, Default)]
pub struct BatchCoordinator {
    next_operation_id: OperationId,
    batches: HashMap<BatchId, BatchState>,
    operations: HashMap<OperationId, PendingOperation>,
}

impl BatchCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 打开批次，按声明顺序分配操作 id
    pub fn open_batch(
        &mut self,
        batch_id: BatchId,
        operations: Vec<(OperationKind, Vec<Channel>)>,
    ) -> Result<Batch> {
        if operations.is_empty() {
            return Err(SubscribeError::InvalidArgument("batch without operations".to_string()));
        }
        if self.batches.contains_key(&batch_id) {
            return Err(SubscribeError::InvalidArgument(format!("batch {} already open", batch_id)));
        }

        let mut ids = Vec::with_capacity(operations.len());
        for (kind, channels) in operations {
            self.next_operation_id += 1;
            let id = self.next_operation_id;
            self.operations.insert(
                id,
                PendingOperation {
                    id,
                    batch_id,
                    kind,
                    channels,
                    outcome: OperationOutcome::Pending,
                },
            );
            ids.push(id);
        }

        let batch = Batch {
            id: batch_id,
            operations: ids,
        };
        self.batches.insert(
            batch_id,
            BatchState {
                batch: batch.clone(),
                cursor: 0,
            },
        );
        Ok(batch)
    }

    /// 记录某个操作的结果，返回现在可以按顺序投递的终态
    ///
    /// 已经有终态的操作再次完成会被忽略。
    pub fn complete_operation(
        &mut self,
        batch_id: BatchId,
        operation_id: OperationId,
        result: std::result::Result<(), SubscribeError>,
    ) -> Vec<CompletedOperation> {
        match self.operations.get_mut(&operation_id) {
            Some(op) if op.batch_id == batch_id && op.outcome.is_pending() => {
                op.outcome = match result {
                    Ok(()) => OperationOutcome::Succeeded,
                    Err(e) => OperationOutcome::Failed(e),
                };
            }
            Some(_) => return Vec::new(),
            None => {
                tracing::debug!("忽略未知操作: batch={}, op={}", batch_id, operation_id);
                return Vec::new();
            }
        }
        self.flush(batch_id)
    }

    /// 按声明顺序吐出已完成的前缀
    fn flush(&mut self, batch_id: BatchId) -> Vec<CompletedOperation> {
        let mut ready = Vec::new();
        let Some(state) = self.batches.get_mut(&batch_id) else {
            return ready;
        };
        let total = state.batch.operations.len();

        while state.cursor < total {
            let op_id = state.batch.operations[state.cursor];
            let Some(op) = self.operations.get(&op_id) else {
                break;
            };
            let result = match &op.outcome {
                OperationOutcome::Pending => break,
                OperationOutcome::Succeeded => Ok(()),
                OperationOutcome::Failed(e) => Err(e.clone()),
            };
            ready.push(CompletedOperation {
                batch_id,
                operation_id: op_id,
                kind: op.kind,
                channels: op.channels.clone(),
                result,
                sequenced: state.cursor + 1 < total,
            });
            state.cursor += 1;
        }

        if state.cursor == total {
            if let Some(state) = self.batches.remove(&batch_id) {
                for op_id in state.batch.operations {
                    self.operations.remove(&op_id);
                }
            }
        }
        ready
    }

    pub fn operation(&self, operation_id: OperationId) -> Option<&PendingOperation> {
        self.operations.get(&operation_id)
    }

    /// 所有仍未出结果的操作（按 id 升序，即提交顺序）
    pub fn pending_operations(&self) -> Vec<(BatchId, OperationId)> {
        let mut pending: Vec<(BatchId, OperationId)> = self
            .operations
            .values()
            .filter(|op| op.outcome.is_pending())
            .map(|op| (op.batch_id, op.id))
            .collect();
        pending.sort_by_key(|(_, op_id)| *op_id);
        pending
    }

    /// 让所有未完成操作失败（致命错误 / reset / shutdown）
    pub fn fail_all(&mut self, error: &SubscribeError) -> Vec<CompletedOperation> {
        let mut delivered = Vec::new();
        for (batch_id, op_id) in self.pending_operations() {
            delivered.extend(self.complete_operation(batch_id, op_id, Err(error.clone())));
        }
        delivered
    }

    pub fn open_batch_count(&self) -> usize {
        self.batches.len()
    }
}
