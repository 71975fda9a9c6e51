use homecad_core::model::{EntityId, Model};
use tracing::debug;

use crate::errors::EngineError;

/// 请求分类标签，用于日志与历史记录分组。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestCategory {
    Field,
    Structure,
    Document,
}

impl RequestCategory {
    #[inline]
    pub fn label(self) -> &'static str {
        match self {
            RequestCategory::Field => "field",
            RequestCategory::Structure => "structure",
            RequestCategory::Document => "document",
        }
    }
}

/// 一次可逆突变的原子单元。
///
/// 约束：`on_undo` 必须把状态恢复到 `on_commit` 之前的原样，`on_redo`
/// 必须恢复到 `on_commit` 之后的原样，且反复撤销/重做保持幂等。
/// 提交失败时请求自身负责不留下半完成的突变。
pub trait Request {
    fn on_commit(&mut self, model: &mut Model) -> Result<(), EngineError>;

    fn on_undo(&mut self, model: &mut Model) -> Result<(), EngineError>;

    /// 默认重做即重新提交；提交时派生了额外副作用的请求自行覆盖。
    fn on_redo(&mut self, model: &mut Model) -> Result<(), EngineError> {
        self.on_commit(model)
    }

    fn description(&self) -> &str;

    fn category(&self) -> RequestCategory;

    /// 请求作用的目标实体，用于子树级的提交串行化与信号携带。
    fn target(&self) -> EntityId;

    /// 是否允许参与字段级的随输入提交。默认不允许。
    fn can_transact_field(&self) -> bool {
        false
    }
}

impl std::fmt::Debug for dyn Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("description", &self.description())
            .field("category", &self.category())
            .field("target", &self.target())
            .finish()
    }
}

/// 字段写入函数：`(模型, 目标实体, 值)`。
pub type ApplyFn<T> = fn(&mut Model, EntityId, &T) -> Result<(), EngineError>;

/// 通用单字段请求：记录前后值，提交/重做写入后值，撤销写回前值。
/// 前后值相等时照常提交，不做内建去重；调用方如需跳过应在构造前比较。
pub struct DataRequest<T: Clone> {
    target: EntityId,
    before: T,
    after: T,
    apply: ApplyFn<T>,
    description: String,
    category: RequestCategory,
}

impl<T: Clone> DataRequest<T> {
    pub fn new(
        target: EntityId,
        before: T,
        after: T,
        apply: ApplyFn<T>,
        description: impl Into<String>,
        category: RequestCategory,
    ) -> Self {
        Self {
            target,
            before,
            after,
            apply,
            description: description.into(),
            category,
        }
    }
}

impl<T: Clone> Request for DataRequest<T> {
    fn on_commit(&mut self, model: &mut Model) -> Result<(), EngineError> {
        (self.apply)(model, self.target, &self.after)
    }

    fn on_undo(&mut self, model: &mut Model) -> Result<(), EngineError> {
        (self.apply)(model, self.target, &self.before)
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn category(&self) -> RequestCategory {
        self.category
    }

    fn target(&self) -> EntityId {
        self.target
    }

    fn can_transact_field(&self) -> bool {
        true
    }
}

/// 结构性突变的执行者：实际差异只能在提交时对照当前状态得出，
/// 由 `perform` 在完成突变的同时产出规格，供撤销/重做回放。
pub trait StateChange {
    type Spec;

    fn perform(&mut self, model: &mut Model) -> Result<Self::Spec, EngineError>;

    fn revert(&mut self, model: &mut Model, spec: &Self::Spec) -> Result<(), EngineError>;

    fn reapply(&mut self, model: &mut Model, spec: &Self::Spec) -> Result<(), EngineError>;
}

/// 通用结构请求：提交时计算并保存规格，撤销/重做按规格回放。
pub struct StateRequest<C: StateChange> {
    target: EntityId,
    change: C,
    spec: Option<C::Spec>,
    description: String,
    category: RequestCategory,
}

impl<C: StateChange> StateRequest<C> {
    pub fn new(
        target: EntityId,
        change: C,
        description: impl Into<String>,
        category: RequestCategory,
    ) -> Self {
        Self {
            target,
            change,
            spec: None,
            description: description.into(),
            category,
        }
    }
}

impl<C: StateChange> Request for StateRequest<C> {
    fn on_commit(&mut self, model: &mut Model) -> Result<(), EngineError> {
        let spec = self.change.perform(model)?;
        self.spec = Some(spec);
        Ok(())
    }

    fn on_undo(&mut self, model: &mut Model) -> Result<(), EngineError> {
        let Some(spec) = self.spec.as_ref() else {
            return Err(EngineError::NotCommitted(self.description.clone()));
        };
        self.change.revert(model, spec)
    }

    fn on_redo(&mut self, model: &mut Model) -> Result<(), EngineError> {
        let Some(spec) = self.spec.as_ref() else {
            return Err(EngineError::NotCommitted(self.description.clone()));
        };
        self.change.reapply(model, spec)
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn category(&self) -> RequestCategory {
        self.category
    }

    fn target(&self) -> EntityId {
        self.target
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionSignal {
    Committed,
    Undone,
    Redone,
}

/// 随信号分发的通知，携带已完成状态转换的请求概要。
#[derive(Debug, Clone)]
pub struct TransactionNotice {
    pub signal: TransactionSignal,
    pub description: String,
    pub category: RequestCategory,
    pub target: EntityId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// 类型化的信号集线器。监听者持订阅句柄显式注销。
#[derive(Default)]
pub struct SignalHub {
    listeners: Vec<(SubscriptionId, Box<dyn FnMut(&TransactionNotice)>)>,
    next_id: u64,
}

impl SignalHub {
    pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: FnMut(&TransactionNotice) + 'static,
    {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        self.listeners.len() != before
    }

    fn emit(&mut self, notice: &TransactionNotice) {
        for (_, listener) in &mut self.listeners {
            listener(notice);
        }
    }
}

/// 挂起中的异步提交句柄。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingToken(u64);

struct Pending {
    token: u64,
    target: EntityId,
}

const DEFAULT_HISTORY_LIMIT: usize = 50;

/// 撤销/重做的唯一执行者，维护严格后进先出的两个请求栈。
///
/// 异步提交按目标子树显式建模为状态机：`begin_commit` 锁定子树，
/// `complete_commit`/`abort_commit` 释放。锁定期间同一子树的其他
/// 提交被拒绝，互不相关的子树不受影响。
pub struct TransactionManager {
    undo_stack: Vec<Box<dyn Request>>,
    redo_stack: Vec<Box<dyn Request>>,
    history_limit: usize,
    pending: Vec<Pending>,
    signals: SignalHub,
    next_token: u64,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            history_limit: limit.max(1),
            pending: Vec::new(),
            signals: SignalHub::default(),
            next_token: 0,
        }
    }

    #[inline]
    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    /// 同步提交。成功后请求进入撤销栈并清空重做栈；失败时两栈不变、
    /// 不发信号，错误原样抛给调用方。
    pub fn commit(
        &mut self,
        model: &mut Model,
        mut request: Box<dyn Request>,
    ) -> Result<(), EngineError> {
        self.ensure_not_locked(model, request.target())?;
        request.on_commit(model)?;
        debug!(
            entity = request.target().get(),
            category = request.category().label(),
            description = request.description(),
            "已提交请求"
        );
        self.push_committed(request);
        Ok(())
    }

    /// 异步提交第一阶段：锁定目标子树。同一子树已有挂起提交时拒绝。
    pub fn begin_commit(
        &mut self,
        model: &Model,
        target: EntityId,
    ) -> Result<PendingToken, EngineError> {
        if !model.contains(target) {
            return Err(EngineError::EntityNotFound(target.get()));
        }
        self.ensure_not_locked(model, target)?;
        self.next_token += 1;
        self.pending.push(Pending {
            token: self.next_token,
            target,
        });
        debug!(entity = target.get(), token = self.next_token, "子树提交锁定");
        Ok(PendingToken(self.next_token))
    }

    /// 异步提交第二阶段：执行请求并释放锁。失败等同提交失败——锁释放、
    /// 两栈不变、不发信号。
    pub fn complete_commit(
        &mut self,
        model: &mut Model,
        token: PendingToken,
        mut request: Box<dyn Request>,
    ) -> Result<(), EngineError> {
        let index = self
            .pending
            .iter()
            .position(|pending| pending.token == token.0)
            .ok_or(EngineError::UnknownPendingToken(token.0))?;
        let pending_target = self.pending[index].target;
        if !model.related(pending_target, request.target()) {
            return Err(EngineError::PendingTargetMismatch {
                pending: pending_target.get(),
                request: request.target().get(),
            });
        }
        let result = request.on_commit(model);
        self.pending.remove(index);
        match result {
            Ok(()) => {
                debug!(
                    entity = request.target().get(),
                    description = request.description(),
                    "异步提交完成"
                );
                self.push_committed(request);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// 异步提交的失败路径：只释放子树锁，不触碰请求栈。
    pub fn abort_commit(&mut self, token: PendingToken) -> Result<(), EngineError> {
        let index = self
            .pending
            .iter()
            .position(|pending| pending.token == token.0)
            .ok_or(EngineError::UnknownPendingToken(token.0))?;
        let pending = self.pending.remove(index);
        debug!(entity = pending.target.get(), "异步提交已放弃");
        Ok(())
    }

    /// 撤销栈顶请求。空栈是良性无操作，返回 `false`。
    /// 撤销失败时请求退回原栈，错误上抛。
    pub fn undo(&mut self, model: &mut Model) -> Result<bool, EngineError> {
        if let Some(top) = self.undo_stack.last() {
            self.ensure_not_locked(model, top.target())?;
        }
        let Some(mut request) = self.undo_stack.pop() else {
            debug!("撤销栈为空，忽略本次撤销");
            return Ok(false);
        };
        match request.on_undo(model) {
            Ok(()) => {
                debug!(description = request.description(), "已撤销请求");
                let notice = Self::notice_for(request.as_ref(), TransactionSignal::Undone);
                self.redo_stack.push(request);
                self.signals.emit(&notice);
                Ok(true)
            }
            Err(err) => {
                self.undo_stack.push(request);
                Err(err)
            }
        }
    }

    /// 重做最近撤销的请求。空栈是良性无操作，返回 `false`。
    pub fn redo(&mut self, model: &mut Model) -> Result<bool, EngineError> {
        if let Some(top) = self.redo_stack.last() {
            self.ensure_not_locked(model, top.target())?;
        }
        let Some(mut request) = self.redo_stack.pop() else {
            debug!("重做栈为空，忽略本次重做");
            return Ok(false);
        };
        match request.on_redo(model) {
            Ok(()) => {
                debug!(description = request.description(), "已重做请求");
                let notice = Self::notice_for(request.as_ref(), TransactionSignal::Redone);
                self.undo_stack.push(request);
                self.signals.emit(&notice);
                Ok(true)
            }
            Err(err) => {
                self.redo_stack.push(request);
                Err(err)
            }
        }
    }

    #[inline]
    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    #[inline]
    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    #[inline]
    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    #[inline]
    pub fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }

    /// 最近一次提交/重做的请求描述，供界面展示。
    pub fn last_committed_description(&self) -> Option<&str> {
        self.undo_stack.last().map(|request| request.description())
    }

    pub fn next_redo_description(&self) -> Option<&str> {
        self.redo_stack.last().map(|request| request.description())
    }

    pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: FnMut(&TransactionNotice) + 'static,
    {
        self.signals.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.signals.unsubscribe(id)
    }

    fn ensure_not_locked(&self, model: &Model, target: EntityId) -> Result<(), EngineError> {
        for pending in &self.pending {
            if model.related(pending.target, target) {
                return Err(EngineError::SubtreePending(pending.target.get()));
            }
        }
        Ok(())
    }

    /// 新提交作废整个重做分支，撤销栈超限时淘汰最旧的请求。
    fn push_committed(&mut self, request: Box<dyn Request>) {
        self.redo_stack.clear();
        if self.undo_stack.len() >= self.history_limit {
            self.undo_stack.remove(0);
        }
        let notice = Self::notice_for(request.as_ref(), TransactionSignal::Committed);
        self.undo_stack.push(request);
        self.signals.emit(&notice);
    }

    fn notice_for(request: &dyn Request, signal: TransactionSignal) -> TransactionNotice {
        TransactionNotice {
            signal,
            description: request.description().to_string(),
            category: request.category(),
            target: request.target(),
        }
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}
