//! 错误处理模块
//!
//! 本模块定义核心的错误分类体系。错误按处理策略分为四类：
//!
//! - **校验错误**：非法的信号/订单输入，由风控或订单管理器就地拒绝并给出原因码，
//!   从不向上抛出（参见 [`risk::RiskRefusedReason`](crate::risk::RiskRefusedReason)），
//!   最终落在 `Rejected`/`processed` 的终态上。
//! - **瞬时基础设施错误**：总线发布/订阅失败、外部存储写入失败。记录日志并作为
//!   可恢复错误返回给调用方，核心自身不做无限重试。
//! - **数据一致性错误**：柜台回报引用未知订单、重复成交超出未平数量。记录并丢弃，
//!   绝不导致进程崩溃。
//! - **致命错误**：启动时无法建立总线连接、无法加载必需的合约元数据。向外传播并
//!   终止进程——缺少它们无法做出任何正确的交易决策。

use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 确定某个错误是否"不可恢复"。
///
/// 分发循环依据此接口机械地区分瞬时失败与必须终止进程的失败。
pub trait Unrecoverable {
    /// 检查是否不可恢复。
    fn is_unrecoverable(&self) -> bool;
}

/// 核心中所有可能向调用方传播的错误。
///
/// 校验类拒绝不在此列：它们以 [`RiskRefused`](crate::risk::RiskRefused) 的形式
/// 留在订单/信号的终态里，属于正常业务结果而非错误路径。
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum TraderError {
    /// 瞬时总线失败（发布失败、订阅流中断后的收尾等）。
    #[error("transient bus failure: {0}")]
    Bus(String),

    /// 外部存储读写失败。
    #[error("store failure: {0}")]
    Store(#[from] StoreError),

    /// 数据一致性问题：记录后丢弃对应事件，状态保持不变。
    #[error("data consistency: {0}")]
    Consistency(String),

    /// 致命错误，进程应以非零状态退出。
    #[error("fatal: {0}")]
    Fatal(#[from] FatalError),
}

/// 无法恢复的致命错误条件。
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Error)]
pub enum FatalError {
    /// 无法建立初始总线连接，或订阅连接已丢失。
    ///
    /// 分发器不做自动重连与消息重放，由进程守护方重启整个进程。
    #[error("bus connection: {0}")]
    BusConnection(String),

    /// 启动时加载合约元数据失败。
    #[error("instrument load: {0}")]
    InstrumentLoad(String),

    /// 配置不合法（非法 cron 表达式、空通道模式、非正的最小变动价位等）。
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Unrecoverable for TraderError {
    fn is_unrecoverable(&self) -> bool {
        matches!(self, TraderError::Fatal(_))
    }
}
