//! # HemaBridge 风险解释模块
//!
//! 将分类概率映射为离散的风险等级与可读的发现说明。
//! 解释过程是纯函数：同一推理结果与策略总是得到相同的评估，
//! 支持审计时的重放校验。

pub mod interpreter;

pub use interpreter::RiskInterpreter;
