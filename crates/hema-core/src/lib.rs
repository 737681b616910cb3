//! # HemaBridge Core
//!
//! 诊断流水线的核心模块，提供基础数据结构、错误定义和通用工具。

pub mod error;
pub mod models;
pub mod policy;
pub mod report;
pub mod tensor;
pub mod utils;

pub use error::{HemaError, Result};
pub use models::*;
pub use policy::{RiskPolicy, ThresholdTable};
pub use report::{DocumentRef, Report, ReviewAction, ReviewState, ReviewStatus, SampleRecord};
pub use tensor::{ChannelFormat, ImageTensor, TensorSpec};
