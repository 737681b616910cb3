//! # HemaBridge 影像预处理模块
//!
//! 将上传的原始影像转换为分类器所需的归一化张量：
//! - 编码识别与白名单校验
//! - 最小分辨率校验
//! - 通道转换、缩放与归一化

pub mod preprocessor;

pub use preprocessor::{ImageEncoding, ImagePreprocessor, PreprocessConfig};
