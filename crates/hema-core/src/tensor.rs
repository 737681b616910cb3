//! 模型输入张量

use crate::error::{HemaError, Result};
use serde::{Deserialize, Serialize};

/// 通道格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelFormat {
    Grayscale,
    Rgb,
}

impl ChannelFormat {
    pub fn channels(&self) -> usize {
        match self {
            ChannelFormat::Grayscale => 1,
            ChannelFormat::Rgb => 3,
        }
    }
}

/// 分类器期望的输入规格（NHWC，批大小为 1）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub height: u32,
    pub width: u32,
    pub format: ChannelFormat,
}

impl TensorSpec {
    pub fn shape(&self) -> [usize; 4] {
        [
            1,
            self.height as usize,
            self.width as usize,
            self.format.channels(),
        ]
    }
}

impl Default for TensorSpec {
    fn default() -> Self {
        Self {
            height: 224,
            width: 224,
            format: ChannelFormat::Grayscale,
        }
    }
}

/// 归一化后的影像张量，取值范围 [0, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    shape: [usize; 4],
    data: Vec<f32>,
}

impl ImageTensor {
    pub fn new(shape: [usize; 4], data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(HemaError::Internal(format!(
                "tensor shape {:?} needs {} values, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn matches(&self, spec: &TensorSpec) -> bool {
        self.shape == spec.shape()
    }
}
