//! 影像预处理器
//!
//! 纯函数转换：相同的字节输入总是得到逐位相同的张量输出。

use hema_core::{ChannelFormat, HemaError, ImageTensor, Result, TensorSpec};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// 最小有效影像字节数（最小合法 PNG 约 67 字节）
const MIN_IMAGE_BYTES: usize = 67;

/// 支持的影像编码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageEncoding {
    Png,
    Jpeg,
    Tiff,
    Bmp,
}

impl ImageEncoding {
    fn from_format(format: ImageFormat) -> Option<Self> {
        match format {
            ImageFormat::Png => Some(ImageEncoding::Png),
            ImageFormat::Jpeg => Some(ImageEncoding::Jpeg),
            ImageFormat::Tiff => Some(ImageEncoding::Tiff),
            ImageFormat::Bmp => Some(ImageEncoding::Bmp),
            _ => None,
        }
    }

    fn image_format(&self) -> ImageFormat {
        match self {
            ImageEncoding::Png => ImageFormat::Png,
            ImageEncoding::Jpeg => ImageFormat::Jpeg,
            ImageEncoding::Tiff => ImageFormat::Tiff,
            ImageEncoding::Bmp => ImageFormat::Bmp,
        }
    }
}

/// 预处理配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessConfig {
    /// 输出张量规格，必须与模型输入一致
    pub tensor: TensorSpec,
    /// 最小宽度（像素）
    pub min_width: u32,
    /// 最小高度（像素）
    pub min_height: u32,
    /// 最大上传字节数
    pub max_bytes: usize,
    /// 允许的编码
    pub allowed_encodings: Vec<ImageEncoding>,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            tensor: TensorSpec::default(),
            min_width: 64,
            min_height: 64,
            max_bytes: 20 * 1024 * 1024,
            allowed_encodings: vec![
                ImageEncoding::Png,
                ImageEncoding::Jpeg,
                ImageEncoding::Tiff,
                ImageEncoding::Bmp,
            ],
        }
    }
}

/// 影像预处理器
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    config: PreprocessConfig,
}

impl ImagePreprocessor {
    pub fn new(config: PreprocessConfig) -> Result<Self> {
        if config.tensor.width == 0 || config.tensor.height == 0 {
            return Err(HemaError::Config("tensor dimensions must be non-zero".to_string()));
        }
        if config.min_width == 0 || config.min_height == 0 {
            return Err(HemaError::Config("minimum resolution must be non-zero".to_string()));
        }
        if config.max_bytes < MIN_IMAGE_BYTES {
            return Err(HemaError::Config(format!(
                "max_bytes must be at least {}",
                MIN_IMAGE_BYTES
            )));
        }
        if config.allowed_encodings.is_empty() {
            return Err(HemaError::Config("at least one image encoding must be allowed".to_string()));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    /// 识别编码并校验是否在白名单内
    pub fn detect_encoding(&self, bytes: &[u8]) -> Result<ImageEncoding> {
        if bytes.len() < MIN_IMAGE_BYTES {
            return Err(HemaError::InvalidInput(format!(
                "image data too small to be valid ({} bytes)",
                bytes.len()
            )));
        }
        if bytes.len() > self.config.max_bytes {
            return Err(HemaError::InvalidInput(format!(
                "image data exceeds {} byte limit",
                self.config.max_bytes
            )));
        }

        let format = image::guess_format(bytes)
            .map_err(|e| HemaError::InvalidInput(format!("unrecognised image encoding: {}", e)))?;

        match ImageEncoding::from_format(format) {
            Some(encoding) if self.config.allowed_encodings.contains(&encoding) => Ok(encoding),
            _ => Err(HemaError::InvalidInput(format!(
                "unsupported image encoding: {:?}",
                format
            ))),
        }
    }

    /// 将原始影像转换为模型输入张量
    pub fn preprocess(&self, bytes: &[u8]) -> Result<ImageTensor> {
        let encoding = self.detect_encoding(bytes)?;

        let image = image::load_from_memory_with_format(bytes, encoding.image_format())
            .map_err(|e| HemaError::InvalidInput(format!("failed to decode {:?} image: {}", encoding, e)))?;

        let (width, height) = (image.width(), image.height());
        if width < self.config.min_width || height < self.config.min_height {
            return Err(HemaError::InvalidInput(format!(
                "image resolution {}x{} is below the minimum {}x{}",
                width, height, self.config.min_width, self.config.min_height
            )));
        }

        debug!(
            encoding = ?encoding,
            width,
            height,
            "Preprocessing image"
        );

        let spec = self.config.tensor;
        let data = normalize(&image, &spec);
        ImageTensor::new(spec.shape(), data)
    }
}

/// 通道转换、缩放并归一化到 [0, 1]
///
/// 固定使用 Triangle 滤波器，保证结果可复现。
fn normalize(image: &DynamicImage, spec: &TensorSpec) -> Vec<f32> {
    let raw = match spec.format {
        ChannelFormat::Grayscale => {
            let gray = image.to_luma8();
            image::imageops::resize(&gray, spec.width, spec.height, FilterType::Triangle).into_raw()
        }
        ChannelFormat::Rgb => {
            let rgb = image.to_rgb8();
            image::imageops::resize(&rgb, spec.width, spec.height, FilterType::Triangle).into_raw()
        }
    };

    raw.into_iter().map(|v| v as f32 / 255.0).collect()
}
