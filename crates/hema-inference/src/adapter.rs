//! 分类器适配器
//!
//! 模型是进程级共享的只读资源：首次使用时加载，加载过程互斥，
//! 推理调用持有 `Arc` 并发执行，卸载不会影响正在进行的推理。

use crate::artifact::{ModelConfig, OutputActivation};
use crate::backend::{ModelBackend, ModelLoader};
use hema_core::utils::softmax;
use hema_core::{HemaError, ImageTensor, InferenceResult, ModelVersion, Result, TensorSpec};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, info};

/// 已加载的模型及其版本
pub struct LoadedModel {
    backend: Box<dyn ModelBackend>,
    version: ModelVersion,
}

impl LoadedModel {
    pub fn version(&self) -> &ModelVersion {
        &self.version
    }
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// 分类器适配器
pub struct ClassifierAdapter {
    config: ModelConfig,
    loader: Arc<dyn ModelLoader>,
    slot: RwLock<Option<Arc<LoadedModel>>>,
    load_lock: Mutex<()>,
    torn_down: AtomicBool,
    loads: AtomicUsize,
}

impl ClassifierAdapter {
    /// 创建适配器，不会立即加载模型
    pub fn new(config: ModelConfig, loader: Arc<dyn ModelLoader>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            loader,
            slot: RwLock::new(None),
            load_lock: Mutex::new(()),
            torn_down: AtomicBool::new(false),
            loads: AtomicUsize::new(0),
        })
    }

    pub fn labels(&self) -> &[String] {
        &self.config.labels
    }

    pub fn input_spec(&self) -> TensorSpec {
        self.config.input
    }

    /// 启动时预热，提前暴露模型不可用问题
    pub fn warm_up(&self) -> Result<ModelVersion> {
        Ok(self.model()?.version.clone())
    }

    /// 当前已加载的模型版本
    pub fn version(&self) -> Option<ModelVersion> {
        self.slot
            .read()
            .ok()
            .and_then(|slot| slot.as_ref().map(|m| m.version.clone()))
    }

    pub fn is_loaded(&self) -> bool {
        self.version().is_some()
    }

    /// 实际执行过的加载次数
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// 进程退出时卸载模型，之后的调用返回 `ModelUnavailable`
    pub fn teardown(&self) {
        self.torn_down.store(true, Ordering::SeqCst);
        // 等待可能正在进行的加载结束
        let _guard = self.load_lock.lock().unwrap_or_else(|p| p.into_inner());
        if let Ok(mut slot) = self.slot.write() {
            if let Some(model) = slot.take() {
                info!(version = %model.version, "Classifier model torn down");
            }
        }
    }

    /// 获取共享模型，必要时加载
    fn model(&self) -> Result<Arc<LoadedModel>> {
        if let Some(model) = self.loaded()? {
            return Ok(model);
        }

        let _guard = self
            .load_lock
            .lock()
            .map_err(|_| HemaError::Internal("model load lock poisoned".to_string()))?;

        // 等锁期间可能已有其他调用完成加载
        if let Some(model) = self.loaded()? {
            return Ok(model);
        }

        let artifact = self.config.artifact();
        info!(path = %artifact.path().display(), "Loading classifier model");

        let version = artifact.version()?;
        let backend = self.loader.load(&artifact).map_err(|e| {
            error!(path = %artifact.path().display(), error = %e, "Failed to load classifier model");
            match e {
                HemaError::ModelUnavailable(_) => e,
                other => HemaError::ModelUnavailable(other.to_string()),
            }
        })?;

        let model = Arc::new(LoadedModel { backend, version });
        {
            let mut slot = self
                .slot
                .write()
                .map_err(|_| HemaError::Internal("model slot lock poisoned".to_string()))?;
            *slot = Some(Arc::clone(&model));
        }
        self.loads.fetch_add(1, Ordering::SeqCst);

        info!(version = %model.version, "Classifier model loaded");
        Ok(model)
    }

    fn loaded(&self) -> Result<Option<Arc<LoadedModel>>> {
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(HemaError::ModelUnavailable(
                "classifier has been torn down".to_string(),
            ));
        }
        let slot = self
            .slot
            .read()
            .map_err(|_| HemaError::Internal("model slot lock poisoned".to_string()))?;
        Ok(slot.clone())
    }

    /// 对归一化张量执行推理
    ///
    /// CPU 密集，应在阻塞线程池中调用。
    pub fn classify(&self, tensor: &ImageTensor) -> Result<InferenceResult> {
        let model = self.model()?;

        if !tensor.matches(&self.config.input) {
            return Err(HemaError::inference(format!(
                "tensor shape {:?} does not match model input {:?}",
                tensor.shape(),
                self.config.input.shape()
            )));
        }

        let raw = model.backend.forward(tensor)?;
        let probabilities = match self.config.activation {
            OutputActivation::Probabilities => raw,
            OutputActivation::Logits => softmax(&raw),
        };

        let result = InferenceResult::new(
            probabilities,
            self.config.labels.clone(),
            model.version.clone(),
        )?;

        debug!(
            inference_id = %result.id(),
            top_class = result.top_label(),
            probability = result.top_probability(),
            version = %model.version,
            "Inference completed"
        );
        Ok(result)
    }
}

impl std::fmt::Debug for ClassifierAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassifierAdapter")
            .field("config", &self.config)
            .field("loaded", &self.is_loaded())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ModelArtifact;
    use crate::backend::BackendError;
    use hema_core::ChannelFormat;
    use std::path::PathBuf;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    struct FixedBackend(Vec<f32>);

    impl ModelBackend for FixedBackend {
        fn forward(&self, _tensor: &ImageTensor) -> std::result::Result<Vec<f32>, BackendError> {
            Ok(self.0.clone())
        }
    }

    struct SlowLoader {
        output: Vec<f32>,
        calls: AtomicUsize,
    }

    impl ModelLoader for SlowLoader {
        fn load(&self, _artifact: &ModelArtifact) -> Result<Box<dyn ModelBackend>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            Ok(Box::new(FixedBackend(self.output.clone())))
        }
    }

    struct FailingLoader;

    impl ModelLoader for FailingLoader {
        fn load(&self, _artifact: &ModelArtifact) -> Result<Box<dyn ModelBackend>> {
            Err(HemaError::Internal("corrupt weights".to_string()))
        }
    }

    fn spec() -> TensorSpec {
        TensorSpec {
            height: 4,
            width: 4,
            format: ChannelFormat::Grayscale,
        }
    }

    fn config(dir: &tempfile::TempDir, activation: OutputActivation) -> ModelConfig {
        let path = dir.path().join("model.onnx");
        std::fs::write(&path, b"frozen weights").unwrap();
        ModelConfig {
            path,
            version_label: "test-v1".to_string(),
            input: spec(),
            labels: vec!["myeloblast".to_string(), "monocyte".to_string()],
            activation,
            intra_threads: 1,
        }
    }

    fn tensor() -> ImageTensor {
        ImageTensor::new(spec().shape(), vec![0.5; 16]).unwrap()
    }

    fn adapter(dir: &tempfile::TempDir, output: Vec<f32>) -> (Arc<ClassifierAdapter>, Arc<SlowLoader>) {
        let loader = Arc::new(SlowLoader {
            output,
            calls: AtomicUsize::new(0),
        });
        let adapter = ClassifierAdapter::new(config(dir, OutputActivation::Probabilities), loader.clone()).unwrap();
        (Arc::new(adapter), loader)
    }

    #[test]
    fn test_lazy_load_on_first_classify() {
        let dir = tempfile::tempdir().unwrap();
        let (adapter, loader) = adapter(&dir, vec![0.92, 0.08]);
        assert!(!adapter.is_loaded());

        let result = adapter.classify(&tensor()).unwrap();
        assert_eq!(result.top_label(), "myeloblast");
        assert_eq!(result.model_version().label, "test-v1");
        assert!(adapter.is_loaded());

        adapter.classify(&tensor()).unwrap();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_first_use_loads_once() {
        let dir = tempfile::tempdir().unwrap();
        let (adapter, loader) = adapter(&dir, vec![0.3, 0.7]);
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let adapter = Arc::clone(&adapter);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    adapter.classify(&tensor()).unwrap()
                })
            })
            .collect();

        let versions: Vec<ModelVersion> = handles
            .into_iter()
            .map(|h| h.join().unwrap().model_version().clone())
            .collect();

        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.load_count(), 1);
        assert!(versions.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_shape_mismatch_is_non_transient_inference_error() {
        let dir = tempfile::tempdir().unwrap();
        let (adapter, _) = adapter(&dir, vec![0.5, 0.5]);
        let wrong = ImageTensor::new([1, 2, 2, 1], vec![0.0; 4]).unwrap();

        let err = adapter.classify(&wrong).unwrap_err();
        assert!(matches!(err, HemaError::Inference { transient: false, .. }));
    }

    #[test]
    fn test_invalid_model_output_is_inference_error() {
        let dir = tempfile::tempdir().unwrap();
        let (adapter, _) = adapter(&dir, vec![0.9, 0.9]);
        assert!(matches!(
            adapter.classify(&tensor()),
            Err(HemaError::Inference { .. })
        ));
    }

    #[test]
    fn test_logits_are_softmaxed() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(SlowLoader {
            output: vec![3.0, -1.0],
            calls: AtomicUsize::new(0),
        });
        let adapter = ClassifierAdapter::new(config(&dir, OutputActivation::Logits), loader).unwrap();

        let result = adapter.classify(&tensor()).unwrap();
        let sum: f32 = result.probabilities().iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert_eq!(result.top_class(), 0);
    }

    #[test]
    fn test_missing_model_file_is_unavailable() {
        let loader = Arc::new(SlowLoader {
            output: vec![0.5, 0.5],
            calls: AtomicUsize::new(0),
        });
        let config = ModelConfig {
            path: PathBuf::from("/nonexistent/model.onnx"),
            ..Default::default()
        };
        let adapter = ClassifierAdapter::new(config, loader.clone()).unwrap();

        assert!(matches!(adapter.warm_up(), Err(HemaError::ModelUnavailable(_))));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_loader_failure_is_unavailable_and_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = ClassifierAdapter::new(
            config(&dir, OutputActivation::Probabilities),
            Arc::new(FailingLoader),
        )
        .unwrap();

        assert!(matches!(adapter.classify(&tensor()), Err(HemaError::ModelUnavailable(_))));
        assert!(!adapter.is_loaded());
        assert_eq!(adapter.load_count(), 0);
    }

    #[test]
    fn test_teardown_makes_model_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let (adapter, _) = adapter(&dir, vec![0.5, 0.5]);
        adapter.warm_up().unwrap();
        assert!(adapter.is_loaded());

        adapter.teardown();
        assert!(!adapter.is_loaded());
        assert!(matches!(
            adapter.classify(&tensor()),
            Err(HemaError::ModelUnavailable(_))
        ));
    }
}
