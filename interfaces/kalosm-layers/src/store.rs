//! Named parameter storage.
//!
//! A [`ParameterStore`] owns every parameter of a model. Parameters are declared through a [`Scope`], which
//! tracks the hierarchical name prefix the same way a candle `VarBuilder` does:
//!
//! ```rust
//! use candle_core::Device;
//! use kalosm_layers::{ParameterConfig, ParameterStore};
//!
//! let store = ParameterStore::new(&Device::Cpu);
//! let layer = store.scope("cnn").pp("layer_0");
//! let w = layer.declare("w", &ParameterConfig::new([3, 3, 3, 8])).unwrap();
//! assert_eq!(w.name(), "cnn.layer_0.w");
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use candle_core::{DType, Device, Tensor, Var};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::{InitParams, Initializer, LayerError, Result};

/// The seed random initializers start from unless [`ParameterStore::with_seed`] is used.
pub const DEFAULT_SEED: u64 = 1;

/// Where the storage of a parameter lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageLocation {
    /// Host memory, regardless of the device the model computes on.
    #[default]
    Cpu,
    /// The compute device of the store.
    Compute,
}

/// What a declaration does when the name already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReusePolicy {
    /// Always create a new parameter. An existing name is a [`LayerError::NamingCollision`].
    #[default]
    Create,
    /// Return the existing parameter. A missing name is a [`LayerError::MissingParameter`].
    Reuse,
    /// Return the existing parameter if there is one, otherwise create it.
    CreateOrReuse,
}

/// The settings of a parameter declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterConfig {
    /// The shape of the parameter. Every dimension must be positive.
    pub shape: Vec<usize>,
    /// How the initial value is generated.
    ///
    /// Default: [`Initializer::Zeros`]
    pub initializer: Initializer,
    /// Default: [`DType::F32`]
    pub dtype: DType,
    /// The coefficient of the L2 penalty registered for this parameter. Only positive values register a penalty.
    ///
    /// Default: None
    pub weight_decay: Option<f64>,
    /// Default: true
    pub trainable: bool,
    /// Default: [`ReusePolicy::Create`]
    pub reuse: ReusePolicy,
}

impl ParameterConfig {
    /// Create a config for a zero initialized, trainable `f32` parameter.
    pub fn new(shape: impl Into<Vec<usize>>) -> Self {
        Self {
            shape: shape.into(),
            initializer: Initializer::Zeros,
            dtype: DType::F32,
            weight_decay: None,
            trainable: true,
            reuse: ReusePolicy::Create,
        }
    }

    /// Set the initializer.
    pub fn with_initializer(mut self, initializer: Initializer) -> Self {
        self.initializer = initializer;
        self
    }

    /// Set the initializer from its method name. See [`Initializer::from_method`].
    pub fn with_init_method(self, method: Option<&str>, params: &InitParams) -> Result<Self> {
        Ok(self.with_initializer(Initializer::from_method(method, params)?))
    }

    /// Set the data type.
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Set the weight decay coefficient.
    pub fn with_weight_decay(mut self, weight_decay: Option<f64>) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    /// Set whether the optimizer may update the parameter.
    pub fn with_trainable(mut self, trainable: bool) -> Self {
        self.trainable = trainable;
        self
    }

    /// Set the reuse policy.
    pub fn with_reuse(mut self, reuse: ReusePolicy) -> Self {
        self.reuse = reuse;
        self
    }
}

/// A handle to a declared parameter.
///
/// Cloning the handle shares the storage of the parameter.
#[derive(Debug, Clone)]
pub struct Parameter {
    name: String,
    var: Var,
    trainable: bool,
    weight_decay: Option<f64>,
    storage: StorageLocation,
}

impl Parameter {
    /// The full name of the parameter, including its scope.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The variable backing this parameter.
    pub fn var(&self) -> &Var {
        &self.var
    }

    /// The current value of the parameter on its storage device.
    pub fn as_tensor(&self) -> &Tensor {
        self.var.as_tensor()
    }

    /// The shape of the parameter.
    pub fn dims(&self) -> &[usize] {
        self.var.dims()
    }

    /// Whether the optimizer may update the parameter.
    pub fn trainable(&self) -> bool {
        self.trainable
    }

    /// The weight decay coefficient, if a penalty was registered.
    pub fn weight_decay(&self) -> Option<f64> {
        self.weight_decay
    }

    /// Where the storage of the parameter lives.
    pub fn storage(&self) -> StorageLocation {
        self.storage
    }

    /// The value of the parameter for use on `device`.
    ///
    /// Non trainable parameters are detached so no gradient flows into them.
    pub fn on(&self, device: &Device) -> Result<Tensor> {
        let tensor = if self.trainable {
            self.var.as_tensor().clone()
        } else {
            self.var.as_tensor().detach()
        };
        Ok(tensor.to_device(device)?)
    }

    /// Overwrite the value of the parameter.
    pub fn set(&self, value: &Tensor) -> Result<()> {
        if value.dims() != self.dims() {
            return Err(LayerError::ShapeMismatch {
                name: self.name.clone(),
                expected: self.dims().to_vec(),
                actual: value.dims().to_vec(),
            });
        }
        let value = value
            .to_device(self.var.device())?
            .to_dtype(self.var.dtype())?;
        self.var.set(&value)?;
        Ok(())
    }

    /// The registered L2 penalty `0.5 * weight_decay * sum(value^2)`, if any.
    pub fn l2_penalty(&self) -> Result<Option<Tensor>> {
        let Some(weight_decay) = self.weight_decay else {
            return Ok(None);
        };
        let squared_sum = self.var.as_tensor().sqr()?.sum_all()?;
        Ok(Some(squared_sum.affine(0.5 * weight_decay, 0.0)?))
    }
}

#[derive(Debug)]
struct StoreInner {
    parameters: HashMap<String, Parameter>,
    order: Vec<String>,
    rng: StdRng,
}

/// Owns every parameter and every moving average of a model.
///
/// The store is cheap to clone; clones share the same parameters.
#[derive(Debug, Clone)]
pub struct ParameterStore {
    inner: Arc<Mutex<StoreInner>>,
    device: Device,
    placement: StorageLocation,
}

impl ParameterStore {
    /// Create an empty store for a model that computes on `device`.
    pub fn new(device: &Device) -> Self {
        Self::with_seed(device, DEFAULT_SEED)
    }

    /// Create an empty store whose random initializers start from `seed`.
    pub fn with_seed(device: &Device, seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                parameters: HashMap::new(),
                order: Vec::new(),
                rng: StdRng::seed_from_u64(seed),
            })),
            device: device.clone(),
            placement: StorageLocation::Cpu,
        }
    }

    /// Set where parameters declared from now on are stored.
    pub fn with_placement(mut self, placement: StorageLocation) -> Self {
        self.placement = placement;
        self
    }

    /// The device the model computes on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The device new parameters are allocated on.
    pub fn storage_device(&self) -> Device {
        match self.placement {
            StorageLocation::Cpu => Device::Cpu,
            StorageLocation::Compute => self.device.clone(),
        }
    }

    /// The scope with an empty prefix.
    pub fn root(&self) -> Scope<'_> {
        Scope {
            store: self,
            path: Vec::new(),
        }
    }

    /// A top level scope.
    pub fn scope(&self, name: impl ToString) -> Scope<'_> {
        self.root().pp(name)
    }

    /// Look up a parameter by its full name.
    pub fn get(&self, name: &str) -> Option<Parameter> {
        self.lock().parameters.get(name).cloned()
    }

    /// Check if a parameter with the full name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.lock().parameters.contains_key(name)
    }

    /// The number of declared parameters.
    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    /// Check if no parameter was declared yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every parameter in declaration order.
    pub fn parameters(&self) -> Vec<Parameter> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|name| inner.parameters.get(name).cloned())
            .collect()
    }

    /// The variables of every trainable parameter, ready to hand to a candle optimizer.
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.parameters()
            .into_iter()
            .filter(Parameter::trainable)
            .map(|parameter| parameter.var)
            .collect()
    }

    /// The sum of every registered L2 penalty on the compute device, or `None` if no parameter has weight decay.
    pub fn regularization_loss(&self) -> Result<Option<Tensor>> {
        let mut total: Option<Tensor> = None;
        for parameter in self.parameters() {
            if let Some(penalty) = parameter.l2_penalty()? {
                let penalty = penalty.to_device(&self.device)?.to_dtype(DType::F32)?;
                total = Some(match total {
                    Some(total) => total.add(&penalty)?,
                    None => penalty,
                });
            }
        }
        Ok(total)
    }

    /// Save the value of every parameter to a safetensors file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let tensors = self
            .parameters()
            .into_iter()
            .map(|parameter| (parameter.name.clone(), parameter.as_tensor().clone()))
            .collect::<HashMap<_, _>>();
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    /// Load parameter values from a safetensors file into the declared parameters.
    ///
    /// Tensors without a declared parameter are skipped.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
        for (name, tensor) in tensors {
            match self.get(&name) {
                Some(parameter) => parameter.set(&tensor)?,
                None => tracing::warn!("Skipping '{name}'; no parameter with that name is declared"),
            }
        }
        Ok(())
    }

    fn declare(&self, name: String, config: &ParameterConfig) -> Result<Parameter> {
        if config.shape.is_empty() || config.shape.contains(&0) {
            return Err(LayerError::InvalidArgument(format!(
                "parameter '{name}' needs a non-empty shape of positive sizes, got {:?}",
                config.shape
            )));
        }
        if config.dtype != DType::F32 {
            tracing::warn!("Not using f32, currently using {:?}", config.dtype);
        }

        let mut inner = self.lock();
        if let Some(existing) = inner.parameters.get(&name) {
            return match config.reuse {
                ReusePolicy::Create => Err(LayerError::NamingCollision(name)),
                ReusePolicy::Reuse | ReusePolicy::CreateOrReuse => {
                    if existing.dims() != config.shape.as_slice() {
                        return Err(LayerError::ShapeMismatch {
                            name,
                            expected: existing.dims().to_vec(),
                            actual: config.shape.clone(),
                        });
                    }
                    tracing::debug!("Reusing parameter {name}");
                    Ok(existing.clone())
                }
            };
        }
        if config.reuse == ReusePolicy::Reuse {
            return Err(LayerError::MissingParameter(name));
        }

        tracing::info!("Weight shape {:?}", config.shape);
        let weight_decay = match config.weight_decay {
            Some(weight_decay) if weight_decay > 0.0 => {
                tracing::info!("Weight decay {weight_decay}");
                Some(weight_decay)
            }
            _ => {
                tracing::warn!("No weight decay");
                None
            }
        };

        let initial = config.initializer.init(
            &config.shape,
            config.dtype,
            &self.storage_device(),
            &mut inner.rng,
        )?;
        let parameter = Parameter {
            name: name.clone(),
            var: Var::from_tensor(&initial)?,
            trainable: config.trainable,
            weight_decay,
            storage: self.placement,
        };
        inner.order.push(name.clone());
        inner.parameters.insert(name, parameter.clone());
        Ok(parameter)
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A name prefix inside a [`ParameterStore`].
///
/// Pushing a segment with [`Scope::pp`] returns a new scope; the parent is left untouched.
#[derive(Debug, Clone)]
pub struct Scope<'a> {
    store: &'a ParameterStore,
    path: Vec<String>,
}

impl<'a> Scope<'a> {
    /// A child scope with `name` appended to the prefix.
    pub fn pp(&self, name: impl ToString) -> Scope<'a> {
        let mut path = self.path.clone();
        path.push(name.to_string());
        Scope {
            store: self.store,
            path,
        }
    }

    /// The prefix of this scope, segments joined with `.`.
    pub fn path(&self) -> String {
        self.path.join(".")
    }

    /// The full name `name` resolves to inside this scope.
    pub fn full_name(&self, name: &str) -> String {
        let mut full_path = self.path();
        if !full_path.is_empty() {
            full_path.push('.');
        }
        full_path.push_str(name);
        full_path
    }

    /// The store this scope declares into.
    pub fn store(&self) -> &'a ParameterStore {
        self.store
    }

    /// The compute device of the store.
    pub fn device(&self) -> &'a Device {
        self.store.device()
    }

    /// Declare a parameter in this scope.
    pub fn declare(&self, name: &str, config: &ParameterConfig) -> Result<Parameter> {
        self.store.declare(self.full_name(name), config)
    }

    /// Look up a parameter declared in this scope.
    pub fn get(&self, name: &str) -> Option<Parameter> {
        self.store.get(&self.full_name(name))
    }
}

/// Declare a parameter from an initializer method name.
///
/// `init_method` is one of `None` or `"zeros"`, `"truncated_normal"`, `"uniform_scaling"`, `"constant"` or
/// `"xavier"`; any other name fails with [`LayerError::InvalidArgument`]. A positive `weight_decay`
/// registers an L2 penalty, see [`ParameterStore::regularization_loss`].
pub fn declare_parameter(
    scope: &Scope,
    name: &str,
    shape: &[usize],
    init_method: Option<&str>,
    init_params: &InitParams,
    weight_decay: Option<f64>,
    trainable: bool,
) -> Result<Parameter> {
    let config = ParameterConfig::new(shape)
        .with_init_method(init_method, init_params)?
        .with_weight_decay(weight_decay)
        .with_trainable(trainable);
    scope.declare(name, &config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn every_method_declares_the_requested_shape() {
        let store = ParameterStore::new(&Device::Cpu);
        let scope = store.scope("weights");
        let methods = [
            None,
            Some("truncated_normal"),
            Some("uniform_scaling"),
            Some("constant"),
            Some("xavier"),
        ];
        for (i, method) in methods.into_iter().enumerate() {
            let parameter = declare_parameter(
                &scope,
                &format!("w{i}"),
                &[3, 3, 2, 4],
                method,
                &InitParams::new(),
                None,
                true,
            )
            .unwrap();
            assert_eq!(parameter.dims(), &[3, 3, 2, 4]);
        }
        assert_eq!(store.len(), 5);
    }

    #[test]
    fn unknown_method_is_rejected() {
        let store = ParameterStore::new(&Device::Cpu);
        let err = declare_parameter(
            &store.root(),
            "w",
            &[2],
            Some("orthogonal"),
            &InitParams::new(),
            None,
            true,
        )
        .unwrap_err();
        assert!(matches!(err, LayerError::InvalidArgument(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn duplicate_names_collide() {
        let store = ParameterStore::new(&Device::Cpu);
        let scope = store.scope("bn");
        scope.declare("ema_mean", &ParameterConfig::new([4])).unwrap();
        let err = scope
            .declare("ema_mean", &ParameterConfig::new([4]))
            .unwrap_err();
        assert!(matches!(err, LayerError::NamingCollision(name) if name == "bn.ema_mean"));
    }

    #[test]
    fn same_name_in_other_scope_is_distinct() {
        let store = ParameterStore::new(&Device::Cpu);
        store.scope("a").declare("w", &ParameterConfig::new([2])).unwrap();
        store.scope("b").declare("w", &ParameterConfig::new([2])).unwrap();
        let names = store
            .parameters()
            .iter()
            .map(|p| p.name().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["a.w".to_string(), "b.w".to_string()]);
    }

    #[test]
    fn reuse_shares_storage() {
        let store = ParameterStore::new(&Device::Cpu);
        let scope = store.scope("shared");
        let first = scope.declare("w", &ParameterConfig::new([2])).unwrap();
        let second = scope
            .declare("w", &ParameterConfig::new([2]).with_reuse(ReusePolicy::Reuse))
            .unwrap();
        first
            .set(&Tensor::new(&[1f32, 2.], &Device::Cpu).unwrap())
            .unwrap();
        assert_eq!(
            second.as_tensor().to_vec1::<f32>().unwrap(),
            vec![1f32, 2.]
        );
    }

    #[test]
    fn reuse_checks_existence_and_shape() {
        let store = ParameterStore::new(&Device::Cpu);
        let scope = store.root();
        let missing = scope
            .declare("w", &ParameterConfig::new([2]).with_reuse(ReusePolicy::Reuse))
            .unwrap_err();
        assert!(matches!(missing, LayerError::MissingParameter(_)));

        scope
            .declare(
                "w",
                &ParameterConfig::new([2]).with_reuse(ReusePolicy::CreateOrReuse),
            )
            .unwrap();
        let mismatch = scope
            .declare(
                "w",
                &ParameterConfig::new([3]).with_reuse(ReusePolicy::CreateOrReuse),
            )
            .unwrap_err();
        assert!(matches!(mismatch, LayerError::ShapeMismatch { .. }));
    }

    #[test]
    fn zero_sized_shapes_are_rejected() {
        let store = ParameterStore::new(&Device::Cpu);
        let err = store
            .root()
            .declare("w", &ParameterConfig::new([3, 0]))
            .unwrap_err();
        assert!(matches!(err, LayerError::InvalidArgument(_)));
    }

    #[test]
    fn weight_decay_registers_l2_penalty() {
        let store = ParameterStore::new(&Device::Cpu);
        let scope = store.root();
        let config = ParameterConfig::new([2, 2])
            .with_initializer(Initializer::Constant { val: 2.0 })
            .with_weight_decay(Some(0.1));
        scope.declare("w", &config).unwrap();
        scope
            .declare("b", &ParameterConfig::new([2]).with_weight_decay(Some(0.0)))
            .unwrap();

        assert_eq!(store.get("b").unwrap().weight_decay(), None);
        let loss = store
            .regularization_loss()
            .unwrap()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((loss - 0.8).abs() < 1e-6);
    }

    #[test]
    fn no_weight_decay_means_no_loss() {
        let store = ParameterStore::new(&Device::Cpu);
        store.root().declare("w", &ParameterConfig::new([2])).unwrap();
        assert!(store.regularization_loss().unwrap().is_none());
    }

    #[test]
    fn parameters_are_stored_on_the_cpu() {
        let store = ParameterStore::new(&Device::Cpu);
        let parameter = store.root().declare("w", &ParameterConfig::new([2])).unwrap();
        assert_eq!(parameter.storage(), StorageLocation::Cpu);
        assert!(parameter.as_tensor().device().is_cpu());
    }

    #[test]
    fn trainable_vars_skip_frozen_parameters() {
        let store = ParameterStore::new(&Device::Cpu);
        let scope = store.root();
        scope.declare("w", &ParameterConfig::new([2])).unwrap();
        scope
            .declare("ema_mean", &ParameterConfig::new([2]).with_trainable(false))
            .unwrap();
        assert_eq!(store.trainable_vars().len(), 1);
    }

    #[test]
    fn non_f32_dtype_is_honored() {
        let store = ParameterStore::new(&Device::Cpu);
        let parameter = store
            .root()
            .declare("w", &ParameterConfig::new([2]).with_dtype(DType::F64))
            .unwrap();
        assert_eq!(parameter.as_tensor().dtype(), DType::F64);
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    // Runs `f` with a subscriber that records every event, and returns the recorded lines.
    fn record_logs(f: impl FnOnce()) -> String {
        let buffer = LogBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = buffer.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn declarations_warn_about_dtype_and_missing_weight_decay() {
        let store = ParameterStore::new(&Device::Cpu);
        let logs = record_logs(|| {
            store
                .root()
                .declare("w", &ParameterConfig::new([2]).with_dtype(DType::F64))
                .unwrap();
        });
        assert!(logs.contains("WARN"), "{logs}");
        assert!(logs.contains("Not using f32, currently using F64"), "{logs}");
        assert!(logs.contains("No weight decay"), "{logs}");

        let logs = record_logs(|| {
            store
                .root()
                .declare("zero", &ParameterConfig::new([2]).with_weight_decay(Some(0.0)))
                .unwrap();
        });
        assert!(logs.contains("No weight decay"), "{logs}");
        assert!(!logs.contains("Not using f32"), "{logs}");

        let logs = record_logs(|| {
            store
                .root()
                .declare("decayed", &ParameterConfig::new([2]).with_weight_decay(Some(0.5)))
                .unwrap();
        });
        assert!(logs.contains("Weight decay 0.5"), "{logs}");
        assert!(!logs.contains("No weight decay"), "{logs}");
    }

    #[test]
    fn same_seed_builds_the_same_model() {
        let config = ParameterConfig::new([8]).with_initializer(Initializer::Xavier);
        let first = ParameterStore::with_seed(&Device::Cpu, 7);
        let second = ParameterStore::with_seed(&Device::Cpu, 7);
        let a = first.root().declare("w", &config).unwrap();
        let b = second.root().declare("w", &config).unwrap();
        assert_eq!(
            a.as_tensor().to_vec1::<f32>().unwrap(),
            b.as_tensor().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn checkpoint_restores_values() {
        let path = std::env::temp_dir().join(format!(
            "kalosm-layers-checkpoint-{}.safetensors",
            std::process::id()
        ));
        let config = ParameterConfig::new([3]).with_initializer(Initializer::TruncatedNormal {
            mean: 0.0,
            stddev: 1.0,
        });

        let trained = ParameterStore::with_seed(&Device::Cpu, 3);
        trained.scope("mlp").declare("w", &config).unwrap();
        trained.save(&path).unwrap();

        let restored = ParameterStore::with_seed(&Device::Cpu, 4);
        restored.scope("mlp").declare("w", &config).unwrap();
        restored.load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(
            trained.get("mlp.w").unwrap().as_tensor().to_vec1::<f32>().unwrap(),
            restored.get("mlp.w").unwrap().as_tensor().to_vec1::<f32>().unwrap()
        );
    }
}
