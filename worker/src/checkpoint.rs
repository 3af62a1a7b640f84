use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::Write,
    path::{Path, PathBuf},
    str::FromStr,
};

use log::{debug, info, warn};
use machine_learning::{
    arch::ParamLayout,
    optimization::{Optimizer, OptimizerKind, OptimizerState},
    precision::GradScaler,
};
use safetensors::{Dtype, SafeTensors, serialize, tensor::TensorView};
use tempfile::NamedTempFile;

use crate::{
    Result, WorkerErr,
    config::{CheckpointConfig, RunConfig},
    engine::StepEngine,
    group::ProcessGroup,
    progress::TrainingProgress,
};

/// The artifact overwritten at the end of every epoch.
pub const LATEST: &str = "model_final.safetensors";
/// The artifact overwritten whenever validation accuracy improves.
pub const BEST: &str = "model.safetensors";

const STATE_DICT: &str = "state_dict.";
const OPTIMIZER: &str = "optimizer.";
/// Prefixes wrappers add to parameter names, dropped on load.
const WRAPPER_PREFIXES: &[&str] = &["module.", "backbone."];

/// Borrowed view of everything that goes into a checkpoint.
#[derive(Clone, Copy)]
pub struct Snapshot<'a> {
    pub layout: &'a ParamLayout,
    pub params: &'a [f32],
    pub optimizer: Option<&'a dyn Optimizer>,
    pub scaler: Option<&'a GradScaler>,
    pub progress: TrainingProgress,
    pub config: &'a RunConfig,
}

/// A tensor read back from a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// The contents of a checkpoint file.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    /// Parameter tensors by their stored name.
    pub state_dict: BTreeMap<String, StoredTensor>,
    pub optimizer: Option<OptimizerState>,
    pub scaler: Option<(f32, u32)>,
    /// Missing fields read as zero.
    pub progress: TrainingProgress,
    pub config: Option<RunConfig>,
}

/// How the stored tensors matched the model's parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    /// Model parameters the checkpoint has no tensor for.
    pub missing: Vec<String>,
    /// Stored tensors the model has no parameter for.
    pub unexpected: Vec<String>,
    /// Names present on both sides with different shapes.
    pub mismatched: Vec<String>,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }
}

/// Drops every wrapper prefix from a parameter name.
pub fn normalize_name(mut name: &str) -> &str {
    while let Some(rest) = WRAPPER_PREFIXES
        .iter()
        .find_map(|prefix| name.strip_prefix(prefix))
    {
        name = rest;
    }
    name
}

/// Writes `snapshot` to `path` atomically.
///
/// The bytes go to a temporary file next to `path` which is synced and then renamed over
/// it, so `path` always holds either the previous or the new checkpoint.
pub fn write(path: &Path, snapshot: &Snapshot<'_>) -> Result<()> {
    if snapshot.params.len() != snapshot.layout.size() {
        return Err(WorkerErr::LengthMismatch {
            rank: 0,
            got: snapshot.params.len(),
            expected: snapshot.layout.size(),
        });
    }

    let optimizer = snapshot.optimizer.map(|o| o.state());

    let mut tensors: Vec<(String, Vec<usize>, Vec<u8>)> = snapshot
        .layout
        .entries()
        .iter()
        .map(|entry| {
            let name = format!("{STATE_DICT}{}", entry.name);
            (name, entry.shape.clone(), encode(&snapshot.params[entry.range.clone()]))
        })
        .collect();

    let mut metadata = HashMap::from([
        ("epoch".to_string(), snapshot.progress.epoch.to_string()),
        ("best_acc".to_string(), snapshot.progress.best_acc.to_string()),
        ("best_epoch".to_string(), snapshot.progress.best_epoch.to_string()),
        ("run_config".to_string(), serde_json::to_string(snapshot.config)?),
    ]);

    if let Some(state) = &optimizer {
        metadata.insert("optimizer.kind".into(), state.kind.as_str().into());
        metadata.insert("optimizer.step".into(), state.step.to_string());

        for (name, buf) in &state.buffers {
            tensors.push((format!("{OPTIMIZER}{name}"), vec![buf.len()], encode(buf)));
        }
    }

    if let Some(scaler) = snapshot.scaler {
        metadata.insert("scaler.scale".into(), scaler.scale().to_string());
        metadata.insert("scaler.stable_steps".into(), scaler.stable_steps().to_string());
    }

    let views = tensors
        .iter()
        .map(|(name, shape, data)| {
            let view = TensorView::new(Dtype::F32, shape.clone(), data)?;
            Ok::<_, WorkerErr>((name.as_str(), view))
        })
        .collect::<Result<Vec<_>>>()?;
    let bytes = serialize(views, &Some(metadata))?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    debug!(bytes = bytes.len(); "wrote checkpoint {}", path.display());
    Ok(())
}

/// Reads the checkpoint at `path`.
///
/// Tensors without the `state_dict.` or `optimizer.` prefix are taken as parameters, so
/// plain weight files load too.
pub fn read(path: &Path) -> Result<Checkpoint> {
    let bytes = fs::read(path).map_err(|e| {
        WorkerErr::Checkpoint(format!("can't read {}: {e}", path.display()))
    })?;

    let tensors = SafeTensors::deserialize(&bytes)?;
    let (_, header) = SafeTensors::read_metadata(&bytes)?;
    let metadata = header.metadata().clone().unwrap_or_default();

    let mut state_dict = BTreeMap::new();
    let mut buffers = Vec::new();

    for (name, view) in tensors.tensors() {
        if view.dtype() != Dtype::F32 {
            return Err(WorkerErr::Checkpoint(format!(
                "tensor {name} in {} is {:?}, expected F32",
                path.display(),
                view.dtype()
            )));
        }

        let data = decode(view.data());
        if let Some(buffer) = name.strip_prefix(OPTIMIZER) {
            buffers.push((buffer.to_string(), data));
        } else {
            let key = name.strip_prefix(STATE_DICT).unwrap_or(&name).to_string();
            let shape = view.shape().to_vec();
            state_dict.insert(key, StoredTensor { shape, data });
        }
    }

    let optimizer = match metadata.get("optimizer.kind") {
        Some(kind) => {
            let kind = OptimizerKind::parse(kind).ok_or_else(|| {
                WorkerErr::Checkpoint(format!("unknown optimizer {kind:?} in {}", path.display()))
            })?;
            Some(OptimizerState {
                kind,
                step: parse_meta(&metadata, "optimizer.step")?.unwrap_or(0),
                buffers,
            })
        }
        None => None,
    };

    let scaler = match (
        parse_meta::<f32>(&metadata, "scaler.scale")?,
        parse_meta::<u32>(&metadata, "scaler.stable_steps")?,
    ) {
        (Some(scale), Some(steps)) => Some((scale, steps)),
        _ => None,
    };

    let progress = TrainingProgress {
        epoch: parse_meta(&metadata, "epoch")?.unwrap_or(0),
        best_acc: parse_meta(&metadata, "best_acc")?.unwrap_or(0.),
        best_epoch: parse_meta(&metadata, "best_epoch")?.unwrap_or(0),
    };

    let config: Option<RunConfig> = metadata
        .get("run_config")
        .map(|json| serde_json::from_str(json))
        .transpose()?;

    Ok(Checkpoint {
        state_dict,
        optimizer,
        scaler,
        progress,
        config,
    })
}

impl Checkpoint {
    /// Copies every stored tensor whose normalized name and shape match a model parameter.
    ///
    /// # Arguments
    /// * `layout` - The model's parameter layout.
    /// * `params` - The model's parameters.
    /// * `strict` - Fail unless every parameter and every stored tensor matched.
    ///
    /// # Returns
    /// What matched. In strict mode `params` is left untouched on failure.
    pub fn load_weights(
        &self,
        layout: &ParamLayout,
        params: &mut [f32],
        strict: bool,
    ) -> Result<LoadReport> {
        if params.len() != layout.size() {
            return Err(WorkerErr::LengthMismatch {
                rank: 0,
                got: params.len(),
                expected: layout.size(),
            });
        }

        let mut stored: HashMap<&str, &StoredTensor> = self
            .state_dict
            .iter()
            .map(|(name, tensor)| (normalize_name(name), tensor))
            .collect();

        let mut report = LoadReport::default();
        let mut matches = Vec::new();

        for entry in layout.entries() {
            match stored.remove(entry.name.as_str()) {
                Some(tensor)
                    if tensor.shape == entry.shape && tensor.data.len() == entry.range.len() =>
                {
                    matches.push((entry.range.clone(), tensor));
                    report.loaded.push(entry.name.clone());
                }
                Some(_) => report.mismatched.push(entry.name.clone()),
                None => report.missing.push(entry.name.clone()),
            }
        }

        report.unexpected = stored.into_keys().map(String::from).collect();
        report.unexpected.sort();

        if strict && !report.is_complete() {
            return Err(WorkerErr::Checkpoint(format!(
                "weights don't match the model: missing {:?}, unexpected {:?}, mismatched {:?}",
                report.missing, report.unexpected, report.mismatched
            )));
        }

        for (range, tensor) in matches {
            params[range].copy_from_slice(&tensor.data);
        }

        Ok(report)
    }
}

/// Initializes `engine` from the configured pretrained weights and resume checkpoint.
///
/// Pretrained weights must match the model exactly. A resume checkpoint is loaded
/// leniently: whatever matches is copied and the rest is reported. Its optimizer state is
/// restored only if it was made by the same algorithm for the same parameters.
///
/// # Returns
/// The progress to continue from, zeroed if there's nothing to resume.
pub fn restore(config: &RunConfig, engine: &mut StepEngine) -> Result<TrainingProgress> {
    let layout = engine.model().layout().clone();

    if let Some(path) = &config.checkpoint.pretrained {
        read(path)?.load_weights(&layout, engine.params_mut(), true)?;
        info!("using pretrained weights from {}", path.display());
    }

    let Some(path) = &config.checkpoint.resume else {
        return Ok(TrainingProgress::new());
    };

    let checkpoint = read(path)?;
    match &checkpoint.config {
        Some(stored) => {
            for section in config.drift(stored)? {
                warn!("{section} differs from the checkpoint's run, using the current value");
            }
        }
        None => debug!("checkpoint {} carries no run configuration", path.display()),
    }

    let report = checkpoint.load_weights(&layout, engine.params_mut(), false)?;
    if !report.is_complete() {
        warn!(
            loaded = report.loaded.len();
            "partially loaded {}: missing {:?}, unexpected {:?}, mismatched {:?}",
            path.display(),
            report.missing,
            report.unexpected,
            report.mismatched
        );
    }

    match checkpoint.optimizer {
        Some(state) if state.kind == engine.optimizer().kind() => {
            if let Err(e) = engine.optimizer_mut().load_state(state) {
                warn!("starting from a fresh optimizer: {e}");
            }
        }
        Some(state) => warn!(
            "checkpoint optimizer is {}, this run uses {}, starting from a fresh optimizer",
            state.kind.as_str(),
            engine.optimizer().kind().as_str()
        ),
        None => {}
    }

    if let (Some(scaler), Some((scale, steps))) = (engine.scaler_mut(), checkpoint.scaler) {
        scaler.restore(scale, steps);
    }

    let progress = checkpoint.progress;
    info!(
        epoch = progress.epoch,
        best_acc = progress.best_acc;
        "loaded checkpoint {}",
        path.display()
    );
    Ok(progress)
}

/// Writes the run's checkpoints from rank 0 while the other ranks wait.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    enabled: bool,
}

impl CheckpointManager {
    pub fn new(config: &CheckpointConfig) -> Self {
        Self {
            dir: config.run_dir.clone(),
            enabled: config.save,
        }
    }

    pub fn latest_path(&self) -> PathBuf {
        self.dir.join(LATEST)
    }

    pub fn best_path(&self) -> PathBuf {
        self.dir.join(BEST)
    }

    /// Saves the latest checkpoint, and the best one if `improved`.
    ///
    /// Only rank 0 writes, every rank returns after the write is complete. A failed write
    /// fails the whole group.
    pub async fn save(
        &self,
        group: &mut ProcessGroup,
        snapshot: &Snapshot<'_>,
        improved: bool,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if group.is_primary() {
            let written = self.write_files(snapshot, improved);
            if let Err(e) = &written {
                group.abort(e).await;
                return written;
            }
        }

        group.barrier().await
    }

    fn write_files(&self, snapshot: &Snapshot<'_>, improved: bool) -> Result<()> {
        write(&self.latest_path(), snapshot)?;

        if improved {
            write(&self.best_path(), snapshot)?;
            info!(
                best_acc = snapshot.progress.best_acc;
                "saved new best model to {}",
                self.best_path().display()
            );
        }
        Ok(())
    }
}

fn encode(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn parse_meta<T: FromStr>(metadata: &HashMap<String, String>, key: &str) -> Result<Option<T>> {
    metadata
        .get(key)
        .map(|raw| {
            raw.parse().map_err(|_| {
                WorkerErr::Checkpoint(format!("metadata {key} = {raw:?} can't be parsed"))
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use machine_learning::optimization::OptimizerSpec;

    use super::*;

    fn layout() -> ParamLayout {
        let mut layout = ParamLayout::new();
        layout.push("layers.0.weight", &[2, 3]);
        layout.push("layers.0.bias", &[3]);
        layout
    }

    fn params() -> Vec<f32> {
        (0..9).map(|i| i as f32 * 0.25 - 1.).collect()
    }

    #[test]
    fn round_trip_restores_progress_and_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LATEST);

        let layout = layout();
        let params = params();
        let config = RunConfig::default();
        let mut optimizer = OptimizerSpec {
            learning_rate: 0.1,
            ..config.optimizer
        }
        .build(params.len());
        let mut updated = params.clone();
        optimizer.update_params(&[1.; 9], &mut updated).unwrap();
        let scaler = GradScaler::default();

        let progress = TrainingProgress {
            epoch: 7,
            best_acc: 0.83,
            best_epoch: 5,
        };
        let snapshot = Snapshot {
            layout: &layout,
            params: &params,
            optimizer: Some(optimizer.as_ref()),
            scaler: Some(&scaler),
            progress,
            config: &config,
        };
        write(&path, &snapshot).unwrap();

        let checkpoint = read(&path).unwrap();
        assert_eq!(checkpoint.progress, progress);
        assert_eq!(checkpoint.config.as_ref(), Some(&config));
        assert_eq!(checkpoint.optimizer, Some(optimizer.state()));
        assert_eq!(checkpoint.scaler, Some((65536., 0)));

        let mut restored = vec![0.; 9];
        let report = checkpoint.load_weights(&layout, &mut restored, true).unwrap();
        assert!(report.is_complete());
        assert_eq!(restored, params);
    }

    #[test]
    fn wrapper_prefixes_are_stripped() {
        assert_eq!(normalize_name("module.layers.0.bias"), "layers.0.bias");
        assert_eq!(normalize_name("module.backbone.layers.0.bias"), "layers.0.bias");
        assert_eq!(normalize_name("layers.0.bias"), "layers.0.bias");

        let data = params();
        let checkpoint = Checkpoint {
            state_dict: BTreeMap::from([
                (
                    "module.layers.0.weight".to_string(),
                    StoredTensor {
                        shape: vec![2, 3],
                        data: data[..6].to_vec(),
                    },
                ),
                (
                    "backbone.layers.0.bias".to_string(),
                    StoredTensor {
                        shape: vec![3],
                        data: data[6..].to_vec(),
                    },
                ),
            ]),
            optimizer: None,
            scaler: None,
            progress: TrainingProgress::new(),
            config: None,
        };

        let mut restored = vec![0.; 9];
        checkpoint.load_weights(&layout(), &mut restored, true).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn partial_loads_are_reported_and_strict_loads_fail() {
        let checkpoint = Checkpoint {
            state_dict: BTreeMap::from([
                (
                    "layers.0.weight".to_string(),
                    StoredTensor {
                        shape: vec![3, 2],
                        data: vec![1.; 6],
                    },
                ),
                (
                    "layers.0.bias".to_string(),
                    StoredTensor {
                        shape: vec![3],
                        data: vec![2.; 3],
                    },
                ),
                (
                    "head.weight".to_string(),
                    StoredTensor {
                        shape: vec![1],
                        data: vec![3.],
                    },
                ),
            ]),
            optimizer: None,
            scaler: None,
            progress: TrainingProgress::new(),
            config: None,
        };

        let mut params = vec![0.; 9];
        assert!(checkpoint.load_weights(&layout(), &mut params, true).is_err());
        assert_eq!(params, vec![0.; 9]);

        let report = checkpoint.load_weights(&layout(), &mut params, false).unwrap();
        assert_eq!(report.loaded, ["layers.0.bias"]);
        assert_eq!(report.mismatched, ["layers.0.weight"]);
        assert_eq!(report.unexpected, ["head.weight"]);
        assert_eq!(&params[6..], &[2.; 3]);
        assert_eq!(&params[..6], &[0.; 6]);
    }

    #[test]
    fn missing_progress_fields_read_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");

        let data = encode(&[1., 2.]);
        let view = TensorView::new(Dtype::F32, vec![2], &data).unwrap();
        let bytes = serialize([("layers.0.bias", view)], &None).unwrap();
        fs::write(&path, bytes).unwrap();

        let checkpoint = read(&path).unwrap();
        assert_eq!(checkpoint.progress, TrainingProgress::new());
        assert_eq!(checkpoint.optimizer, None);
        assert_eq!(checkpoint.state_dict["layers.0.bias"].data, [1., 2.]);
    }

    #[test]
    fn a_failed_write_keeps_the_previous_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LATEST);

        let layout = layout();
        let config = RunConfig::default();
        let first = params();
        let snapshot = Snapshot {
            layout: &layout,
            params: &first,
            optimizer: None,
            scaler: None,
            progress: TrainingProgress::new(),
            config: &config,
        };
        write(&path, &snapshot).unwrap();

        let short = vec![0.; 3];
        let broken = Snapshot {
            params: &short,
            ..snapshot
        };
        assert!(write(&path, &broken).is_err());

        let mut restored = vec![0.; 9];
        read(&path)
            .unwrap()
            .load_weights(&layout, &mut restored, true)
            .unwrap();
        assert_eq!(restored, first);
    }

    #[tokio::test]
    async fn disabled_manager_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(&CheckpointConfig {
            run_dir: dir.path().to_path_buf(),
            save: false,
            resume: None,
            pretrained: None,
        });

        let layout = layout();
        let params = params();
        let config = RunConfig::default();
        let snapshot = Snapshot {
            layout: &layout,
            params: &params,
            optimizer: None,
            scaler: None,
            progress: TrainingProgress::new(),
            config: &config,
        };

        manager
            .save(&mut ProcessGroup::solo(), &snapshot, true)
            .await
            .unwrap();
        assert!(!manager.latest_path().exists());
        assert!(!manager.best_path().exists());
    }
}
