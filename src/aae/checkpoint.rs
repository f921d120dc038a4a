use super::{config::TrainerConfig, discriminator::Discriminator, generator::Generator};
use crate::{learn::Summary, result::Result};
use anyhow::Context;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

/// The training state after an epoch.
///
/// The optimizer state is stored in the parameters of the networks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The config.
    pub config: TrainerConfig,
    /// The training summary.
    pub summary: Summary,
    /// The generator.
    pub generator: Generator,
    /// The discriminator.
    pub discriminator: Discriminator,
    /// Noise decoded into the sample images.
    pub fixed_noise: Array2<f32>,
}

impl Checkpoint {
    /// The file name of the checkpoint for `epoch`.
    pub fn file_name(epoch: usize) -> String {
        format!("checkpoint_{epoch:04}.json")
    }
    /// Saves the checkpoint into `dir` as [`Checkpoint::file_name()`] of the epoch, creating
    /// `dir` if necessary.
    ///
    /// Returns the path.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("Unable to create checkpoint dir {dir:?}!"))?;
        let path = dir.join(Self::file_name(self.summary.epoch()));
        let mut writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        Ok(path)
    }
    /// Loads a checkpoint from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("Unable to open checkpoint {path:?}!"))?;
        let checkpoint = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Unable to parse checkpoint {path:?}!"))?;
        Ok(checkpoint)
    }
}

fn parse_epoch(path: &Path) -> Option<usize> {
    path.file_name()?
        .to_str()?
        .strip_prefix("checkpoint_")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

/// The checkpoints in `dir`, sorted by epoch.
///
/// Returns an empty Vec if `dir` does not exist.
pub fn checkpoints(dir: impl AsRef<Path>) -> Result<Vec<(usize, PathBuf)>> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut checkpoints = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(epoch) = parse_epoch(&path) {
            checkpoints.push((epoch, path));
        }
    }
    checkpoints.sort();
    Ok(checkpoints)
}

/// The checkpoint with the highest epoch in `dir`.
pub fn latest_checkpoint(dir: impl AsRef<Path>) -> Result<Option<PathBuf>> {
    Ok(checkpoints(dir)?.pop().map(|(_, path)| path))
}

/// Removes all but the `retain` latest checkpoints in `dir`.
///
/// Checkpoints that can not be removed are skipped with a warning.
///
/// Returns the removed paths.
pub fn prune_checkpoints(dir: impl AsRef<Path>, retain: usize) -> Result<Vec<PathBuf>> {
    let checkpoints = checkpoints(dir)?;
    let remove = checkpoints.len().saturating_sub(retain);
    let mut removed = Vec::with_capacity(remove);
    for (_, path) in checkpoints.into_iter().take(remove) {
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!("Removed {path:?}.");
                removed.push(path);
            }
            Err(e) => tracing::warn!("Unable to remove checkpoint {path:?}: {e}"),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_epoch_from_file_name() {
        assert_eq!(Checkpoint::file_name(7), "checkpoint_0007.json");
        assert_eq!(parse_epoch(Path::new("a/checkpoint_0007.json")), Some(7));
        assert_eq!(parse_epoch(Path::new("checkpoint_12345.json")), Some(12345));
        assert_eq!(parse_epoch(Path::new("checkpoint_x.json")), None);
        assert_eq!(parse_epoch(Path::new("checkpoint_0001.json.tmp")), None);
        assert_eq!(parse_epoch(Path::new("epoch1_generator.png")), None);
    }

    #[test]
    fn prune_keeps_latest() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(checkpoints(dir.path().join("missing"))?.is_empty());
        for epoch in [3, 1, 10, 2] {
            fs::write(dir.path().join(Checkpoint::file_name(epoch)), "{}")?;
        }
        fs::write(dir.path().join("notes.txt"), "")?;
        let epochs: Vec<_> = checkpoints(dir.path())?.into_iter().map(|(e, _)| e).collect();
        assert_eq!(epochs, [1, 2, 3, 10]);
        let removed = prune_checkpoints(dir.path(), 2)?;
        assert_eq!(removed.len(), 2);
        let epochs: Vec<_> = checkpoints(dir.path())?.into_iter().map(|(e, _)| e).collect();
        assert_eq!(epochs, [3, 10]);
        assert_eq!(
            latest_checkpoint(dir.path())?,
            Some(dir.path().join(Checkpoint::file_name(10)))
        );
        assert!(dir.path().join("notes.txt").exists());
        assert!(prune_checkpoints(dir.path(), 5)?.is_empty());
        Ok(())
    }
}
