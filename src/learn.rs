use crate::result::Result;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Criteria / loss functions.
pub mod criterion;
/// Neural Networks.
pub mod neural_network;

/// Training statistics.
///
/// Accumulates the losses of each named loss over an epoch, weighted by batch size.
#[derive(Default, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    count: usize,
    losses: Vec<(String, f64)>,
}

impl Stats {
    /// Adds the mean `loss` of a batch of `batch_size` samples for `name`.
    ///
    /// Does not increment the count, see [`.add_count()`](Self::add_count).
    pub fn add_loss(&mut self, name: &str, batch_size: usize, loss: f32) {
        let loss = loss as f64 * batch_size as f64;
        if let Some((_, sum)) = self.losses.iter_mut().find(|(n, _)| n == name) {
            *sum += loss;
        } else {
            self.losses.push((name.to_string(), loss));
        }
    }
    /// Adds `batch_size` to the count.
    pub fn add_count(&mut self, batch_size: usize) {
        self.count += batch_size;
    }
    /// The number of samples.
    pub fn count(&self) -> usize {
        self.count
    }
    /// The mean loss for `name`.
    ///
    /// Returns None if `name` was not recorded or the count is 0.
    pub fn loss(&self, name: &str) -> Option<f32> {
        self.losses()
            .find(|(n, _)| *n == name)
            .map(|(_, loss)| loss)
    }
    /// Iterator over the names and mean losses.
    pub fn losses(&self) -> impl Iterator<Item = (&str, f32)> + '_ {
        let count = self.count;
        self.losses
            .iter()
            .filter(move |_| count > 0)
            .map(move |(name, sum)| (name.as_str(), (sum / count as f64) as f32))
    }
}

/// Summary of training.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct Summary {
    epoch: usize,
    epoch_time: Duration,
    total_time: Duration,
    train: Stats,
    history: Vec<Stats>,
}

impl Summary {
    /// Runs an epoch with `f`.
    ///
    /// Times `f`. If `f` returns `Ok`, updates the epoch time and accumulates the total time and the epoch. Otherwise returns the error.
    pub fn run_epoch<F>(&mut self, mut f: F) -> Result<Stats>
    where
        F: FnMut(&Self) -> Result<Stats>,
    {
        let start = Instant::now();
        let train = f(self)?;
        self.epoch_time = start.elapsed();
        self.total_time += self.epoch_time;
        self.epoch += 1;
        self.train = train.clone();
        self.history.push(train.clone());
        Ok(train)
    }
    /// The number of epochs completed.
    pub fn epoch(&self) -> usize {
        self.epoch
    }
    /// The duration of the last epoch.
    pub fn epoch_time(&self) -> Duration {
        self.epoch_time
    }
    /// The duration of all epochs.
    pub fn total_time(&self) -> Duration {
        self.total_time
    }
    /// The stats of the last epoch.
    pub fn train(&self) -> &Stats {
        &self.train
    }
    /// The stats of each epoch.
    pub fn history(&self) -> &[Stats] {
        &self.history
    }
}

/// Summerizes the trainer.
pub trait Summarize {
    /// Returns a summary.
    fn summarize(&self) -> Summary;
}

/// Training.
///
/// [`Train`] is a general purpose trait for machine learning "trainers" that train a model, potentially iteratively with several "epochs". [`.train()`](Train::train()) trains the model for one epoch.
///
/// # Summary
/// Implement [`Summarize`], as the trainer is expected to compute a summary on each call to [`.train()`](Train::train()). Use [`Summary::run_epoch()`] to compute the next summary.
///
/// # serde
/// Implement [`Serialize`](serde::Serialize) and [`Deserialize`](serde::Deserialize) for saving and loading checkpoints.
pub trait Train<X> {
    /// Trains the model with the training set.
    ///
    /// Returns the training stats.
    ///
    /// **Errors**
    /// Returns an error if training could not be performed. The trainer may be modified even when returning an error.
    fn train<I>(&mut self, train_iter: I) -> Result<Stats>
    where
        I: IntoIterator<Item = X>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_mean_is_weighted_by_batch_size() {
        let mut stats = Stats::default();
        assert_eq!(stats.loss("generator_loss"), None);
        stats.add_loss("generator_loss", 3, 1.);
        stats.add_loss("discriminator_loss", 3, 0.5);
        stats.add_count(3);
        stats.add_loss("generator_loss", 1, 5.);
        stats.add_loss("discriminator_loss", 1, 0.5);
        stats.add_count(1);
        assert_eq!(stats.count(), 4);
        assert_eq!(stats.loss("generator_loss"), Some(2.));
        assert_eq!(stats.loss("discriminator_loss"), Some(0.5));
        let names: Vec<_> = stats.losses().map(|(name, _)| name).collect();
        assert_eq!(names, ["generator_loss", "discriminator_loss"]);
    }

    #[test]
    fn summary_run_epoch() -> Result<()> {
        let mut summary = Summary::default();
        for epoch in 0..2 {
            summary.run_epoch(|summary| {
                assert_eq!(summary.epoch(), epoch);
                let mut stats = Stats::default();
                stats.add_loss("loss", 1, epoch as f32);
                stats.add_count(1);
                Ok(stats)
            })?;
        }
        assert_eq!(summary.epoch(), 2);
        assert_eq!(summary.history().len(), 2);
        assert_eq!(summary.train().loss("loss"), Some(1.));
        assert!(summary.total_time() >= summary.epoch_time());
        assert!(summary
            .run_epoch(|_| Err(anyhow::anyhow!("failed")))
            .is_err());
        assert_eq!(summary.epoch(), 2);
        Ok(())
    }
}
