//! Per-iteration telemetry.
//!
//! The solver loop calls an [`IterationObserver`] every `disp_iter` iterations when
//! plotting or saving was requested. Observers only see a read-only view of the
//! current image, so enabling or disabling them never changes the result.

use crate::float::ReconFloat;
use crossbeam_channel::Sender;
use ndarray::{Array4, ArrayView4};
use std::path::Path;
use thiserror::Error;

/// Failure reported by an observer. The solver logs it and keeps iterating.
#[derive(Error, Debug)]
pub enum ObserverError {
    #[error("snapshot receiver disconnected")]
    Disconnected,
    #[error("{0}")]
    Other(String),
}

/// What the caller asked for when the observer fires.
#[derive(Debug, Clone, Copy)]
pub struct IterationEvent<'a> {
    /// name of the running algorithm
    pub algorithm: &'static str,
    pub plot: bool,
    pub save: Option<&'a Path>,
}

pub trait IterationObserver<T: ReconFloat> {
    /// Called with the 1-based iteration count and the current formed image.
    fn on_iteration(
        &mut self,
        iteration: usize,
        estimate: ArrayView4<'_, T>,
        event: &IterationEvent<'_>,
    ) -> Result<(), ObserverError>;
}

/// Owned copy of an intermediate image, sent to another thread.
#[derive(Debug, Clone)]
pub struct IterationSnapshot<T> {
    pub algorithm: &'static str,
    pub iteration: usize,
    pub image: Array4<T>,
}

/// Forwards snapshots through a `crossbeam_channel`, e.g. to a plotting thread.
#[derive(Debug)]
pub struct ChannelObserver<T> {
    sender: Sender<IterationSnapshot<T>>,
    disconnected: bool,
}

impl<T> ChannelObserver<T> {
    pub fn new(sender: Sender<IterationSnapshot<T>>) -> Self {
        ChannelObserver {
            sender,
            disconnected: false,
        }
    }
}

impl<T: ReconFloat> IterationObserver<T> for ChannelObserver<T> {
    fn on_iteration(
        &mut self,
        iteration: usize,
        estimate: ArrayView4<'_, T>,
        event: &IterationEvent<'_>,
    ) -> Result<(), ObserverError> {
        if self.disconnected {
            return Ok(());
        }
        let snapshot = IterationSnapshot {
            algorithm: event.algorithm,
            iteration,
            image: estimate.to_owned(),
        };
        if self.sender.send(snapshot).is_err() {
            // reported once, later snapshots are dropped silently
            self.disconnected = true;
            return Err(ObserverError::Disconnected);
        }
        Ok(())
    }
}

/// Logs summary statistics of the intermediate image.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl<T: ReconFloat> IterationObserver<T> for LogObserver {
    fn on_iteration(
        &mut self,
        iteration: usize,
        estimate: ArrayView4<'_, T>,
        event: &IterationEvent<'_>,
    ) -> Result<(), ObserverError> {
        let (min, max) = estimate
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &x| {
                (lo.min(x.as_f64()), hi.max(x.as_f64()))
            });
        let mean = estimate.mean().map_or(f64::NAN, |m| m.as_f64());
        log::info!(
            "{} iteration {}: min {:.4e}, max {:.4e}, mean {:.4e}",
            event.algorithm,
            iteration,
            min,
            max,
            mean
        );
        Ok(())
    }
}
