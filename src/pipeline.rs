//! A linear chain of double-buffered stages.

use std::sync::Arc;

use log::error;
use rayon::prelude::*;

use crate::element::HostArray;
use crate::stage::PipelineStage;

/// An ordered chain of stages, advanced one tick per [`push`].
///
/// Built by [`PipelineStage::make_pipeline`].
///
/// [`push`]: Pipeline::push
pub struct Pipeline {
    stages: Vec<Arc<PipelineStage>>,
    counter: u64,
}

impl Pipeline {
    pub(crate) fn new(stages: Vec<Arc<PipelineStage>>) -> Pipeline {
        Pipeline { stages: stages, counter: 0 }
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Number of pushes so far.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn stages(&self) -> &[Arc<PipelineStage>] {
        &self.stages
    }

    /// Advances every stage by one tick.
    ///
    /// Phase one runs `2N` tasks concurrently: each stage's kernels on the
    /// primary buffer sides, and each stage's forwarding copies on the
    /// passive sides (host feed into the entry, host drain out of the exit,
    /// output-to-input shuttling along each edge). Phase two switches buffer
    /// sides — except the entry's inputs when nothing was fed and the exit's
    /// outputs when nothing is draining.
    ///
    /// Returns `true` once the exit stage holds a valid result. A value
    /// needs `2N − 2` ticks to traverse the chain; feeding adds one tick,
    /// draining adds another:
    ///
    /// | fed | drained | ready when counter > |
    /// |-----|---------|----------------------|
    /// | no  | no      | `2N − 2`             |
    /// | yes | no      | `2N − 1`             |
    /// | no  | yes     | `2N − 1`             |
    /// | yes | yes     | `2N`                 |
    pub fn push(&mut self, host_inputs: Option<&[HostArray]>,
            host_outputs: Option<&[HostArray]>) -> bool {
        let n = self.stages.len();
        if n == 0 {
            return false;
        }
        let max_index = n - 1;
        let stages = &self.stages;

        (0..2 * n).into_par_iter().for_each(|i| {
            if i < n {
                if let Err(err) = stages[i].run(false) {
                    error!("Pipeline::push(): stage {}: {}", i, err);
                }
            } else {
                stages[i - n].forward_results(i - n, max_index, host_inputs, host_outputs);
            }
        });

        (0..n).into_par_iter().for_each(|i| {
            let skip_inputs = i == 0 && host_inputs.is_none();
            let skip_outputs = i == max_index && host_outputs.is_none();
            if !skip_inputs {
                stages[i].switch_input_buffers();
            }
            if !skip_outputs {
                stages[i].switch_output_buffers();
            }
        });

        self.counter += 1;

        let mut threshold = 2 * n as u64 - 2;
        if host_inputs.is_some() {
            threshold += 1;
        }
        if host_outputs.is_some() {
            threshold += 1;
        }
        self.counter > threshold
    }
}
