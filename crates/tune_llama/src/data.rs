//! Data Module - Paired instruction/response datasets
//!
//! - DatasetBuilder: reads parallel line files, augments, shuffles, splits
//! - PromptTemplate: the instruction/response text layout

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use std::path::Path;
use tracing::info;

use crate::error::{PipelineError, PipelineResult, Stage};

pub mod template;

pub use template::PromptTemplate;

/// Prefix of the synthetic rephrasing added for long inputs.
pub const AUGMENT_PREFIX: &str = "Convert this to code: ";
/// Inputs longer than this many characters get an augmented twin.
pub const AUGMENT_MIN_CHARS: usize = 20;
pub const DEFAULT_TEST_FRACTION: f64 = 0.05;

/// One rendered instruction/response pair. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrainingExample {
    input: String,
    output: String,
    rendered_text: String,
}

impl TrainingExample {
    pub fn new(input: &str, output: &str, template: &PromptTemplate) -> Self {
        Self {
            input: input.to_string(),
            output: output.to_string(),
            rendered_text: template.render(input, output),
        }
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn rendered_text(&self) -> &str {
        &self.rendered_text
    }
}

/// Disjoint train/validation partitions of one shuffled example sequence.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub train: Vec<TrainingExample>,
    pub validation: Vec<TrainingExample>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.train.len() + self.validation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct DatasetBuilder {
    template: PromptTemplate,
    seed: u64,
    test_fraction: f64,
    cap: Option<usize>,
}

impl DatasetBuilder {
    pub fn new(seed: u64) -> Self {
        Self {
            template: PromptTemplate::instruction(),
            seed,
            test_fraction: DEFAULT_TEST_FRACTION,
            cap: None,
        }
    }

    pub fn with_test_fraction(mut self, test_fraction: f64) -> Self {
        self.test_fraction = test_fraction.clamp(0.0, 1.0);
        self
    }

    /// Keep at most `cap` examples after shuffling.
    pub fn with_cap(mut self, cap: Option<usize>) -> Self {
        self.cap = cap;
        self
    }

    pub fn with_template(mut self, template: PromptTemplate) -> Self {
        self.template = template;
        self
    }

    pub fn template(&self) -> &PromptTemplate {
        &self.template
    }

    pub fn build_from_files(&self, inputs: &Path, outputs: &Path) -> PipelineResult<Dataset> {
        let read = |path: &Path| {
            std::fs::read_to_string(path).map_err(|e| PipelineError::io(Stage::Dataset, path, e))
        };
        let input_text = read(inputs)?;
        let output_text = read(outputs)?;
        let input_lines: Vec<&str> = input_text.lines().map(str::trim).collect();
        let output_lines: Vec<&str> = output_text.lines().map(str::trim).collect();
        info!(
            "📄 Read {} input / {} output lines",
            input_lines.len(),
            output_lines.len()
        );
        self.build(&input_lines, &output_lines)
    }

    /// Line `i` of `inputs` pairs with line `i` of `outputs`.
    pub fn build<S: AsRef<str>>(&self, inputs: &[S], outputs: &[S]) -> PipelineResult<Dataset> {
        let examples = self.examples(inputs, outputs)?;
        Ok(self.split(examples))
    }

    /// Rendered examples plus augmentation, in source order.
    pub fn examples<S: AsRef<str>>(
        &self,
        inputs: &[S],
        outputs: &[S],
    ) -> PipelineResult<Vec<TrainingExample>> {
        if inputs.len() != outputs.len() {
            return Err(PipelineError::DataIntegrity {
                inputs: inputs.len(),
                outputs: outputs.len(),
            });
        }

        let mut examples = Vec::with_capacity(inputs.len() * 2);
        let mut augmented = 0usize;
        for (input, output) in inputs.iter().zip(outputs) {
            let (input, output) = (input.as_ref().trim(), output.as_ref().trim());
            examples.push(TrainingExample::new(input, output, &self.template));
            if input.chars().count() > AUGMENT_MIN_CHARS {
                let rephrased = format!("{AUGMENT_PREFIX}{input}");
                examples.push(TrainingExample::new(&rephrased, output, &self.template));
                augmented += 1;
            }
        }
        info!(
            "🧪 {} pairs -> {} examples ({} augmented)",
            inputs.len(),
            examples.len(),
            augmented
        );
        Ok(examples)
    }

    /// Seeded shuffle, optional cap, then the first part goes to train and the rest to
    /// validation. Validation size is `floor(n * test_fraction)`.
    pub fn split(&self, mut examples: Vec<TrainingExample>) -> Dataset {
        let mut rng = StdRng::seed_from_u64(self.seed);
        examples.shuffle(&mut rng);
        if let Some(cap) = self.cap {
            if examples.len() > cap {
                info!("✂️ Capping dataset at {cap} of {} examples", examples.len());
                examples.truncate(cap);
            }
        }

        let n = examples.len();
        let n_val = validation_size(n, self.test_fraction);
        let validation = examples.split_off(n - n_val);
        info!(
            "📚 Dataset split: {} train / {} validation",
            examples.len(),
            validation.len()
        );
        Dataset {
            train: examples,
            validation,
        }
    }
}

pub fn validation_size(n: usize, test_fraction: f64) -> usize {
    // epsilon keeps exact products like 20 * 0.05 from flooring to 0
    (((n as f64) * test_fraction) + 1e-9).floor().min(n as f64) as usize
}
