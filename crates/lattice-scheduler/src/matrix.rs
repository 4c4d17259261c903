//! Matrix expansion into concrete job instances.

use indexmap::IndexMap;
use lattice_core::job::{JobInstance, MatrixCoordinate};
use lattice_core::pipeline::{ExclusionRule, JobDefinition, MatrixSpec, PipelineDefinition, render_value};
use lattice_core::{Error, JobId, Result};
use std::time::Duration;
use tracing::debug;

/// Expander for matrix configurations.
pub struct MatrixExpander;

impl MatrixExpander {
    pub fn new() -> Self {
        Self
    }

    /// Expand a matrix into its coordinates, in declared axis order.
    ///
    /// Exclusions are applied to the Cartesian product; include entries are
    /// appended afterwards unless an identical coordinate is already present.
    pub fn expand(&self, job: &str, matrix: &MatrixSpec) -> Result<Vec<MatrixCoordinate>> {
        self.validate(job, matrix)?;

        let mut combinations = self.generate_combinations(matrix);

        combinations.retain(|combo| {
            !matrix
                .exclude
                .iter()
                .any(|exclude| self.matches_exclude(combo, exclude))
        });

        for include in &matrix.include {
            let include = self.order_include(matrix, include);
            if !combinations.contains(&include) {
                combinations.push(include);
            }
        }

        Ok(combinations)
    }

    /// Expand every job of a pipeline, in declaration order.
    pub fn expand_pipeline(&self, pipeline: &PipelineDefinition) -> Result<Vec<JobInstance>> {
        let mut instances = Vec::new();
        for (name, job) in &pipeline.jobs {
            let expanded = self.expand_job(pipeline, name, job, instances.len())?;
            debug!(job = %name, instances = expanded.len(), "Expanded job");
            instances.extend(expanded);
        }
        Ok(instances)
    }

    fn expand_job(
        &self,
        pipeline: &PipelineDefinition,
        name: &str,
        job: &JobDefinition,
        first_index: usize,
    ) -> Result<Vec<JobInstance>> {
        let coordinates = match &job.matrix {
            Some(matrix) => self.expand(name, matrix)?,
            None => vec![MatrixCoordinate::new()],
        };

        let mut env = pipeline.env.clone();
        env.extend(job.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let instances = coordinates
            .into_iter()
            .enumerate()
            .map(|(offset, matrix)| {
                let values: Vec<String> = matrix.values().map(render_value).collect();
                let id = JobId::for_coordinate(name, values.iter().map(String::as_str));
                JobInstance {
                    id,
                    name: name.to_string(),
                    index: first_index + offset,
                    matrix,
                    steps: job.steps.clone(),
                    needs: job.needs.clone(),
                    env: env.clone(),
                    resources: job.resources.clone(),
                    concurrency_group: job.concurrency_group.clone(),
                    timeout: job
                        .timeout_minutes
                        .map(|m| Duration::from_secs(u64::from(m) * 60)),
                }
            })
            .collect();

        Ok(instances)
    }

    fn validate(&self, job: &str, matrix: &MatrixSpec) -> Result<()> {
        for axis in matrix.axes() {
            if axis.values.is_empty() {
                return Err(Error::InvalidMatrix {
                    job: job.to_string(),
                    reason: format!("axis '{}' has no values", axis.name),
                });
            }
        }

        for rule in &matrix.exclude {
            if rule.is_empty() {
                return Err(Error::InvalidMatrix {
                    job: job.to_string(),
                    reason: "empty exclusion rule".to_string(),
                });
            }
            for (key, value) in rule {
                let Some(values) = matrix.dimensions.get(key) else {
                    return Err(Error::InvalidMatrix {
                        job: job.to_string(),
                        reason: format!("exclusion references undeclared axis '{}'", key),
                    });
                };
                if !values.contains(value) {
                    return Err(Error::InvalidMatrix {
                        job: job.to_string(),
                        reason: format!(
                            "exclusion references undeclared value '{}' for axis '{}'",
                            render_value(value),
                            key
                        ),
                    });
                }
            }
        }

        for rule in &matrix.include {
            if rule.is_empty() {
                return Err(Error::InvalidMatrix {
                    job: job.to_string(),
                    reason: "empty include entry".to_string(),
                });
            }
        }

        Ok(())
    }

    fn generate_combinations(&self, matrix: &MatrixSpec) -> Vec<MatrixCoordinate> {
        if matrix.dimensions.is_empty() {
            // Include-only matrices are built entirely from their entries.
            return if matrix.include.is_empty() {
                vec![MatrixCoordinate::new()]
            } else {
                Vec::new()
            };
        }

        let mut result = vec![MatrixCoordinate::new()];

        for axis in matrix.axes() {
            let mut next = Vec::with_capacity(result.len() * axis.values.len());
            for combo in &result {
                for value in axis.values {
                    let mut new_combo = combo.clone();
                    new_combo.insert(axis.name.to_string(), value.clone());
                    next.push(new_combo);
                }
            }
            result = next;
        }

        result
    }

    fn matches_exclude(&self, combo: &MatrixCoordinate, exclude: &ExclusionRule) -> bool {
        exclude
            .iter()
            .all(|(key, value)| combo.get(key) == Some(value))
    }

    /// Declared axes first, in axis order; include-only keys follow.
    fn order_include(&self, matrix: &MatrixSpec, include: &ExclusionRule) -> MatrixCoordinate {
        let mut ordered = IndexMap::with_capacity(include.len());
        for axis in matrix.axes() {
            if let Some(value) = include.get(axis.name) {
                ordered.insert(axis.name.to_string(), value.clone());
            }
        }
        for (key, value) in include {
            if !ordered.contains_key(key) {
                ordered.insert(key.clone(), value.clone());
            }
        }
        ordered
    }
}

impl Default for MatrixExpander {
    fn default() -> Self {
        Self::new()
    }
}
