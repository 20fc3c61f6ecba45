use serde::{Deserialize, Serialize};

/// A production job: one part number engraved from one project file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub key: String,
    #[serde(default)]
    pub display_name: String,
    pub part_number: String,
    #[serde(alias = "default_batch", default = "default_batch_size")]
    pub default_batch_size: u32,
    #[serde(default)]
    pub focus_height: f64,
    /// Sensor pattern (`0`/`1` per job input) that selects this job.
    pub select_pattern: String,
    /// Air-on dwell before the start pulse.
    #[serde(default)]
    pub air_before_sec: f64,
    /// Delay after the start pulse before the door lock is released.
    #[serde(default)]
    pub job_delay_sec: f64,
    /// Air kept on after the batch finishes.
    #[serde(default)]
    pub air_after_sec: f64,
}

fn default_batch_size() -> u32 {
    28
}

impl Job {
    #[cfg(test)]
    pub fn new(key: &str, part_number: &str, select_pattern: &str) -> Self {
        Self {
            key: key.to_string(),
            display_name: String::new(),
            part_number: part_number.to_string(),
            default_batch_size: default_batch_size(),
            focus_height: 0.0,
            select_pattern: select_pattern.to_string(),
            air_before_sec: 0.0,
            job_delay_sec: 0.0,
            air_after_sec: 0.0,
        }
    }

    /// Operator-facing name, falling back to the key.
    pub fn name(&self) -> &str {
        if self.display_name.is_empty() {
            &self.key
        } else {
            &self.display_name
        }
    }
}

/// Ordered set of job definitions.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    jobs: Vec<Job>,
}

impl JobRegistry {
    pub fn new(jobs: Vec<Job>) -> Self {
        for (i, job) in jobs.iter().enumerate() {
            if jobs[..i]
                .iter()
                .any(|earlier| earlier.select_pattern == job.select_pattern)
            {
                tracing::warn!(
                    job = %job.key,
                    pattern = %job.select_pattern,
                    "select pattern already used by an earlier job; this job is unreachable"
                );
            }
        }
        Self { jobs }
    }

    /// First job, in insertion order, whose pattern equals `pattern`.
    pub fn find_by_pattern(&self, pattern: &str) -> Option<&Job> {
        self.jobs.iter().find(|job| job.select_pattern == pattern)
    }

    pub fn get(&self, key: &str) -> Option<&Job> {
        self.jobs.iter().find(|job| job.key == key)
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> JobRegistry {
        JobRegistry::new(vec![
            Job::new("Job 8", "PN123", "100"),
            Job::new("Job 9", "PN456", "010"),
            Job::new("Job 10", "PN789", "110"),
        ])
    }

    #[test]
    fn finds_job_by_pattern() {
        let registry = registry();
        assert_eq!(registry.find_by_pattern("010").unwrap().key, "Job 9");
        assert!(registry.find_by_pattern("111").is_none());
        assert!(registry.find_by_pattern("000").is_none());
    }

    #[test]
    fn duplicate_patterns_resolve_to_first_registered() {
        let registry = JobRegistry::new(vec![
            Job::new("First", "PN1", "101"),
            Job::new("Second", "PN2", "101"),
        ]);
        for _ in 0..10 {
            assert_eq!(registry.find_by_pattern("101").unwrap().key, "First");
        }
    }

    #[test]
    fn lookup_by_key() {
        let registry = registry();
        assert_eq!(registry.get("Job 10").unwrap().part_number, "PN789");
        assert!(registry.get("Job 11").is_none());
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn name_falls_back_to_key() {
        let mut job = Job::new("Job 8", "PN123", "100");
        assert_eq!(job.name(), "Job 8");
        job.display_name = "Idler 1".into();
        assert_eq!(job.name(), "Idler 1");
    }
}
