use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::buffers::Fill;
use crate::{DType, DeviceClass, Error, ProblemDescriptor, Result};

/// Predefined problem sweeps.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    Quick,
    #[default]
    Medium,
    Full,
}

impl Profile {
    pub fn problems(&self) -> Vec<ProblemDescriptor> {
        let (sums, int_sums, adds, mats): (&[usize], &[usize], &[usize], &[usize]) = match self {
            Profile::Quick => (&[1_000_000], &[1_000_000], &[1_000_000], &[128]),
            Profile::Medium => (
                &[1_000_000, 10_000_000],
                &[10_000_000],
                &[1_000_000, 10_000_000],
                &[128, 256, 512],
            ),
            Profile::Full => (
                &[1_000_000, 10_000_000, 50_000_000, 100_000_000],
                &[10_000_000, 100_000_000],
                &[1_000_000, 10_000_000, 50_000_000],
                &[128, 256, 512, 1024],
            ),
        };
        let mut problems = Vec::new();
        problems.extend(sums.iter().map(|&n| ProblemDescriptor::sum(n, DType::F32)));
        problems.extend(int_sums.iter().map(|&n| ProblemDescriptor::sum(n, DType::I32)));
        problems.extend(adds.iter().map(|&n| ProblemDescriptor::vector_add(n, DType::F32)));
        problems.extend(mats.iter().map(|&n| ProblemDescriptor::matmul(n, n, n, DType::F32)));
        problems
    }
}

impl FromStr for Profile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "quick" => Ok(Profile::Quick),
            "medium" => Ok(Profile::Medium),
            "full" => Ok(Profile::Full),
            other => Err(Error::Config(format!("unknown profile `{}`", other))),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceApiChoice {
    #[default]
    Wgpu,
    Emulated,
    None,
}

impl FromStr for DeviceApiChoice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "wgpu" | "gpu" => Ok(DeviceApiChoice::Wgpu),
            "emulated" => Ok(DeviceApiChoice::Emulated),
            "none" | "off" => Ok(DeviceApiChoice::None),
            other => Err(Error::Config(format!("unknown device api `{}`", other))),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub api: DeviceApiChoice,
    pub class: DeviceClass,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self { api: DeviceApiChoice::Wgpu, class: DeviceClass::Gpu }
    }
}

pub fn parse_device_class(s: &str) -> Result<DeviceClass> {
    match s {
        "gpu" => Ok(DeviceClass::Gpu),
        "accelerator" => Ok(DeviceClass::Accelerator),
        "cpu" => Ok(DeviceClass::Cpu),
        "any" => Ok(DeviceClass::Any),
        other => Err(Error::Config(format!("unknown device class `{}`", other))),
    }
}

/// Available parallelism capped at 16.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .clamp(1, 16)
}

/// Everything a run needs besides the kernels themselves. Loaded from JSON;
/// missing fields take their defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub profile: Profile,
    /// Explicit problems. When non-empty the profile is ignored.
    pub problems: Vec<ProblemDescriptor>,
    pub workers: usize,
    pub max_workers: usize,
    pub thread_stack_size: Option<usize>,
    pub tolerance: f64,
    pub fill: Fill,
    pub rounds: usize,
    pub device: DeviceConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        let workers = default_workers();
        Self {
            profile: Profile::default(),
            problems: Vec::new(),
            workers,
            max_workers: workers,
            thread_stack_size: None,
            tolerance: 1e-3,
            fill: Fill::default(),
            rounds: 5,
            device: DeviceConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: RunConfig =
            serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    /// Reject values no run could use. A worker count of zero is left to
    /// the thread pool, which reports it as a partition error.
    pub fn validate(&self) -> Result<()> {
        if self.rounds == 0 {
            return Err(Error::Config("rounds must be at least 1".into()));
        }
        if self.max_workers == 0 {
            return Err(Error::Config("max_workers must be at least 1".into()));
        }
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            return Err(Error::Config(format!("tolerance {} is not a finite non-negative number", self.tolerance)));
        }
        if self.thread_stack_size == Some(0) {
            return Err(Error::Config("thread_stack_size must be positive".into()));
        }
        if let Some(bad) = self.problems.iter().find(|p| !p.shape_fits()) {
            return Err(Error::Config(format!("{:?} does not fit its operation", bad)));
        }
        Ok(())
    }

    pub fn problems(&self) -> Vec<ProblemDescriptor> {
        if self.problems.is_empty() {
            self.profile.problems()
        } else {
            self.problems.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_json_takes_defaults() {
        let cfg = RunConfig::from_json_str(r#"{"profile": "quick", "rounds": 2}"#).unwrap();
        assert_eq!(cfg.profile, Profile::Quick);
        assert_eq!(cfg.rounds, 2);
        assert_eq!(cfg.tolerance, 1e-3);
        assert_eq!(cfg.device.api, DeviceApiChoice::Wgpu);
    }

    #[test]
    fn test_explicit_problems_override_profile() {
        let cfg = RunConfig::from_json_str(
            r#"{
                "problems": [
                    {"operation": "sum", "shape": {"kind": "elements", "count": 1000}, "dtype": "i32"},
                    {"operation": "mat_mul", "shape": {"kind": "matrix", "m": 4, "n": 4, "k": 4}, "dtype": "f32"}
                ],
                "fill": {"kind": "ones"},
                "device": {"api": "emulated", "class": "any"}
            }"#,
        )
        .unwrap();
        let problems = cfg.problems();
        assert_eq!(problems.len(), 2);
        assert_eq!(problems[1], ProblemDescriptor::matmul(4, 4, 4, DType::F32));
        assert_eq!(cfg.fill, Fill::Ones);
        assert_eq!(cfg.device.class, DeviceClass::Any);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert_eq!(RunConfig::from_json_str(r#"{"rounds": 0}"#).unwrap_err().kind(), "Config");
        assert_eq!(RunConfig::from_json_str(r#"{"tolerance": -1.0}"#).unwrap_err().kind(), "Config");
        assert_eq!(RunConfig::from_json_str(r#"{"wrkers": 4}"#).unwrap_err().kind(), "Config");
        let mismatched = r#"{"problems": [{"operation": "mat_mul", "shape": {"kind": "elements", "count": 4}, "dtype": "f32"}]}"#;
        assert!(RunConfig::from_json_str(mismatched).unwrap_err().is_fatal());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"workers": 3, "max_workers": 8, "thread_stack_size": 65536}}"#).unwrap();
        let cfg = RunConfig::from_json_file(file.path()).unwrap();
        assert_eq!((cfg.workers, cfg.max_workers), (3, 8));
        assert_eq!(cfg.thread_stack_size, Some(65536));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = RunConfig::from_json_file(&dir.path().join("absent.json")).unwrap_err();
        assert_eq!(err.kind(), "Config");
    }

    #[test]
    fn test_profile_sweeps_grow() {
        assert!(Profile::Quick.problems().len() < Profile::Medium.problems().len());
        assert!(Profile::Medium.problems().len() < Profile::Full.problems().len());
        assert!(Profile::Full.problems().iter().all(|p| p.shape_fits()));
        assert_eq!("full".parse::<Profile>().unwrap(), Profile::Full);
        assert!("huge".parse::<Profile>().is_err());
    }
}
