//! One-shot recovery from accelerator memory exhaustion.
//!
//! When generation on the accelerator fails with
//! [`BackendError::ResourceExhausted`], the model is moved to the CPU at
//! full precision, the accelerator memory it held is released and the same
//! request is retried exactly once. There is no way back to the accelerator
//! short of unloading and reloading the handle.

use crate::backend::{BackendError, Model, ModelLibrary};
use crate::config::{Device, Precision};
use crate::environment::EnvironmentDescriptor;
use crate::generation::GenerationConfig;

/// What happened while producing a generation
#[derive(Debug)]
pub enum Outcome {
    /// Succeeded on the current device
    Completed(Vec<u32>),
    /// Succeeded after demotion to the fallback device
    Recovered {
        ids: Vec<u32>,
        environment: EnvironmentDescriptor,
    },
}

/// Failure after the policy gave up
#[derive(Debug)]
pub struct Failure {
    pub error: BackendError,
    /// Set when the model was demoted before the failure surfaced
    pub demoted_to: Option<EnvironmentDescriptor>,
}

/// Descriptor of the device models are demoted to
pub fn fallback_environment() -> EnvironmentDescriptor {
    EnvironmentDescriptor {
        device: Device::fallback(),
        precision: Precision::F32,
    }
}

/// Move a model to the fallback device, then free the accelerator memory
/// its old weights occupied
pub fn demote(
    library: &dyn ModelLibrary,
    model: &mut dyn Model,
) -> Result<EnvironmentDescriptor, BackendError> {
    let target = fallback_environment();
    model.move_to(target.device, target.precision)?;
    library.release_accelerator_memory();
    Ok(target)
}

/// Generate, demoting and retrying once on resource exhaustion
pub fn generate_with_recovery(
    name: &str,
    library: &dyn ModelLibrary,
    model: &mut dyn Model,
    input_ids: &[u32],
    config: &GenerationConfig,
) -> Result<Outcome, Failure> {
    let error = match model.generate(input_ids, config) {
        Ok(ids) => return Ok(Outcome::Completed(ids)),
        Err(error) => error,
    };

    if !error.is_resource_exhausted() || !model.device().is_accelerator() {
        return Err(Failure {
            error,
            demoted_to: None,
        });
    }

    crate::warning!("'{}' ran out of accelerator memory; retrying on cpu", name);

    let environment = demote(library, model).map_err(|error| Failure {
        error,
        demoted_to: None,
    })?;
    crate::verbose!("'{}' moved to {} ({})", name, environment.device, environment.precision);

    match model.generate(input_ids, config) {
        Ok(ids) => Ok(Outcome::Recovered { ids, environment }),
        Err(error) => Err(Failure {
            error,
            demoted_to: Some(environment),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LoadOptions;
    use crate::backend::fake::FakeLibrary;
    use crate::locator::SourceDescriptor;
    use std::sync::atomic::Ordering;

    fn accelerator_model(library: &FakeLibrary) -> Box<dyn Model> {
        library
            .load_model(
                &SourceDescriptor::Remote("acme/demo".into()),
                Device::Accelerator,
                Precision::Bf16,
                &LoadOptions::default(),
            )
            .unwrap()
    }

    #[test]
    fn test_no_failure_no_demotion() {
        let library = FakeLibrary::new();
        let mut model = accelerator_model(&library);
        let outcome =
            generate_with_recovery("demo", &library, model.as_mut(), &[20], &Default::default())
                .unwrap();
        assert!(matches!(outcome, Outcome::Completed(_)));
        assert_eq!(model.device(), Device::Accelerator);
        assert_eq!(library.state.moves.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_single_retry_on_cpu() {
        let library = FakeLibrary::new();
        library.state.oom_on_accelerator.store(1, Ordering::SeqCst);
        let mut model = accelerator_model(&library);

        let outcome =
            generate_with_recovery("demo", &library, model.as_mut(), &[20], &Default::default())
                .unwrap();
        match outcome {
            Outcome::Recovered { environment, .. } => {
                assert_eq!(environment, fallback_environment())
            }
            other => panic!("expected recovery, got {:?}", other),
        }
        assert_eq!(model.device(), Device::Cpu);
        assert_eq!(library.state.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_memory_released_after_move() {
        let library = FakeLibrary::new();
        let mut model = accelerator_model(&library);

        let environment = demote(&library, model.as_mut()).unwrap();
        assert_eq!(environment, fallback_environment());
        assert_eq!(library.state.releases.load(Ordering::SeqCst), 1);
        // The weights had already left the accelerator when memory was freed
        assert_eq!(library.state.moves_at_release.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_second_failure_is_fatal() {
        let library = FakeLibrary::new();
        library.state.oom_on_accelerator.store(1, Ordering::SeqCst);
        library.state.oom_on_cpu.store(true, Ordering::SeqCst);
        let mut model = accelerator_model(&library);

        let failure =
            generate_with_recovery("demo", &library, model.as_mut(), &[20], &Default::default())
                .unwrap_err();
        assert!(failure.error.is_resource_exhausted());
        assert_eq!(failure.demoted_to, Some(fallback_environment()));
        assert_eq!(library.state.moves.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cpu_exhaustion_not_retried() {
        let library = FakeLibrary::new();
        library.state.oom_on_cpu.store(true, Ordering::SeqCst);
        let mut model = library
            .load_model(
                &SourceDescriptor::Remote("acme/demo".into()),
                Device::Cpu,
                Precision::F32,
                &LoadOptions::default(),
            )
            .unwrap();

        let failure =
            generate_with_recovery("demo", &library, model.as_mut(), &[20], &Default::default())
                .unwrap_err();
        assert!(failure.demoted_to.is_none());
        assert_eq!(library.state.moves.load(Ordering::SeqCst), 0);
    }
}
