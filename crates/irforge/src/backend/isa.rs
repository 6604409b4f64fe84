//! Host target setup
//!
//! The host ISA is created once per process (opt_level=speed, PIC) and
//! shared by every JIT runner and layout query.

use std::sync::Arc;

use cranelift_codegen::isa::TargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use once_cell::sync::OnceCell;

/// Backend bring-up failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("host target unavailable: {0}")]
    Host(String),
}

static HOST_ISA: OnceCell<Arc<dyn TargetIsa>> = OnceCell::new();

/// The process-wide host ISA.
pub fn host_isa() -> Result<Arc<dyn TargetIsa>, BackendError> {
    HOST_ISA
        .get_or_try_init(|| {
            let mut flag_builder = settings::builder();
            flag_builder
                .set("opt_level", "speed")
                .map_err(|e| BackendError::Host(format!("failed to set opt_level: {}", e)))?;
            flag_builder
                .set("is_pic", "true")
                .map_err(|e| BackendError::Host(format!("failed to set is_pic: {}", e)))?;
            let flags = settings::Flags::new(flag_builder);

            cranelift_native::builder()
                .map_err(|e| BackendError::Host(format!("failed to create native ISA builder: {}", e)))?
                .finish(flags)
                .map_err(|e| BackendError::Host(format!("failed to finish ISA: {}", e)))
        })
        .map(Arc::clone)
}

/// Pointer width of the host in bytes; 8 when the ISA is unavailable so
/// layout queries stay usable in error paths.
pub fn pointer_bytes() -> u32 {
    host_isa().map(|isa| isa.pointer_bytes() as u32).unwrap_or(8)
}

/// Target triple string of the host.
pub fn host_triple() -> String {
    host_isa()
        .map(|isa| isa.triple().to_string())
        .unwrap_or_else(|_| target_lexicon::Triple::host().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_isa_is_cached() {
        let a = host_isa().unwrap();
        let b = host_isa().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pointer_bytes(), a.pointer_bytes() as u32);
    }

    #[test]
    fn test_host_triple_nonempty() {
        assert!(!host_triple().is_empty());
    }
}
