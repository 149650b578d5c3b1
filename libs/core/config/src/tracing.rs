//! Tracing initialization, environment-aware.
//!
//! - **Production** (`APP_ENV=production`): JSON output for log aggregation,
//!   module targets hidden.
//! - **Development** (default): pretty-printed, human-readable output.
//!
//! `RUST_LOG` overrides the default filter in both modes.

use crate::Environment;
use tracing_subscriber::{EnvFilter, prelude::*};

pub fn init_tracing(environment: &Environment) {
    let is_production = environment.is_production();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if is_production {
            EnvFilter::new("info")
        } else {
            EnvFilter::new("debug")
        }
    });

    let registry = tracing_subscriber::registry().with(filter);

    // try_init: callers (and tests) may initialize more than once
    if is_production {
        let _ = registry
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .try_init();
    } else {
        let _ = registry.with(tracing_subscriber::fmt::layer()).try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let env = Environment::Development;
        init_tracing(&env);
        init_tracing(&env);
    }
}
