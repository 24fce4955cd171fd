use crate::Environment;
use tracing::{debug, info};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Install color-eyre for `eyre::Report` output: error locations on, env
/// section off. Later calls are ignored.
pub fn install_color_eyre() {
    let _ = color_eyre::config::HookBuilder::default()
        .display_location_section(true)
        .display_env_section(false)
        .install();
}

/// Filter used when `RUST_LOG` is unset. Broker and driver chatter is kept
/// one level below the service's own.
pub fn default_filter(environment: &Environment) -> &'static str {
    if environment.is_production() {
        "info,lapin=warn,mongodb=warn,tower_http=info"
    } else {
        "debug,lapin=info,mongodb=info,hyper=info"
    }
}

/// Install the global subscriber with an `ErrorLayer`, so span traces end up
/// in eyre reports.
///
/// Production logs flattened JSON, development logs pretty text. `RUST_LOG`
/// overrides [`default_filter`]. A second call is a no-op.
pub fn init_tracing(environment: &Environment) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(environment)));

    let result = if environment.is_production() {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .flatten_event(true),
            )
            .with(tracing_error::ErrorLayer::default())
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_file(false)
                    .with_line_number(false)
                    .pretty(),
            )
            .with(tracing_error::ErrorLayer::default())
            .with(filter)
            .try_init()
    };

    match result {
        Ok(()) => info!(environment = ?environment, "Tracing initialized"),
        Err(_) => debug!("Tracing already initialized"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        for env in [Environment::Development, Environment::Production] {
            let directives = default_filter(&env);
            assert!(directives.contains("lapin="));
            assert!(directives.parse::<EnvFilter>().is_ok());
        }
        assert!(default_filter(&Environment::Production).starts_with("info"));
    }

    #[test]
    fn test_init_tracing_multiple_calls() {
        init_tracing(&Environment::Development);
        init_tracing(&Environment::Production);
    }

    #[test]
    fn test_init_tracing_with_rust_log_env() {
        temp_env::with_var("RUST_LOG", Some("domain_jobs=trace"), || {
            init_tracing(&Environment::Production);
        });
    }
}
