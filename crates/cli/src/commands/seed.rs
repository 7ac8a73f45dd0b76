use fleetrun_core::config::{AppConfig, LoadOptions};
use fleetrun_db::repositories::{SqlTimeoutPolicyRepository, TimeoutPolicyRepository};
use fleetrun_db::{connect_with_settings, migrations};

use crate::commands::{block_on, CommandResult};

/// Seed the timeout-policy matrix. Idempotent: cells an operator already
/// tuned are left alone.
pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "seed",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let result = block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;

        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;

        let repo = SqlTimeoutPolicyRepository::new(pool.clone());
        let inserted =
            repo.seed_defaults().await.map_err(|error| ("seed", error.to_string(), 6u8))?;

        pool.close().await;
        Ok::<u64, (&'static str, String, u8)>(inserted)
    });

    match result {
        Ok(Ok(inserted)) => CommandResult::success(
            "seed",
            format!("timeout policy matrix ready ({inserted} cells inserted)"),
        ),
        Ok(Err((error_class, message, exit_code))) => {
            CommandResult::failure("seed", error_class, message, exit_code)
        }
        Err(message) => CommandResult::failure("seed", "runtime_init", message, 3),
    }
}
