use std::sync::Arc;

use warden_agent::ReviewQueue;

use crate::commands::{build_runtime, load_config, open_repository, parse_tenant, CommandResult};

pub fn run(tenant: &str) -> CommandResult {
    let tenant_id = match parse_tenant("queue-stats", tenant) {
        Ok(tenant_id) => tenant_id,
        Err(failure) => return failure,
    };
    let config = match load_config("queue-stats") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match build_runtime("queue-stats") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let repository = open_repository(&config).await?;
        ReviewQueue::new(Arc::new(repository))
            .get_queue_stats(&tenant_id)
            .await
            .map_err(|error| ("storage", error.to_string(), 6u8))
    });

    match result {
        Ok(stats) => CommandResult::success_with_data(
            "queue-stats",
            format!(
                "{} conversations awaiting review for tenant `{tenant_id}`",
                stats.pending_count
            ),
            &stats,
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("queue-stats", error_class, message, exit_code)
        }
    }
}
